use crate::{
    config::{ModelConfig, Validatable},
    detection::{BoundingBox, Detection},
    labels::ClassLabel,
    lazy_model::ModelLoader,
    model_service::{ModelService, ModelServiceError},
};
use image::{imageops::FilterType, RgbImage};
use ndarray::{s, Array, ArrayD, ArrayView2, Axis, Ix3, Ix4};
use ort::{
    execution_providers::CPUExecutionProvider,
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

#[derive(Debug, Clone, Copy)]
pub struct PostProcessing {
    pub min_probability: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
    pub input_size: u32,
}

impl From<&ModelConfig> for PostProcessing {
    fn from(config: &ModelConfig) -> Self {
        Self {
            min_probability: config.min_probability,
            iou_threshold: config.iou_threshold,
            max_detections: config.max_detections,
            input_size: config.input_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    class_id: usize,
    confidence: f32,
    bbox: BoundingBox,
}

fn transform_image(image: &RgbImage, input_size: u32) -> Array<f32, Ix4> {
    let size = input_size as usize;
    let resized;
    let img = if image.dimensions() == (input_size, input_size) {
        image
    } else {
        resized = image::imageops::resize(image, input_size, input_size, FilterType::CatmullRom);
        &resized
    };

    let mut input = Array::zeros((1, 3, size, size));
    for (x, y, pixel) in img.enumerate_pixels() {
        let x = x as usize;
        let y = y as usize;
        let [r, g, b] = pixel.0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    input
}

/// Decodes a YOLOv8 head laid out as `[4 + classes, anchors]` with boxes as
/// `cx, cy, w, h` in model input pixels.
fn decode_output(
    output: ArrayView2<f32>,
    params: &PostProcessing,
    img_width: u32,
    img_height: u32,
) -> Result<Vec<Candidate>, ModelServiceError> {
    if output.nrows() <= 4 {
        return Err(ModelServiceError::Output(format!(
            "expected at least 5 rows per anchor, got {}",
            output.nrows()
        )));
    }

    let scale_x = img_width as f32 / params.input_size as f32;
    let scale_y = img_height as f32 / params.input_size as f32;
    let mut candidates = Vec::new();

    for anchor in output.axis_iter(Axis(1)) {
        let (class_id, prob) = anchor
            .iter()
            .skip(4)
            .copied()
            .enumerate()
            .fold((0, f32::MIN), |best, (index, value)| {
                if value > best.1 {
                    (index, value)
                } else {
                    best
                }
            });

        if prob < params.min_probability {
            continue;
        }

        let bbox = BoundingBox::from_center(
            anchor[0] * scale_x,
            anchor[1] * scale_y,
            anchor[2] * scale_x,
            anchor[3] * scale_y,
        )
        .clamp(img_width as f32, img_height as f32);

        if bbox.area() <= 0. {
            continue;
        }

        candidates.push(Candidate {
            class_id,
            confidence: prob,
            bbox,
        });
    }

    Ok(candidates)
}

fn non_max_suppression(
    mut candidates: Vec<Candidate>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        if kept.len() >= max_detections {
            break;
        }
        let suppressed = kept.iter().any(|k| {
            k.class_id == candidate.class_id && k.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }

    kept
}

fn postprocess(
    output: &ArrayD<f32>,
    params: &PostProcessing,
    labels: &[ClassLabel],
    img_width: u32,
    img_height: u32,
) -> Result<Vec<Detection>, ModelServiceError> {
    let output = output
        .view()
        .into_dimensionality::<Ix3>()
        .map_err(|e| ModelServiceError::Output(format!("expected a rank 3 tensor: {}", e)))?;
    if output.shape()[0] != 1 {
        return Err(ModelServiceError::Output(format!(
            "expected a batch of 1, got {}",
            output.shape()[0]
        )));
    }

    let candidates = decode_output(output.slice(s![0, .., ..]), params, img_width, img_height)?;
    let kept = non_max_suppression(candidates, params.iou_threshold, params.max_detections);

    let detections = kept
        .into_iter()
        .map(|candidate| Detection {
            class_id: candidate.class_id,
            label: labels
                .get(candidate.class_id)
                .map(|l| l.label.clone())
                .unwrap_or_else(|| ClassLabel::unknown(candidate.class_id).label),
            confidence: candidate.confidence,
            bbox: candidate.bbox,
        })
        .collect();

    Ok(detections)
}

fn build_session(model_config: &ModelConfig) -> Result<Session, ort::Error> {
    Session::builder()?
        .with_execution_providers([CPUExecutionProvider::default().build()])?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(model_config.intra_threads)?
        .commit_from_file(model_config.get_path())
}

#[derive(Clone)]
pub struct OrtModelService {
    sessions: Arc<Vec<Arc<Mutex<Session>>>>,
    counter: Arc<AtomicUsize>,
    labels: Arc<Vec<ClassLabel>>,
    post_processing: PostProcessing,
}

impl OrtModelService {
    pub fn new(
        model_config: &ModelConfig,
        labels: Arc<Vec<ClassLabel>>,
    ) -> Result<Self, ModelServiceError> {
        let num_instances = model_config.num_instances.max(1);
        let sessions = (0..num_instances)
            .map(|_| build_session(model_config).map(|s| Arc::new(Mutex::new(s))))
            .collect::<Result<Vec<_>, ort::Error>>()
            .map_err(|e| {
                ModelServiceError::Load(format!("{:?}: {}", model_config.get_path(), e))
            })?;

        tracing::info!(
            "Created {} ONNX sessions from {:?}",
            num_instances,
            model_config.get_path()
        );

        Ok(Self {
            sessions: Arc::new(sessions),
            counter: Arc::new(AtomicUsize::new(0)),
            labels,
            post_processing: PostProcessing::from(model_config),
        })
    }

    fn run_inference(&self, input: &Array<f32, Ix4>) -> Result<ArrayD<f32>, ModelServiceError> {
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
        let mut session = self.sessions[index]
            .lock()
            .map_err(|e| ModelServiceError::Poisoned(e.to_string()))?;

        tracing::debug!("Handling request with session {}", index);

        let tensor_ref = TensorRef::from_array_view(input.view())
            .map_err(|e| ModelServiceError::Inference(format!("failed to build tensor: {}", e)))?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| ModelServiceError::Inference(e.to_string()))?;

        let output = outputs[0]
            .try_extract_array::<f32>()
            .map_err(|e| ModelServiceError::Output(format!("failed to extract tensor: {}", e)))?
            .to_owned();

        Ok(output)
    }
}

impl ModelService for OrtModelService {
    fn predict(&self, image: &RgbImage) -> Result<Vec<Detection>, ModelServiceError> {
        let (img_width, img_height) = image.dimensions();
        let input = transform_image(image, self.post_processing.input_size);
        let output = self.run_inference(&input)?;

        let detections = postprocess(
            &output,
            &self.post_processing,
            &self.labels,
            img_width,
            img_height,
        )?;

        tracing::debug!("Returning {} detections", detections.len());
        for (i, detection) in detections.iter().enumerate() {
            tracing::debug!(
                "Detection {}: label={}, confidence={:.3}, bbox=({:.1}, {:.1}, {:.1}, {:.1})",
                i,
                detection.label,
                detection.confidence,
                detection.bbox.x1,
                detection.bbox.y1,
                detection.bbox.x2,
                detection.bbox.y2
            );
        }

        Ok(detections)
    }
}

/// Builds an [`OrtModelService`] on demand for lazily loaded deployments.
pub struct OrtModelLoader {
    model_config: ModelConfig,
    labels: Arc<Vec<ClassLabel>>,
}

impl OrtModelLoader {
    pub fn new(model_config: ModelConfig, labels: Arc<Vec<ClassLabel>>) -> Self {
        Self {
            model_config,
            labels,
        }
    }

    pub fn model_path(&self) -> PathBuf {
        self.model_config.get_path()
    }
}

impl ModelLoader for OrtModelLoader {
    type Model = OrtModelService;

    fn load(&self) -> Result<Self::Model, ModelServiceError> {
        OrtModelService::new(&self.model_config, self.labels.clone())
    }
}
