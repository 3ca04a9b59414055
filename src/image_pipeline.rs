use crate::{config::AnnotationConfig, detection::Detection, labels::ClassLabel};
use ab_glyph::{FontArc, PxScale};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{codecs::jpeg::JpegEncoder, imageops::FilterType, Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
    rect::Rect,
};
use std::{io::Cursor, sync::Arc};
use thiserror::Error;

const DEFAULT_FONT: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");
const LABEL_PADDING: u32 = 2;
const LABEL_TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

#[derive(Error, Debug)]
pub enum ImagePipelineError {
    #[error("unable to decode image: {0}")]
    Decode(String),
    #[error("unable to encode image: {0}")]
    Encode(#[from] image::ImageError),
    #[error("unable to load font {path}: {reason}")]
    Font { path: String, reason: String },
}

pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, ImagePipelineError> {
    if bytes.is_empty() {
        return Err(ImagePipelineError::Decode("image data is empty".to_string()));
    }

    let image = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ImagePipelineError::Decode(e.to_string()))?
        .decode()
        .map_err(|e| ImagePipelineError::Decode(e.to_string()))?;

    Ok(image.to_rgb8())
}

/// Resizes to a `size` x `size` square, the space every returned box lives in.
pub fn resize_square(image: RgbImage, size: u32) -> RgbImage {
    if image.dimensions() == (size, size) {
        return image;
    }
    image::imageops::resize(&image, size, size, FilterType::CatmullRom)
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, ImagePipelineError> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality).encode_image(image)?;
    Ok(buffer)
}

pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Burns detection boxes and `"<label> <confidence>"` tags into an image.
pub struct Annotator {
    labels: Arc<Vec<ClassLabel>>,
    font: FontArc,
    font_size: f32,
    line_thickness: u32,
}

impl Annotator {
    /// Uses `font_file` when configured, otherwise the embedded DejaVu Sans.
    pub fn new(
        config: &AnnotationConfig,
        labels: Arc<Vec<ClassLabel>>,
    ) -> Result<Self, ImagePipelineError> {
        let font = match &config.font_file {
            Some(path) => {
                let font_error = |reason: String| ImagePipelineError::Font {
                    path: path.display().to_string(),
                    reason,
                };
                let data = std::fs::read(path).map_err(|e| font_error(e.to_string()))?;
                let font = FontArc::try_from_vec(data).map_err(|e| font_error(e.to_string()))?;
                tracing::info!("Loaded annotation font {:?}", path);
                font
            }
            None => FontArc::try_from_slice(DEFAULT_FONT).map_err(|e| ImagePipelineError::Font {
                path: "<embedded>".to_string(),
                reason: e.to_string(),
            })?,
        };

        Ok(Self {
            labels,
            font,
            font_size: config.font_size,
            line_thickness: config.line_thickness.max(1),
        })
    }

    fn color(&self, class_id: usize) -> Rgb<u8> {
        let rgb = self
            .labels
            .get(class_id)
            .map(ClassLabel::rgb)
            .unwrap_or_else(|| ClassLabel::unknown(class_id).rgb());
        Rgb(rgb)
    }

    pub fn annotate(&self, image: &mut RgbImage, detections: &[Detection]) {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return;
        }

        for detection in detections {
            let bbox = detection.bbox.clamp(width as f32, height as f32);
            let x1 = bbox.x1.floor() as i32;
            let y1 = bbox.y1.floor() as i32;
            let x2 = (bbox.x2.ceil() as i32).min(width as i32);
            let y2 = (bbox.y2.ceil() as i32).min(height as i32);
            if x2 <= x1 || y2 <= y1 {
                continue;
            }
            let color = self.color(detection.class_id);

            for t in 0..self.line_thickness as i32 {
                let w = x2 - x1 - 2 * t;
                let h = y2 - y1 - 2 * t;
                if w <= 0 || h <= 0 {
                    break;
                }
                let rect = Rect::at(x1 + t, y1 + t).of_size(w as u32, h as u32);
                draw_hollow_rect_mut(image, rect, color);
            }

            let text = format!("{} {:.2}", detection.label, detection.confidence);
            let scale = PxScale::from(self.font_size);
            let (text_w, text_h) = text_size(scale, &self.font, &text);
            let tag_w = text_w + 2 * LABEL_PADDING;
            let tag_h = text_h + 2 * LABEL_PADDING;
            let tag_y = (y1 - tag_h as i32).max(0);

            draw_filled_rect_mut(image, Rect::at(x1, tag_y).of_size(tag_w, tag_h), color);
            draw_text_mut(
                image,
                LABEL_TEXT_COLOR,
                x1 + LABEL_PADDING as i32,
                tag_y + LABEL_PADDING as i32,
                scale,
                &self.font,
                &text,
            );
        }
    }
}
