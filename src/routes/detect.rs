use crate::{
    config::DetectionConfig,
    detection::DetectionTable,
    image_pipeline::{
        decode_image, encode_base64, encode_jpeg, resize_square, Annotator, ImagePipelineError,
    },
    model_service::{ModelService, ModelServiceError},
    server::SharedState,
};
use axum::{
    body::Bytes,
    extract::{
        multipart::{MultipartError, MultipartRejection},
        Multipart, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Instant;
use thiserror::Error;
use tracing::instrument;

pub const DETECT_ROUTE: &str = "/api/detect";
const IMAGE_FIELD: &str = "image";

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("No image provided")]
    MissingInput,
    #[error("Invalid upload: {message}")]
    Upload { status: StatusCode, message: String },
    #[error("{0}")]
    Decode(#[source] ImagePipelineError),
    #[error("inference failed")]
    Inference(#[source] ModelServiceError),
    #[error("unable to encode annotated image")]
    Encode(#[source] ImagePipelineError),
    #[error("detection task did not complete")]
    Task(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl IntoResponse for DetectError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            DetectError::MissingInput => {
                tracing::debug!("Rejected detection request: {}", self);
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            DetectError::Upload { status, .. } => {
                tracing::debug!("Rejected detection request ({}): {}", status, self);
                (*status, self.to_string())
            }
            _ => {
                tracing::error!("Detection failed: {:?}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Detection failed: {}", self),
                )
            }
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Serialize)]
pub struct DetectResponse {
    /// Base64 encoded JPEG of the annotated inference buffer.
    pub image: String,
    pub detections: DetectionTable,
    /// Size of the buffer the boxes refer to.
    pub image_size: ImageSize,
}

/// Decode, resize, infer, annotate and encode one upload.
pub fn run_detection<M: ModelService + ?Sized>(
    model: &M,
    annotator: &Annotator,
    settings: &DetectionConfig,
    image_data: &[u8],
) -> Result<DetectResponse, DetectError> {
    let image = decode_image(image_data).map_err(DetectError::Decode)?;
    let mut image = resize_square(image, settings.resize_to);
    let (width, height) = image.dimensions();

    let detections = model.predict(&image).map_err(DetectError::Inference)?;

    annotator.annotate(&mut image, &detections);
    let jpeg = encode_jpeg(&image, settings.jpeg_quality).map_err(DetectError::Encode)?;

    Ok(DetectResponse {
        image: encode_base64(&jpeg),
        detections: DetectionTable::from(detections.as_slice()),
        image_size: ImageSize { width, height },
    })
}

impl From<MultipartError> for DetectError {
    fn from(e: MultipartError) -> Self {
        DetectError::Upload {
            status: e.status(),
            message: e.body_text(),
        }
    }
}

async fn read_image_field(multipart: &mut Multipart) -> Result<Bytes, DetectError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some(IMAGE_FIELD) {
            let data = field.bytes().await?;
            if data.is_empty() {
                return Err(DetectError::MissingInput);
            }
            return Ok(data);
        }
    }

    Err(DetectError::MissingInput)
}

#[instrument(skip(state, multipart))]
pub async fn detect(
    State(state): State<SharedState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<DetectResponse>, DetectError> {
    state.metrics.record_request(DETECT_ROUTE);

    let mut multipart = multipart.map_err(|rejection| {
        tracing::debug!("Request is not a readable multipart form: {}", rejection);
        DetectError::MissingInput
    })?;
    let image_data = read_image_field(&mut multipart).await?;
    tracing::debug!("Received image upload of {} bytes", image_data.len());

    let start = Instant::now();
    let model = state.model_service.clone();
    let annotator = state.annotator.clone();
    let settings = state.detection.clone();

    let response = tokio::task::spawn_blocking(move || {
        run_detection(&*model, &annotator, &settings, &image_data)
    })
    .await
    .map_err(|e| DetectError::Task(e.to_string()))??;

    let elapsed_ms = start.elapsed().as_millis() as u64;
    state
        .metrics
        .record_detection_duration(elapsed_ms, DETECT_ROUTE);
    state.metrics.record_detections(response.detections.rows.len());
    tracing::info!(
        "Detected {} objects in {} ms",
        response.detections.rows.len(),
        elapsed_ms
    );

    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        detection::{BoundingBox, Detection, DETECTION_HEADERS},
        lazy_model::{LazyModelService, ModelLoader},
        server::{build_router, test_state},
    };
    use axum::{
        body::Body,
        http::{header::CONTENT_TYPE, Request},
        Router,
    };
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use image::{Rgb, RgbImage};
    use serde_json::{json, Value};
    use std::{
        io::Cursor,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };
    use tower::ServiceExt; // for `oneshot`

    const BOUNDARY: &str = "object-detection-test-boundary";

    struct MockModelService {
        detections: Vec<Detection>,
    }

    impl ModelService for MockModelService {
        fn predict(
            &self,
            _image: &RgbImage,
        ) -> Result<Vec<Detection>, ModelServiceError> {
            Ok(self.detections.clone())
        }
    }

    struct FailingModelService;

    impl ModelService for FailingModelService {
        fn predict(
            &self,
            _image: &RgbImage,
        ) -> Result<Vec<Detection>, ModelServiceError> {
            Err(ModelServiceError::Inference(
                "onnxruntime: node /model.22 failed".to_string(),
            ))
        }
    }

    struct CountingLoader {
        loads: Arc<AtomicUsize>,
    }

    impl ModelLoader for CountingLoader {
        type Model = MockModelService;

        fn load(&self) -> Result<MockModelService, ModelServiceError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(50));
            Ok(MockModelService {
                detections: sample_detections(),
            })
        }
    }

    fn sample_detections() -> Vec<Detection> {
        vec![
            Detection {
                class_id: 16,
                label: "dog".to_string(),
                confidence: 0.91234,
                bbox: BoundingBox {
                    x1: 200.123,
                    y1: 150.456,
                    x2: 440.789,
                    y2: 490.0,
                },
            },
            Detection {
                class_id: 0,
                label: "person".to_string(),
                confidence: 0.4,
                bbox: BoundingBox {
                    x1: 10.0,
                    y1: 20.0,
                    x2: 100.0,
                    y2: 300.0,
                },
            },
        ]
    }

    fn app(model: impl ModelService) -> Router {
        build_router(test_state(Arc::new(model)), 1024 * 1024)
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([90, 120, 200]));
        let mut data = Vec::new();
        img.write_to(&mut Cursor::new(&mut data), image::ImageFormat::Png)
            .unwrap();
        data
    }

    fn multipart_request(field: &str, data: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"upload.png\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri(DETECT_ROUTE)
            .header(
                CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_missing_image_field() {
        let app = app(MockModelService {
            detections: sample_detections(),
        });

        let (status, body) = send(app, multipart_request("file", &png_bytes(8, 8))).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "No image provided"}));
    }

    #[tokio::test]
    async fn test_empty_image_field() {
        let app = app(MockModelService {
            detections: sample_detections(),
        });

        let (status, body) = send(app, multipart_request("image", &[])).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "No image provided"}));
    }

    #[tokio::test]
    async fn test_non_multipart_request() {
        let app = app(MockModelService {
            detections: sample_detections(),
        });
        let request = Request::builder()
            .method("POST")
            .uri(DETECT_ROUTE)
            .body(Body::empty())
            .unwrap();

        let (status, body) = send(app, request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "No image provided"}));
    }

    #[tokio::test]
    async fn test_truncated_multipart_body() {
        let app = app(MockModelService {
            detections: sample_detections(),
        });
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"upload.png\"\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(&png_bytes(8, 8));
        let request = Request::builder()
            .method("POST")
            .uri(DETECT_ROUTE)
            .header(
                CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap();

        let (status, body) = send(app, request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        let message = body["error"].as_str().unwrap();
        assert!(message.starts_with("Invalid upload: "), "{}", message);
    }

    #[tokio::test]
    async fn test_upload_over_body_limit() {
        let app = build_router(
            test_state(Arc::new(MockModelService {
                detections: sample_detections(),
            })),
            1024,
        );

        let (status, body) = send(app, multipart_request("image", &vec![0u8; 8 * 1024])).await;

        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        let message = body["error"].as_str().unwrap();
        assert!(message.starts_with("Invalid upload: "), "{}", message);
    }

    #[tokio::test]
    async fn test_detect_returns_table_and_annotated_image() {
        let app = app(MockModelService {
            detections: sample_detections(),
        });

        let (status, body) = send(app, multipart_request("image", &png_bytes(320, 240))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["detections"]["headers"], json!(DETECTION_HEADERS));
        assert_eq!(
            body["detections"]["rows"],
            json!([
                ["dog", 0.912, 200.12, 150.46, 440.79, 490.0],
                ["person", 0.4, 10.0, 20.0, 100.0, 300.0]
            ])
        );
        assert_eq!(body["image_size"], json!({"width": 640, "height": 640}));

        let jpeg = STANDARD
            .decode(body["image"].as_str().unwrap())
            .unwrap();
        let annotated =
            image::load_from_memory_with_format(&jpeg, image::ImageFormat::Jpeg).unwrap();
        assert_eq!((annotated.width(), annotated.height()), (640, 640));
    }

    #[tokio::test]
    async fn test_trailing_slash_route() {
        let app = app(MockModelService {
            detections: Vec::new(),
        });
        let mut request = multipart_request("image", &png_bytes(16, 16));
        *request.uri_mut() = "/api/detect/".parse().unwrap();

        let (status, _) = send(app, request).await;

        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_no_detections_is_not_an_error() {
        let app = app(MockModelService {
            detections: Vec::new(),
        });

        let (status, body) = send(app, multipart_request("image", &png_bytes(64, 64))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["detections"]["rows"], json!([]));
    }

    #[tokio::test]
    async fn test_undecodable_image() {
        let app = app(MockModelService {
            detections: sample_detections(),
        });

        let (status, body) = send(app, multipart_request("image", b"not an image at all")).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let message = body["error"].as_str().unwrap();
        assert!(message.starts_with("Detection failed: "), "{}", message);
    }

    #[tokio::test]
    async fn test_inference_failure_is_redacted() {
        let app = app(FailingModelService);

        let (status, body) = send(app, multipart_request("image", &png_bytes(32, 32))).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({"error": "Detection failed: inference failed"}));
    }

    #[tokio::test]
    async fn test_identical_requests_give_identical_tables() {
        let app = app(MockModelService {
            detections: sample_detections(),
        });
        let image = png_bytes(100, 80);

        let (_, first) = send(app.clone(), multipart_request("image", &image)).await;
        let (_, second) = send(app, multipart_request("image", &image)).await;

        assert_eq!(first["detections"], second["detections"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_requests_load_model_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let app = app(LazyModelService::new(CountingLoader {
            loads: loads.clone(),
        }));
        let image = png_bytes(32, 32);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let app = app.clone();
                let request = multipart_request("image", &image);
                tokio::spawn(async move { send(app, request).await })
            })
            .collect();

        for handle in handles {
            let (status, body) = handle.await.unwrap();
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["detections"]["rows"].as_array().unwrap().len(), 2);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }
}
