use crate::detection::Detection;
use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelServiceError {
    #[error("Failed to load model: {0}")]
    Load(String),
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Unexpected model output: {0}")]
    Output(String),
    #[error("Session mutex poisoned: {0}")]
    Poisoned(String),
}

/// Object detector. Implementations are shared read-only between requests and
/// must be callable concurrently.
///
/// `predict` blocks the calling thread; async callers should run it on the
/// blocking pool. Returned boxes are expressed in the pixel space of `image`.
pub trait ModelService: Send + Sync + 'static {
    fn predict(&self, image: &RgbImage) -> Result<Vec<Detection>, ModelServiceError>;

    /// Whether the underlying model is loaded and ready to serve.
    fn is_ready(&self) -> bool {
        true
    }
}

impl<M: ModelService + ?Sized> ModelService for Arc<M> {
    fn predict(&self, image: &RgbImage) -> Result<Vec<Detection>, ModelServiceError> {
        (**self).predict(image)
    }

    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }
}
