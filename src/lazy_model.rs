use crate::{
    detection::Detection,
    model_service::{ModelService, ModelServiceError},
};
use image::RgbImage;
use once_cell::sync::OnceCell;

/// Produces a model on first use.
pub trait ModelLoader: Send + Sync + 'static {
    type Model: ModelService;

    fn load(&self) -> Result<Self::Model, ModelServiceError>;
}

/// Defers model loading until the first prediction.
///
/// Concurrent first callers block on a single initialisation, so the loader
/// succeeds at most once. A failed load is not cached; the next request tries
/// again.
pub struct LazyModelService<L: ModelLoader> {
    loader: L,
    model: OnceCell<L::Model>,
}

impl<L: ModelLoader> LazyModelService<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            model: OnceCell::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.model.get().is_some()
    }

    fn model(&self) -> Result<&L::Model, ModelServiceError> {
        self.model.get_or_try_init(|| {
            tracing::info!("Loading model on first request");
            let model = self.loader.load();
            if let Err(e) = &model {
                tracing::error!("Lazy model load failed: {}", e);
            }
            model
        })
    }
}

impl<L: ModelLoader> ModelService for LazyModelService<L> {
    fn predict(&self, image: &RgbImage) -> Result<Vec<Detection>, ModelServiceError> {
        self.model()?.predict(image)
    }

    fn is_ready(&self) -> bool {
        self.is_loaded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BoundingBox;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    };

    struct StaticModel;

    impl ModelService for StaticModel {
        fn predict(&self, _image: &RgbImage) -> Result<Vec<Detection>, ModelServiceError> {
            Ok(vec![Detection {
                class_id: 16,
                label: "dog".to_string(),
                confidence: 0.9,
                bbox: BoundingBox {
                    x1: 1.0,
                    y1: 2.0,
                    x2: 3.0,
                    y2: 4.0,
                },
            }])
        }
    }

    struct CountingLoader {
        loads: Arc<AtomicUsize>,
        failures_before_success: usize,
    }

    impl ModelLoader for CountingLoader {
        type Model = StaticModel;

        fn load(&self) -> Result<StaticModel, ModelServiceError> {
            let attempt = self.loads.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            if attempt < self.failures_before_success {
                return Err(ModelServiceError::Load("not yet".to_string()));
            }
            Ok(StaticModel)
        }
    }

    #[test]
    fn test_loads_once_under_concurrency() {
        let loads = Arc::new(AtomicUsize::new(0));
        let service = Arc::new(LazyModelService::new(CountingLoader {
            loads: loads.clone(),
            failures_before_success: 0,
        }));
        assert!(!service.is_loaded());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let service = service.clone();
                thread::spawn(move || service.predict(&RgbImage::new(8, 8)))
            })
            .collect();

        for handle in handles {
            let detections = handle.join().unwrap().unwrap();
            assert_eq!(detections.len(), 1);
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(service.is_loaded());
    }

    #[test]
    fn test_failed_load_is_retried() {
        let loads = Arc::new(AtomicUsize::new(0));
        let service = LazyModelService::new(CountingLoader {
            loads: loads.clone(),
            failures_before_success: 1,
        });

        let first = service.predict(&RgbImage::new(8, 8));
        assert!(matches!(first, Err(ModelServiceError::Load(_))));
        assert!(!service.is_loaded());

        let second = service.predict(&RgbImage::new(8, 8)).unwrap();
        assert_eq!(second[0].label, "dog");
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }
}
