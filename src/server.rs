use crate::{
    config::{DetectionConfig, ServerConfig},
    image_pipeline::Annotator,
    labels::ClassLabel,
    model_service::ModelService,
    routes::api_routes,
    telemetry::Metrics,
};
use axum::{extract::DefaultBodyLimit, Router};
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

#[derive(Clone)]
pub struct SharedState {
    pub model_service: Arc<dyn ModelService>,
    pub annotator: Arc<Annotator>,
    pub labels: Arc<Vec<ClassLabel>>,
    pub detection: DetectionConfig,
    pub metrics: Arc<Metrics>,
}

pub fn build_router(state: SharedState, max_upload_bytes: usize) -> Router {
    let metrics_layer = HttpMetricsLayerBuilder::new().build();

    Router::new()
        .merge(api_routes())
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(metrics_layer)
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(state: SharedState, config: &ServerConfig) -> anyhow::Result<Self> {
        let addr = config.get_address();
        let router = build_router(state, config.max_upload_bytes);
        let listener = TcpListener::bind(&addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(
        self,
        mut shutdown_rx: Receiver<()>,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await.ok();
                })
                .await?;
            tracing::info!("HTTP server stopped");
            Ok(())
        });

        Ok(server_handle)
    }
}

#[cfg(test)]
pub(crate) fn test_state(model_service: Arc<dyn ModelService>) -> SharedState {
    use crate::config::AnnotationConfig;

    let labels = Arc::new(vec![
        ClassLabel {
            label: "person".to_string(),
            red: 255,
            green: 56,
            blue: 56,
        },
        ClassLabel {
            label: "dog".to_string(),
            red: 82,
            green: 0,
            blue: 133,
        },
    ]);
    let annotator = Annotator::new(&AnnotationConfig::default(), labels.clone())
        .expect("annotator without font");

    SharedState {
        model_service,
        annotator: Arc::new(annotator),
        labels,
        detection: DetectionConfig::default(),
        metrics: Arc::new(Metrics::new().expect("metrics registry")),
    }
}
