use crate::{
    config::{Config, LoadStrategy, Validatable},
    image_pipeline::Annotator,
    labels::load_labels,
    lazy_model::LazyModelService,
    model_service::ModelService,
    ort_service::{OrtModelLoader, OrtModelService},
    server::{HttpServer, SharedState},
    telemetry::Metrics,
};
use std::{error::Error, sync::Arc};
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let labels = match load_labels(&config.labels.get_path()) {
        Ok(labels) => Arc::new(labels),
        Err(e) => {
            tracing::error!("Failed to load class labels: {:?}", e);
            return Err(Box::new(e));
        }
    };
    tracing::info!("Loaded {} class labels", labels.len());

    let model_service: Arc<dyn ModelService> = match config.model.load_strategy {
        LoadStrategy::Eager => match OrtModelService::new(&config.model, labels.clone()) {
            Ok(service) => Arc::new(service),
            Err(e) => {
                tracing::error!("Failed to initialize model service: {:?}", e);
                return Err(Box::new(e));
            }
        },
        LoadStrategy::Lazy => {
            let loader = OrtModelLoader::new(config.model.clone(), labels.clone());
            tracing::info!(
                "Model {:?} will be loaded on the first detection request",
                loader.model_path()
            );
            Arc::new(LazyModelService::new(loader))
        }
    };

    let annotator = Arc::new(Annotator::new(&config.annotation, labels.clone())?);
    let metrics = Arc::new(Metrics::new()?);

    let state = SharedState {
        model_service,
        annotator,
        labels,
        detection: config.detection.clone(),
        metrics,
    };

    let server = HttpServer::new(state, &config.server).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    server_handle.await??;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
