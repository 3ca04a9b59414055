mod detect;
mod health;
mod labels;
mod metrics;

use crate::server::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route(detect::DETECT_ROUTE, post(detect::detect))
        .route("/api/detect/", post(detect::detect))
        .route("/api/labels", get(labels::class_labels))
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
}
