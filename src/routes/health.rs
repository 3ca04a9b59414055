use crate::server::SharedState;
use axum::{extract::State, Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct HealthStatus {
    status: &'static str,
    model_loaded: bool,
}

/// Liveness probe. A lazily loaded model reports `model_loaded: false` until
/// the first detection request has loaded it.
pub async fn healthcheck(State(state): State<SharedState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "Available",
        model_loaded: state.model_service.is_ready(),
    })
}
