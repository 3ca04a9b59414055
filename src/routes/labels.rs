use crate::{labels::ClassLabel, server::SharedState};
use axum::{extract::State, Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct LabelsResponse {
    labels: Vec<ClassLabel>,
}

pub async fn class_labels(State(state): State<SharedState>) -> Json<LabelsResponse> {
    Json(LabelsResponse {
        labels: state.labels.as_ref().clone(),
    })
}
