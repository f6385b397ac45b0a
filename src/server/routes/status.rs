//! Status and discovery endpoints

use axum::{extract::State, routing::get, Json, Router};

use crate::api::{LanguagesResponse, StatusResponse};
use crate::server::state::ServerState;

pub fn create_router() -> Router<ServerState> {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/languages", get(languages))
}

/// Accelerator and model status. Never waits for a load in progress.
pub async fn status(State(state): State<ServerState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        gpu: state.accelerator.as_ref().clone(),
        model: state.model_host.status().into(),
    })
}

pub async fn languages() -> Json<LanguagesResponse> {
    Json(LanguagesResponse::default())
}
