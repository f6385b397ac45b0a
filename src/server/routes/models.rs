//! Model management endpoints

use axum::{extract::State, routing::post, Json, Router};
use tracing::info;

use super::ApiError;
use crate::api::{ModelSwitchRequest, ModelSwitchResponse};
use crate::server::state::ServerState;

pub fn create_router() -> Router<ServerState> {
    Router::new().route("/api/model/switch", post(switch_model))
}

/// Load another model variant, replacing the resident one
pub async fn switch_model(
    State(state): State<ServerState>,
    Json(request): Json<ModelSwitchRequest>,
) -> Result<Json<ModelSwitchResponse>, ApiError> {
    let host = &state.model_host;
    let identifier = host.resolve_identifier(Some(&request.model));
    info!("Switching model to {}", identifier);

    let loaded = host.load(&identifier, host.config().quantize).await?;
    Ok(Json(ModelSwitchResponse {
        status: "loaded".to_string(),
        model: loaded.identifier.clone(),
    }))
}
