//! Per-story block configuration endpoints.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Json};

use quill_domain::blocks::BlockConfig;

use super::error_response;
use crate::state::AppState;

pub async fn get_config(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> impl IntoResponse {
    if let Err(e) = state.deps.stories.require(&sid) {
        return error_response(e);
    }
    Json(state.deps.block_configs.load(&sid)).into_response()
}

pub async fn put_config(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    Json(config): Json<BlockConfig>,
) -> impl IntoResponse {
    if let Err(e) = state.deps.stories.require(&sid) {
        return error_response(e);
    }
    match state.deps.block_configs.save(&sid, &config) {
        Ok(()) => Json(config).into_response(),
        Err(e) => error_response(e),
    }
}
