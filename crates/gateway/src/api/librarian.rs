//! Librarian stream/status and the active-agent listing.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Json};

use super::ndjson_response;
use crate::state::AppState;

/// Replay-then-follow NDJSON stream of the story's current analysis.
/// Before any analysis has run, the stream is empty and closes
/// immediately.
pub async fn stream(State(state): State<AppState>, Path(sid): Path<String>) -> impl IntoResponse {
    match state.librarian.buffer(&sid) {
        Some(buffer) => ndjson_response(buffer.subscribe()),
        None => ndjson_response(futures_util::stream::empty::<String>()),
    }
}

pub async fn status(State(state): State<AppState>, Path(sid): Path<String>) -> impl IntoResponse {
    Json(state.librarian.status(&sid))
}

pub async fn active_agents(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> impl IntoResponse {
    Json(state.active.list(Some(&sid)))
}
