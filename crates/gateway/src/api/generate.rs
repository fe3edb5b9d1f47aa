//! Generation endpoints: the NDJSON stream, cancellation, logs and
//! direction suggestions.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;

use quill_domain::genlog::GenerationMode;
use quill_domain::Error;

use super::{error_response, ndjson_response};
use crate::runtime::pipeline::{self, GenerateRequest};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateBody {
    pub input: String,
    #[serde(default)]
    pub save_result: bool,
    #[serde(default)]
    pub mode: GenerationMode,
    #[serde(default)]
    pub fragment_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

pub async fn generate(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    Json(body): Json<GenerateBody>,
) -> impl IntoResponse {
    let req = GenerateRequest {
        input: body.input,
        save_result: body.save_result,
        mode: body.mode,
        fragment_id: body.fragment_id,
        model: body.model,
    };
    match pipeline::start_generation(&state, &sid, req).await {
        Ok(lines) => ndjson_response(ReceiverStream::new(lines)),
        Err(e) => error_response(e),
    }
}

pub async fn stop(State(state): State<AppState>, Path(sid): Path<String>) -> impl IntoResponse {
    let cancelled = state.cancel_map.cancel(&sid);
    Json(json!({ "cancelled": cancelled }))
}

pub async fn list_logs(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> impl IntoResponse {
    if let Err(e) = state.deps.stories.require(&sid) {
        return error_response(e);
    }
    Json(state.deps.logs.list(&sid)).into_response()
}

pub async fn get_log(
    State(state): State<AppState>,
    Path((sid, lid)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.deps.logs.get(&sid, &lid) {
        Some(log) => Json(log).into_response(),
        None => error_response(Error::not_found("generation log", lid)),
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct SuggestBody {
    #[serde(default)]
    pub count: Option<usize>,
}

pub async fn suggest(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    body: Option<Json<SuggestBody>>,
) -> impl IntoResponse {
    let count = body.and_then(|Json(b)| b.count);
    match pipeline::suggest_directions(&state, &sid, count).await {
        Ok(value) => Json(value).into_response(),
        Err(e) => error_response(e),
    }
}
