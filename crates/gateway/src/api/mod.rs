//! HTTP surface. Streaming endpoints return `application/x-ndjson`
//! bodies (one JSON object per line); everything else is JSON.

pub mod blocks;
pub mod fragments;
pub mod generate;
pub mod librarian;
pub mod plugins;
pub mod stories;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use quill_domain::Error;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stories", post(stories::create).get(stories::list))
        .route(
            "/stories/{sid}",
            get(stories::get_story)
                .patch(stories::update)
                .delete(stories::delete),
        )
        .route("/stories/{sid}/generate", post(generate::generate))
        .route("/stories/{sid}/generate/stop", post(generate::stop))
        .route("/stories/{sid}/generation-logs", get(generate::list_logs))
        .route("/stories/{sid}/generation-logs/{lid}", get(generate::get_log))
        .route("/stories/{sid}/suggest-directions", post(generate::suggest))
        .route(
            "/stories/{sid}/fragments",
            get(fragments::list).post(fragments::create),
        )
        .route(
            "/stories/{sid}/fragments/{fid}",
            get(fragments::get_fragment)
                .patch(fragments::update)
                .delete(fragments::delete),
        )
        .route(
            "/stories/{sid}/fragments/{fid}/tags",
            get(fragments::get_tags).put(fragments::put_tags),
        )
        .route("/stories/{sid}/fragments/{fid}/archive", post(fragments::archive))
        .route("/stories/{sid}/fragments/{fid}/restore", post(fragments::restore))
        .route("/stories/{sid}/fragments/{fid}/revert", post(fragments::revert))
        .route("/stories/{sid}/fragments/{fid}/versions", get(fragments::versions))
        .route("/stories/{sid}/block-config", get(blocks::get_config).put(blocks::put_config))
        .route("/stories/{sid}/librarian/stream", get(librarian::stream))
        .route("/stories/{sid}/librarian/status", get(librarian::status))
        .route("/stories/{sid}/active-agents", get(librarian::active_agents))
        .route("/plugins", get(plugins::list))
        .route("/instructions/reload", post(plugins::reload_instructions))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Map an error kind onto its HTTP status and the standard
/// `{ "error": "<message>" }` body.
pub(crate) fn error_response(e: Error) -> Response {
    let status = match &e {
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::Validation(_) | Error::UnknownInstruction(_) => StatusCode::BAD_REQUEST,
        Error::Conflict { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
}

/// NDJSON response over a stream of pre-serialized lines.
pub(crate) fn ndjson_response<S>(lines: S) -> Response
where
    S: futures_core::Stream<Item = String> + Send + 'static,
{
    use futures_util::StreamExt;
    let body = axum::body::Body::from_stream(
        lines.map(|line| Ok::<_, std::convert::Infallible>(line)),
    );
    (
        [(header::CONTENT_TYPE, "application/x-ndjson; charset=utf-8")],
        body,
    )
        .into_response()
}
