//! Fragment CRUD, tags, lifecycle and version endpoints.

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;

use quill_domain::fragment::Placement;
use quill_domain::Error;
use quill_store::fragments::{AttributePatch, NewFragment, VersionedPatch};

use super::error_response;
use crate::state::AppState;

fn require_story(state: &AppState, sid: &str) -> Result<(), Error> {
    state.deps.stories.require(sid).map(|_| ())
}

// ── Listing + CRUD ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub include_archived: bool,
}

pub async fn list(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    if let Err(e) = require_story(&state, &sid) {
        return error_response(e);
    }
    match state
        .deps
        .fragments
        .list_summaries(&sid, query.kind.as_deref(), query.include_archived)
    {
        Ok(summaries) => Json(summaries).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFragment {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sticky: bool,
    #[serde(default)]
    pub placement: Placement,
    #[serde(default)]
    pub order: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub meta: BTreeMap<String, serde_json::Value>,
}

pub async fn create(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    Json(body): Json<CreateFragment>,
) -> impl IntoResponse {
    if let Err(e) = require_story(&state, &sid) {
        return error_response(e);
    }
    let new = NewFragment {
        kind: body.kind,
        name: body.name,
        description: body.description,
        content: body.content,
        sticky: body.sticky,
        placement: body.placement,
        order: body.order,
        tags: body.tags,
        meta: body.meta,
    };
    match state.deps.fragments.create(&sid, new) {
        Ok(fragment) => Json(fragment).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn get_fragment(
    State(state): State<AppState>,
    Path((sid, fid)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.deps.fragments.get(&sid, &fid) {
        Some(fragment) => Json(fragment).into_response(),
        None => error_response(Error::not_found("fragment", fid)),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchFragment {
    pub name: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    /// Compare-and-swap guard for the versioned fields.
    pub expected_version: Option<u64>,
    pub sticky: Option<bool>,
    pub placement: Option<Placement>,
    pub order: Option<i64>,
    pub tags: Option<Vec<String>>,
    pub meta: Option<BTreeMap<String, serde_json::Value>>,
}

pub async fn update(
    State(state): State<AppState>,
    Path((sid, fid)): Path<(String, String)>,
    Json(body): Json<PatchFragment>,
) -> impl IntoResponse {
    let attributes = AttributePatch {
        sticky: body.sticky,
        placement: body.placement,
        order: body.order,
        tags: body.tags,
        meta: body.meta,
    };
    if !attributes.is_empty() {
        if let Err(e) = state.deps.fragments.update(&sid, &fid, attributes) {
            return error_response(e);
        }
    }

    let versioned = VersionedPatch {
        name: body.name,
        description: body.description,
        content: body.content,
        expected_version: body.expected_version,
    };
    match state.deps.fragments.update_versioned(&sid, &fid, versioned) {
        Ok(fragment) => Json(fragment).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn delete(
    State(state): State<AppState>,
    Path((sid, fid)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.deps.fragments.delete(&sid, &fid) {
        Ok(()) => Json(json!({ "deleted": fid })).into_response(),
        Err(e) => error_response(e),
    }
}

// ── Tags ───────────────────────────────────────────────────────────

pub async fn get_tags(
    State(state): State<AppState>,
    Path((sid, fid)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.deps.fragments.get(&sid, &fid) {
        Some(fragment) => Json(json!({ "tags": fragment.tags })).into_response(),
        None => error_response(Error::not_found("fragment", fid)),
    }
}

#[derive(Debug, Deserialize)]
pub struct PutTags {
    pub tags: Vec<String>,
}

pub async fn put_tags(
    State(state): State<AppState>,
    Path((sid, fid)): Path<(String, String)>,
    Json(body): Json<PutTags>,
) -> impl IntoResponse {
    let patch = AttributePatch { tags: Some(body.tags), ..Default::default() };
    match state.deps.fragments.update(&sid, &fid, patch) {
        Ok(fragment) => Json(json!({ "tags": fragment.tags })).into_response(),
        Err(e) => error_response(e),
    }
}

// ── Lifecycle + versions ───────────────────────────────────────────

pub async fn archive(
    State(state): State<AppState>,
    Path((sid, fid)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.deps.fragments.archive(&sid, &fid) {
        Ok(fragment) => Json(fragment).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn restore(
    State(state): State<AppState>,
    Path((sid, fid)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.deps.fragments.restore(&sid, &fid) {
        Ok(fragment) => Json(fragment).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct RevertBody {
    #[serde(default)]
    pub version: Option<u64>,
}

pub async fn revert(
    State(state): State<AppState>,
    Path((sid, fid)): Path<(String, String)>,
    body: Option<Json<RevertBody>>,
) -> impl IntoResponse {
    let version = body.and_then(|Json(b)| b.version);
    match state.deps.fragments.revert_to_version(&sid, &fid, version) {
        Ok(fragment) => Json(fragment).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn versions(
    State(state): State<AppState>,
    Path((sid, fid)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.deps.fragments.list_versions(&sid, &fid) {
        Ok(versions) => Json(versions).into_response(),
        Err(e) => error_response(e),
    }
}
