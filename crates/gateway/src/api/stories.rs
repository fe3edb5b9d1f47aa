//! Story CRUD endpoints.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Json};
use serde::Deserialize;

use quill_domain::story::{Story, StorySettings};

use super::error_response;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateStory {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateStory>,
) -> impl IntoResponse {
    let mut story = Story::new(body.name);
    story.description = body.description;
    match state.deps.stories.create(&story) {
        Ok(()) => Json(story).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn list(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.deps.stories.list())
}

pub async fn get_story(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> impl IntoResponse {
    match state.deps.stories.require(&sid) {
        Ok(story) => Json(story).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStory {
    pub name: Option<String>,
    pub description: Option<String>,
    pub summary: Option<String>,
    pub settings: Option<StorySettings>,
}

pub async fn update(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    Json(body): Json<UpdateStory>,
) -> impl IntoResponse {
    let result = state.deps.stories.update(&sid, |story| {
        if let Some(name) = body.name {
            story.name = name;
        }
        if let Some(description) = body.description {
            story.description = description;
        }
        if let Some(summary) = body.summary {
            story.summary = summary;
        }
        if let Some(settings) = body.settings {
            story.settings = settings;
        }
    });
    match result {
        Ok(story) => Json(story).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn delete(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> impl IntoResponse {
    match state.deps.stories.delete(&sid) {
        Ok(()) => Json(serde_json::json!({ "deleted": sid })).into_response(),
        Err(e) => error_response(e),
    }
}
