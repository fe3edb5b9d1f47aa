//! Plugin manifest listing and instruction reload.

use axum::extract::State;
use axum::response::{IntoResponse, Json};
use serde_json::json;

use crate::state::AppState;

/// List `manifest.json` documents from the plugin directory. Unreadable
/// manifests are skipped.
pub async fn list(State(state): State<AppState>) -> impl IntoResponse {
    let mut manifests = Vec::new();
    let dir = &state.deps.config.storage.plugins_dir;
    if let Ok(read_dir) = std::fs::read_dir(dir) {
        for entry in read_dir.flatten() {
            let path = entry.path().join("manifest.json");
            if let Some(manifest) =
                quill_store::atomic::read_json::<serde_json::Value>(&path)
            {
                manifests.push(manifest);
            }
        }
    }
    Json(manifests)
}

/// Re-scan the instruction-set override directory.
pub async fn reload_instructions(State(state): State<AppState>) -> impl IntoResponse {
    let sets = state.deps.instructions.reload();
    Json(json!({ "sets": sets }))
}
