//! File-backed persistence for the Quill story server.
//!
//! One directory per story under `{data_dir}/stories/{sid}`:
//!
//! ```text
//! stories/{sid}/
//!   meta.json
//!   content/
//!     fragments/ <id>.json, _index.json
//!     generation-logs/ <lid>.json, _index.json
//!     block-config.json
//!     librarian/ suggestions.json
//! ```
//!
//! Every JSON write goes through [`atomic::write_json_atomic`]
//! (temp file + rename), so readers never observe a partial document.

pub mod atomic;
pub mod block_config;
pub mod fragments;
pub mod logs;
pub mod stories;

pub use block_config::BlockConfigStore;
pub use fragments::FragmentStore;
pub use logs::GenerationLogStore;
pub use stories::StoryStore;

use std::path::{Path, PathBuf};

/// Directory of a story under the data root.
pub fn story_dir(data_dir: &Path, story_id: &str) -> PathBuf {
    data_dir.join("stories").join(story_id)
}

/// `content/` directory of a story.
pub fn content_dir(data_dir: &Path, story_id: &str) -> PathBuf {
    story_dir(data_dir, story_id).join("content")
}
