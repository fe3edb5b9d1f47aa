//! Per-story block configuration (`block-config.json`).

use std::path::PathBuf;

use quill_domain::blocks::BlockConfig;
use quill_domain::Result;

use crate::atomic::{read_json, write_json_atomic};

pub struct BlockConfigStore {
    data_dir: PathBuf,
}

impl BlockConfigStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into() }
    }

    fn path(&self, story_id: &str) -> PathBuf {
        crate::content_dir(&self.data_dir, story_id).join("block-config.json")
    }

    /// Missing or unreadable config reads as the default (no custom
    /// blocks, no overrides).
    pub fn load(&self, story_id: &str) -> BlockConfig {
        read_json(&self.path(story_id)).unwrap_or_default()
    }

    pub fn save(&self, story_id: &str, config: &BlockConfig) -> Result<()> {
        write_json_atomic(&self.path(story_id), config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_domain::blocks::{BlockOverride, ContentMode};

    #[test]
    fn missing_config_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockConfigStore::new(dir.path());
        let cfg = store.load("s1");
        assert!(cfg.custom_blocks.is_empty());
        assert!(cfg.overrides.is_empty());
        assert!(cfg.block_order.is_empty());
    }

    #[test]
    fn save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockConfigStore::new(dir.path());

        let mut cfg = BlockConfig::default();
        cfg.overrides.insert(
            "prose".into(),
            BlockOverride {
                content_mode: Some(ContentMode::Append),
                custom_content: Some("afterword".into()),
                ..Default::default()
            },
        );
        store.save("s1", &cfg).unwrap();

        let back = store.load("s1");
        assert_eq!(back.overrides["prose"].content_mode, Some(ContentMode::Append));
    }
}
