//! Generation-log store — one JSON file per run plus a newest-first
//! summary index. Index appends are serialized to prevent `_index.json`
//! loss under concurrent saves.

use std::path::PathBuf;

use parking_lot::Mutex;

use quill_domain::genlog::{GenerationLog, GenerationLogSummary};
use quill_domain::Result;

use crate::atomic::{read_json, write_json_atomic};

pub struct GenerationLogStore {
    data_dir: PathBuf,
    index_lock: Mutex<()>,
}

impl GenerationLogStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into(), index_lock: Mutex::new(()) }
    }

    fn logs_dir(&self, story_id: &str) -> PathBuf {
        crate::content_dir(&self.data_dir, story_id).join("generation-logs")
    }

    fn log_path(&self, story_id: &str, id: &str) -> PathBuf {
        self.logs_dir(story_id).join(format!("{id}.json"))
    }

    fn index_path(&self, story_id: &str) -> PathBuf {
        self.logs_dir(story_id).join("_index.json")
    }

    /// Persist a log and prepend its summary to the index.
    pub fn save(&self, story_id: &str, log: &GenerationLog) -> Result<()> {
        write_json_atomic(&self.log_path(story_id, &log.id), log)?;

        let _guard = self.index_lock.lock();
        let mut index: Vec<GenerationLogSummary> =
            read_json(&self.index_path(story_id)).unwrap_or_default();
        index.retain(|s| s.id != log.id);
        index.insert(0, GenerationLogSummary::from(log));
        write_json_atomic(&self.index_path(story_id), &index)?;

        tracing::debug!(story_id, log_id = %log.id, "generation log saved");
        Ok(())
    }

    pub fn get(&self, story_id: &str, id: &str) -> Option<GenerationLog> {
        read_json(&self.log_path(story_id, id))
    }

    /// Summary list, newest first. Rebuilt from the log files when the
    /// index is missing.
    pub fn list(&self, story_id: &str) -> Vec<GenerationLogSummary> {
        if let Some(index) = read_json::<Vec<GenerationLogSummary>>(&self.index_path(story_id)) {
            return index;
        }

        let mut entries = Vec::new();
        if let Ok(read_dir) = std::fs::read_dir(self.logs_dir(story_id)) {
            for entry in read_dir.flatten() {
                let path = entry.path();
                if path.file_name().and_then(|n| n.to_str()) == Some("_index.json") {
                    continue;
                }
                if let Some(log) = read_json::<GenerationLog>(&path) {
                    entries.push(GenerationLogSummary::from(&log));
                }
            }
        }
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        if !entries.is_empty() {
            let _guard = self.index_lock.lock();
            if let Err(e) = write_json_atomic(&self.index_path(story_id), &entries) {
                tracing::warn!(story_id, error = %e, "failed to persist rebuilt log index");
            }
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use quill_domain::genlog::GenerationMode;

    fn sample(input: &str) -> GenerationLog {
        GenerationLog {
            id: GenerationLog::new_id(),
            created_at: Utc::now(),
            mode: GenerationMode::Generate,
            input: input.into(),
            messages: Vec::new(),
            tool_calls: Vec::new(),
            generated_text: "prose".into(),
            fragment_id: None,
            model: "anthropic/test".into(),
            duration_ms: 40,
            step_count: 1,
            finish_reason: "stop".into(),
            steps_exceeded: false,
            total_usage: None,
            reasoning: None,
        }
    }

    #[test]
    fn newest_save_appears_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = GenerationLogStore::new(dir.path());

        let older = sample("one");
        store.save("s1", &older).unwrap();
        let mut newer = sample("two");
        newer.created_at = older.created_at + chrono::Duration::seconds(1);
        store.save("s1", &newer).unwrap();

        let index = store.list("s1");
        assert_eq!(index.len(), 2);
        assert_eq!(index[0].id, newer.id);
        assert_eq!(index[1].id, older.id);
    }

    #[test]
    fn save_then_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = GenerationLogStore::new(dir.path());
        let log = sample("hello");
        store.save("s1", &log).unwrap();
        let back = store.get("s1", &log.id).unwrap();
        assert_eq!(back.generated_text, "prose");
    }

    #[test]
    fn index_rebuilt_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = GenerationLogStore::new(dir.path());
        let log = sample("hello");
        store.save("s1", &log).unwrap();

        std::fs::remove_file(
            dir.path().join("stories/s1/content/generation-logs/_index.json"),
        )
        .unwrap();

        let index = store.list("s1");
        assert_eq!(index.len(), 1);
        assert_eq!(index[0].id, log.id);
    }
}
