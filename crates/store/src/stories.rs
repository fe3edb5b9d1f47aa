//! Story store — `meta.json` per story directory.

use std::path::PathBuf;

use parking_lot::Mutex;

use quill_domain::story::Story;
use quill_domain::{Error, Result};

use crate::atomic::{read_json, write_json_atomic};

pub struct StoryStore {
    data_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl StoryStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into(), write_lock: Mutex::new(()) }
    }

    fn meta_path(&self, story_id: &str) -> PathBuf {
        crate::story_dir(&self.data_dir, story_id).join("meta.json")
    }

    pub fn create(&self, story: &Story) -> Result<()> {
        let _guard = self.write_lock.lock();
        let path = self.meta_path(&story.id);
        if path.exists() {
            return Err(Error::Validation(format!("story {} already exists", story.id)));
        }
        write_json_atomic(&path, story)?;
        tracing::info!(story_id = %story.id, name = %story.name, "story created");
        Ok(())
    }

    pub fn get(&self, story_id: &str) -> Option<Story> {
        read_json(&self.meta_path(story_id))
    }

    pub fn require(&self, story_id: &str) -> Result<Story> {
        self.get(story_id)
            .ok_or_else(|| Error::not_found("story", story_id))
    }

    /// All stories under the data root, newest first.
    pub fn list(&self) -> Vec<Story> {
        let mut stories = Vec::new();
        let root = self.data_dir.join("stories");
        if let Ok(read_dir) = std::fs::read_dir(&root) {
            for entry in read_dir.flatten() {
                if let Some(story) = read_json::<Story>(&entry.path().join("meta.json")) {
                    stories.push(story);
                }
            }
        }
        stories.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        stories
    }

    /// Read-modify-write under the store lock.
    pub fn update<F>(&self, story_id: &str, f: F) -> Result<Story>
    where
        F: FnOnce(&mut Story),
    {
        let _guard = self.write_lock.lock();
        let mut story = self.require(story_id)?;
        f(&mut story);
        write_json_atomic(&self.meta_path(story_id), &story)?;
        Ok(story)
    }

    /// Replace the rolling librarian summary.
    pub fn update_summary(&self, story_id: &str, summary: String) -> Result<Story> {
        self.update(story_id, |story| story.summary = summary)
    }

    pub fn delete(&self, story_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        let dir = crate::story_dir(&self.data_dir, story_id);
        if !dir.join("meta.json").exists() {
            return Err(Error::not_found("story", story_id));
        }
        std::fs::remove_dir_all(&dir)?;
        tracing::info!(story_id, "story deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_get_list_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = StoryStore::new(dir.path());

        let story = Story::new("Voyage");
        store.create(&story).unwrap();

        let back = store.get(&story.id).unwrap();
        assert_eq!(back.name, "Voyage");
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn duplicate_create_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = StoryStore::new(dir.path());
        let story = Story::new("Voyage");
        store.create(&story).unwrap();
        assert!(matches!(store.create(&story), Err(Error::Validation(_))));
    }

    #[test]
    fn update_summary_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = StoryStore::new(dir.path());
        let story = Story::new("Voyage");
        store.create(&story).unwrap();

        store.update_summary(&story.id, "so far: a storm".into()).unwrap();
        assert_eq!(store.get(&story.id).unwrap().summary, "so far: a storm");
    }

    #[test]
    fn delete_missing_story_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = StoryStore::new(dir.path());
        assert!(matches!(store.delete("st-none"), Err(Error::NotFound { .. })));
    }
}
