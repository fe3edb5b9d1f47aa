//! Fragment store — one JSON file per fragment plus a summary index.
//!
//! The `_index.json` beside the fragment files holds
//! [`FragmentSummary`] entries for cheap listings. An in-memory copy is
//! cached per story and rebuilt from the directory when the file is
//! missing or unreadable. Mutations are serialized per process by a
//! single write lock; the atomic rename keeps readers consistent.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};

use quill_domain::fragment::{
    new_fragment_id, require_kind, Fragment, FragmentSnapshot, FragmentSummary, Placement,
};
use quill_domain::{Error, Result};

use crate::atomic::{read_json, write_json_atomic};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Input shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fields accepted when creating a fragment.
#[derive(Debug, Clone, Default)]
pub struct NewFragment {
    pub kind: String,
    pub name: String,
    pub description: String,
    pub content: String,
    pub sticky: bool,
    pub placement: Placement,
    /// When `None`, one past the highest order of the same kind.
    pub order: Option<i64>,
    pub tags: Vec<String>,
    pub meta: BTreeMap<String, serde_json::Value>,
}

/// Versioned fields: changing any of these snapshots the previous state
/// and bumps `version`.
#[derive(Debug, Clone, Default)]
pub struct VersionedPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    /// Compare-and-swap guard; stale values fail with `Conflict`.
    pub expected_version: Option<u64>,
}

/// Non-versioned attribute updates.
#[derive(Debug, Clone, Default)]
pub struct AttributePatch {
    pub sticky: Option<bool>,
    pub placement: Option<Placement>,
    pub order: Option<i64>,
    pub tags: Option<Vec<String>>,
    pub meta: Option<BTreeMap<String, serde_json::Value>>,
}

impl AttributePatch {
    pub fn is_empty(&self) -> bool {
        self.sticky.is_none()
            && self.placement.is_none()
            && self.order.is_none()
            && self.tags.is_none()
            && self.meta.is_none()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// FragmentStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct FragmentStore {
    data_dir: PathBuf,
    /// story_id → (fragment_id → summary).
    index: RwLock<HashMap<String, HashMap<String, FragmentSummary>>>,
    /// Serializes fragment + index mutations per process.
    write_lock: Mutex<()>,
}

impl FragmentStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            index: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    fn fragments_dir(&self, story_id: &str) -> PathBuf {
        crate::content_dir(&self.data_dir, story_id).join("fragments")
    }

    fn fragment_path(&self, story_id: &str, id: &str) -> PathBuf {
        self.fragments_dir(story_id).join(format!("{id}.json"))
    }

    fn index_path(&self, story_id: &str) -> PathBuf {
        self.fragments_dir(story_id).join("_index.json")
    }

    /// Drop all cached indexes (tests, external directory edits).
    pub fn clear_cache(&self) {
        self.index.write().clear();
    }

    // ── Index maintenance ─────────────────────────────────────────

    /// Make sure the story's index is cached, rebuilding from the
    /// directory when the `_index.json` is missing or unreadable.
    fn ensure_index(&self, story_id: &str) {
        if self.index.read().contains_key(story_id) {
            return;
        }

        let entries: Vec<FragmentSummary> = match read_json(&self.index_path(story_id)) {
            Some(entries) => entries,
            None => self.rebuild_index(story_id),
        };
        let map = entries.into_iter().map(|s| (s.id.clone(), s)).collect();
        self.index.write().insert(story_id.to_string(), map);
    }

    /// Scan the fragment directory and rewrite `_index.json`.
    fn rebuild_index(&self, story_id: &str) -> Vec<FragmentSummary> {
        let dir = self.fragments_dir(story_id);
        let mut entries = Vec::new();
        if let Ok(read_dir) = std::fs::read_dir(&dir) {
            for entry in read_dir.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if path.file_name().and_then(|n| n.to_str()) == Some("_index.json") {
                    continue;
                }
                if let Some(fragment) = read_json::<Fragment>(&path) {
                    entries.push(FragmentSummary::from(&fragment));
                }
            }
            tracing::info!(
                story_id,
                fragments = entries.len(),
                "rebuilt fragment index from directory"
            );
            if let Err(e) = write_json_atomic(&self.index_path(story_id), &entries) {
                tracing::warn!(story_id, error = %e, "failed to persist rebuilt index");
            }
        }
        entries
    }

    /// Update the cached + persisted index after a mutation. Caller
    /// holds the write lock.
    fn index_put(&self, story_id: &str, fragment: &Fragment) -> Result<()> {
        self.ensure_index(story_id);
        let entries: Vec<FragmentSummary> = {
            let mut cache = self.index.write();
            let map = cache.entry(story_id.to_string()).or_default();
            map.insert(fragment.id.clone(), FragmentSummary::from(fragment));
            map.values().cloned().collect()
        };
        write_json_atomic(&self.index_path(story_id), &entries)
    }

    fn index_remove(&self, story_id: &str, id: &str) -> Result<()> {
        self.ensure_index(story_id);
        let entries: Vec<FragmentSummary> = {
            let mut cache = self.index.write();
            let map = cache.entry(story_id.to_string()).or_default();
            map.remove(id);
            map.values().cloned().collect()
        };
        write_json_atomic(&self.index_path(story_id), &entries)
    }

    // ── Operations ────────────────────────────────────────────────

    pub fn create(&self, story_id: &str, new: NewFragment) -> Result<Fragment> {
        let kind = require_kind(&new.kind)?;
        if new.name.trim().is_empty() {
            return Err(Error::Validation("fragment name must not be empty".into()));
        }

        let _guard = self.write_lock.lock();
        self.ensure_index(story_id);

        let mut fragment = Fragment::new(kind, new.name);
        // Ids are unique per story; regenerate on the off chance of a
        // suffix collision with an existing file.
        while self.fragment_path(story_id, &fragment.id).exists() {
            fragment.id = new_fragment_id(kind);
        }
        fragment.description = new.description;
        fragment.content = new.content;
        fragment.sticky = new.sticky;
        fragment.placement = new.placement;
        fragment.tags = new.tags;
        fragment.meta = new.meta;
        fragment.order = match new.order {
            Some(order) => order,
            None => self.next_order(story_id, kind.prefix),
        };

        write_json_atomic(&self.fragment_path(story_id, &fragment.id), &fragment)?;
        self.index_put(story_id, &fragment)?;

        tracing::debug!(story_id, id = %fragment.id, kind = %fragment.kind, "fragment created");
        Ok(fragment)
    }

    fn next_order(&self, story_id: &str, prefix: &str) -> i64 {
        let cache = self.index.read();
        cache
            .get(story_id)
            .map(|map| {
                map.values()
                    .filter(|s| s.id.starts_with(prefix))
                    .map(|s| s.order)
                    .max()
                    .map(|m| m + 1)
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    /// Read a fragment. Absent and unparseable files both read as `None`.
    pub fn get(&self, story_id: &str, id: &str) -> Option<Fragment> {
        read_json(&self.fragment_path(story_id, id))
    }

    fn require(&self, story_id: &str, id: &str) -> Result<Fragment> {
        self.get(story_id, id)
            .ok_or_else(|| Error::not_found("fragment", id))
    }

    /// Update non-versioned attributes (sticky, placement, order, tags,
    /// meta). Does not touch `version`.
    pub fn update(&self, story_id: &str, id: &str, patch: AttributePatch) -> Result<Fragment> {
        let _guard = self.write_lock.lock();
        let mut fragment = self.require(story_id, id)?;

        if let Some(sticky) = patch.sticky {
            fragment.sticky = sticky;
        }
        if let Some(placement) = patch.placement {
            fragment.placement = placement;
        }
        if let Some(order) = patch.order {
            fragment.order = order;
        }
        if let Some(tags) = patch.tags {
            fragment.tags = tags;
        }
        if let Some(meta) = patch.meta {
            fragment.meta = meta;
        }
        fragment.updated_at = Utc::now();

        write_json_atomic(&self.fragment_path(story_id, id), &fragment)?;
        self.index_put(story_id, &fragment)?;
        Ok(fragment)
    }

    /// Update name/description/content. When any field actually changes,
    /// the previous state is appended to `versions` and `version` bumps.
    pub fn update_versioned(
        &self,
        story_id: &str,
        id: &str,
        patch: VersionedPatch,
    ) -> Result<Fragment> {
        let _guard = self.write_lock.lock();
        let mut fragment = self.require(story_id, id)?;

        if let Some(expected) = patch.expected_version {
            if expected != fragment.version {
                return Err(Error::Conflict { expected, found: fragment.version });
            }
        }

        let changed = patch.name.as_ref().is_some_and(|v| *v != fragment.name)
            || patch
                .description
                .as_ref()
                .is_some_and(|v| *v != fragment.description)
            || patch.content.as_ref().is_some_and(|v| *v != fragment.content);
        if !changed {
            return Ok(fragment);
        }

        fragment.push_snapshot();
        if let Some(name) = patch.name {
            fragment.name = name;
        }
        if let Some(description) = patch.description {
            fragment.description = description;
        }
        if let Some(content) = patch.content {
            fragment.content = content;
        }
        fragment.updated_at = Utc::now();

        write_json_atomic(&self.fragment_path(story_id, id), &fragment)?;
        self.index_put(story_id, &fragment)?;
        Ok(fragment)
    }

    pub fn archive(&self, story_id: &str, id: &str) -> Result<Fragment> {
        self.set_archived(story_id, id, true)
    }

    pub fn restore(&self, story_id: &str, id: &str) -> Result<Fragment> {
        self.set_archived(story_id, id, false)
    }

    fn set_archived(&self, story_id: &str, id: &str, archived: bool) -> Result<Fragment> {
        let _guard = self.write_lock.lock();
        let mut fragment = self.require(story_id, id)?;
        fragment.archived = archived;
        fragment.updated_at = Utc::now();
        write_json_atomic(&self.fragment_path(story_id, id), &fragment)?;
        self.index_put(story_id, &fragment)?;
        Ok(fragment)
    }

    pub fn delete(&self, story_id: &str, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        let path = self.fragment_path(story_id, id);
        if !path.exists() {
            return Err(Error::not_found("fragment", id));
        }
        std::fs::remove_file(&path)?;
        self.index_remove(story_id, id)?;
        tracing::debug!(story_id, id, "fragment deleted");
        Ok(())
    }

    /// Summary listing, filtered by the 2-char prefix derived from
    /// `kind`. Archived fragments are excluded unless requested.
    pub fn list_summaries(
        &self,
        story_id: &str,
        kind: Option<&str>,
        include_archived: bool,
    ) -> Result<Vec<FragmentSummary>> {
        let prefix = match kind {
            Some(kind) => Some(require_kind(kind)?.prefix),
            None => None,
        };
        self.ensure_index(story_id);

        let cache = self.index.read();
        let mut entries: Vec<FragmentSummary> = cache
            .get(story_id)
            .map(|map| {
                map.values()
                    .filter(|s| prefix.is_none_or(|p| s.id.starts_with(p)))
                    .filter(|s| include_archived || !s.archived)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        entries.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        Ok(entries)
    }

    /// Full-fragment listing in summary order. Entries whose files have
    /// gone unreadable are skipped.
    pub fn list_fragments(
        &self,
        story_id: &str,
        kind: Option<&str>,
        include_archived: bool,
    ) -> Result<Vec<Fragment>> {
        let summaries = self.list_summaries(story_id, kind, include_archived)?;
        Ok(summaries
            .iter()
            .filter_map(|s| self.get(story_id, &s.id))
            .collect())
    }

    pub fn list_versions(&self, story_id: &str, id: &str) -> Result<Vec<FragmentSnapshot>> {
        Ok(self.require(story_id, id)?.versions)
    }

    /// Revert name/description/content to a snapshot (the latest when
    /// `version` is omitted). Always appends a new snapshot recording
    /// the pre-revert state.
    pub fn revert_to_version(
        &self,
        story_id: &str,
        id: &str,
        version: Option<u64>,
    ) -> Result<Fragment> {
        let _guard = self.write_lock.lock();
        let mut fragment = self.require(story_id, id)?;

        let snapshot = match version {
            Some(v) => fragment
                .versions
                .iter()
                .find(|s| s.version == v)
                .cloned()
                .ok_or_else(|| Error::Validation(format!("no snapshot for version {v}")))?,
            None => fragment
                .versions
                .last()
                .cloned()
                .ok_or_else(|| Error::Validation("fragment has no snapshots".into()))?,
        };

        fragment.push_snapshot();
        fragment.name = snapshot.name;
        fragment.description = snapshot.description;
        fragment.content = snapshot.content;
        fragment.updated_at = Utc::now();

        write_json_atomic(&self.fragment_path(story_id, id), &fragment)?;
        self.index_put(story_id, &fragment)?;
        Ok(fragment)
    }

    /// Kind names with at least one registered entry, for tooling.
    pub fn kind_names(&self) -> Vec<&'static str> {
        quill_domain::fragment::KINDS.iter().map(|k| k.name).collect()
    }

    /// Whether the fragment directory exists for a story (used to
    /// distinguish "no fragments" from "no story").
    pub fn story_has_content(&self, story_id: &str) -> bool {
        crate::story_dir(&self.data_dir, story_id).join("meta.json").exists()
    }

    #[doc(hidden)]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FragmentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FragmentStore::new(dir.path());
        (dir, store)
    }

    fn character(name: &str) -> NewFragment {
        NewFragment {
            kind: "character".into(),
            name: name.into(),
            description: "d".into(),
            content: "c".into(),
            ..Default::default()
        }
    }

    #[test]
    fn create_assigns_prefixed_id_and_version_one() {
        let (_dir, store) = store();
        let f = store.create("s1", character("A")).unwrap();
        assert!(f.id.starts_with("ch-"));
        assert_eq!(f.id.len(), "ch-".len() + 6);
        assert_eq!(f.version, 1);
        assert!(f.versions.is_empty());
    }

    #[test]
    fn write_then_read_equal() {
        let (_dir, store) = store();
        let f = store.create("s1", character("A")).unwrap();
        let back = store.get("s1", &f.id).unwrap();
        assert_eq!(serde_json::to_value(&back).unwrap(), serde_json::to_value(&f).unwrap());
    }

    #[test]
    fn versioned_update_snapshots_previous_state() {
        let (_dir, store) = store();
        let f = store.create("s1", character("A")).unwrap();

        store
            .update_versioned(
                "s1",
                &f.id,
                VersionedPatch { content: Some("second".into()), ..Default::default() },
            )
            .unwrap();
        let f = store
            .update_versioned(
                "s1",
                &f.id,
                VersionedPatch { content: Some("third".into()), ..Default::default() },
            )
            .unwrap();

        assert_eq!(f.version, 3);
        assert_eq!(f.versions.len(), 2);
        assert_eq!(f.versions[0].version, 1);
        assert_eq!(f.versions[0].content, "c");
        assert_eq!(f.versions[1].version, 2);
        assert_eq!(f.versions[1].content, "second");
    }

    #[test]
    fn unchanged_versioned_update_is_a_noop() {
        let (_dir, store) = store();
        let f = store.create("s1", character("A")).unwrap();
        let same = store
            .update_versioned(
                "s1",
                &f.id,
                VersionedPatch { content: Some("c".into()), ..Default::default() },
            )
            .unwrap();
        assert_eq!(same.version, 1);
        assert!(same.versions.is_empty());
    }

    #[test]
    fn stale_expected_version_conflicts() {
        let (_dir, store) = store();
        let f = store.create("s1", character("A")).unwrap();
        store
            .update_versioned(
                "s1",
                &f.id,
                VersionedPatch { content: Some("x".into()), ..Default::default() },
            )
            .unwrap();

        let err = store
            .update_versioned(
                "s1",
                &f.id,
                VersionedPatch {
                    content: Some("y".into()),
                    expected_version: Some(1),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { expected: 1, found: 2 }));
    }

    #[test]
    fn attribute_update_does_not_bump_version() {
        let (_dir, store) = store();
        let f = store.create("s1", character("A")).unwrap();
        let f = store
            .update(
                "s1",
                &f.id,
                AttributePatch { sticky: Some(true), tags: Some(vec!["crew".into()]), ..Default::default() },
            )
            .unwrap();
        assert!(f.sticky);
        assert_eq!(f.tags, vec!["crew"]);
        assert_eq!(f.version, 1);
    }

    #[test]
    fn archived_fragments_hidden_from_default_listings() {
        let (_dir, store) = store();
        let a = store.create("s1", character("A")).unwrap();
        let b = store.create("s1", character("B")).unwrap();
        store.archive("s1", &a.id).unwrap();

        let listed = store.list_summaries("s1", None, false).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, b.id);

        let all = store.list_summaries("s1", Some("character"), true).unwrap();
        assert_eq!(all.len(), 2);

        store.restore("s1", &a.id).unwrap();
        assert_eq!(store.list_summaries("s1", None, false).unwrap().len(), 2);
    }

    #[test]
    fn listings_filter_by_kind_prefix() {
        let (_dir, store) = store();
        store.create("s1", character("A")).unwrap();
        store
            .create(
                "s1",
                NewFragment { kind: "prose".into(), name: "ch1".into(), ..Default::default() },
            )
            .unwrap();

        let prose = store.list_summaries("s1", Some("prose"), false).unwrap();
        assert_eq!(prose.len(), 1);
        assert!(prose[0].id.starts_with("pr-"));
    }

    #[test]
    fn unknown_kind_listing_fails_validation() {
        let (_dir, store) = store();
        assert!(matches!(
            store.list_summaries("s1", Some("widget"), false),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn index_rebuilt_after_cache_and_file_loss() {
        let (dir, store) = store();
        let f = store.create("s1", character("A")).unwrap();

        // Simulate a lost index file and a cold cache.
        std::fs::remove_file(
            dir.path()
                .join("stories/s1/content/fragments/_index.json"),
        )
        .unwrap();
        store.clear_cache();

        let listed = store.list_summaries("s1", None, false).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, f.id);
    }

    #[test]
    fn revert_to_latest_snapshot_records_the_revert() {
        let (_dir, store) = store();
        let f = store.create("s1", character("A")).unwrap();
        store
            .update_versioned(
                "s1",
                &f.id,
                VersionedPatch { content: Some("v2".into()), ..Default::default() },
            )
            .unwrap();

        let reverted = store.revert_to_version("s1", &f.id, None).unwrap();
        assert_eq!(reverted.content, "c");
        assert_eq!(reverted.version, 3);
        // Snapshot of the pre-revert state was appended.
        assert_eq!(reverted.versions.last().unwrap().content, "v2");
        assert_eq!(reverted.versions.last().unwrap().version, 2);
    }

    #[test]
    fn revert_to_named_version() {
        let (_dir, store) = store();
        let f = store.create("s1", character("A")).unwrap();
        for content in ["v2", "v3"] {
            store
                .update_versioned(
                    "s1",
                    &f.id,
                    VersionedPatch { content: Some(content.into()), ..Default::default() },
                )
                .unwrap();
        }

        let reverted = store.revert_to_version("s1", &f.id, Some(2)).unwrap();
        assert_eq!(reverted.content, "v2");

        let err = store.revert_to_version("s1", &f.id, Some(99)).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn delete_removes_file_and_index_entry() {
        let (_dir, store) = store();
        let f = store.create("s1", character("A")).unwrap();
        store.delete("s1", &f.id).unwrap();
        assert!(store.get("s1", &f.id).is_none());
        assert!(store.list_summaries("s1", None, true).unwrap().is_empty());
        assert!(matches!(
            store.delete("s1", &f.id),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn corrupt_fragment_file_reads_none() {
        let (dir, store) = store();
        let f = store.create("s1", character("A")).unwrap();
        std::fs::write(
            dir.path()
                .join(format!("stories/s1/content/fragments/{}.json", f.id)),
            "{broken",
        )
        .unwrap();
        assert!(store.get("s1", &f.id).is_none());
    }

    #[test]
    fn orders_default_per_kind() {
        let (_dir, store) = store();
        let a = store.create("s1", character("A")).unwrap();
        let b = store.create("s1", character("B")).unwrap();
        let p = store
            .create(
                "s1",
                NewFragment { kind: "prose".into(), name: "ch1".into(), ..Default::default() },
            )
            .unwrap();
        assert_eq!(a.order, 0);
        assert_eq!(b.order, 1);
        assert_eq!(p.order, 0); // independent sequence per kind
    }
}
