//! Fragment model — the persisted unit of story content.
//!
//! A fragment is a small typed document (prose, character, guideline,
//! knowledge). Identity is `{prefix}-{suffix}` where `prefix` is the
//! two-character kind code and `suffix` is 4..8 lowercase alphanumerics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fragment kinds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A registered fragment kind: a name plus its two-character id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentKind {
    pub name: &'static str,
    pub prefix: &'static str,
}

/// The registered kind table. Listings and id derivation go through this;
/// adding a kind here is all that is needed to register a new type.
pub const KINDS: &[FragmentKind] = &[
    FragmentKind { name: "prose", prefix: "pr" },
    FragmentKind { name: "character", prefix: "ch" },
    FragmentKind { name: "guideline", prefix: "gl" },
    FragmentKind { name: "knowledge", prefix: "kn" },
];

pub fn kind_by_name(name: &str) -> Option<&'static FragmentKind> {
    KINDS.iter().find(|k| k.name == name)
}

pub fn kind_by_prefix(prefix: &str) -> Option<&'static FragmentKind> {
    KINDS.iter().find(|k| k.prefix == prefix)
}

/// Resolve a kind name or fail with a validation error.
pub fn require_kind(name: &str) -> Result<&'static FragmentKind> {
    kind_by_name(name)
        .ok_or_else(|| Error::Validation(format!("unknown fragment type: {name}")))
}

/// Mint a fresh fragment id for a kind: `{prefix}-{6 lowercase alnums}`.
pub fn new_fragment_id(kind: &FragmentKind) -> String {
    format!("{}-{}", kind.prefix, random_suffix(6))
}

/// Random lowercase-alphanumeric suffix, also used for temp-file entropy.
pub fn random_suffix(len: usize) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let idx = rand::Rng::random_range(&mut rng, 0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

/// Check an id against the `{prefix}-{4..8 lowercase alnums}` shape.
pub fn is_valid_fragment_id(id: &str) -> bool {
    let Some((prefix, suffix)) = id.split_once('-') else {
        return false;
    };
    kind_by_prefix(prefix).is_some()
        && (4..=8).contains(&suffix.len())
        && suffix
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fragment
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where a sticky fragment is injected into the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Placement {
    System,
    #[default]
    User,
}

/// Snapshot of a fragment's previous state, appended on every versioned
/// change. `version` is the version the snapshot captures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentSnapshot {
    pub version: u64,
    pub name: String,
    pub description: String,
    pub content: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fragment {
    pub id: String,
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
    pub archived: bool,
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub meta: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
    #[serde(default)]
    pub versions: Vec<FragmentSnapshot>,
}

impl Fragment {
    /// Build a new version-1 fragment for a kind.
    pub fn new(kind: &FragmentKind, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_fragment_id(kind),
            kind: kind.name.to_string(),
            name: name.into(),
            description: String::new(),
            content: String::new(),
            sticky: false,
            placement: Placement::User,
            archived: false,
            order: 0,
            tags: Vec::new(),
            meta: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            version: 1,
            versions: Vec::new(),
        }
    }

    /// Snapshot the current state into `versions` and bump `version`.
    /// Called before applying a name/description/content change.
    pub fn push_snapshot(&mut self) {
        self.versions.push(FragmentSnapshot {
            version: self.version,
            name: self.name.clone(),
            description: self.description.clone(),
            content: self.content.clone(),
            updated_at: self.updated_at,
        });
        self.version += 1;
    }
}

/// Lightweight listing entry kept in the per-story `_index.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentSummary {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub sticky: bool,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Fragment> for FragmentSummary {
    fn from(f: &Fragment) -> Self {
        Self {
            id: f.id.clone(),
            kind: f.kind.clone(),
            name: f.name.clone(),
            description: f.description.clone(),
            sticky: f.sticky,
            archived: f.archived,
            order: f.order,
            tags: f.tags.clone(),
            updated_at: f.updated_at,
        }
    }
}
