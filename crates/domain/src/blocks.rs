//! Context blocks and the per-story block configuration.
//!
//! Blocks are the ordered pieces the final prompt messages are built
//! from. Builtin producers emit one block per logical section; stories
//! may add custom blocks (verbatim text or script-evaluated) and
//! override builtin ones through [`BlockConfig`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::fragment::random_suffix;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ContextBlock
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockRole {
    System,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockSource {
    Builtin,
    Custom,
}

/// One ordered piece of the final prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextBlock {
    pub id: String,
    pub role: BlockRole,
    pub content: String,
    pub order: i64,
    pub source: BlockSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Block configuration (persisted per story)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CustomBlockKind {
    Simple,
    Script,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomBlockDefinition {
    pub id: String,
    pub name: String,
    pub role: BlockRole,
    #[serde(default)]
    pub order: i64,
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind: CustomBlockKind,
    /// Verbatim text for `simple`, a script body for `script`.
    #[serde(default)]
    pub content: String,
}

fn d_true() -> bool {
    true
}

impl CustomBlockDefinition {
    pub fn new_id() -> String {
        format!("cb-{}", random_suffix(4))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentMode {
    Override,
    Prepend,
    Append,
}

/// Per-block override applied after block production.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlockOverride {
    pub enabled: Option<bool>,
    pub order: Option<i64>,
    pub content_mode: Option<ContentMode>,
    pub custom_content: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlockConfig {
    pub custom_blocks: Vec<CustomBlockDefinition>,
    pub overrides: HashMap<String, BlockOverride>,
    pub block_order: Vec<String>,
}
