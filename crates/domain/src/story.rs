//! Story model and per-story settings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fragment::random_suffix;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context limit
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextLimitMode {
    Fragments,
    Tokens,
    Characters,
}

/// How much recent prose goes into the prompt window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextLimit {
    pub mode: ContextLimitMode,
    pub value: u64,
}

impl Default for ContextLimit {
    fn default() -> Self {
        Self { mode: ContextLimitMode::Fragments, value: 20 }
    }
}

/// Rough token estimate used by the `tokens` limit mode.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Settings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Plaintext,
    Markdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorySettings {
    pub context_limit: ContextLimit,
    pub max_steps: u32,
    /// 0 disables summarization-threshold behavior.
    pub summarization_threshold: u64,
    pub output_format: OutputFormat,
    pub auto_apply_librarian: bool,
}

impl Default for StorySettings {
    fn default() -> Self {
        Self {
            context_limit: ContextLimit::default(),
            max_steps: 10,
            summarization_threshold: 0,
            output_format: OutputFormat::Plaintext,
            auto_apply_librarian: false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Story
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Rolling summary maintained by the librarian.
    #[serde(default)]
    pub summary: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub settings: StorySettings,
}

impl Story {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: format!("st-{}", random_suffix(6)),
            name: name.into(),
            description: String::new(),
            summary: String::new(),
            created_at: Utc::now(),
            settings: StorySettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_defaults() {
        let s = StorySettings::default();
        assert_eq!(s.max_steps, 10);
        assert_eq!(s.summarization_threshold, 0);
        assert_eq!(s.output_format, OutputFormat::Plaintext);
        assert!(!s.auto_apply_librarian);
        assert_eq!(s.context_limit.mode, ContextLimitMode::Fragments);
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn story_settings_survive_missing_field() {
        // Older meta.json files have no settings key.
        let raw = r#"{"id":"st-abc123","name":"N","createdAt":"2024-01-01T00:00:00Z"}"#;
        let s: Story = serde_json::from_str(raw).unwrap();
        assert_eq!(s.settings.max_steps, 10);
    }
}
