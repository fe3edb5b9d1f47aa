//! Generation logs — one persisted record per pipeline run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fragment::random_suffix;
use crate::stream::{ToolCallRecord, Usage};
use crate::tool::Message;

/// Pipeline mode that produced a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GenerationMode {
    #[default]
    Generate,
    Regenerate,
    Refine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationLog {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub mode: GenerationMode,
    pub input: String,
    pub messages: Vec<Message>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub generated_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fragment_id: Option<String>,
    pub model: String,
    pub duration_ms: u64,
    pub step_count: u32,
    pub finish_reason: String,
    #[serde(default)]
    pub steps_exceeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl GenerationLog {
    pub fn new_id() -> String {
        format!("gen-{}", random_suffix(8))
    }
}

/// Lightweight entry kept newest-first in the log `_index.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationLogSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub mode: GenerationMode,
    /// First 200 chars of the author input.
    pub input: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fragment_id: Option<String>,
    pub duration_ms: u64,
    pub step_count: u32,
    pub finish_reason: String,
}

impl From<&GenerationLog> for GenerationLogSummary {
    fn from(log: &GenerationLog) -> Self {
        let mut input = log.input.clone();
        if input.len() > 200 {
            let mut cut = 200;
            while !input.is_char_boundary(cut) {
                cut -= 1;
            }
            input.truncate(cut);
        }
        Self {
            id: log.id.clone(),
            created_at: log.created_at,
            mode: log.mode,
            input,
            model: log.model.clone(),
            fragment_id: log.fragment_id.clone(),
            duration_ms: log.duration_ms,
            step_count: log.step_count,
            finish_reason: log.finish_reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_log(input: &str) -> GenerationLog {
        GenerationLog {
            id: GenerationLog::new_id(),
            created_at: Utc::now(),
            mode: GenerationMode::Generate,
            input: input.into(),
            messages: Vec::new(),
            tool_calls: Vec::new(),
            generated_text: String::new(),
            fragment_id: None,
            model: "anthropic/test".into(),
            duration_ms: 12,
            step_count: 1,
            finish_reason: "stop".into(),
            steps_exceeded: false,
            total_usage: None,
            reasoning: None,
        }
    }

    #[test]
    fn summary_truncates_input_on_char_boundary() {
        let long = "é".repeat(150); // 300 bytes
        let summary = GenerationLogSummary::from(&sample_log(&long));
        assert!(summary.input.len() <= 200);
        assert!(summary.input.chars().all(|c| c == 'é'));
    }

    #[test]
    fn log_ids_have_gen_prefix() {
        assert!(GenerationLog::new_id().starts_with("gen-"));
    }
}
