//! Stream grammar: model parts in, NDJSON events out.
//!
//! Providers (and the writer tool loop) produce [`ModelPart`]s; the
//! event-stream adapter converts them into the wire-level
//! [`StreamEvent`] lines and a final [`Completion`] summary.

use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A boxed async stream, used for provider part streams.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Token usage for a completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model parts (internal)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single element of a model part-stream, provider-agnostic.
///
/// `ToolResult` parts never come from a provider; the agent tool loop
/// injects them after executing a call, so downstream consumers see one
/// interleaved sequence.
#[derive(Debug, Clone)]
pub enum ModelPart {
    TextDelta { text: String },
    ReasoningDelta { text: String },
    ToolCall { id: String, tool_name: String, args: serde_json::Value },
    ToolResult { id: String, tool_name: String, result: serde_json::Value },
    /// End of one model step. No line is emitted for this; the adapter
    /// latches the reason and bumps the step count.
    Finish { finish_reason: Option<String>, usage: Option<Usage> },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// NDJSON events (wire)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One NDJSON line. Serialized shape is part of the public API:
/// `{type, ...}` with camelCase keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "reasoning")]
    Reasoning { text: String },

    #[serde(rename = "tool-call")]
    ToolCall {
        id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        args: serde_json::Value,
    },

    #[serde(rename = "tool-result")]
    ToolResult {
        id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        result: serde_json::Value,
    },

    #[serde(rename = "finish")]
    Finish {
        #[serde(rename = "finishReason")]
        finish_reason: String,
        #[serde(rename = "stepCount")]
        step_count: u32,
    },

    /// Emitted only on analysis streams and on hard stream failures.
    #[serde(rename = "error")]
    Error { error: String },
}

impl StreamEvent {
    /// Serialize to one `\n`-terminated NDJSON line.
    pub fn to_ndjson_line(&self) -> String {
        let mut line = serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"type":"error","error":"serialization failed"}"#.into());
        line.push('\n');
        line
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Completion
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Accumulated tool-call record, paired by id downstream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub tool_name: String,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default)]
    pub result: serde_json::Value,
}

/// Resolved once a part-stream closes.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub text: String,
    pub reasoning: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub step_count: u32,
    pub finish_reason: String,
    pub usage: Option<Usage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ndjson_lines_use_spec_keys() {
        let ev = StreamEvent::ToolCall {
            id: "c1".into(),
            tool_name: "getFragment".into(),
            args: serde_json::json!({"id": "ch-abc123"}),
        };
        let line = ev.to_ndjson_line();
        assert!(line.ends_with('\n'));
        let v: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(v["type"], "tool-call");
        assert_eq!(v["toolName"], "getFragment");

        let fin = StreamEvent::Finish { finish_reason: "stop".into(), step_count: 2 };
        let v: serde_json::Value = serde_json::from_str(fin.to_ndjson_line().trim()).unwrap();
        assert_eq!(v["finishReason"], "stop");
        assert_eq!(v["stepCount"], 2);
    }

    #[test]
    fn event_round_trip() {
        let ev = StreamEvent::Text { text: "hello".into() };
        let back: StreamEvent = serde_json::from_str(ev.to_ndjson_line().trim()).unwrap();
        assert_eq!(back, ev);
    }
}
