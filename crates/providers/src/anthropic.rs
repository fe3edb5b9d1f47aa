//! Anthropic Messages adapter.
//!
//! Streams one model step per call, translating the Anthropic SSE event
//! grammar (content blocks, thinking deltas, tool_use assembly) into
//! [`ModelPart`]s. System messages move into the top-level `system`
//! field; tool results become user messages with `tool_result` blocks.

use serde_json::Value;

use quill_domain::config::LlmConfig;
use quill_domain::stream::{BoxStream, ModelPart, Usage};
use quill_domain::tool::{ContentPart, Message, MessageContent, Role, ToolDefinition};
use quill_domain::{Error, Result};

use crate::sse::sse_part_stream;
use crate::traits::{LlmProvider, ModelRequest};
use crate::util::{from_reqwest, resolve_api_key};

const ANTHROPIC_VERSION: &str = "2023-06-01";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AnthropicProvider {
    base_url: String,
    api_key: String,
    default_model: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn from_config(cfg: &LlmConfig) -> Result<Self> {
        let api_key = resolve_api_key(&cfg.api_key_env)?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model: cfg.default_model.clone(),
            client,
        })
    }

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
    }

    fn build_messages_body(&self, req: &ModelRequest) -> Value {
        let model = req
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());

        // Separate out system messages.
        let mut system_parts: Vec<String> = Vec::new();
        let mut api_messages: Vec<Value> = Vec::new();

        for msg in &req.messages {
            match msg.role {
                Role::System => system_parts.push(msg.content.extract_all_text()),
                Role::User => api_messages.push(user_msg_to_anthropic(msg)),
                Role::Assistant => api_messages.push(assistant_msg_to_anthropic(msg)),
                // Anthropic expects tool results as user messages with
                // tool_result content blocks.
                Role::Tool => api_messages.push(tool_result_to_anthropic(msg)),
            }
        }

        let mut body = serde_json::json!({
            "model": model,
            "messages": api_messages,
            "stream": true,
        });

        if !system_parts.is_empty() {
            body["system"] = Value::String(system_parts.join("\n\n"));
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_anthropic).collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        body["max_tokens"] = serde_json::json!(req.max_tokens.unwrap_or(4096));

        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn user_msg_to_anthropic(msg: &Message) -> Value {
    match &msg.content {
        MessageContent::Text(t) => serde_json::json!({
            "role": "user",
            "content": t,
        }),
        MessageContent::Parts(parts) => {
            let content: Vec<Value> = parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(serde_json::json!({
                        "type": "text",
                        "text": text,
                    })),
                    _ => None,
                })
                .collect();
            serde_json::json!({ "role": "user", "content": content })
        }
    }
}

fn assistant_msg_to_anthropic(msg: &Message) -> Value {
    match &msg.content {
        MessageContent::Text(t) => serde_json::json!({
            "role": "assistant",
            "content": [{"type": "text", "text": t}],
        }),
        MessageContent::Parts(parts) => {
            let content: Vec<Value> = parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(serde_json::json!({
                        "type": "text",
                        "text": text,
                    })),
                    ContentPart::ToolUse { id, name, input } => Some(serde_json::json!({
                        "type": "tool_use",
                        "id": id,
                        "name": name,
                        "input": input,
                    })),
                    _ => None,
                })
                .collect();
            serde_json::json!({ "role": "assistant", "content": content })
        }
    }
}

fn tool_result_to_anthropic(msg: &Message) -> Value {
    let content: Vec<Value> = match &msg.content {
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolResult { tool_use_id, content, is_error } => {
                    Some(serde_json::json!({
                        "type": "tool_result",
                        "tool_use_id": tool_use_id,
                        "content": content,
                        "is_error": is_error,
                    }))
                }
                _ => None,
            })
            .collect(),
        MessageContent::Text(t) => vec![serde_json::json!({
            "type": "tool_result",
            "tool_use_id": "",
            "content": t,
        })],
    };
    serde_json::json!({ "role": "user", "content": content })
}

fn tool_to_anthropic(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.parameters,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming SSE parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// State for assembling tool calls from streaming content blocks:
/// block index → (call_id, name, args buffer).
struct StreamState {
    active_tool_calls: std::collections::HashMap<u64, (String, String, String)>,
    usage: Option<Usage>,
    finish_emitted: bool,
}

impl StreamState {
    fn new() -> Self {
        Self {
            active_tool_calls: std::collections::HashMap::new(),
            usage: None,
            finish_emitted: false,
        }
    }
}

fn parse_usage(v: &Value) -> Option<Usage> {
    let input = v.get("input_tokens")?.as_u64()? as u32;
    let output = v.get("output_tokens")?.as_u64()? as u32;
    Some(Usage {
        prompt_tokens: input,
        completion_tokens: output,
        total_tokens: input + output,
    })
}

fn map_stop_reason(s: &str) -> String {
    match s {
        "end_turn" => "stop".to_string(),
        "tool_use" => "tool-calls".to_string(),
        "max_tokens" => "length".to_string(),
        other => other.to_string(),
    }
}

/// Parse a single Anthropic SSE data payload into zero or more parts.
fn parse_anthropic_sse(data: &str, state: &mut StreamState) -> Vec<Result<ModelPart>> {
    let mut parts = Vec::new();

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            parts.push(Err(Error::Json(e)));
            return parts;
        }
    };

    let event_type = v.get("type").and_then(|v| v.as_str()).unwrap_or("");

    match event_type {
        "message_start" => {
            if let Some(msg) = v.get("message") {
                state.usage = msg.get("usage").and_then(parse_usage);
            }
        }

        "content_block_start" => {
            let idx = v.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            if let Some(block) = v.get("content_block") {
                if block.get("type").and_then(|v| v.as_str()) == Some("tool_use") {
                    let call_id = block
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string();
                    let name = block
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string();
                    state.active_tool_calls.insert(idx, (call_id, name, String::new()));
                }
            }
        }

        "content_block_delta" => {
            let idx = v.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            if let Some(delta) = v.get("delta") {
                match delta.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                    "text_delta" => {
                        if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                            if !text.is_empty() {
                                parts.push(Ok(ModelPart::TextDelta { text: text.to_string() }));
                            }
                        }
                    }
                    "thinking_delta" => {
                        if let Some(text) = delta.get("thinking").and_then(|v| v.as_str()) {
                            if !text.is_empty() {
                                parts.push(Ok(ModelPart::ReasoningDelta {
                                    text: text.to_string(),
                                }));
                            }
                        }
                    }
                    "input_json_delta" => {
                        if let Some(partial) = delta.get("partial_json").and_then(|v| v.as_str()) {
                            if let Some(tc) = state.active_tool_calls.get_mut(&idx) {
                                tc.2.push_str(partial);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        "content_block_stop" => {
            let idx = v.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            if let Some((call_id, tool_name, args_str)) = state.active_tool_calls.remove(&idx) {
                let args: Value =
                    serde_json::from_str(&args_str).unwrap_or(Value::Object(Default::default()));
                parts.push(Ok(ModelPart::ToolCall { id: call_id, tool_name, args }));
            }
        }

        "message_delta" => {
            if let Some(usage_val) = v.get("usage") {
                if let Some(output) = usage_val.get("output_tokens").and_then(|v| v.as_u64()) {
                    if let Some(ref mut u) = state.usage {
                        u.completion_tokens = output as u32;
                        u.total_tokens = u.prompt_tokens + u.completion_tokens;
                    }
                }
            }
            let stop_reason = v
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(|v| v.as_str())
                .map(map_stop_reason);
            if stop_reason.is_some() {
                state.finish_emitted = true;
                parts.push(Ok(ModelPart::Finish {
                    finish_reason: stop_reason,
                    usage: state.usage.clone(),
                }));
            }
        }

        "message_stop" => {
            if !state.finish_emitted {
                state.finish_emitted = true;
                parts.push(Ok(ModelPart::Finish {
                    finish_reason: Some("stop".into()),
                    usage: state.usage.clone(),
                }));
            }
        }

        "error" => {
            let msg = v
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            parts.push(Err(Error::Provider {
                provider: "anthropic".into(),
                message: msg.to_string(),
            }));
        }

        _ => {
            // ping or unknown event types -- ignore.
        }
    }

    parts
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    async fn stream_parts(
        &self,
        req: &ModelRequest,
    ) -> Result<BoxStream<'static, Result<ModelPart>>> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_messages_body(req);

        tracing::debug!(url = %url, model = ?req.model, "anthropic stream request");

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.map_err(from_reqwest)?;
            return Err(Error::Provider {
                provider: "anthropic".into(),
                message: format!("HTTP {} - {}", status.as_u16(), err_text),
            });
        }

        let mut state = StreamState::new();
        Ok(sse_part_stream(resp, move |data| {
            parse_anthropic_sse(data, &mut state)
        }))
    }

    fn provider_id(&self) -> &str {
        "anthropic"
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_deltas_parse() {
        let mut state = StreamState::new();
        let parts = parse_anthropic_sse(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#,
            &mut state,
        );
        assert_eq!(parts.len(), 1);
        assert!(matches!(
            parts[0].as_ref().unwrap(),
            ModelPart::TextDelta { text } if text == "hi"
        ));
    }

    #[test]
    fn tool_use_assembled_across_block_events() {
        let mut state = StreamState::new();
        parse_anthropic_sse(
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"tu_1","name":"getFragment"}}"#,
            &mut state,
        );
        parse_anthropic_sse(
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"id\":"}}"#,
            &mut state,
        );
        parse_anthropic_sse(
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"\"ch-abc123\"}"}}"#,
            &mut state,
        );
        let parts = parse_anthropic_sse(r#"{"type":"content_block_stop","index":1}"#, &mut state);

        assert_eq!(parts.len(), 1);
        match parts[0].as_ref().unwrap() {
            ModelPart::ToolCall { id, tool_name, args } => {
                assert_eq!(id, "tu_1");
                assert_eq!(tool_name, "getFragment");
                assert_eq!(args["id"], "ch-abc123");
            }
            other => panic!("unexpected part: {other:?}"),
        }
    }

    #[test]
    fn message_delta_finishes_with_mapped_reason() {
        let mut state = StreamState::new();
        parse_anthropic_sse(
            r#"{"type":"message_start","message":{"usage":{"input_tokens":10,"output_tokens":0}}}"#,
            &mut state,
        );
        let parts = parse_anthropic_sse(
            r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":5}}"#,
            &mut state,
        );
        match parts[0].as_ref().unwrap() {
            ModelPart::Finish { finish_reason, usage } => {
                assert_eq!(finish_reason.as_deref(), Some("tool-calls"));
                let usage = usage.as_ref().unwrap();
                assert_eq!(usage.prompt_tokens, 10);
                assert_eq!(usage.completion_tokens, 5);
                assert_eq!(usage.total_tokens, 15);
            }
            other => panic!("unexpected part: {other:?}"),
        }

        // message_stop after an emitted finish stays silent.
        let parts = parse_anthropic_sse(r#"{"type":"message_stop"}"#, &mut state);
        assert!(parts.is_empty());
    }

    #[test]
    fn provider_error_event_fails_the_stream() {
        let mut state = StreamState::new();
        let parts = parse_anthropic_sse(
            r#"{"type":"error","error":{"type":"overloaded_error","message":"overloaded"}}"#,
            &mut state,
        );
        assert!(matches!(parts[0], Err(Error::Provider { .. })));
    }

    #[test]
    fn system_messages_move_to_top_level_field() {
        let provider = AnthropicProvider {
            base_url: "http://localhost".into(),
            api_key: "k".into(),
            default_model: "claude-sonnet-4-20250514".into(),
            client: reqwest::Client::new(),
        };
        let req = ModelRequest {
            messages: vec![Message::system("rules"), Message::user("continue")],
            ..Default::default()
        };
        let body = provider.build_messages_body(&req);
        assert_eq!(body["system"], "rules");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["stream"], true);
    }
}
