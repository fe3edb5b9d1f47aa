//! Shared model tool loop.
//!
//! One loop iteration = one model step: stream parts, forward them to
//! the caller's part sink, execute any tool calls, feed the results
//! back as messages, repeat until the model stops calling tools or the
//! step budget runs out. Tool failures are reported to the model as
//! error results; they never abort the loop.

use futures_util::StreamExt;
use serde_json::Value;

use quill_domain::stream::{ModelPart, Usage};
use quill_domain::tool::{ContentPart, Message, MessageContent, Role, ToolCall};
use quill_domain::{Error, Result};
use quill_providers::ModelRequest;

use super::AgentDeps;
use crate::runtime::cancel::CancelToken;
use crate::runtime::ndjson::PartSender;
use crate::runtime::tools::ToolSet;

pub struct ToolLoopParams<'a> {
    pub deps: &'a AgentDeps,
    pub tools: &'a ToolSet,
    pub messages: Vec<Message>,
    pub model: Option<String>,
    pub max_steps: u32,
    pub parts: Option<&'a PartSender>,
    pub cancel: &'a CancelToken,
}

#[derive(Debug, Default)]
pub struct ToolLoopOutcome {
    pub text: String,
    pub reasoning: String,
    /// Executed calls with their results, in execution order.
    pub tool_calls: Vec<ExecutedCall>,
    pub step_count: u32,
    pub finish_reason: String,
    pub steps_exceeded: bool,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone)]
pub struct ExecutedCall {
    pub call: ToolCall,
    pub result: Value,
    pub is_error: bool,
}

/// Forward a part to the sink. A closed sink means the consumer is gone
/// (client disconnect); the loop treats that as cancellation.
async fn emit(parts: Option<&PartSender>, part: ModelPart) -> Result<()> {
    if let Some(tx) = parts {
        if tx.send(Ok(part)).await.is_err() {
            return Err(Error::StreamAborted("event consumer went away".into()));
        }
    }
    Ok(())
}

pub async fn run_tool_loop(params: ToolLoopParams<'_>) -> Result<ToolLoopOutcome> {
    let ToolLoopParams { deps, tools, mut messages, model, max_steps, parts, cancel } = params;

    let tool_defs = tools.definitions();
    let mut outcome = ToolLoopOutcome::default();

    for step in 0..max_steps.max(1) {
        if cancel.is_cancelled() {
            return Err(Error::StreamAborted("generation cancelled".into()));
        }
        tracing::debug!(step, "tool loop step");

        let req = ModelRequest {
            messages: messages.clone(),
            tools: tool_defs.clone(),
            model: model.clone(),
            max_tokens: None,
            temperature: None,
        };
        let mut stream = deps.provider.stream_parts(&req).await?;

        // ── Consume one model step ────────────────────────────────
        let mut step_text = String::new();
        let mut pending: Vec<ToolCall> = Vec::new();

        while let Some(item) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(Error::StreamAborted("generation cancelled".into()));
            }
            let part = item?;
            match &part {
                ModelPart::TextDelta { text } => {
                    step_text.push_str(text);
                    outcome.text.push_str(text);
                }
                ModelPart::ReasoningDelta { text } => {
                    outcome.reasoning.push_str(text);
                }
                ModelPart::ToolCall { id, tool_name, args } => {
                    pending.push(ToolCall {
                        call_id: id.clone(),
                        tool_name: tool_name.clone(),
                        arguments: args.clone(),
                    });
                }
                ModelPart::ToolResult { .. } => {
                    // Providers never produce these; the loop injects
                    // them below after executing a call.
                }
                ModelPart::Finish { finish_reason, usage } => {
                    outcome.step_count += 1;
                    if let Some(reason) = finish_reason {
                        outcome.finish_reason = reason.clone();
                    }
                    if let Some(step_usage) = usage {
                        let total = outcome.usage.get_or_insert(Usage {
                            prompt_tokens: 0,
                            completion_tokens: 0,
                            total_tokens: 0,
                        });
                        total.prompt_tokens += step_usage.prompt_tokens;
                        total.completion_tokens += step_usage.completion_tokens;
                        total.total_tokens += step_usage.total_tokens;
                    }
                }
            }
            emit(parts, part).await?;
        }

        // No tool calls: the model is done.
        if pending.is_empty() {
            return Ok(outcome);
        }

        // ── Dispatch tools and extend the conversation ────────────
        let mut assistant_parts: Vec<ContentPart> = Vec::new();
        if !step_text.is_empty() {
            assistant_parts.push(ContentPart::Text { text: step_text });
        }
        for call in &pending {
            assistant_parts.push(ContentPart::ToolUse {
                id: call.call_id.clone(),
                name: call.tool_name.clone(),
                input: call.arguments.clone(),
            });
        }
        messages.push(Message {
            role: Role::Assistant,
            content: MessageContent::Parts(assistant_parts),
        });

        for call in pending {
            if cancel.is_cancelled() {
                return Err(Error::StreamAborted("generation cancelled".into()));
            }
            let (result, is_error) = tools.dispatch(&call.tool_name, &call.arguments);
            if is_error {
                tracing::debug!(tool = %call.tool_name, result = %result, "tool returned an error result");
            }

            emit(
                parts,
                ModelPart::ToolResult {
                    id: call.call_id.clone(),
                    tool_name: call.tool_name.clone(),
                    result: result.clone(),
                },
            )
            .await?;

            let content = serde_json::to_string(&result).unwrap_or_default();
            messages.push(Message::tool_result(&call.call_id, content, is_error));
            outcome.tool_calls.push(ExecutedCall { call, result, is_error });
        }

        if step == max_steps.max(1) - 1 {
            outcome.steps_exceeded = true;
            tracing::warn!(max_steps, "tool loop stopped at step budget");
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::instructions::InstructionRegistry;
    use quill_domain::config::Config;
    use quill_providers::ScriptedProvider;
    use quill_store::fragments::NewFragment;
    use quill_store::{BlockConfigStore, FragmentStore, GenerationLogStore, StoryStore};
    use serde_json::json;
    use std::sync::Arc;

    fn deps_with(provider: ScriptedProvider) -> (tempfile::TempDir, AgentDeps) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let deps = AgentDeps {
            config: Arc::new(Config::default()),
            stories: Arc::new(StoryStore::new(&path)),
            fragments: Arc::new(FragmentStore::new(&path)),
            logs: Arc::new(GenerationLogStore::new(&path)),
            block_configs: Arc::new(BlockConfigStore::new(&path)),
            instructions: Arc::new(InstructionRegistry::load(path.join("instruction-sets"))),
            provider: Arc::new(provider),
        };
        (dir, deps)
    }

    fn finish(reason: &str) -> quill_domain::Result<ModelPart> {
        Ok(ModelPart::Finish { finish_reason: Some(reason.into()), usage: None })
    }

    #[tokio::test]
    async fn single_step_without_tools() {
        let provider = ScriptedProvider::new(vec![vec![
            Ok(ModelPart::TextDelta { text: "prose out".into() }),
            finish("stop"),
        ]]);
        let (_dir, deps) = deps_with(provider);
        let tools = ToolSet::new(deps.fragments.clone(), "s1", true);

        let outcome = run_tool_loop(ToolLoopParams {
            deps: &deps,
            tools: &tools,
            messages: vec![Message::user("continue")],
            model: None,
            max_steps: 5,
            parts: None,
            cancel: &CancelToken::new(),
        })
        .await
        .unwrap();

        assert_eq!(outcome.text, "prose out");
        assert_eq!(outcome.step_count, 1);
        assert_eq!(outcome.finish_reason, "stop");
        assert!(!outcome.steps_exceeded);
        assert!(outcome.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn tool_call_round_trip_feeds_second_step() {
        let dir = tempfile::tempdir().unwrap();
        let fragments = Arc::new(FragmentStore::new(dir.path()));
        let fragment = fragments
            .create(
                "s1",
                NewFragment {
                    kind: "character".into(),
                    name: "Ada".into(),
                    content: "an engineer".into(),
                    ..Default::default()
                },
            )
            .unwrap();

        let provider = ScriptedProvider::new(vec![
            vec![
                Ok(ModelPart::ToolCall {
                    id: "c1".into(),
                    tool_name: "getFragment".into(),
                    args: json!({ "id": fragment.id }),
                }),
                finish("tool-calls"),
            ],
            vec![Ok(ModelPart::TextDelta { text: "done".into() }), finish("stop")],
        ]);
        let (_deps_dir, mut deps) = deps_with(provider);
        deps.fragments = fragments.clone();
        let tools = ToolSet::new(fragments, "s1", true);

        let outcome = run_tool_loop(ToolLoopParams {
            deps: &deps,
            tools: &tools,
            messages: vec![Message::user("continue")],
            model: None,
            max_steps: 5,
            parts: None,
            cancel: &CancelToken::new(),
        })
        .await
        .unwrap();

        assert_eq!(outcome.text, "done");
        assert_eq!(outcome.step_count, 2);
        assert_eq!(outcome.finish_reason, "stop");
        assert_eq!(outcome.tool_calls.len(), 1);
        assert!(!outcome.tool_calls[0].is_error);
        assert_eq!(outcome.tool_calls[0].result["name"], "Ada");
    }

    #[tokio::test]
    async fn tool_error_is_reported_not_raised() {
        let provider = ScriptedProvider::new(vec![
            vec![
                Ok(ModelPart::ToolCall {
                    id: "c1".into(),
                    tool_name: "getFragment".into(),
                    args: json!({ "id": "ch-zzzz99" }),
                }),
                finish("tool-calls"),
            ],
            vec![Ok(ModelPart::TextDelta { text: "recovered".into() }), finish("stop")],
        ]);
        let (_dir, deps) = deps_with(provider);
        let tools = ToolSet::new(deps.fragments.clone(), "s1", true);

        let outcome = run_tool_loop(ToolLoopParams {
            deps: &deps,
            tools: &tools,
            messages: vec![Message::user("continue")],
            model: None,
            max_steps: 5,
            parts: None,
            cancel: &CancelToken::new(),
        })
        .await
        .unwrap();

        assert_eq!(outcome.text, "recovered");
        assert!(outcome.tool_calls[0].is_error);
    }

    #[tokio::test]
    async fn step_budget_latches_steps_exceeded() {
        // Every step calls a tool, so the loop never finishes naturally.
        let step = || {
            vec![
                Ok(ModelPart::ToolCall {
                    id: "c".into(),
                    tool_name: "listFragments".into(),
                    args: json!({}),
                }),
                finish("tool-calls"),
            ]
        };
        let provider = ScriptedProvider::new(vec![step(), step()]);
        let (_dir, deps) = deps_with(provider);
        let tools = ToolSet::new(deps.fragments.clone(), "s1", true);

        let outcome = run_tool_loop(ToolLoopParams {
            deps: &deps,
            tools: &tools,
            messages: vec![Message::user("continue")],
            model: None,
            max_steps: 2,
            parts: None,
            cancel: &CancelToken::new(),
        })
        .await
        .unwrap();

        assert!(outcome.steps_exceeded);
        assert_eq!(outcome.step_count, 2);
        assert_eq!(outcome.tool_calls.len(), 2);
    }

    #[tokio::test]
    async fn cancellation_aborts_the_loop() {
        let provider = ScriptedProvider::text("never seen");
        let (_dir, deps) = deps_with(provider);
        let tools = ToolSet::new(deps.fragments.clone(), "s1", true);
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = run_tool_loop(ToolLoopParams {
            deps: &deps,
            tools: &tools,
            messages: vec![Message::user("continue")],
            model: None,
            max_steps: 5,
            parts: None,
            cancel: &cancel,
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::StreamAborted(_)));
    }
}
