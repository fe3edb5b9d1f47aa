//! Generation pipeline — orchestrates context assembly, block merging,
//! the writer agent and the NDJSON stream for one request.
//!
//! Modes: `generate` appends new prose, `regenerate` replaces a target
//! passage with a fresh take, `refine` rewrites a target under the
//! author's instructions. Every run persists a generation log (best
//! effort on failure) and, when a fragment was written, wakes the
//! librarian.

use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;

use quill_domain::blocks::{BlockRole, BlockSource, ContextBlock};
use quill_domain::context::{ContextOptions, ContextState};
use quill_domain::genlog::{GenerationLog, GenerationMode};
use quill_domain::story::OutputFormat;
use quill_domain::stream::Completion;
use quill_domain::tool::Message;
use quill_domain::{Error, Result};
use quill_store::fragments::{NewFragment, VersionedPatch};

use super::agents::writer::{WriterInput, WriterOutput};
use super::agents::{invoke_agent, InvokeOptions, InvokeParams};
use super::blocks::{apply_block_config, concat_role};
use super::context::build_context;
use super::instructions::{
    OUTPUT_MARKDOWN, OUTPUT_PLAINTEXT, WRITER_REFINE, WRITER_REGENERATE, WRITER_SYSTEM,
    WRITER_TOOL_SUFFIX,
};
use super::ndjson;
use super::script::ScriptEnv;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub input: String,
    pub save_result: bool,
    pub mode: GenerationMode,
    pub fragment_id: Option<String>,
    pub model: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Validate, assemble, and launch one generation. Returns the NDJSON
/// line receiver for the HTTP body; the run itself continues in a
/// background task that persists its results.
pub async fn start_generation(
    state: &AppState,
    story_id: &str,
    req: GenerateRequest,
) -> Result<mpsc::Receiver<String>> {
    let deps = state.deps.clone();

    // ── Validation ───────────────────────────────────────────────
    deps.stories.require(story_id)?;
    let target = match req.mode {
        GenerationMode::Generate => None,
        GenerationMode::Regenerate | GenerationMode::Refine => {
            let id = req.fragment_id.clone().ok_or_else(|| {
                Error::Validation("fragmentId is required for regenerate/refine".into())
            })?;
            let fragment = deps
                .fragments
                .get(story_id, &id)
                .ok_or_else(|| Error::not_found("fragment", &id))?;
            if fragment.kind != "prose" {
                return Err(Error::Validation(format!("{id} is not a prose fragment")));
            }
            Some(fragment)
        }
    };
    if req.mode == GenerationMode::Refine && req.input.trim().is_empty() {
        return Err(Error::Validation("refine requires instructions in input".into()));
    }

    // ── Context ──────────────────────────────────────────────────
    let opts = ContextOptions {
        prose_before_fragment_id: target.as_ref().map(|f| f.id.clone()),
        summary_before_fragment_id: target.as_ref().map(|f| f.id.clone()),
    };
    let context = build_context(&deps.stories, &deps.fragments, story_id, &req.input, &opts)?;

    let model = req
        .model
        .clone()
        .unwrap_or_else(|| deps.provider.default_model().to_string());

    // ── Blocks → messages ────────────────────────────────────────
    let defaults = default_blocks(state, &context, &req, target.as_ref().map(|f| &f.content), &model)?;
    let block_config = deps.block_configs.load(story_id);
    let script_env = ScriptEnv::new(&context, None, deps.fragments.clone());
    let blocks = apply_block_config(defaults, &block_config, &script_env);

    let messages = vec![
        Message::system(concat_role(&blocks, BlockRole::System)),
        Message::user(concat_role(&blocks, BlockRole::User)),
    ];

    // ── Stream + writer agent ────────────────────────────────────
    let (part_tx, handles) = ndjson::adapt(&deps.config.stream);
    let ndjson::StreamHandles { lines, completion } = handles;
    let cancel = state.cancel_map.register(story_id);

    let writer_input = json!(WriterInput {
        messages: messages.clone(),
        model: Some(model.clone()),
        max_steps: context.story.settings.max_steps,
    });

    let run_state = state.clone();
    let run_story = story_id.to_string();
    let started = Instant::now();
    tokio::spawn(async move {
        let outcome = invoke_agent(
            &run_state.agents,
            &run_state.deps,
            &run_state.active,
            InvokeParams {
                story_id: run_story.clone(),
                agent_name: "writer".into(),
                input: writer_input,
                options: InvokeOptions::from(&run_state.deps.config.agents),
                parts: Some(part_tx.clone()),
                cancel: cancel.clone(),
            },
        )
        .await;

        // Surface a run failure on the stream before closing it.
        if let Err(e) = &outcome.output {
            let _ = part_tx.send(Err(Error::Other(e.to_string()))).await;
        }
        drop(part_tx);

        let completion = match completion.await {
            Ok(completion) => completion,
            Err(_) => Err(Error::StreamAborted("adapter task dropped".into())),
        };

        finalize_run(
            &run_state,
            &run_story,
            &req,
            target.map(|f| f.id),
            model,
            messages,
            outcome.output.as_ref().ok(),
            completion,
            started,
        )
        .await;

        run_state.cancel_map.remove(&run_story, &cancel);
    });

    Ok(lines)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Builtin block producers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn builtin(id: &str, role: BlockRole, order: i64, content: String) -> ContextBlock {
    ContextBlock { id: id.into(), role, content, order, source: BlockSource::Builtin, name: None }
}

fn default_blocks(
    state: &AppState,
    context: &ContextState,
    req: &GenerateRequest,
    target_content: Option<&String>,
    model: &str,
) -> Result<Vec<ContextBlock>> {
    let instructions = &state.deps.instructions;
    let settings = &context.story.settings;

    // ── System role ───────────────────────────────────────────────
    let mut system_text = instructions.resolve(WRITER_SYSTEM, model)?;
    match req.mode {
        GenerationMode::Generate => {}
        GenerationMode::Regenerate => {
            system_text.push_str("\n\n");
            system_text.push_str(&instructions.resolve(WRITER_REGENERATE, model)?);
        }
        GenerationMode::Refine => {
            system_text.push_str("\n\n");
            system_text.push_str(&instructions.resolve(WRITER_REFINE, model)?);
        }
    }
    let format_key = match settings.output_format {
        OutputFormat::Plaintext => OUTPUT_PLAINTEXT,
        OutputFormat::Markdown => OUTPUT_MARKDOWN,
    };

    let sticky_system = context
        .system_prompt_fragments
        .iter()
        .map(|f| format!("## {}\n{}", f.name, f.content))
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut blocks = vec![
        builtin("instructions", BlockRole::System, 0, system_text),
        builtin("output-format", BlockRole::System, 10, instructions.resolve(format_key, model)?),
        builtin("tool-suffix", BlockRole::System, 20, instructions.resolve(WRITER_TOOL_SUFFIX, model)?),
        builtin("sticky-system", BlockRole::System, 30, sticky_system),
    ];

    // ── User role ─────────────────────────────────────────────────
    let header = if context.story.description.is_empty() {
        format!("Story: {}", context.story.name)
    } else {
        format!("Story: {}\n{}", context.story.name, context.story.description)
    };
    blocks.push(builtin("story-header", BlockRole::User, 0, header));

    let summary = if context.story.summary.is_empty() {
        String::new()
    } else {
        format!("Story so far:\n{}", context.story.summary)
    };
    blocks.push(builtin("summary", BlockRole::User, 10, summary));

    let mut sticky = String::new();
    for group in [
        &context.sticky_guidelines,
        &context.sticky_knowledge,
        &context.sticky_characters,
    ] {
        for fragment in group.iter() {
            if !sticky.is_empty() {
                sticky.push_str("\n\n");
            }
            sticky.push_str(&format!("## {}\n{}", fragment.name, fragment.content));
        }
    }
    blocks.push(builtin("sticky", BlockRole::User, 20, sticky));

    let mut shortlists = String::new();
    for (label, list) in [
        ("Characters", &context.character_shortlist),
        ("Guidelines", &context.guideline_shortlist),
        ("Knowledge", &context.knowledge_shortlist),
    ] {
        if list.is_empty() {
            continue;
        }
        if !shortlists.is_empty() {
            shortlists.push('\n');
        }
        shortlists.push_str(&format!("{label} (fetch with tools for details):\n"));
        for line in list {
            shortlists.push_str(&format!("- {line}\n"));
        }
    }
    blocks.push(builtin("shortlists", BlockRole::User, 30, shortlists.trim_end().to_string()));

    let prose = context
        .prose_fragments
        .iter()
        .map(|f| f.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    blocks.push(builtin("prose", BlockRole::User, 40, prose));

    if let Some(content) = target_content {
        blocks.push(builtin(
            "target-passage",
            BlockRole::User,
            50,
            format!("Passage to rewrite:\n{content}"),
        ));
    }

    let author_input = match req.mode {
        GenerationMode::Refine => format!("Instructions: {}", context.author_input),
        _ if context.author_input.is_empty() => String::new(),
        _ => format!("Author direction: {}", context.author_input),
    };
    blocks.push(builtin("author-input", BlockRole::User, 60, author_input));

    Ok(blocks)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Persistence
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[allow(clippy::too_many_arguments)]
async fn finalize_run(
    state: &AppState,
    story_id: &str,
    req: &GenerateRequest,
    target_id: Option<String>,
    model: String,
    messages: Vec<Message>,
    writer_output: Option<&serde_json::Value>,
    completion: Result<Completion>,
    started: Instant,
) {
    let writer: Option<WriterOutput> =
        writer_output.and_then(|v| serde_json::from_value(v.clone()).ok());

    let (completion, failed) = match completion {
        Ok(completion) => (completion, None),
        Err(e) => (Completion::default(), Some(e.to_string())),
    };

    // ── Persist the prose fragment ───────────────────────────────
    let mut fragment_id = None;
    if req.save_result && failed.is_none() && !completion.text.is_empty() {
        fragment_id = persist_prose(state, story_id, req, target_id, &completion.text)
            .map_err(|e| tracing::error!(story_id, error = %e, "failed to persist generated prose"))
            .ok()
            .flatten();
    }

    // ── Persist the generation log ───────────────────────────────
    let log = GenerationLog {
        id: GenerationLog::new_id(),
        created_at: Utc::now(),
        mode: req.mode,
        input: req.input.clone(),
        messages,
        tool_calls: completion.tool_calls.clone(),
        generated_text: completion.text.clone(),
        fragment_id: fragment_id.clone(),
        model,
        duration_ms: started.elapsed().as_millis() as u64,
        step_count: completion.step_count,
        finish_reason: match &failed {
            Some(message) => format!("error: {message}"),
            None => completion.finish_reason.clone(),
        },
        steps_exceeded: writer.as_ref().is_some_and(|w| w.steps_exceeded),
        total_usage: completion.usage.clone(),
        reasoning: (!completion.reasoning.is_empty()).then(|| completion.reasoning.clone()),
    };
    if let Err(e) = state.deps.logs.save(story_id, &log) {
        tracing::error!(story_id, error = %e, "failed to persist generation log");
    }

    // ── Wake the librarian ───────────────────────────────────────
    if let Some(id) = &fragment_id {
        state.librarian.clone().trigger(story_id, id);
    }
}

fn persist_prose(
    state: &AppState,
    story_id: &str,
    req: &GenerateRequest,
    target_id: Option<String>,
    text: &str,
) -> Result<Option<String>> {
    match req.mode {
        GenerationMode::Generate => {
            let count = state
                .deps
                .fragments
                .list_summaries(story_id, Some("prose"), true)?
                .len();
            let fragment = state.deps.fragments.create(
                story_id,
                NewFragment {
                    kind: "prose".into(),
                    name: format!("Passage {}", count + 1),
                    content: text.to_string(),
                    ..Default::default()
                },
            )?;
            Ok(Some(fragment.id))
        }
        GenerationMode::Regenerate | GenerationMode::Refine => {
            let id = target_id.ok_or_else(|| Error::Validation("missing target".into()))?;
            state.deps.fragments.update_versioned(
                story_id,
                &id,
                VersionedPatch { content: Some(text.to_string()), ..Default::default() },
            )?;
            Ok(Some(id))
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Suggest directions (non-streaming pipeline)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run the suggestion agent and return its output document.
pub async fn suggest_directions(
    state: &AppState,
    story_id: &str,
    count: Option<usize>,
) -> Result<serde_json::Value> {
    state.deps.stories.require(story_id)?;

    let outcome = invoke_agent(
        &state.agents,
        &state.deps,
        &state.active,
        InvokeParams {
            story_id: story_id.to_string(),
            agent_name: "suggest-directions".into(),
            input: json!({ "count": count }),
            options: InvokeOptions::from(&state.deps.config.agents),
            parts: None,
            cancel: super::cancel::CancelToken::new(),
        },
    )
    .await;
    outcome.output
}
