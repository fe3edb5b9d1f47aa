//! Sandboxed evaluation of user-authored script blocks.
//!
//! Script bodies run in an embedded Rhai engine with no filesystem or
//! network surface; the only capabilities are the `ctx` object (story,
//! prose window, sticky/shortlist arrays, optional new prose) and a
//! `get_fragment(id)` lookup bound to the story's fragment store.
//! Evaluation carries a hard operation budget and a wall-clock deadline;
//! any failure is captured deterministically and surfaced to the caller
//! as a message, never as a request failure.

use std::sync::Arc;
use std::time::{Duration, Instant};

use quill_domain::context::ContextState;
use quill_store::FragmentStore;

/// Operation budget per evaluation.
const MAX_OPERATIONS: u64 = 100_000;
/// Wall-clock budget per evaluation.
const TIME_BUDGET: Duration = Duration::from_millis(250);

/// Everything a script evaluation may touch.
pub struct ScriptEnv {
    ctx: serde_json::Value,
    fragments: Arc<FragmentStore>,
    story_id: String,
}

impl ScriptEnv {
    pub fn new(
        context: &ContextState,
        new_prose: Option<&str>,
        fragments: Arc<FragmentStore>,
    ) -> Self {
        let ctx = serde_json::json!({
            "story": context.story,
            "proseFragments": context.prose_fragments,
            "stickyCharacters": context.sticky_characters,
            "stickyGuidelines": context.sticky_guidelines,
            "stickyKnowledge": context.sticky_knowledge,
            "characterShortlist": context.character_shortlist,
            "guidelineShortlist": context.guideline_shortlist,
            "knowledgeShortlist": context.knowledge_shortlist,
            "authorInput": context.author_input,
            "newProse": new_prose,
        });
        Self { ctx, fragments, story_id: context.story.id.clone() }
    }

    fn build_engine(&self) -> rhai::Engine {
        let mut engine = rhai::Engine::new();
        engine.set_max_operations(MAX_OPERATIONS);
        engine.set_max_string_size(1024 * 1024);
        engine.set_max_array_size(16 * 1024);
        engine.set_max_map_size(16 * 1024);

        let deadline = Instant::now() + TIME_BUDGET;
        engine.on_progress(move |_| {
            if Instant::now() > deadline {
                Some("script time budget exceeded".into())
            } else {
                None
            }
        });

        let fragments = self.fragments.clone();
        let story_id = self.story_id.clone();
        engine.register_fn("get_fragment", move |id: &str| -> rhai::Dynamic {
            match fragments.get(&story_id, id) {
                Some(fragment) => serde_json::to_value(&fragment)
                    .ok()
                    .and_then(|v| rhai::serde::to_dynamic(v).ok())
                    .unwrap_or(rhai::Dynamic::UNIT),
                None => rhai::Dynamic::UNIT,
            }
        });

        engine
    }
}

/// Evaluate one script block body.
///
/// `Ok(content)` is the string the script returned (may be empty; the
/// block engine drops empty blocks). `Err(message)` is the in-band
/// error text for the visible error block.
pub fn eval_script_block(body: &str, env: &ScriptEnv) -> Result<String, String> {
    let engine = env.build_engine();

    let mut scope = rhai::Scope::new();
    match rhai::serde::to_dynamic(&env.ctx) {
        Ok(ctx) => {
            scope.push_dynamic("ctx", ctx);
        }
        Err(e) => return Err(format!("context unavailable: {e}")),
    }

    let result = engine.eval_with_scope::<rhai::Dynamic>(&mut scope, body);
    match result {
        Ok(value) => value
            .into_string()
            .map_err(|_| "script returned a non-string value".to_string()),
        Err(e) => Err(script_error_message(e.as_ref())),
    }
}

/// Deterministic error text: a thrown value renders as itself, anything
/// else as the engine's message without position noise.
fn script_error_message(e: &rhai::EvalAltResult) -> String {
    match e {
        rhai::EvalAltResult::ErrorRuntime(value, _) => value
            .clone()
            .into_string()
            .unwrap_or_else(|_| value.to_string()),
        rhai::EvalAltResult::ErrorTerminated(value, _) => value.to_string(),
        other => other.to_string(),
    }
}
