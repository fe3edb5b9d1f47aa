//! Direction-suggestion agent: proposes where the next passage could
//! go, as structured options the UI can offer.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use quill_domain::context::ContextOptions;
use quill_domain::tool::Message;
use quill_domain::{Error, Result};

use super::tool_loop::{run_tool_loop, ToolLoopParams};
use super::{extract_json, AgentDefinition, InvocationContext};
use crate::runtime::context::build_context;
use crate::runtime::instructions::SUGGEST_DIRECTIONS;
use crate::runtime::tools::ToolSet;

const DEFAULT_COUNT: usize = 3;
const MAX_COUNT: usize = 10;

pub struct SuggestDirectionsAgent;

#[derive(Debug, Serialize, Deserialize)]
pub struct SuggestInput {
    #[serde(default)]
    pub count: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suggestion {
    pub pacing: String,
    pub title: String,
    pub description: String,
    pub instruction: String,
}

#[async_trait::async_trait]
impl AgentDefinition for SuggestDirectionsAgent {
    fn name(&self) -> &'static str {
        "suggest-directions"
    }

    fn validate_input(&self, input: &Value) -> Result<()> {
        let input: SuggestInput = serde_json::from_value(input.clone())
            .map_err(|e| Error::Validation(format!("suggest input: {e}")))?;
        if input.count.is_some_and(|c| c == 0 || c > MAX_COUNT) {
            return Err(Error::Validation(format!("count must be 1..={MAX_COUNT}")));
        }
        Ok(())
    }

    fn validate_output(&self, output: &Value) -> Result<()> {
        let suggestions = output
            .get("suggestions")
            .ok_or_else(|| Error::Validation("missing suggestions".into()))?;
        serde_json::from_value::<Vec<Suggestion>>(suggestions.clone())
            .map(|_| ())
            .map_err(|e| Error::Validation(format!("suggestions: {e}")))
    }

    async fn run(&self, ctx: &InvocationContext, input: Value) -> Result<Value> {
        let input: SuggestInput = serde_json::from_value(input)
            .map_err(|e| Error::Validation(format!("suggest input: {e}")))?;
        let count = input.count.unwrap_or(DEFAULT_COUNT);

        let context = build_context(
            &ctx.deps.stories,
            &ctx.deps.fragments,
            &ctx.story_id,
            "",
            &ContextOptions::default(),
        )?;

        let model = ctx.deps.provider.default_model().to_string();
        let system = ctx.deps.instructions.resolve(SUGGEST_DIRECTIONS, &model)?;

        let mut user = format!(
            "Story: {}\n{}\n",
            context.story.name, context.story.description
        );
        if !context.story.summary.is_empty() {
            user.push_str(&format!("\nSummary so far:\n{}\n", context.story.summary));
        }
        if let Some(latest) = context.prose_fragments.last() {
            user.push_str(&format!("\nLatest passage:\n{}\n", latest.content));
        }
        user.push_str(&format!("\nPropose {count} directions."));

        let tools = ToolSet::new(ctx.deps.fragments.clone(), ctx.story_id.clone(), true);
        let outcome = run_tool_loop(ToolLoopParams {
            deps: &ctx.deps,
            tools: &tools,
            messages: vec![Message::system(system), Message::user(user)],
            model: Some(model),
            max_steps: 3,
            parts: ctx.parts.as_ref(),
            cancel: &ctx.cancel,
        })
        .await?;

        let raw = extract_json(&outcome.text)
            .ok_or_else(|| Error::Validation("suggester produced no JSON".into()))?;
        let mut suggestions: Vec<Suggestion> = serde_json::from_value(raw)
            .map_err(|e| Error::Validation(format!("suggestions: {e}")))?;
        suggestions.truncate(count);

        Ok(json!({ "suggestions": suggestions }))
    }
}
