//! Writer agent — streams prose generation over pre-assembled messages
//! with read-only fragment tools.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use quill_domain::tool::Message;
use quill_domain::{Error, Result};

use super::tool_loop::{run_tool_loop, ToolLoopParams};
use super::{AgentDefinition, InvocationContext};
use crate::runtime::tools::ToolSet;

pub struct WriterAgent;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriterInput {
    /// Final prompt messages, assembled by the pipeline.
    pub messages: Vec<Message>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "d_max_steps")]
    pub max_steps: u32,
}

fn d_max_steps() -> u32 {
    10
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriterOutput {
    pub text: String,
    #[serde(default)]
    pub reasoning: String,
    pub step_count: u32,
    pub finish_reason: String,
    #[serde(default)]
    pub steps_exceeded: bool,
    #[serde(default)]
    pub usage: Option<quill_domain::stream::Usage>,
}

#[async_trait::async_trait]
impl AgentDefinition for WriterAgent {
    fn name(&self) -> &'static str {
        "writer"
    }

    fn validate_input(&self, input: &Value) -> Result<()> {
        serde_json::from_value::<WriterInput>(input.clone())
            .map(|_| ())
            .map_err(|e| Error::Validation(format!("writer input: {e}")))
    }

    fn validate_output(&self, output: &Value) -> Result<()> {
        serde_json::from_value::<WriterOutput>(output.clone())
            .map(|_| ())
            .map_err(|e| Error::Validation(format!("writer output: {e}")))
    }

    async fn run(&self, ctx: &InvocationContext, input: Value) -> Result<Value> {
        let input: WriterInput = serde_json::from_value(input)
            .map_err(|e| Error::Validation(format!("writer input: {e}")))?;

        // The writer only reads the corpus; mutations belong to the
        // librarian.
        let tools = ToolSet::new(ctx.deps.fragments.clone(), ctx.story_id.clone(), true);

        let outcome = run_tool_loop(ToolLoopParams {
            deps: &ctx.deps,
            tools: &tools,
            messages: input.messages,
            model: input.model,
            max_steps: input.max_steps,
            parts: ctx.parts.as_ref(),
            cancel: &ctx.cancel,
        })
        .await?;

        Ok(json!(WriterOutput {
            text: outcome.text,
            reasoning: outcome.reasoning,
            step_count: outcome.step_count,
            finish_reason: outcome.finish_reason,
            steps_exceeded: outcome.steps_exceeded,
            usage: outcome.usage,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_validation() {
        let agent = WriterAgent;
        assert!(agent
            .validate_input(&json!({ "messages": [{ "role": "user", "content": "go" }] }))
            .is_ok());
        assert!(agent.validate_input(&json!({ "messages": "nope" })).is_err());
        assert!(agent.validate_input(&json!({})).is_err());
    }

    #[test]
    fn max_steps_defaults_to_ten() {
        let input: WriterInput =
            serde_json::from_value(json!({ "messages": [] })).unwrap();
        assert_eq!(input.max_steps, 10);
    }
}
