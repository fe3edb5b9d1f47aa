//! Analyze agent — the librarian's worker.
//!
//! Reads the newest passage against the corpus with write tools in
//! hand, fixes what the tools can fix, and returns a structured
//! analysis report for the scheduler to integrate.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use quill_domain::context::ContextOptions;
use quill_domain::tool::Message;
use quill_domain::{Error, Result};

use super::tool_loop::{run_tool_loop, ToolLoopParams};
use super::{extract_json, AgentDefinition, InvocationContext};
use crate::runtime::context::build_context;
use crate::runtime::instructions::LIBRARIAN_ANALYSIS;
use crate::runtime::tools::ToolSet;

/// Prose fragments shown to the analyzer, newest last.
const ANALYSIS_PROSE_WINDOW: usize = 4;
/// The analyzer gets a short tool budget; it fixes details, it does not
/// write prose.
const ANALYSIS_MAX_STEPS: u32 = 6;

pub struct AnalyzeAgent;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeInput {
    /// The fragment whose creation triggered this analysis.
    #[serde(default)]
    pub fragment_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalysisReport {
    pub summary_update: String,
    pub mentions: Vec<Mention>,
    pub contradictions: Vec<Contradiction>,
    pub knowledge_suggestions: Vec<KnowledgeSuggestion>,
    pub timeline_events: Vec<TimelineEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mention {
    #[serde(default)]
    pub fragment_id: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contradiction {
    pub description: String,
    #[serde(default)]
    pub fragment_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeSuggestion {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEvent {
    pub title: String,
    #[serde(default)]
    pub description: String,
}

#[async_trait::async_trait]
impl AgentDefinition for AnalyzeAgent {
    fn name(&self) -> &'static str {
        "analyze"
    }

    fn validate_input(&self, input: &Value) -> Result<()> {
        serde_json::from_value::<AnalyzeInput>(input.clone())
            .map(|_| ())
            .map_err(|e| Error::Validation(format!("analyze input: {e}")))
    }

    fn validate_output(&self, output: &Value) -> Result<()> {
        serde_json::from_value::<AnalysisReport>(output.clone())
            .map(|_| ())
            .map_err(|e| Error::Validation(format!("analysis report: {e}")))
    }

    async fn run(&self, ctx: &InvocationContext, input: Value) -> Result<Value> {
        let input: AnalyzeInput = serde_json::from_value(input)
            .map_err(|e| Error::Validation(format!("analyze input: {e}")))?;

        let mut context = build_context(
            &ctx.deps.stories,
            &ctx.deps.fragments,
            &ctx.story_id,
            "",
            &ContextOptions::default(),
        )?;
        // The analyzer reads a fixed short window regardless of the
        // story's generation limit.
        let keep = context
            .prose_fragments
            .len()
            .saturating_sub(ANALYSIS_PROSE_WINDOW);
        context.prose_fragments.drain(..keep);

        let model = ctx.deps.provider.default_model().to_string();
        let system = ctx.deps.instructions.resolve(LIBRARIAN_ANALYSIS, &model)?;
        let user = analysis_prompt(&context, input.fragment_id.as_deref(), &ctx.deps);

        let tools = ToolSet::new(ctx.deps.fragments.clone(), ctx.story_id.clone(), false);
        let outcome = run_tool_loop(ToolLoopParams {
            deps: &ctx.deps,
            tools: &tools,
            messages: vec![Message::system(system), Message::user(user)],
            model: Some(model),
            max_steps: ANALYSIS_MAX_STEPS,
            parts: ctx.parts.as_ref(),
            cancel: &ctx.cancel,
        })
        .await?;

        let raw = extract_json(&outcome.text)
            .ok_or_else(|| Error::Validation("analyzer produced no JSON report".into()))?;
        let report: AnalysisReport = serde_json::from_value(raw)
            .map_err(|e| Error::Validation(format!("analysis report: {e}")))?;
        Ok(json!(report))
    }
}

fn analysis_prompt(
    context: &quill_domain::context::ContextState,
    fragment_id: Option<&str>,
    deps: &super::AgentDeps,
) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!(
        "Story: {}\n{}\n",
        context.story.name, context.story.description
    ));
    if !context.story.summary.is_empty() {
        prompt.push_str(&format!("\nSummary so far:\n{}\n", context.story.summary));
    }

    if !context.character_shortlist.is_empty() {
        prompt.push_str("\nCharacters:\n");
        for line in &context.character_shortlist {
            prompt.push_str(&format!("- {line}\n"));
        }
    }
    if !context.knowledge_shortlist.is_empty() {
        prompt.push_str("\nKnowledge:\n");
        for line in &context.knowledge_shortlist {
            prompt.push_str(&format!("- {line}\n"));
        }
    }

    prompt.push_str("\nRecent prose:\n");
    for fragment in &context.prose_fragments {
        prompt.push_str(&format!("--- {} ({})\n{}\n", fragment.name, fragment.id, fragment.content));
    }

    if let Some(id) = fragment_id {
        if let Some(fragment) = deps.fragments.get(&context.story.id, id) {
            prompt.push_str(&format!(
                "\nNewest passage to analyze ({}):\n{}\n",
                fragment.id, fragment.content
            ));
        }
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_accepts_partial_documents() {
        let report: AnalysisReport =
            serde_json::from_value(json!({ "summaryUpdate": "a storm hit" })).unwrap();
        assert_eq!(report.summary_update, "a storm hit");
        assert!(report.mentions.is_empty());
        assert!(report.knowledge_suggestions.is_empty());
    }

    #[test]
    fn report_round_trip_uses_camel_case() {
        let report = AnalysisReport {
            summary_update: "s".into(),
            knowledge_suggestions: vec![KnowledgeSuggestion {
                name: "The Meridian".into(),
                description: "a ship".into(),
                content: "three masts".into(),
            }],
            ..Default::default()
        };
        let v = serde_json::to_value(&report).unwrap();
        assert!(v.get("summaryUpdate").is_some());
        assert!(v.get("knowledgeSuggestions").is_some());
    }

    #[test]
    fn output_validation_rejects_wrong_shape() {
        let agent = AnalyzeAgent;
        assert!(agent.validate_output(&json!({ "summaryUpdate": "ok" })).is_ok());
        assert!(agent
            .validate_output(&json!({ "mentions": "not a list" }))
            .is_err());
    }
}
