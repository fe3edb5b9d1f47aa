//! Agent registry and runner.
//!
//! Agents are named, schema-validated tasks that call the model with
//! tools under cycle/depth/call/timeout discipline. The runner owns the
//! per-invocation bookkeeping: a shared runtime tracks the call stack,
//! the call budget and the trace so that nested invocations (via
//! [`InvocationContext::invoke`]) see true limits, not per-call resets.
//! Every attempt records a trace entry, including attempts rejected
//! before `run` is entered.

pub mod librarian;
pub mod suggest;
pub mod tool_loop;
pub mod writer;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use uuid::Uuid;

use quill_domain::config::{AgentLimitsConfig, Config};
use quill_domain::trace::{AgentTraceEntry, TraceStatus};
use quill_domain::{Error, Result};
use quill_providers::LlmProvider;
use quill_store::{BlockConfigStore, FragmentStore, GenerationLogStore, StoryStore};

use super::active::ActiveAgentRegistry;
use super::cancel::CancelToken;
use super::instructions::InstructionRegistry;
use super::ndjson::PartSender;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared capability set
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything agent `run` functions may reach, shared with the rest of
/// the runtime.
pub struct AgentDeps {
    pub config: Arc<Config>,
    pub stories: Arc<StoryStore>,
    pub fragments: Arc<FragmentStore>,
    pub logs: Arc<GenerationLogStore>,
    pub block_configs: Arc<BlockConfigStore>,
    pub instructions: Arc<InstructionRegistry>,
    pub provider: Arc<dyn LlmProvider>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Invocation options
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy)]
pub struct InvokeOptions {
    pub max_depth: u32,
    pub max_calls: u32,
    pub timeout_ms: u64,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self { max_depth: 3, max_calls: 20, timeout_ms: 120_000 }
    }
}

impl From<&AgentLimitsConfig> for InvokeOptions {
    fn from(cfg: &AgentLimitsConfig) -> Self {
        Self {
            max_depth: cfg.max_depth,
            max_calls: cfg.max_calls,
            timeout_ms: cfg.timeout_ms,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent definition + registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
pub trait AgentDefinition: Send + Sync {
    fn name(&self) -> &'static str;

    /// Agents this one may invoke. Empty means unrestricted.
    fn allowed_calls(&self) -> &'static [&'static str] {
        &[]
    }

    /// Reject malformed input before `run` is entered.
    fn validate_input(&self, input: &Value) -> Result<()>;

    /// Validate the produced output. Default: anything goes.
    fn validate_output(&self, _output: &Value) -> Result<()> {
        Ok(())
    }

    async fn run(&self, ctx: &InvocationContext, input: Value) -> Result<Value>;
}

#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<dyn AgentDefinition>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in agents registered.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(writer::WriterAgent));
        registry.register(Arc::new(librarian::AnalyzeAgent));
        registry.register(Arc::new(suggest::SuggestDirectionsAgent));
        registry
    }

    pub fn register(&self, def: Arc<dyn AgentDefinition>) {
        let name = def.name().to_string();
        if self.agents.write().insert(name.clone(), def).is_some() {
            tracing::warn!(agent = %name, "agent re-registered, previous definition replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentDefinition>> {
        self.agents.read().get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.agents.read().contains_key(name)
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<_> = self.agents.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn clear(&self) {
        self.agents.write().clear();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-root-invocation runtime shared by the whole call tree.
struct RunnerState {
    root_run_id: Uuid,
    options: InvokeOptions,
    trace: Mutex<Vec<AgentTraceEntry>>,
    stack: Mutex<Vec<String>>,
    call_count: AtomicU32,
}

/// Capability record handed to `run`.
pub struct InvocationContext {
    pub deps: Arc<AgentDeps>,
    pub story_id: String,
    pub agent_name: String,
    pub run_id: Uuid,
    pub parent_run_id: Option<Uuid>,
    pub root_run_id: Uuid,
    pub depth: u32,
    /// Sink for streamed model parts; `None` for non-streaming callers.
    pub parts: Option<PartSender>,
    pub cancel: CancelToken,
    registry: Arc<AgentRegistry>,
    active: Arc<ActiveAgentRegistry>,
    runner: Arc<RunnerState>,
}

impl InvocationContext {
    /// Invoke another agent inside the same runtime, so cycle, depth and
    /// call-budget checks see the whole tree.
    pub async fn invoke(&self, agent_name: &str, input: Value) -> Result<Value> {
        let frame = CallFrame {
            story_id: self.story_id.clone(),
            agent_name: agent_name.to_string(),
            parent_run_id: Some(self.run_id),
            parent_agent: Some(self.agent_name.clone()),
            depth: self.depth + 1,
            run_id: Uuid::new_v4(),
            parts: self.parts.clone(),
            cancel: self.cancel.clone(),
        };
        invoke_frame(
            &self.registry,
            &self.deps,
            &self.active,
            &self.runner,
            frame,
            input,
        )
        .await
    }
}

pub struct InvokeParams {
    pub story_id: String,
    pub agent_name: String,
    pub input: Value,
    pub options: InvokeOptions,
    pub parts: Option<PartSender>,
    pub cancel: CancelToken,
}

/// The root invocation's result: output (or error) plus the full trace,
/// which is recorded for failed attempts too.
pub struct InvokeOutcome {
    pub run_id: Uuid,
    pub output: Result<Value>,
    pub trace: Vec<AgentTraceEntry>,
}

/// Run an agent as the root of a fresh runtime.
pub async fn invoke_agent(
    registry: &Arc<AgentRegistry>,
    deps: &Arc<AgentDeps>,
    active: &Arc<ActiveAgentRegistry>,
    params: InvokeParams,
) -> InvokeOutcome {
    let run_id = Uuid::new_v4();
    let runner = Arc::new(RunnerState {
        root_run_id: run_id,
        options: params.options,
        trace: Mutex::new(Vec::new()),
        stack: Mutex::new(Vec::new()),
        call_count: AtomicU32::new(0),
    });

    let frame = CallFrame {
        story_id: params.story_id,
        agent_name: params.agent_name,
        parent_run_id: None,
        parent_agent: None,
        depth: 0,
        run_id,
        parts: params.parts,
        cancel: params.cancel,
    };
    let output = invoke_frame(registry, deps, active, &runner, frame, params.input).await;

    let trace = runner.trace.lock().clone();
    InvokeOutcome {
        run_id,
        output,
        trace,
    }
}

/// One invocation attempt.
struct CallFrame {
    story_id: String,
    agent_name: String,
    parent_run_id: Option<Uuid>,
    parent_agent: Option<String>,
    depth: u32,
    run_id: Uuid,
    parts: Option<PartSender>,
    cancel: CancelToken,
}

async fn invoke_frame(
    registry: &Arc<AgentRegistry>,
    deps: &Arc<AgentDeps>,
    active: &Arc<ActiveAgentRegistry>,
    runner: &Arc<RunnerState>,
    frame: CallFrame,
    input: Value,
) -> Result<Value> {
    let started_at = Utc::now();
    let agent_name = frame.agent_name.clone();

    let result = run_checked(registry, deps, active, runner, &frame, input).await;

    let finished_at = Utc::now();
    let entry = AgentTraceEntry {
        run_id: frame.run_id,
        parent_run_id: frame.parent_run_id,
        root_run_id: runner.root_run_id,
        agent_name: agent_name.clone(),
        started_at,
        finished_at,
        duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
        status: if result.is_ok() { TraceStatus::Success } else { TraceStatus::Error },
        error: result.as_ref().err().map(|e| e.to_string()),
    };
    runner.trace.lock().push(entry);

    match &result {
        Ok(_) => tracing::debug!(agent = %agent_name, run_id = %frame.run_id, "agent run succeeded"),
        Err(e) => tracing::warn!(agent = %agent_name, run_id = %frame.run_id, error = %e, "agent run failed"),
    }
    result
}

/// Guards, validation, and the timed run itself.
async fn run_checked(
    registry: &Arc<AgentRegistry>,
    deps: &Arc<AgentDeps>,
    active: &Arc<ActiveAgentRegistry>,
    runner: &Arc<RunnerState>,
    frame: &CallFrame,
    input: Value,
) -> Result<Value> {
    let def = registry
        .get(&frame.agent_name)
        .ok_or_else(|| Error::not_found("agent", &frame.agent_name))?;

    // ── Call budget ──────────────────────────────────────────────
    let count = runner.call_count.fetch_add(1, Ordering::SeqCst);
    if count >= runner.options.max_calls {
        return Err(Error::AgentCallLimitExceeded {
            count,
            max_calls: runner.options.max_calls,
        });
    }

    // ── Depth ────────────────────────────────────────────────────
    if frame.depth > runner.options.max_depth {
        return Err(Error::AgentDepthExceeded {
            depth: frame.depth,
            max_depth: runner.options.max_depth,
        });
    }

    // ── Cycle ────────────────────────────────────────────────────
    {
        let stack = runner.stack.lock();
        if stack.iter().any(|name| name == &frame.agent_name) {
            let path = stack
                .iter()
                .map(String::as_str)
                .chain([frame.agent_name.as_str()])
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(Error::AgentCycle(path));
        }
    }

    // ── Parent allow-list ────────────────────────────────────────
    if let Some(parent_name) = &frame.parent_agent {
        if let Some(parent_def) = registry.get(parent_name) {
            let allowed = parent_def.allowed_calls();
            if !allowed.is_empty() && !allowed.contains(&frame.agent_name.as_str()) {
                return Err(Error::AgentCallNotAllowed {
                    parent: parent_name.clone(),
                    child: frame.agent_name.clone(),
                });
            }
        }
    }

    // ── Input validation ─────────────────────────────────────────
    def.validate_input(&input)?;

    // ── Run with timeout ─────────────────────────────────────────
    runner.stack.lock().push(frame.agent_name.clone());
    let active_id = active.register(&frame.story_id, &frame.agent_name);

    let ctx = InvocationContext {
        deps: deps.clone(),
        story_id: frame.story_id.clone(),
        agent_name: frame.agent_name.clone(),
        run_id: frame.run_id,
        parent_run_id: frame.parent_run_id,
        root_run_id: runner.root_run_id,
        depth: frame.depth,
        parts: frame.parts.clone(),
        cancel: frame.cancel.clone(),
        registry: registry.clone(),
        active: active.clone(),
        runner: runner.clone(),
    };

    let timeout = Duration::from_millis(runner.options.timeout_ms);
    let run_result = tokio::time::timeout(timeout, def.run(&ctx, input)).await;

    // Pop this frame (the innermost occurrence of the name).
    {
        let mut stack = runner.stack.lock();
        if let Some(pos) = stack.iter().rposition(|name| name == &frame.agent_name) {
            stack.remove(pos);
        }
    }
    active.unregister(active_id);

    let output = match run_result {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            return Err(Error::AgentTimeout {
                agent: frame.agent_name.clone(),
                timeout_ms: runner.options.timeout_ms,
            })
        }
    };

    def.validate_output(&output)?;
    Ok(output)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model-output helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pull a JSON document out of model text: fenced block first, then the
/// widest `{...}` or `[...]` span.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str(trimmed) {
        return Some(v);
    }

    if let Some(fence_start) = trimmed.find("```") {
        let after = &trimmed[fence_start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(fence_end) = after.find("```") {
            if let Ok(v) = serde_json::from_str(after[..fence_end].trim()) {
                return Some(v);
            }
        }
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if start < end {
                if let Ok(v) = serde_json::from_str(&trimmed[start..=end]) {
                    return Some(v);
                }
            }
        }
    }
    None
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use quill_providers::ScriptedProvider;
    use serde_json::json;

    fn test_deps(provider: ScriptedProvider) -> (tempfile::TempDir, Arc<AgentDeps>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let deps = Arc::new(AgentDeps {
            config: Arc::new(Config::default()),
            stories: Arc::new(StoryStore::new(&path)),
            fragments: Arc::new(FragmentStore::new(&path)),
            logs: Arc::new(GenerationLogStore::new(&path)),
            block_configs: Arc::new(BlockConfigStore::new(&path)),
            instructions: Arc::new(InstructionRegistry::load(path.join("instruction-sets"))),
            provider: Arc::new(provider),
        });
        (dir, deps)
    }

    /// Test double: invokes the agent named in its input, or echoes.
    struct RelayAgent {
        name: &'static str,
        calls: &'static str,
    }

    #[async_trait::async_trait]
    impl AgentDefinition for RelayAgent {
        fn name(&self) -> &'static str {
            self.name
        }

        fn validate_input(&self, input: &Value) -> Result<()> {
            if input.is_object() {
                Ok(())
            } else {
                Err(Error::Validation("input must be an object".into()))
            }
        }

        async fn run(&self, ctx: &InvocationContext, input: Value) -> Result<Value> {
            if self.calls.is_empty() {
                return Ok(json!({ "echo": input, "depth": ctx.depth }));
            }
            ctx.invoke(self.calls, input).await
        }
    }

    fn registry_with(agents: Vec<RelayAgent>) -> Arc<AgentRegistry> {
        let registry = AgentRegistry::new();
        for agent in agents {
            registry.register(Arc::new(agent));
        }
        Arc::new(registry)
    }

    async fn invoke(
        registry: &Arc<AgentRegistry>,
        deps: &Arc<AgentDeps>,
        name: &str,
        input: Value,
        options: InvokeOptions,
    ) -> InvokeOutcome {
        let active = Arc::new(ActiveAgentRegistry::new());
        invoke_agent(
            registry,
            deps,
            &active,
            InvokeParams {
                story_id: "s1".into(),
                agent_name: name.into(),
                input,
                options,
                parts: None,
                cancel: CancelToken::new(),
            },
        )
        .await
    }

    #[tokio::test]
    async fn unknown_agent_fails_with_trace_entry() {
        let (_dir, deps) = test_deps(ScriptedProvider::new(vec![]));
        let registry = registry_with(vec![]);
        let outcome = invoke(&registry, &deps, "ghost", json!({}), InvokeOptions::default()).await;

        assert!(matches!(outcome.output, Err(Error::NotFound { .. })));
        assert_eq!(outcome.trace.len(), 1);
        assert_eq!(outcome.trace[0].status, TraceStatus::Error);
        assert_eq!(outcome.trace[0].agent_name, "ghost");
    }

    #[tokio::test]
    async fn echo_agent_succeeds_with_trace() {
        let (_dir, deps) = test_deps(ScriptedProvider::new(vec![]));
        let registry = registry_with(vec![RelayAgent { name: "echo", calls: "" }]);
        let outcome =
            invoke(&registry, &deps, "echo", json!({ "a": 1 }), InvokeOptions::default()).await;

        let output = outcome.output.unwrap();
        assert_eq!(output["echo"]["a"], 1);
        assert_eq!(output["depth"], 0);
        assert_eq!(outcome.trace.len(), 1);
        assert_eq!(outcome.trace[0].status, TraceStatus::Success);
        assert_eq!(outcome.trace[0].root_run_id, outcome.run_id);
    }

    #[tokio::test]
    async fn cycle_is_rejected_with_full_trace() {
        let (_dir, deps) = test_deps(ScriptedProvider::new(vec![]));
        let registry = registry_with(vec![
            RelayAgent { name: "X", calls: "Y" },
            RelayAgent { name: "Y", calls: "X" },
        ]);
        let outcome = invoke(&registry, &deps, "X", json!({}), InvokeOptions::default()).await;

        assert!(matches!(outcome.output, Err(Error::AgentCycle(_))));
        // Innermost finishes first: the rejected X attempt, then Y, then X.
        let names: Vec<_> = outcome.trace.iter().map(|t| t.agent_name.as_str()).collect();
        assert_eq!(names, vec!["X", "Y", "X"]);
        assert_eq!(outcome.trace[0].status, TraceStatus::Error);
        assert!(outcome
            .trace
            .iter()
            .all(|t| t.status == TraceStatus::Error));
        assert!(outcome.trace[0].error.as_deref().unwrap().contains("X -> Y -> X"));
    }

    #[tokio::test]
    async fn depth_limit_fails_before_run() {
        let (_dir, deps) = test_deps(ScriptedProvider::new(vec![]));
        // a → b → c → d would reach depth 3 with max_depth 2.
        let registry = registry_with(vec![
            RelayAgent { name: "a", calls: "b" },
            RelayAgent { name: "b", calls: "c" },
            RelayAgent { name: "c", calls: "d" },
            RelayAgent { name: "d", calls: "" },
        ]);
        let options = InvokeOptions { max_depth: 2, ..Default::default() };
        let outcome = invoke(&registry, &deps, "a", json!({}), options).await;

        assert!(matches!(outcome.output, Err(Error::AgentDepthExceeded { depth: 3, max_depth: 2 })));
    }

    #[tokio::test]
    async fn call_budget_enforced_across_the_tree() {
        let (_dir, deps) = test_deps(ScriptedProvider::new(vec![]));
        let registry = registry_with(vec![
            RelayAgent { name: "a", calls: "b" },
            RelayAgent { name: "b", calls: "c" },
            RelayAgent { name: "c", calls: "" },
        ]);
        let options = InvokeOptions { max_calls: 2, ..Default::default() };
        let outcome = invoke(&registry, &deps, "a", json!({}), options).await;

        assert!(matches!(
            outcome.output,
            Err(Error::AgentCallLimitExceeded { count: 2, max_calls: 2 })
        ));
        assert_eq!(outcome.trace.len(), 3);
    }

    #[tokio::test]
    async fn input_validation_failure_precedes_run() {
        let (_dir, deps) = test_deps(ScriptedProvider::new(vec![]));
        let registry = registry_with(vec![RelayAgent { name: "echo", calls: "" }]);
        let outcome =
            invoke(&registry, &deps, "echo", json!("not an object"), InvokeOptions::default())
                .await;
        assert!(matches!(outcome.output, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn timeout_fails_the_run() {
        struct SleepyAgent;
        #[async_trait::async_trait]
        impl AgentDefinition for SleepyAgent {
            fn name(&self) -> &'static str {
                "sleepy"
            }
            fn validate_input(&self, _input: &Value) -> Result<()> {
                Ok(())
            }
            async fn run(&self, _ctx: &InvocationContext, _input: Value) -> Result<Value> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!({}))
            }
        }

        let (_dir, deps) = test_deps(ScriptedProvider::new(vec![]));
        let registry = AgentRegistry::new();
        registry.register(Arc::new(SleepyAgent));
        let registry = Arc::new(registry);

        let options = InvokeOptions { timeout_ms: 50, ..Default::default() };
        let outcome = invoke(&registry, &deps, "sleepy", json!({}), options).await;

        assert!(matches!(
            outcome.output,
            Err(Error::AgentTimeout { timeout_ms: 50, .. })
        ));
        assert_eq!(outcome.trace.len(), 1);
        assert_eq!(outcome.trace[0].status, TraceStatus::Error);
    }

    #[tokio::test]
    async fn allowed_calls_restricts_children() {
        struct PickyAgent;
        #[async_trait::async_trait]
        impl AgentDefinition for PickyAgent {
            fn name(&self) -> &'static str {
                "picky"
            }
            fn allowed_calls(&self) -> &'static [&'static str] {
                &["echo"]
            }
            fn validate_input(&self, _input: &Value) -> Result<()> {
                Ok(())
            }
            async fn run(&self, ctx: &InvocationContext, _input: Value) -> Result<Value> {
                ctx.invoke("other", json!({})).await
            }
        }

        let registry = AgentRegistry::new();
        registry.register(Arc::new(PickyAgent));
        registry.register(Arc::new(RelayAgent { name: "echo", calls: "" }));
        registry.register(Arc::new(RelayAgent { name: "other", calls: "" }));
        let registry = Arc::new(registry);
        let (_dir, deps) = test_deps(ScriptedProvider::new(vec![]));

        let outcome = invoke(&registry, &deps, "picky", json!({}), InvokeOptions::default()).await;
        assert!(matches!(outcome.output, Err(Error::AgentCallNotAllowed { .. })));
    }

    #[test]
    fn extract_json_variants() {
        assert_eq!(extract_json(r#"{"a":1}"#).unwrap()["a"], 1);
        assert_eq!(
            extract_json("Here you go:\n```json\n{\"a\": 2}\n```\nDone.").unwrap()["a"],
            2
        );
        assert_eq!(extract_json("prefix {\"a\": 3} suffix").unwrap()["a"], 3);
        assert_eq!(extract_json("list: [1, 2]").unwrap()[1], 2);
        assert!(extract_json("no json here").is_none());
    }

    #[test]
    fn registry_basics() {
        let registry = AgentRegistry::with_builtins();
        assert!(registry.has("writer"));
        assert!(registry.has("analyze"));
        assert!(registry.has("suggest-directions"));
        assert_eq!(registry.list().len(), 3);
        registry.clear();
        assert!(registry.list().is_empty());
    }
}
