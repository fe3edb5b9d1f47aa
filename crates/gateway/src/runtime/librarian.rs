//! Librarian scheduler — per-story debounced background analysis.
//!
//! Every corpus change calls [`LibrarianScheduler::trigger`]; the
//! debounce timer collapses bursts so one analyzer run sees the final
//! state. Each run streams its events into a fresh [`AnalysisBuffer`]
//! that HTTP subscribers replay from the start and then follow live.
//! A new analysis supersedes the previous buffer. Librarian failures
//! never propagate; they only park the story in an error status.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures_core::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use quill_domain::stream::{ModelPart, StreamEvent};
use quill_domain::Result;
use quill_store::atomic::write_json_atomic;
use quill_store::fragments::NewFragment;

use super::active::ActiveAgentRegistry;
use super::agents::librarian::{AnalysisReport, KnowledgeSuggestion};
use super::agents::{invoke_agent, AgentDeps, AgentRegistry, InvokeOptions, InvokeParams};
use super::cancel::CancelToken;
use super::ndjson::Accumulator;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Analysis buffer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct BufferState {
    events: Vec<StreamEvent>,
    done: bool,
    error: Option<String>,
}

/// Replay-then-follow event log for one analyzer run. Every subscriber
/// sees the identical sequence: full replay from the start, then live
/// events until `done`.
#[derive(Default)]
pub struct AnalysisBuffer {
    state: Mutex<BufferState>,
    notify: Notify,
}

impl AnalysisBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_event(&self, event: StreamEvent) {
        let mut state = self.state.lock();
        if state.done {
            return;
        }
        state.events.push(event);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Finalize the buffer. An error appends a visible error event.
    pub fn finish(&self, error: Option<String>) {
        let mut state = self.state.lock();
        if state.done {
            return;
        }
        if let Some(message) = &error {
            state.events.push(StreamEvent::Error { error: message.clone() });
        }
        state.error = error;
        state.done = true;
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().done
    }

    /// The failure message the buffer was finalized with, if any.
    pub fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    /// NDJSON lines: replay every buffered event in order, then follow
    /// until the buffer finishes.
    pub fn subscribe(self: Arc<Self>) -> impl Stream<Item = String> {
        async_stream::stream! {
            let mut idx = 0;
            loop {
                let mut notified = pin!(self.notify.notified());
                // Register interest before the snapshot so a push
                // between snapshot and await still wakes us.
                notified.as_mut().enable();

                let (fresh, done) = {
                    let state = self.state.lock();
                    (state.events[idx..].to_vec(), state.done)
                };
                if fresh.is_empty() && done {
                    break;
                }
                if fresh.is_empty() {
                    notified.await;
                    continue;
                }
                for event in fresh {
                    idx += 1;
                    yield event.to_ndjson_line();
                }
                if done {
                    break;
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LibrarianStatus {
    Idle,
    Scheduled,
    Running,
    Error,
}

#[derive(Default)]
struct StoryEntry {
    timer: Option<JoinHandle<()>>,
    pending_fragment: Option<String>,
    status: Option<LibrarianStatus>,
    last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LibrarianStatusView {
    pub run_status: LibrarianStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_fragment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

pub struct LibrarianScheduler {
    deps: Arc<AgentDeps>,
    registry: Arc<AgentRegistry>,
    active: Arc<ActiveAgentRegistry>,
    entries: Mutex<HashMap<String, StoryEntry>>,
    buffers: Mutex<HashMap<String, Arc<AnalysisBuffer>>>,
}

impl LibrarianScheduler {
    pub fn new(
        deps: Arc<AgentDeps>,
        registry: Arc<AgentRegistry>,
        active: Arc<ActiveAgentRegistry>,
    ) -> Self {
        Self {
            deps,
            registry,
            active,
            entries: Mutex::new(HashMap::new()),
            buffers: Mutex::new(HashMap::new()),
        }
    }

    fn debounce(&self) -> Duration {
        Duration::from_millis(self.deps.config.librarian.debounce_ms)
    }

    /// Schedule (or reschedule) an analysis for a story. A pending
    /// timer is cancelled; a running analysis is left alone and the new
    /// trigger fires after it completes.
    pub fn trigger(self: Arc<Self>, story_id: &str, fragment_id: &str) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(story_id.to_string()).or_default();

        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        entry.pending_fragment = Some(fragment_id.to_string());
        if entry.status != Some(LibrarianStatus::Running) {
            entry.status = Some(LibrarianStatus::Scheduled);
        }

        tracing::debug!(story_id, fragment_id, "librarian scheduled");
        let story_id = story_id.to_string();
        entry.timer = Some(Self::arm_timer(self.clone(), story_id));
    }

    fn arm_timer(this: Arc<Self>, story_id: String) -> JoinHandle<()> {
        let debounce = this.debounce();
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            this.fire(story_id).await;
        })
    }

    async fn fire(self: Arc<Self>, story_id: String) {
        let fragment_id = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(story_id.clone()).or_default();
            if entry.status == Some(LibrarianStatus::Running) {
                // Not preempting: re-arm and try again after the run.
                entry.timer = Some(Self::arm_timer(self.clone(), story_id.clone()));
                return;
            }
            entry.timer = None;
            entry.status = Some(LibrarianStatus::Running);
            entry.pending_fragment.take()
        };

        tracing::info!(story_id, fragment = ?fragment_id, "librarian analysis starting");
        let result = self.run_analysis(&story_id, fragment_id).await;

        let mut entries = self.entries.lock();
        let entry = entries.entry(story_id.clone()).or_default();
        match result {
            Ok(()) => {
                entry.status = Some(LibrarianStatus::Idle);
                entry.last_error = None;
            }
            Err(message) => {
                tracing::warn!(story_id, error = %message, "librarian analysis failed");
                entry.status = Some(LibrarianStatus::Error);
                entry.last_error = Some(message);
            }
        }
    }

    /// One analyzer run: fresh buffer, part consumer, agent invocation,
    /// result integration. Returns the failure message, if any.
    async fn run_analysis(
        &self,
        story_id: &str,
        fragment_id: Option<String>,
    ) -> std::result::Result<(), String> {
        let buffer = self.begin_buffer(story_id);

        // Bridge: agent part sink → buffer events.
        let (part_tx, mut part_rx) = mpsc::channel::<Result<ModelPart>>(64);
        let consumer_buffer = buffer.clone();
        let consumer: JoinHandle<(Accumulator, Option<String>)> = tokio::spawn(async move {
            let mut acc = Accumulator::new();
            let mut failure = None;
            while let Some(item) = part_rx.recv().await {
                match item {
                    Ok(part) => {
                        if let Some(event) = acc.ingest(part) {
                            consumer_buffer.push_event(event);
                        }
                    }
                    Err(e) => {
                        failure = Some(e.to_string());
                        break;
                    }
                }
            }
            (acc, failure)
        });

        let outcome = invoke_agent(
            &self.registry,
            &self.deps,
            &self.active,
            InvokeParams {
                story_id: story_id.to_string(),
                agent_name: "analyze".into(),
                input: json!({ "fragmentId": fragment_id }),
                options: InvokeOptions::from(&self.deps.config.agents),
                parts: Some(part_tx),
                cancel: CancelToken::new(),
            },
        )
        .await;

        let (acc, consumer_failure) = consumer.await.unwrap_or_default();

        match outcome.output {
            Ok(report) => {
                let (finish_event, _) = acc.finish();
                buffer.push_event(finish_event);
                buffer.finish(None);

                let report: AnalysisReport =
                    serde_json::from_value(report).map_err(|e| e.to_string())?;
                self.integrate(story_id, &report).map_err(|e| e.to_string())?;
                Ok(())
            }
            Err(e) => {
                let message = consumer_failure.unwrap_or_else(|| e.to_string());
                buffer.finish(Some(message.clone()));
                Err(message)
            }
        }
    }

    /// Create the run's buffer, superseding any previous one.
    fn begin_buffer(&self, story_id: &str) -> Arc<AnalysisBuffer> {
        let buffer = Arc::new(AnalysisBuffer::new());
        let previous = self
            .buffers
            .lock()
            .insert(story_id.to_string(), buffer.clone());
        if let Some(previous) = previous {
            previous.finish(Some("Superseded by new analysis".into()));
        }
        buffer
    }

    /// Apply the analyzer's report: roll the summary forward under the
    /// byte cap, then apply or persist knowledge suggestions.
    fn integrate(&self, story_id: &str, report: &AnalysisReport) -> Result<()> {
        let cap = self.deps.config.librarian.summary_cap_bytes;
        let story = self.deps.stories.require(story_id)?;

        // With a non-zero threshold, the summary only rolls once the
        // corpus has outgrown it; 0 keeps summarization unconditional.
        let threshold = story.settings.summarization_threshold;
        let summarize = threshold == 0 || self.prose_chars(story_id)? >= threshold;

        if summarize && !report.summary_update.is_empty() {
            self.deps.stories.update(story_id, |story| {
                if story.summary.is_empty() {
                    story.summary = report.summary_update.clone();
                } else {
                    story.summary.push_str("\n\n");
                    story.summary.push_str(&report.summary_update);
                }
                truncate_front(&mut story.summary, cap);
            })?;
        }
        if !report.knowledge_suggestions.is_empty() {
            if story.settings.auto_apply_librarian {
                for suggestion in &report.knowledge_suggestions {
                    self.apply_suggestion(story_id, suggestion);
                }
            } else {
                let path = quill_store::content_dir(self.deps.fragments.data_dir(), story_id)
                    .join("librarian")
                    .join("suggestions.json");
                write_json_atomic(&path, &report.knowledge_suggestions)?;
            }
        }

        // Full report kept for the sidebar.
        let path = quill_store::content_dir(self.deps.fragments.data_dir(), story_id)
            .join("librarian")
            .join("last-analysis.json");
        write_json_atomic(&path, report)?;
        Ok(())
    }

    fn prose_chars(&self, story_id: &str) -> Result<u64> {
        let prose = self.deps.fragments.list_fragments(story_id, Some("prose"), false)?;
        Ok(prose.iter().map(|f| f.content.chars().count() as u64).sum())
    }

    fn apply_suggestion(&self, story_id: &str, suggestion: &KnowledgeSuggestion) {
        let created = self.deps.fragments.create(
            story_id,
            NewFragment {
                kind: "knowledge".into(),
                name: suggestion.name.clone(),
                description: suggestion.description.clone(),
                content: suggestion.content.clone(),
                ..Default::default()
            },
        );
        match created {
            Ok(fragment) => {
                tracing::info!(story_id, id = %fragment.id, "librarian created knowledge fragment")
            }
            Err(e) => {
                tracing::warn!(story_id, error = %e, "knowledge suggestion could not be applied")
            }
        }
    }

    // ── Introspection ─────────────────────────────────────────────

    pub fn status(&self, story_id: &str) -> LibrarianStatusView {
        let entries = self.entries.lock();
        match entries.get(story_id) {
            Some(entry) => LibrarianStatusView {
                run_status: entry.status.unwrap_or(LibrarianStatus::Idle),
                pending_fragment_id: entry.pending_fragment.clone(),
                last_error: entry.last_error.clone(),
            },
            None => LibrarianStatusView {
                run_status: LibrarianStatus::Idle,
                pending_fragment_id: None,
                last_error: None,
            },
        }
    }

    /// The latest analysis buffer for a story, if any run has started.
    pub fn buffer(&self, story_id: &str) -> Option<Arc<AnalysisBuffer>> {
        self.buffers.lock().get(story_id).cloned()
    }

    /// Abort timers and drop state (tests).
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        for entry in entries.values_mut() {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
        }
        entries.clear();
        self.buffers.lock().clear();
    }
}

/// Drop bytes from the front until `s` fits `cap`, cutting on a char
/// boundary so the newest context survives.
fn truncate_front(s: &mut String, cap: usize) {
    if s.len() <= cap {
        return;
    }
    let mut cut = s.len() - cap;
    while cut < s.len() && !s.is_char_boundary(cut) {
        cut += 1;
    }
    *s = s[cut..].to_string();
}
