//! Event-stream adapter — converts a model part-stream into NDJSON
//! lines plus a completion summary.
//!
//! The adapter sits between the part producer (writer tool loop,
//! analyzer) and the HTTP writer, connected by a bounded line channel.
//! When a slow client fills the channel, reasoning deltas are dropped
//! first; any other event that stalls past the configured high-water
//! timeout fails the stream with `StreamAborted`. Exactly one
//! synthetic `finish` line closes every successful stream.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use quill_domain::config::StreamConfig;
use quill_domain::stream::{Completion, ModelPart, StreamEvent, ToolCallRecord, Usage};
use quill_domain::{Error, Result};

/// Sender half of a part channel, handed to agents as their event sink.
pub type PartSender = mpsc::Sender<Result<ModelPart>>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Accumulator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Folds parts into wire events and the completion summary. Shared by
/// the HTTP adapter and the librarian's analysis buffer.
#[derive(Default)]
pub struct Accumulator {
    completion: Completion,
    /// Args captured from tool-call parts, merged into the records by id
    /// when the stream finishes.
    call_args: HashMap<String, Value>,
    /// Result ids parallel to `completion.tool_calls`.
    record_ids: Vec<String>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one part. Returns the event to emit, `None` for `Finish`
    /// parts (no line; the synthetic finish is emitted at close).
    pub fn ingest(&mut self, part: ModelPart) -> Option<StreamEvent> {
        match part {
            ModelPart::TextDelta { text } => {
                self.completion.text.push_str(&text);
                Some(StreamEvent::Text { text })
            }
            ModelPart::ReasoningDelta { text } => {
                self.completion.reasoning.push_str(&text);
                Some(StreamEvent::Reasoning { text })
            }
            ModelPart::ToolCall { id, tool_name, args } => {
                self.call_args.insert(id.clone(), args.clone());
                Some(StreamEvent::ToolCall { id, tool_name, args })
            }
            ModelPart::ToolResult { id, tool_name, result } => {
                // Args stay empty here; the pair is merged by id at close.
                self.completion.tool_calls.push(ToolCallRecord {
                    tool_name: tool_name.clone(),
                    args: json!({}),
                    result: result.clone(),
                });
                self.record_ids.push(id.clone());
                Some(StreamEvent::ToolResult { id, tool_name, result })
            }
            ModelPart::Finish { finish_reason, usage } => {
                self.completion.step_count += 1;
                if let Some(reason) = finish_reason {
                    self.completion.finish_reason = reason;
                }
                if let Some(step) = usage {
                    let total = self.completion.usage.get_or_insert(Usage {
                        prompt_tokens: 0,
                        completion_tokens: 0,
                        total_tokens: 0,
                    });
                    total.prompt_tokens += step.prompt_tokens;
                    total.completion_tokens += step.completion_tokens;
                    total.total_tokens += step.total_tokens;
                }
                None
            }
        }
    }

    /// Close the stream: merge tool-call args into the records and
    /// produce the synthetic finish event plus the completion.
    pub fn finish(mut self) -> (StreamEvent, Completion) {
        for (record, id) in self.completion.tool_calls.iter_mut().zip(&self.record_ids) {
            if let Some(args) = self.call_args.get(id) {
                record.args = args.clone();
            }
        }
        if self.completion.finish_reason.is_empty() {
            self.completion.finish_reason = "stop".into();
        }
        let event = StreamEvent::Finish {
            finish_reason: self.completion.finish_reason.clone(),
            step_count: self.completion.step_count,
        };
        (event, self.completion)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// adapt — part channel in, NDJSON lines + completion out
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct StreamHandles {
    /// NDJSON lines for the HTTP body.
    pub lines: mpsc::Receiver<String>,
    /// Resolves when the part stream closes; `Err` when it aborted.
    pub completion: oneshot::Receiver<Result<Completion>>,
}

/// Create a part channel and spawn the adapter task bridging it to a
/// bounded NDJSON line channel.
pub fn adapt(cfg: &StreamConfig) -> (PartSender, StreamHandles) {
    let (part_tx, part_rx) = mpsc::channel::<Result<ModelPart>>(64);
    let (line_tx, line_rx) = mpsc::channel::<String>(cfg.buffer_capacity);
    let (done_tx, done_rx) = oneshot::channel();
    let stall = Duration::from_millis(cfg.stall_timeout_ms);

    tokio::spawn(pump(part_rx, line_tx, done_tx, stall));

    (part_tx, StreamHandles { lines: line_rx, completion: done_rx })
}

async fn pump(
    mut parts: mpsc::Receiver<Result<ModelPart>>,
    lines: mpsc::Sender<String>,
    done: oneshot::Sender<Result<Completion>>,
    stall: Duration,
) {
    let mut acc = Accumulator::new();
    let mut failure: Option<Error> = None;

    while let Some(item) = parts.recv().await {
        match item {
            Ok(part) => {
                let Some(event) = acc.ingest(part) else {
                    continue;
                };
                match &event {
                    // Reasoning is droppable under backpressure.
                    StreamEvent::Reasoning { .. } => {
                        let _ = lines.try_send(event.to_ndjson_line());
                    }
                    _ => {
                        let sent =
                            tokio::time::timeout(stall, lines.send(event.to_ndjson_line())).await;
                        if !matches!(sent, Ok(Ok(()))) {
                            failure = Some(Error::StreamAborted(
                                "client stopped reading the event stream".into(),
                            ));
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                let error_line = StreamEvent::Error { error: e.to_string() }.to_ndjson_line();
                let _ = lines.try_send(error_line);
                failure = Some(e);
                break;
            }
        }
    }

    match failure {
        Some(e) => {
            tracing::debug!(error = %e, "event stream aborted");
            let _ = done.send(Err(e));
        }
        None => {
            let (finish_event, completion) = acc.finish();
            let _ = tokio::time::timeout(stall, lines.send(finish_event.to_ndjson_line())).await;
            let _ = done.send(Ok(completion));
        }
    }
    // Dropping `parts` here unblocks any producer still sending; its
    // sends fail and the tool loop treats that as cancellation.
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
