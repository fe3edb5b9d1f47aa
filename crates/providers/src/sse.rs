//! Shared SSE streaming infrastructure for provider adapters.
//!
//! Adapters receive a `reqwest::Response`, buffer chunks, split on
//! `\n\n`, extract `data:` payloads, and feed each payload to a
//! provider-specific parser that returns `Vec<Result<ModelPart>>`.

use quill_domain::stream::{BoxStream, ModelPart};
use quill_domain::Result;

use crate::util::from_reqwest;

/// Extract complete `data:` payloads from an SSE buffer.
///
/// SSE events are delimited by `\n\n`. Each event block may contain
/// `event:`, `data:`, `id:`, or `retry:` lines; only `data:` lines
/// matter here. The buffer is drained in place, leaving any trailing
/// partial event for the next call.
pub(crate) fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    let mut data_lines = Vec::new();

    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2); // remove the \n\n delimiter

        for line in block.lines() {
            let line = line.trim();
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    data_lines.push(data.to_string());
                }
            }
        }
    }

    data_lines
}

/// Build a part stream from an SSE `reqwest::Response` and a
/// provider-specific parser closure.
///
/// The closure is `FnMut` because adapters keep assembly state across
/// payloads (tool-call input buffers). The stream flushes the remaining
/// buffer when the body closes and emits a fallback `Finish` part if
/// the parser never produced one.
pub(crate) fn sse_part_stream<F>(
    response: reqwest::Response,
    mut parse_data: F,
) -> BoxStream<'static, Result<ModelPart>>
where
    F: FnMut(&str) -> Vec<Result<ModelPart>> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut response = response;
        let mut buffer = String::new();
        let mut finish_emitted = false;

        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));

                    for data in drain_data_lines(&mut buffer) {
                        for part in parse_data(&data) {
                            if matches!(&part, Ok(ModelPart::Finish { .. })) {
                                finish_emitted = true;
                            }
                            yield part;
                        }
                    }
                }
                Ok(None) => {
                    if !buffer.trim().is_empty() {
                        buffer.push_str("\n\n");
                        for data in drain_data_lines(&mut buffer) {
                            for part in parse_data(&data) {
                                if matches!(&part, Ok(ModelPart::Finish { .. })) {
                                    finish_emitted = true;
                                }
                                yield part;
                            }
                        }
                    }
                    break;
                }
                Err(e) => {
                    yield Err(from_reqwest(e));
                    break;
                }
            }
        }

        if !finish_emitted {
            yield Ok(ModelPart::Finish { finish_reason: Some("stop".into()), usage: None });
        }
    };

    Box::pin(stream)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
