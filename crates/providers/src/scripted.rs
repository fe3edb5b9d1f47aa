//! Scripted provider — plays back canned part sequences.
//!
//! Used by pipeline and agent tests: each `stream_parts` call pops the
//! next scripted step, so tool loops can be exercised deterministically
//! without a network.

use std::sync::Mutex;

use quill_domain::stream::{BoxStream, ModelPart};
use quill_domain::{Error, Result};

use crate::traits::{LlmProvider, ModelRequest};

pub struct ScriptedProvider {
    /// One entry per expected model step, consumed front to back.
    steps: Mutex<Vec<Vec<Result<ModelPart>>>>,
    default_model: String,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<Vec<Result<ModelPart>>>) -> Self {
        Self { steps: Mutex::new(steps), default_model: "scripted/test".into() }
    }

    /// Single-step provider that emits the given text and stops.
    pub fn text(text: &str) -> Self {
        Self::new(vec![vec![
            Ok(ModelPart::TextDelta { text: text.to_string() }),
            Ok(ModelPart::Finish { finish_reason: Some("stop".into()), usage: None }),
        ]])
    }

    /// Remaining un-consumed steps (assert 0 at the end of a test).
    pub fn remaining_steps(&self) -> usize {
        self.steps.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    async fn stream_parts(
        &self,
        _req: &ModelRequest,
    ) -> Result<BoxStream<'static, Result<ModelPart>>> {
        let step = {
            let mut steps = self.steps.lock().unwrap();
            if steps.is_empty() {
                return Err(Error::Provider {
                    provider: "scripted".into(),
                    message: "no scripted steps remaining".into(),
                });
            }
            steps.remove(0)
        };

        Ok(Box::pin(async_stream::stream! {
            for part in step {
                yield part;
            }
        }))
    }

    fn provider_id(&self) -> &str {
        "scripted"
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }
}
