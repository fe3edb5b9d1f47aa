use quill_domain::stream::{BoxStream, ModelPart};
use quill_domain::tool::{Message, ToolDefinition};
use quill_domain::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A provider-agnostic model request.
#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    /// The conversation messages to send.
    pub messages: Vec<Message>,
    /// Tool definitions the model may invoke.
    pub tools: Vec<ToolDefinition>,
    /// Model identifier override. When `None`, the provider uses its default.
    pub model: Option<String>,
    /// Maximum tokens in the response. `None` lets the provider choose.
    pub max_tokens: Option<u32>,
    /// Sampling temperature. `None` lets the provider choose.
    pub temperature: Option<f32>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait that every LLM adapter must implement.
///
/// One model step = one call: the returned stream yields text/reasoning
/// deltas and whole tool calls, then exactly one `Finish` part.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a request and return the part stream for one model step.
    async fn stream_parts(
        &self,
        req: &ModelRequest,
    ) -> Result<BoxStream<'static, Result<ModelPart>>>;

    /// A unique identifier for this provider instance.
    fn provider_id(&self) -> &str;

    /// The model used when a request carries no override.
    fn default_model(&self) -> &str;
}
