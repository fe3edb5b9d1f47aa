//! LLM provider adapters.
//!
//! Every adapter translates its provider's wire format into the
//! provider-agnostic [`quill_domain::stream::ModelPart`] stream the
//! agent runtime consumes.

pub mod anthropic;
pub mod scripted;
mod sse;
mod traits;
mod util;

pub use anthropic::AnthropicProvider;
pub use scripted::ScriptedProvider;
pub use traits::{LlmProvider, ModelRequest};
