/// Shared error type used across all Quill crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("validation: {0}")]
    Validation(String),

    #[error("version conflict: expected {expected}, found {found}")]
    Conflict { expected: u64, found: u64 },

    #[error("unknown instruction: {0}")]
    UnknownInstruction(String),

    #[error("agent {agent} timed out after {timeout_ms}ms")]
    AgentTimeout { agent: String, timeout_ms: u64 },

    #[error("agent cycle: {0}")]
    AgentCycle(String),

    #[error("agent depth exceeded: depth={depth} > max_depth={max_depth}")]
    AgentDepthExceeded { depth: u32, max_depth: u32 },

    #[error("agent call limit exceeded: {count} >= {max_calls}")]
    AgentCallLimitExceeded { count: u32, max_calls: u32 },

    #[error("agent {parent} is not allowed to call {child}")]
    AgentCallNotAllowed { parent: String, child: String },

    #[error("tool {tool}: {message}")]
    Tool { tool: String, message: String },

    #[error("stream aborted: {0}")]
    StreamAborted(String),

    #[error("storage: {0}")]
    Storage(String),

    #[error("script: {0}")]
    Script(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    /// Whether this error maps to a client-side HTTP status (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::Validation(_)
                | Self::Conflict { .. }
                | Self::UnknownInstruction(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
