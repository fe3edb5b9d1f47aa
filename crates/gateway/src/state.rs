//! Shared application state passed to all API handlers.

use std::sync::Arc;

use crate::runtime::active::ActiveAgentRegistry;
use crate::runtime::agents::{AgentDeps, AgentRegistry};
use crate::runtime::cancel::CancelMap;
use crate::runtime::librarian::LibrarianScheduler;

#[derive(Clone)]
pub struct AppState {
    /// Stores, provider, config and instructions shared with agents.
    pub deps: Arc<AgentDeps>,
    pub agents: Arc<AgentRegistry>,
    pub active: Arc<ActiveAgentRegistry>,
    pub librarian: Arc<LibrarianScheduler>,
    pub cancel_map: Arc<CancelMap>,
}
