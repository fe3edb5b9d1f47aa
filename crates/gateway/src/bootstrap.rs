//! AppState construction, shared by the server binary and tests.

use std::sync::Arc;

use quill_domain::config::Config;
use quill_providers::LlmProvider;
use quill_store::{BlockConfigStore, FragmentStore, GenerationLogStore, StoryStore};

use crate::runtime::active::ActiveAgentRegistry;
use crate::runtime::agents::{AgentDeps, AgentRegistry};
use crate::runtime::cancel::CancelMap;
use crate::runtime::instructions::InstructionRegistry;
use crate::runtime::librarian::LibrarianScheduler;
use crate::state::AppState;

/// Wire every subsystem into an [`AppState`] around the given provider.
pub fn build_app_state(config: Arc<Config>, provider: Arc<dyn LlmProvider>) -> AppState {
    let data_dir = config.storage.data_dir.clone();

    let stories = Arc::new(StoryStore::new(&data_dir));
    let fragments = Arc::new(FragmentStore::new(&data_dir));
    let logs = Arc::new(GenerationLogStore::new(&data_dir));
    let block_configs = Arc::new(BlockConfigStore::new(&data_dir));
    tracing::info!(data_dir = %data_dir.display(), "stores ready");

    let instructions = Arc::new(InstructionRegistry::load(&config.storage.instruction_sets_dir));

    let deps = Arc::new(AgentDeps {
        config: config.clone(),
        stories,
        fragments,
        logs,
        block_configs,
        instructions,
        provider,
    });

    let agents = Arc::new(AgentRegistry::with_builtins());
    tracing::info!(agents = ?agents.list(), "agent registry ready");

    let active = Arc::new(ActiveAgentRegistry::new());
    let librarian = Arc::new(LibrarianScheduler::new(
        deps.clone(),
        agents.clone(),
        active.clone(),
    ));
    tracing::info!(
        debounce_ms = config.librarian.debounce_ms,
        "librarian scheduler ready"
    );

    AppState {
        deps,
        agents,
        active,
        librarian,
        cancel_map: Arc::new(CancelMap::new()),
    }
}
