//! Active-agent registry — in-memory list of running agents for UI
//! polling, with a safety TTL that reaps entries whose runs never
//! unregistered.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use quill_domain::trace::ActiveAgent;

/// Entries are reaped this long after registration if the run never
/// unregisters (crashed task, lost handle).
const ACTIVE_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Default)]
pub struct ActiveAgentRegistry {
    entries: Arc<Mutex<HashMap<Uuid, ActiveAgent>>>,
}

impl ActiveAgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a running agent and arm its TTL reaper. Returns the id
    /// to pass to [`unregister`](Self::unregister).
    pub fn register(&self, story_id: &str, agent_name: &str) -> Uuid {
        let entry = ActiveAgent {
            id: Uuid::new_v4(),
            story_id: story_id.to_owned(),
            agent_name: agent_name.to_owned(),
            started_at: Utc::now(),
        };
        let id = entry.id;
        self.entries.lock().insert(id, entry);

        let entries = Arc::downgrade(&self.entries);
        tokio::spawn(async move {
            tokio::time::sleep(ACTIVE_TTL).await;
            if let Some(entries) = entries.upgrade() {
                if entries.lock().remove(&id).is_some() {
                    tracing::warn!(%id, "active agent reaped after TTL without unregister");
                }
            }
        });

        id
    }

    pub fn unregister(&self, id: Uuid) {
        self.entries.lock().remove(&id);
    }

    /// Snapshot of current entries, optionally filtered by story.
    pub fn list(&self, story_id: Option<&str>) -> Vec<ActiveAgent> {
        let entries = self.entries.lock();
        let mut list: Vec<ActiveAgent> = entries
            .values()
            .filter(|e| story_id.is_none_or(|sid| e.story_id == sid))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        list
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
