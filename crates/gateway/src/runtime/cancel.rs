//! Per-story cancellation tokens for in-flight generations.
//!
//! Each generation registers a `CancelToken`; `POST
//! /stories/{sid}/generate/stop` (or a dropped HTTP connection) signals
//! the runtime to stop the tool loop and the model stream cleanly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// A cancellation token checked by the runtime loop.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Tracks active cancellation tokens per story.
#[derive(Default)]
pub struct CancelMap {
    tokens: Mutex<HashMap<String, Vec<CancelToken>>>,
}

impl CancelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a new cancel token for a story's generation.
    pub fn register(&self, story_id: &str) -> CancelToken {
        let token = CancelToken::new();
        self.tokens
            .lock()
            .entry(story_id.to_owned())
            .or_default()
            .push(token.clone());
        token
    }

    /// Cancel every in-flight generation for a story. Returns how many
    /// tokens were signalled.
    pub fn cancel(&self, story_id: &str) -> usize {
        let tokens = self.tokens.lock();
        match tokens.get(story_id) {
            Some(list) => {
                for token in list {
                    token.cancel();
                }
                list.len()
            }
            None => 0,
        }
    }

    /// Remove a finished generation's token.
    pub fn remove(&self, story_id: &str, token: &CancelToken) {
        let mut tokens = self.tokens.lock();
        if let Some(list) = tokens.get_mut(story_id) {
            list.retain(|t| !Arc::ptr_eq(&t.cancelled, &token.cancelled));
            if list.is_empty() {
                tokens.remove(story_id);
            }
        }
    }

    pub fn clear(&self) {
        self.tokens.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_lifecycle() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn clone_shares_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn cancel_signals_every_generation_for_the_story() {
        let map = CancelMap::new();
        let a = map.register("s1");
        let b = map.register("s1");
        let other = map.register("s2");

        assert_eq!(map.cancel("s1"), 2);
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
        assert!(!other.is_cancelled());
    }

    #[test]
    fn remove_is_scoped_to_the_token() {
        let map = CancelMap::new();
        let a = map.register("s1");
        let b = map.register("s1");

        map.remove("s1", &a);
        map.cancel("s1");
        assert!(!a.is_cancelled());
        assert!(b.is_cancelled());
    }

    #[test]
    fn cancel_unknown_story_is_zero() {
        let map = CancelMap::new();
        assert_eq!(map.cancel("ghost"), 0);
    }
}
