//! Persistence boundary for conversation state between turns

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::state::ConversationState;

/// Durable storage for conversation state, keyed by thread id.
///
/// Must at least round-trip identity, `pending_hitl`, `hitl_results`,
/// `executed_operations` and `resolver_results` for resume to be correct.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, thread_id: &str) -> Result<Option<ConversationState>>;

    async fn save(&self, state: &ConversationState) -> Result<()>;

    async fn list_threads(&self) -> Result<Vec<String>>;
}

/// Type alias for a shared store
pub type BoxedStateStore = Arc<dyn StateStore>;

/// In-process store, used by tests and ephemeral runs
#[derive(Clone, Default)]
pub struct MemoryStore {
    states: Arc<Mutex<HashMap<String, ConversationState>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self, thread_id: &str) -> Result<Option<ConversationState>> {
        Ok(self.states.lock().get(thread_id).cloned())
    }

    async fn save(&self, state: &ConversationState) -> Result<()> {
        self.states
            .lock()
            .insert(state.thread_id.clone(), state.clone());
        Ok(())
    }

    async fn list_threads(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.states.lock().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
