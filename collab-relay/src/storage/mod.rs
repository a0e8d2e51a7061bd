//! Session store: durable text content per session.
//!
//! The relay reads content once per attach. Writing is left to policies
//! layered on top (see [`crate::snapshot`]).

mod sqlite;

pub use sqlite::SqliteSessionStore;

use crate::error::StoreResult;
use async_trait::async_trait;
use collab_types::SessionId;
use dashmap::DashMap;

/// Trait for session content backends.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load a session's content. Sessions never written load as `""`.
    async fn load(&self, session_id: &SessionId) -> StoreResult<String>;

    /// Replace a session's content.
    async fn save(&self, session_id: &SessionId, content: &str) -> StoreResult<()>;
}

/// Process-local store, for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: DashMap<SessionId, String>,
}

impl MemorySessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with one session's content.
    pub fn with_session(self, session_id: SessionId, content: impl Into<String>) -> Self {
        self.sessions.insert(session_id, content.into());
        self
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, session_id: &SessionId) -> StoreResult<String> {
        Ok(self
            .sessions
            .get(session_id)
            .map(|content| content.clone())
            .unwrap_or_default())
    }

    async fn save(&self, session_id: &SessionId, content: &str) -> StoreResult<()> {
        self.sessions.insert(session_id.clone(), content.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_loads_empty_for_unknown_session() {
        let store = MemorySessionStore::new();
        let content = store.load(&SessionId::parse("new").unwrap()).await.unwrap();
        assert_eq!(content, "");
    }

    #[tokio::test]
    async fn memory_store_save_then_load() {
        let store = MemorySessionStore::new();
        let id = SessionId::parse("room1").unwrap();
        store.save(&id, "hello").await.unwrap();
        assert_eq!(store.load(&id).await.unwrap(), "hello");
    }
}
