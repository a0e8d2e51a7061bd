//! Periodic snapshot persistence.
//!
//! The fanout loop records the latest relayed content per session. A
//! background task drains the dirty set on an interval and writes it through
//! the session store.
//!
//! Edits are not merged: the stored content is the payload of the last edit
//! relayed, which is the whole document only for clients that send their
//! full buffer with every edit.

use crate::config::SnapshotConfig;
use crate::storage::SessionStore;
use collab_types::SessionId;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

/// Latest unsaved content per session.
#[derive(Debug, Default)]
pub struct SnapshotTracker {
    dirty: DashMap<SessionId, String>,
}

impl SnapshotTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `content` as the session's latest state.
    pub fn record(&self, session_id: &SessionId, content: &str) {
        self.dirty.insert(session_id.clone(), content.to_string());
    }

    /// Take every pending snapshot.
    pub fn drain(&self) -> Vec<(SessionId, String)> {
        let keys: Vec<SessionId> = self.dirty.iter().map(|entry| entry.key().clone()).collect();
        keys.into_iter()
            .filter_map(|key| self.dirty.remove(&key))
            .collect()
    }

    /// Put back content whose save failed, unless newer content was recorded meanwhile.
    pub fn requeue(&self, session_id: SessionId, content: String) {
        self.dirty.entry(session_id).or_insert(content);
    }

    /// Number of sessions with unsaved content.
    pub fn pending(&self) -> usize {
        self.dirty.len()
    }
}

/// Write every pending snapshot once. Returns the number saved.
pub async fn flush(tracker: &SnapshotTracker, store: &dyn SessionStore) -> usize {
    let mut saved = 0;
    for (session_id, content) in tracker.drain() {
        match store.save(&session_id, &content).await {
            Ok(()) => saved += 1,
            Err(e) => {
                tracing::warn!("Snapshot save failed for session={}: {}", session_id, e);
                tracker.requeue(session_id, content);
            }
        }
    }
    saved
}

/// Spawn the background snapshot task.
///
/// Returns a handle that can be used to abort the task.
pub fn spawn_snapshot_task(
    tracker: Arc<SnapshotTracker>,
    store: Arc<dyn SessionStore>,
    config: SnapshotConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("Snapshot task disabled");
            return;
        }

        let interval_secs = config.interval_secs.max(1);
        tracing::info!("Snapshot task started (interval: {}s)", interval_secs);

        let mut timer = interval(Duration::from_secs(interval_secs));

        loop {
            timer.tick().await;

            let saved = flush(&tracker, store.as_ref()).await;
            if saved > 0 {
                tracing::info!("Snapshot: saved {} sessions", saved);
            } else {
                tracing::debug!("Snapshot: nothing to save");
            }
        }
    })
}
