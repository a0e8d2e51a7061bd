//! Main CollabRelay server coordination.
//!
//! CollabRelay owns the registry and fanout supervisor, holds the external
//! collaborators, and starts a [`Session`] for every accepted connection.

use crate::broker::Broker;
use crate::config::Config;
use crate::error::Result;
use crate::fanout::FanoutSupervisor;
use crate::identity::IdentityProvider;
use crate::registry::ConnectionRegistry;
use crate::session::Session;
use crate::snapshot::{spawn_snapshot_task, SnapshotTracker};
use crate::storage::SessionStore;
use crate::transport::{InboundFrames, LocalClient, Outbound};
use collab_types::SessionId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Operational metrics for monitoring relay activity.
///
/// All counters are monotonically increasing (reset only on restart).
/// Thread-safe via `AtomicU64`, no locks needed for incrementing.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Total connections accepted (before authentication).
    pub connections_total: AtomicU64,
    /// Total connections refused during authentication.
    pub auth_failures: AtomicU64,
    /// Total client edits published to the broker.
    pub messages_published: AtomicU64,
    /// Total client edits the broker refused.
    pub publish_failures: AtomicU64,
    /// Total broadcast frames queued to connections.
    pub frames_delivered: AtomicU64,
    /// Total connections evicted because their transport was gone.
    pub evictions: AtomicU64,
    /// Total fanout loops started.
    pub fanout_started: AtomicU64,
    /// Total fanout loops stopped.
    pub fanout_stopped: AtomicU64,
}

/// Main relay server.
pub struct CollabRelay {
    config: Config,
    identity: Arc<dyn IdentityProvider>,
    store: Arc<dyn SessionStore>,
    broker: Arc<dyn Broker>,
    registry: Arc<ConnectionRegistry>,
    fanout: FanoutSupervisor,
    /// Present when snapshot persistence is enabled.
    snapshots: Option<Arc<SnapshotTracker>>,
    metrics: Arc<RelayMetrics>,
}

impl std::fmt::Debug for CollabRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollabRelay")
            .field("config", &self.config)
            .field("metrics", &self.metrics)
            .field("sessions_count", &self.registry.session_count())
            .finish_non_exhaustive()
    }
}

impl CollabRelay {
    /// Create a new relay with the given config and collaborators.
    pub fn new(
        config: Config,
        identity: Arc<dyn IdentityProvider>,
        store: Arc<dyn SessionStore>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let metrics = Arc::new(RelayMetrics::default());
        let snapshots = config
            .snapshot
            .enabled
            .then(|| Arc::new(SnapshotTracker::new()));
        let fanout = FanoutSupervisor::new(
            broker.clone(),
            registry.clone(),
            metrics.clone(),
            snapshots.clone(),
        );

        Self {
            config,
            identity,
            store,
            broker,
            registry,
            fanout,
            snapshots,
            metrics,
        }
    }

    /// Get the relay configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the identity provider.
    pub fn identity(&self) -> &dyn IdentityProvider {
        self.identity.as_ref()
    }

    /// Get the session store.
    pub fn store(&self) -> &dyn SessionStore {
        self.store.as_ref()
    }

    /// Get the broker.
    pub fn broker(&self) -> &dyn Broker {
        self.broker.as_ref()
    }

    /// Get the connection registry.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Get the fanout supervisor.
    pub fn fanout(&self) -> &FanoutSupervisor {
        &self.fanout
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Get the snapshot tracker, if persistence is enabled.
    pub fn snapshots(&self) -> Option<&SnapshotTracker> {
        self.snapshots.as_deref()
    }

    /// Start the periodic snapshot task. `None` when persistence is disabled.
    pub fn spawn_snapshot_task(&self) -> Option<JoinHandle<()>> {
        let tracker = self.snapshots.clone()?;
        Some(spawn_snapshot_task(
            tracker,
            self.store.clone(),
            self.config.snapshot.clone(),
        ))
    }

    /// Run a session on an accepted connection until it closes.
    pub async fn serve_connection<I: InboundFrames>(
        self: Arc<Self>,
        session_id: SessionId,
        credential: Option<String>,
        inbound: I,
        outbound: mpsc::Sender<Outbound>,
    ) -> Result<()> {
        self.metrics.connections_total.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Accepted connection for session={}", session_id);

        Session::new(self, session_id, inbound, outbound)
            .run(credential)
            .await
    }

    /// Attach an in-process client to a session.
    ///
    /// The session runs on a background task; the returned client is the
    /// peer's end of the connection.
    pub fn connect_local(
        self: &Arc<Self>,
        session_id: SessionId,
        credential: Option<String>,
    ) -> LocalClient {
        let (client, server) = LocalClient::pair(self.config.limits.outbound_queue);
        let relay = self.clone();
        tokio::spawn(async move {
            if let Err(e) = relay
                .serve_connection(session_id, credential, server.inbound, server.outbound)
                .await
            {
                tracing::debug!("Local connection ended: {}", e);
            }
        });
        client
    }

    /// Get total registered connections across all sessions.
    pub fn total_connections(&self) -> usize {
        self.registry.total_connections()
    }

    /// Get total sessions with at least one connection.
    pub fn total_sessions(&self) -> usize {
        self.registry.session_count()
    }

    /// Stop all fanout loops (process shutdown).
    pub async fn shutdown(&self) {
        self.fanout.stop_all().await;
        if let Some(tracker) = &self.snapshots {
            let saved = crate::snapshot::flush(tracker, self.store.as_ref()).await;
            tracing::info!("Saved {} snapshots on shutdown", saved);
        }
    }
}
