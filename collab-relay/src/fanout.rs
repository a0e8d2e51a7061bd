//! Fanout loops: one background task per locally active session.
//!
//! Each loop owns the session's broker subscription and pushes every message
//! it receives to the session's registered connections. The supervisor keeps
//! at most one loop per session. Its lock only guards loop start and stop;
//! message delivery goes through the registry and never touches it.

use crate::broker::{Broker, Subscription};
use crate::error::{BrokerError, BrokerResult};
use crate::registry::ConnectionRegistry;
use crate::server::RelayMetrics;
use crate::snapshot::SnapshotTracker;
use crate::transport::CloseReason;
use collab_types::{ServerFrame, SessionId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Debug)]
struct FanoutLoop {
    generation: u64,
    handle: JoinHandle<()>,
}

type LoopTable = Arc<Mutex<HashMap<SessionId, FanoutLoop>>>;

/// Starts and stops fanout loops.
pub struct FanoutSupervisor {
    broker: Arc<dyn Broker>,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<RelayMetrics>,
    snapshots: Option<Arc<SnapshotTracker>>,
    loops: LoopTable,
    next_generation: AtomicU64,
}

impl std::fmt::Debug for FanoutSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutSupervisor")
            .field("snapshots", &self.snapshots.is_some())
            .finish_non_exhaustive()
    }
}

impl FanoutSupervisor {
    /// Create a supervisor delivering into `registry`.
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<RelayMetrics>,
        snapshots: Option<Arc<SnapshotTracker>>,
    ) -> Self {
        Self {
            broker,
            registry,
            metrics,
            snapshots,
            loops: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Make sure a loop is running for the session.
    ///
    /// Idempotent: returns `Ok(true)` only when this call started the loop.
    /// A session with no registered members gets no loop. If the broker
    /// refuses the subscription, every registered member of the session is
    /// closed with [`CloseReason::BrokerUnavailable`].
    pub async fn ensure_running(&self, session_id: &SessionId) -> BrokerResult<bool> {
        let mut loops = self.loops.lock().await;

        if let Some(existing) = loops.get(session_id) {
            if !existing.handle.is_finished() {
                return Ok(false);
            }
            // Finished without removing itself (panicked).
            loops.remove(session_id);
            self.metrics.fanout_stopped.fetch_add(1, Ordering::Relaxed);
        }

        let subscription = match self.broker.subscribe(session_id).await {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::warn!("Fanout subscribe failed for session={}: {}", session_id, e);
                self.registry
                    .close_all(session_id, CloseReason::BrokerUnavailable);
                return Err(e);
            }
        };

        // Every member may have left or been closed while we subscribed.
        // Anyone registering from here on calls ensure_running after us.
        if self.registry.member_count(session_id) == 0 {
            tracing::debug!("No members left in session={}, not starting fanout", session_id);
            return Ok(false);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let fanout = RunningLoop {
            session_id: session_id.clone(),
            generation,
            registry: self.registry.clone(),
            metrics: self.metrics.clone(),
            snapshots: self.snapshots.clone(),
            loops: self.loops.clone(),
        };
        let handle = tokio::spawn(fanout.run(subscription));
        loops.insert(session_id.clone(), FanoutLoop { generation, handle });

        self.metrics.fanout_started.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Fanout loop started for session={}", session_id);
        Ok(true)
    }

    /// Stop the session's loop if the session has no members.
    ///
    /// Returns true if a loop was stopped. The broker subscription has been
    /// released by the time this returns.
    pub async fn release(&self, session_id: &SessionId) -> bool {
        let stopped = {
            let mut loops = self.loops.lock().await;
            if self.registry.member_count(session_id) > 0 {
                return false;
            }
            loops.remove(session_id)
        };

        let Some(fanout) = stopped else {
            return false;
        };
        fanout.handle.abort();
        let _ = fanout.handle.await;

        self.metrics.fanout_stopped.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Fanout loop stopped for session={}", session_id);
        true
    }

    /// Whether a loop is running for the session.
    pub async fn is_running(&self, session_id: &SessionId) -> bool {
        self.loops
            .lock()
            .await
            .get(session_id)
            .map(|fanout| !fanout.handle.is_finished())
            .unwrap_or(false)
    }

    /// Number of running loops.
    pub async fn active_loops(&self) -> usize {
        self.loops.lock().await.len()
    }

    /// Abort every loop (process shutdown).
    pub async fn stop_all(&self) {
        let drained: Vec<FanoutLoop> = self.loops.lock().await.drain().map(|(_, l)| l).collect();
        for fanout in drained {
            fanout.handle.abort();
            let _ = fanout.handle.await;
            self.metrics.fanout_stopped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

struct RunningLoop {
    session_id: SessionId,
    generation: u64,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<RelayMetrics>,
    snapshots: Option<Arc<SnapshotTracker>>,
    loops: LoopTable,
}

impl RunningLoop {
    async fn run(self, mut subscription: Box<dyn Subscription>) {
        loop {
            match subscription.recv().await {
                Some(Ok(envelope)) => {
                    if let Some(snapshots) = &self.snapshots {
                        snapshots.record(&self.session_id, &envelope.payload);
                    }

                    let frame = ServerFrame::Broadcast(envelope.to_edit());
                    let delivery = self.registry.broadcast_local(&self.session_id, &frame, None);

                    self.metrics
                        .frames_delivered
                        .fetch_add(delivery.delivered as u64, Ordering::Relaxed);
                    self.metrics
                        .evictions
                        .fetch_add(delivery.evicted as u64, Ordering::Relaxed);
                    tracing::debug!(
                        "Fanout session={} delivered={} evicted={}",
                        self.session_id,
                        delivery.delivered,
                        delivery.evicted
                    );

                    if delivery.emptied && self.retire().await {
                        tracing::info!(
                            "Fanout loop for session={} stopped: no members left",
                            self.session_id
                        );
                        return;
                    }
                }
                Some(Err(BrokerError::Codec(e))) => {
                    tracing::warn!("Dropping undecodable message in session={}: {}", self.session_id, e);
                }
                Some(Err(e)) => {
                    self.fail(&e.to_string()).await;
                    return;
                }
                None => {
                    self.fail("subscription ended").await;
                    return;
                }
            }
        }
    }

    /// Close the session's members and retire. Only the current loop does
    /// this, and both steps happen under the table lock.
    async fn fail(&self, reason: &str) {
        tracing::warn!("Fanout loop for session={} failed: {}", self.session_id, reason);
        let mut loops = self.loops.lock().await;
        if !self.is_current(&loops) {
            return;
        }
        self.registry
            .close_all(&self.session_id, CloseReason::BrokerUnavailable);
        loops.remove(&self.session_id);
        self.metrics.fanout_stopped.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove this loop's own table entry unless the session has members again.
    async fn retire(&self) -> bool {
        let mut loops = self.loops.lock().await;
        if self.registry.member_count(&self.session_id) > 0 || !self.is_current(&loops) {
            return false;
        }
        loops.remove(&self.session_id);
        self.metrics.fanout_stopped.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn is_current(&self, loops: &HashMap<SessionId, FanoutLoop>) -> bool {
        loops
            .get(&self.session_id)
            .map(|fanout| fanout.generation == self.generation)
            .unwrap_or(false)
    }
}
