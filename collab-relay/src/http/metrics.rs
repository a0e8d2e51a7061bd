//! Prometheus metrics endpoint.

use crate::server::CollabRelay;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Prometheus metrics handler.
///
/// Returns metrics in Prometheus text format.
/// Includes both gauges (current state) and counters (monotonic since startup).
pub async fn metrics_handler(Extension(relay): Extension<Arc<CollabRelay>>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        render(&relay).await,
    )
}

async fn render(relay: &CollabRelay) -> String {
    let m = relay.metrics();

    // Gauges
    let connections = relay.total_connections();
    let sessions = relay.total_sessions();
    let fanout_active = relay.fanout().active_loops().await;
    let snapshots_pending = relay.snapshots().map(|s| s.pending()).unwrap_or(0);

    // Counters
    let conns_total = m.connections_total.load(Ordering::Relaxed);
    let auth_failures = m.auth_failures.load(Ordering::Relaxed);
    let published = m.messages_published.load(Ordering::Relaxed);
    let publish_failures = m.publish_failures.load(Ordering::Relaxed);
    let delivered = m.frames_delivered.load(Ordering::Relaxed);
    let evictions = m.evictions.load(Ordering::Relaxed);
    let fanout_started = m.fanout_started.load(Ordering::Relaxed);
    let fanout_stopped = m.fanout_stopped.load(Ordering::Relaxed);

    format!(
        r#"# HELP collab_relay_connections_active Number of registered connections
# TYPE collab_relay_connections_active gauge
collab_relay_connections_active {connections}

# HELP collab_relay_sessions_active Number of sessions with at least one connection
# TYPE collab_relay_sessions_active gauge
collab_relay_sessions_active {sessions}

# HELP collab_relay_fanout_loops_active Number of running fanout loops
# TYPE collab_relay_fanout_loops_active gauge
collab_relay_fanout_loops_active {fanout_active}

# HELP collab_relay_snapshots_pending Sessions with unsaved content
# TYPE collab_relay_snapshots_pending gauge
collab_relay_snapshots_pending {snapshots_pending}

# HELP collab_relay_info Server information
# TYPE collab_relay_info gauge
collab_relay_info{{version="{version}"}} 1

# HELP collab_relay_connections_total Total connections accepted
# TYPE collab_relay_connections_total counter
collab_relay_connections_total {conns_total}

# HELP collab_relay_auth_failures_total Total connections refused during authentication
# TYPE collab_relay_auth_failures_total counter
collab_relay_auth_failures_total {auth_failures}

# HELP collab_relay_messages_published_total Total edits published to the broker
# TYPE collab_relay_messages_published_total counter
collab_relay_messages_published_total {published}

# HELP collab_relay_publish_failures_total Total edits the broker refused
# TYPE collab_relay_publish_failures_total counter
collab_relay_publish_failures_total {publish_failures}

# HELP collab_relay_frames_delivered_total Total broadcast frames queued to connections
# TYPE collab_relay_frames_delivered_total counter
collab_relay_frames_delivered_total {delivered}

# HELP collab_relay_evictions_total Total dead connections evicted during delivery
# TYPE collab_relay_evictions_total counter
collab_relay_evictions_total {evictions}

# HELP collab_relay_fanout_started_total Total fanout loops started
# TYPE collab_relay_fanout_started_total counter
collab_relay_fanout_started_total {fanout_started}

# HELP collab_relay_fanout_stopped_total Total fanout loops stopped
# TYPE collab_relay_fanout_stopped_total counter
collab_relay_fanout_stopped_total {fanout_stopped}
"#,
        version = env!("CARGO_PKG_VERSION"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::config::Config;
    use crate::identity::StaticIdentityProvider;
    use crate::storage::MemorySessionStore;

    #[tokio::test]
    async fn counters_appear_in_output() {
        let relay = CollabRelay::new(
            Config::default(),
            Arc::new(StaticIdentityProvider::default()),
            Arc::new(MemorySessionStore::new()),
            Arc::new(MemoryBroker::default()),
        );
        relay.metrics().auth_failures.fetch_add(3, Ordering::Relaxed);

        let body = render(&relay).await;
        assert!(body.contains("# TYPE collab_relay_connections_active gauge"));
        assert!(body.contains("collab_relay_auth_failures_total 3"));
        assert!(body.contains("collab_relay_fanout_loops_active 0"));
    }
}
