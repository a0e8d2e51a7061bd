//! Connection registry: which live connections belong to which session.
//!
//! The registry is the single serialization point for membership. Each
//! session's member set lives in one `DashMap` slot, and every operation
//! mutates it while holding that slot's lock, so register, unregister and
//! broadcast are atomic with respect to each other per session. Sessions in
//! other shards never contend. No operation awaits while holding a lock:
//! delivery only tries to push onto bounded per-connection queues, and a
//! member whose queue is full is treated like one whose transport is gone.

use crate::transport::{CloseReason, ConnectionHandle};
use collab_types::{ConnectionId, ServerFrame, SessionId};
use dashmap::DashMap;
use std::collections::HashMap;

/// Outcome of [`ConnectionRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The session had no members; a fanout loop should be started.
    FirstMember,
    /// The session already had members.
    Joined,
}

/// Outcome of [`ConnectionRegistry::unregister`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    /// The set is now empty and the entry was evicted; the fanout loop may stop.
    LastMember,
    /// Other members remain.
    Left,
    /// The connection was not registered (already evicted).
    NotRegistered,
}

/// Result of a local broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Connections the frame was queued for.
    pub delivered: usize,
    /// Connections found dead and removed.
    pub evicted: usize,
    /// Whether eviction emptied the session.
    pub emptied: bool,
}

#[derive(Debug, Default)]
struct SessionMembers {
    connections: HashMap<ConnectionId, ConnectionHandle>,
}

/// Session id -> live connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: DashMap<SessionId, SessionMembers>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a session.
    ///
    /// Registering the same connection id twice keeps a single entry.
    pub fn register(&self, session_id: &SessionId, connection: ConnectionHandle) -> Registration {
        let mut members = self.sessions.entry(session_id.clone()).or_default();
        let first = members.connections.is_empty();
        members.connections.insert(connection.id(), connection);

        tracing::debug!(
            "Registered connection in session={} (total: {})",
            session_id,
            members.connections.len()
        );

        if first {
            Registration::FirstMember
        } else {
            Registration::Joined
        }
    }

    /// Remove a connection from a session, evicting the session when it empties.
    pub fn unregister(&self, session_id: &SessionId, connection_id: ConnectionId) -> Departure {
        let (removed, remaining) = match self.sessions.get_mut(session_id) {
            Some(mut members) => {
                let removed = members.connections.remove(&connection_id).is_some();
                (removed, members.connections.len())
            }
            None => return Departure::NotRegistered,
        };

        tracing::debug!(
            "Unregistered connection {:?} from session={} (remaining: {})",
            connection_id,
            session_id,
            remaining
        );

        if remaining == 0 && self.evict_if_empty(session_id) {
            return Departure::LastMember;
        }
        if removed {
            Departure::Left
        } else {
            Departure::NotRegistered
        }
    }

    /// Queue `frame` for every member of the session except `exclude`.
    ///
    /// A member whose transport is gone, or whose queue is full because the
    /// peer stopped reading, is evicted on the spot; it never stops delivery
    /// to the others.
    pub fn broadcast_local(
        &self,
        session_id: &SessionId,
        frame: &ServerFrame,
        exclude: Option<ConnectionId>,
    ) -> Delivery {
        let mut delivery = Delivery::default();
        {
            let Some(mut members) = self.sessions.get_mut(session_id) else {
                return delivery;
            };

            members.connections.retain(|id, connection| {
                if Some(*id) == exclude {
                    return true;
                }
                match connection.send(frame.clone()) {
                    Ok(()) => {
                        delivery.delivered += 1;
                        true
                    }
                    Err(e) => {
                        tracing::debug!("Evicting connection {:?} from {}: {}", id, session_id, e);
                        connection.evict(CloseReason::Normal);
                        delivery.evicted += 1;
                        false
                    }
                }
            });
        }

        if delivery.evicted > 0 {
            delivery.emptied = self.evict_if_empty(session_id);
        }
        delivery
    }

    /// Send a close signal to every member and drop the session entry.
    ///
    /// Returns the number of connections closed.
    pub fn close_all(&self, session_id: &SessionId, reason: CloseReason) -> usize {
        let Some((_, members)) = self.sessions.remove(session_id) else {
            return 0;
        };
        for connection in members.connections.values() {
            connection.evict(reason);
        }
        tracing::info!(
            "Closed {} connections in session={} ({})",
            members.connections.len(),
            session_id,
            reason.description()
        );
        members.connections.len()
    }

    /// Number of connections registered for a session.
    pub fn member_count(&self, session_id: &SessionId) -> usize {
        self.sessions
            .get(session_id)
            .map(|members| members.connections.len())
            .unwrap_or(0)
    }

    /// Whether a connection is registered for a session.
    pub fn contains(&self, session_id: &SessionId, connection_id: ConnectionId) -> bool {
        self.sessions
            .get(session_id)
            .map(|members| members.connections.contains_key(&connection_id))
            .unwrap_or(false)
    }

    /// Number of sessions with at least one member.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Total registered connections across all sessions.
    pub fn total_connections(&self) -> usize {
        self.sessions
            .iter()
            .map(|entry| entry.value().connections.len())
            .sum()
    }

    fn evict_if_empty(&self, session_id: &SessionId) -> bool {
        self.sessions
            .remove_if(session_id, |_, members| members.connections.is_empty())
            .is_some()
    }
}
