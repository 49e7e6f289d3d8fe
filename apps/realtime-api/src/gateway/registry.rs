//! Connection registry: userId → live connections on *this* instance.
//!
//! The registry is mutated only by the owning instance; other instances see
//! this user's connectivity through backplane presence events, never through
//! shared memory.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;

use super::events::OutboundEvent;

/// A live transport connection owned by this instance.
pub struct ConnectionEntry {
    pub connection_id: String,
    pub user_id: String,
    pub instance_id: String,
    pub established_at: DateTime<Utc>,
    pub last_activity_at: Instant,
    /// Queue feeding the connection's socket writer. Order is preserved.
    pub sender: mpsc::UnboundedSender<OutboundEvent>,
}

/// Registry of all connections held by this instance.
///
/// Uses `DashMap` for shard-level concurrency; a secondary index maps userId
/// to that user's connection set.
pub struct ConnectionRegistry {
    connections: DashMap<String, ConnectionEntry>,
    by_user: DashMap<String, HashSet<String>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            by_user: DashMap::new(),
        }
    }

    /// Register a connection. Idempotent: re-registering the same
    /// connectionId replaces the prior entry (handles reconnect races).
    pub fn register(
        &self,
        user_id: &str,
        connection_id: &str,
        instance_id: &str,
        sender: mpsc::UnboundedSender<OutboundEvent>,
    ) {
        if let Some(old) = self.connections.insert(
            connection_id.to_string(),
            ConnectionEntry {
                connection_id: connection_id.to_string(),
                user_id: user_id.to_string(),
                instance_id: instance_id.to_string(),
                established_at: Utc::now(),
                last_activity_at: Instant::now(),
                sender,
            },
        ) {
            // Replaced entry may belong to a different user after a reconnect
            // race; drop it from that user's index.
            if old.user_id != user_id {
                self.unindex(&old.user_id, connection_id);
            }
        }
        self.by_user
            .entry(user_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
    }

    /// Remove a connection. Idempotent. Returns the removed entry, if any.
    pub fn deregister(&self, connection_id: &str) -> Option<ConnectionEntry> {
        let (_, entry) = self.connections.remove(connection_id)?;
        self.unindex(&entry.user_id, connection_id);
        Some(entry)
    }

    fn unindex(&self, user_id: &str, connection_id: &str) {
        if let Some(mut set) = self.by_user.get_mut(user_id) {
            set.remove(connection_id);
            if set.is_empty() {
                drop(set);
                self.by_user.remove_if(user_id, |_, s| s.is_empty());
            }
        }
    }

    /// Connection IDs held locally for a user.
    pub fn connections_for(&self, user_id: &str) -> Vec<String> {
        self.by_user
            .get(user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_user(&self, user_id: &str) -> bool {
        self.by_user
            .get(user_id)
            .map(|set| !set.is_empty())
            .unwrap_or(false)
    }

    /// Record activity (heartbeat) for a connection.
    pub fn touch(&self, connection_id: &str) {
        if let Some(mut entry) = self.connections.get_mut(connection_id) {
            entry.last_activity_at = Instant::now();
        }
    }

    /// Queue an event to every local connection of a user. Returns the number
    /// of connections reached.
    pub fn send_to_user(&self, user_id: &str, event: OutboundEvent) -> usize {
        let ids = self.connections_for(user_id);
        let mut reached = 0;
        for id in ids {
            if let Some(entry) = self.connections.get(&id) {
                if entry.sender.send(event.clone()).is_ok() {
                    reached += 1;
                }
            }
        }
        reached
    }

    /// Queue an event to every local connection. Returns connections reached.
    pub fn broadcast_all(&self, event: OutboundEvent) -> usize {
        let mut reached = 0;
        for entry in self.connections.iter() {
            if entry.sender.send(event.clone()).is_ok() {
                reached += 1;
            }
        }
        reached
    }

    /// Remove connections with no activity within `timeout` (presumed dead).
    /// Returns the removed entries so the caller can update presence.
    pub fn sweep_expired(&self, timeout: Duration) -> Vec<ConnectionEntry> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .connections
            .iter()
            .filter(|e| now.duration_since(e.last_activity_at) > timeout)
            .map(|e| e.connection_id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.deregister(&id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
