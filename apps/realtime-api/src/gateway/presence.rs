//! Per-user presence tracking with multi-connection support.
//!
//! Presence is per-**user**, not per-connection. A user goes offline only
//! when ALL of their connections have dropped and the grace period has
//! expired, so a quick reconnect never emits an offline event.
//!
//! Typing state auto-reverts through a generation counter: each typing event
//! bumps the generation, and a scheduled reversion only fires if its
//! generation is still current. A refresh therefore replaces the pending
//! reversion instead of stacking another timer.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// A user's presence as seen by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
    Typing { thread_id: String },
}

impl PresenceStatus {
    pub fn is_offline(&self) -> bool {
        matches!(self, PresenceStatus::Offline)
    }
}

struct UserPresence {
    status: PresenceStatus,
    /// Number of live connections for this user on this instance.
    connection_count: usize,
    /// Set when `connection_count` drops to 0; cleared on reconnect.
    disconnected_at: Option<Instant>,
    updated_at: Instant,
    /// Bumped on every typing event; stale reversions are ignored.
    typing_generation: u64,
}

/// Thread-safe, DashMap-backed presence tracker.
///
/// Local state is derived from this instance's connections; the remote view
/// is fed by backplane presence events from other instances.
pub struct PresenceTracker {
    local: DashMap<String, UserPresence>,
    remote_online: DashMap<String, bool>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            local: DashMap::new(),
            remote_online: DashMap::new(),
        }
    }

    /// Register a connection coming online. Returns the new status if a
    /// transition occurred (so the caller can publish it).
    pub fn connection_opened(&self, user_id: &str) -> Option<PresenceStatus> {
        let mut entry = self
            .local
            .entry(user_id.to_string())
            .or_insert_with(|| UserPresence {
                status: PresenceStatus::Offline,
                connection_count: 0,
                disconnected_at: None,
                updated_at: Instant::now(),
                typing_generation: 0,
            });

        entry.connection_count += 1;
        entry.disconnected_at = None;

        if entry.status.is_offline() {
            entry.status = PresenceStatus::Online;
            entry.updated_at = Instant::now();
            Some(PresenceStatus::Online)
        } else {
            None
        }
    }

    /// Record a connection closing. No transition is emitted here; the
    /// grace-period sweeper decides when the user actually goes offline.
    pub fn connection_closed(&self, user_id: &str) {
        if let Some(mut entry) = self.local.get_mut(user_id) {
            entry.connection_count = entry.connection_count.saturating_sub(1);
            if entry.connection_count == 0 {
                entry.disconnected_at = Some(Instant::now());
            }
        }
    }

    /// Set typing state for a thread. Returns the status to publish and the
    /// generation the caller's scheduled reversion must present.
    pub fn start_typing(&self, user_id: &str, thread_id: &str) -> (PresenceStatus, u64) {
        let mut entry = self
            .local
            .entry(user_id.to_string())
            .or_insert_with(|| UserPresence {
                status: PresenceStatus::Online,
                connection_count: 0,
                disconnected_at: None,
                updated_at: Instant::now(),
                typing_generation: 0,
            });

        entry.typing_generation += 1;
        entry.status = PresenceStatus::Typing {
            thread_id: thread_id.to_string(),
        };
        entry.updated_at = Instant::now();
        (entry.status.clone(), entry.typing_generation)
    }

    /// Explicit typing-stop. Returns the restored status if the user was
    /// typing in that thread.
    pub fn stop_typing(&self, user_id: &str, thread_id: &str) -> Option<PresenceStatus> {
        let mut entry = self.local.get_mut(user_id)?;
        let typing_here = matches!(
            &entry.status,
            PresenceStatus::Typing { thread_id: t } if t == thread_id
        );
        if !typing_here {
            return None;
        }
        entry.typing_generation += 1;
        entry.status = if entry.connection_count > 0 {
            PresenceStatus::Online
        } else {
            PresenceStatus::Offline
        };
        entry.updated_at = Instant::now();
        Some(entry.status.clone())
    }

    /// Scheduled typing reversion. A no-op unless `generation` is still
    /// current and the user is still typing in that thread.
    pub fn revert_typing(
        &self,
        user_id: &str,
        thread_id: &str,
        generation: u64,
    ) -> Option<PresenceStatus> {
        let mut entry = self.local.get_mut(user_id)?;
        if entry.typing_generation != generation {
            return None; // Superseded by a refresh or explicit stop.
        }
        let typing_here = matches!(
            &entry.status,
            PresenceStatus::Typing { thread_id: t } if t == thread_id
        );
        if !typing_here {
            return None;
        }
        entry.status = if entry.connection_count > 0 {
            PresenceStatus::Online
        } else {
            PresenceStatus::Offline
        };
        entry.updated_at = Instant::now();
        Some(entry.status.clone())
    }

    /// Sweep users whose grace period expired. Returns the users that just
    /// went offline so the caller can publish the transitions.
    ///
    /// Entries offline longer than five minutes are dropped entirely.
    pub fn sweep_offline(&self, grace: Duration) -> Vec<String> {
        const CLEANUP_THRESHOLD: Duration = Duration::from_secs(300);
        let now = Instant::now();
        let mut gone_offline = Vec::new();
        let mut to_remove = Vec::new();

        for entry in self.local.iter() {
            let presence = entry.value();
            if presence.connection_count > 0 {
                continue;
            }
            if let Some(disc_at) = presence.disconnected_at {
                if now.duration_since(disc_at) > grace && !presence.status.is_offline() {
                    gone_offline.push(entry.key().clone());
                }
            }
            if presence.status.is_offline()
                && now.duration_since(presence.updated_at) > CLEANUP_THRESHOLD
            {
                to_remove.push(entry.key().clone());
            }
        }

        for user_id in &gone_offline {
            if let Some(mut entry) = self.local.get_mut(user_id) {
                entry.status = PresenceStatus::Offline;
                entry.disconnected_at = None;
                entry.updated_at = Instant::now();
            }
        }
        for user_id in to_remove {
            self.local.remove(&user_id);
        }

        gone_offline
    }

    /// The user's status as known locally.
    pub fn status(&self, user_id: &str) -> PresenceStatus {
        self.local
            .get(user_id)
            .map(|e| e.status.clone())
            .unwrap_or(PresenceStatus::Offline)
    }

    /// Whether the user has any live connection on any instance: local
    /// connections, or a remote instance that last reported them non-offline.
    pub fn is_online_anywhere(&self, user_id: &str) -> bool {
        let local = self
            .local
            .get(user_id)
            .map(|e| e.connection_count > 0)
            .unwrap_or(false);
        if local {
            return true;
        }
        self.remote_online
            .get(user_id)
            .map(|v| *v)
            .unwrap_or(false)
    }

    /// Fold in a presence event observed on the backplane.
    pub fn apply_remote(&self, user_id: &str, status: &PresenceStatus) {
        self.remote_online
            .insert(user_id.to_string(), !status.is_offline());
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}
