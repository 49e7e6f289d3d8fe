//! Background tasks: presence sweep, dead-connection sweep, and leaderboard
//! reconciliation.

use std::time::Duration;

use tokio::task::JoinHandle;

use crate::gateway::backplane::BackplaneEvent;
use crate::gateway::presence::PresenceStatus;
use crate::AppState;

/// Spawn every periodic task for this instance.
pub fn spawn_all(state: &AppState) -> Vec<JoinHandle<()>> {
    vec![
        spawn_presence_sweeper(state.clone()),
        spawn_connection_sweeper(state.clone()),
        spawn_reconciliation(state.clone()),
    ]
}

/// Broadcast offline for users whose grace period expired.
fn spawn_presence_sweeper(state: AppState) -> JoinHandle<()> {
    let grace = Duration::from_millis(state.config.presence_grace_ms);
    let tick = grace.max(Duration::from_millis(20)) / 2;
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(tick);
        loop {
            timer.tick().await;
            for user_id in state.presence.sweep_offline(grace) {
                tracing::debug!(user_id, "user went offline");
                let event = BackplaneEvent::Presence {
                    user_id,
                    status: PresenceStatus::Offline,
                };
                if let Err(err) = state.backplane.publish_event(&event).await {
                    tracing::warn!(%err, "offline presence publish failed");
                }
            }
        }
    })
}

/// Drop connections that stopped heartbeating and update presence for their
/// users. The session loop usually exits first; this catches sockets that die
/// without a close frame.
fn spawn_connection_sweeper(state: AppState) -> JoinHandle<()> {
    let interval = Duration::from_millis(state.config.heartbeat_interval_ms);
    let timeout = interval * 3 / 2;
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        loop {
            timer.tick().await;
            for entry in state.registry.sweep_expired(timeout) {
                tracing::info!(
                    connection_id = %entry.connection_id,
                    user_id = %entry.user_id,
                    "swept dead connection"
                );
                state.presence.connection_closed(&entry.user_id);
            }
        }
    })
}

/// Rebuild leaderboards from the ledger and broadcast any repaired periods.
fn spawn_reconciliation(state: AppState) -> JoinHandle<()> {
    let interval = Duration::from_millis(state.config.reconciliation_interval_ms);
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.tick().await; // Boards start empty; skip the immediate tick.
        loop {
            timer.tick().await;
            let rows = match state.ledger.completed_transactions().await {
                Ok(rows) => rows,
                Err(err) => {
                    tracing::error!(%err, "ledger read failed, reconciliation skipped");
                    continue;
                }
            };
            for period in state.leaderboard.reconcile(&rows) {
                let event = BackplaneEvent::LeaderboardUpdated { period };
                if let Err(err) = state.backplane.publish_event(&event).await {
                    tracing::warn!(%err, %period, "reconciled leaderboard not published");
                }
            }
        }
    })
}
