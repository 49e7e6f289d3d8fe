pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod models;
pub mod points;
pub mod routes;
pub mod stores;
pub mod tasks;

use std::sync::Arc;
use std::time::Duration;

use refurnish_common::SnowflakeGenerator;

use config::Config;
use gateway::backplane::{Backplane, BackoffPolicy, BackplaneAdapter};
use gateway::delivery::DeliveryPipeline;
use gateway::fanout::FanoutRouter;
use gateway::presence::PresenceTracker;
use gateway::registry::ConnectionRegistry;
use points::leaderboard::LeaderboardEngine;
use points::processor::PointProcessor;
use stores::devices::DeviceDirectory;
use stores::ledger::PointLedger;
use stores::message::MessageStore;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub snowflake: Arc<SnowflakeGenerator>,
    pub registry: Arc<ConnectionRegistry>,
    pub backplane: Arc<BackplaneAdapter>,
    pub presence: Arc<PresenceTracker>,
    pub delivery: Arc<DeliveryPipeline>,
    pub points: Arc<PointProcessor>,
    pub leaderboard: Arc<LeaderboardEngine>,
    pub messages: Arc<dyn MessageStore>,
    pub ledger: Arc<dyn PointLedger>,
    pub devices: Arc<dyn DeviceDirectory>,
}

impl AppState {
    /// Wire the full state from a config and the external-store handles.
    pub fn new(
        config: Config,
        backplane: Arc<dyn Backplane>,
        messages: Arc<dyn MessageStore>,
        ledger: Arc<dyn PointLedger>,
        devices: Arc<dyn DeviceDirectory>,
    ) -> Self {
        let config = Arc::new(config);
        let snowflake = Arc::new(SnowflakeGenerator::new(config.worker_id));
        let registry = Arc::new(ConnectionRegistry::new());
        let presence = Arc::new(PresenceTracker::new());
        let backplane = Arc::new(BackplaneAdapter::new(
            backplane,
            BackoffPolicy {
                base: Duration::from_millis(config.backplane_backoff_base_ms),
                cap: Duration::from_millis(config.backplane_backoff_cap_ms),
                max_attempts: config.backplane_max_attempts,
            },
            config.backplane_buffer_size,
        ));
        let delivery = Arc::new(DeliveryPipeline::new(
            config.clone(),
            snowflake.clone(),
            registry.clone(),
            backplane.clone(),
            presence.clone(),
            messages.clone(),
            devices.clone(),
        ));
        let leaderboard = Arc::new(LeaderboardEngine::new());
        let points = Arc::new(PointProcessor::new(ledger.clone(), leaderboard.clone()));

        Self {
            config,
            snowflake,
            registry,
            backplane,
            presence,
            delivery,
            points,
            leaderboard,
            messages,
            ledger,
            devices,
        }
    }

    /// Start this instance's fan-out router.
    pub fn spawn_router(&self) -> tokio::task::JoinHandle<()> {
        Arc::new(FanoutRouter::new(
            self.registry.clone(),
            self.presence.clone(),
            self.delivery.clone(),
            self.leaderboard.clone(),
            self.backplane.clone(),
        ))
        .spawn()
    }
}
