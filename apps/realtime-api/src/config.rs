use refurnish_common::id::{prefix, prefixed_ulid};

/// Realtime API configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP/WebSocket server binds to.
    pub port: u16,
    /// Identity of this server instance on the backplane.
    pub instance_id: String,
    /// Worker number for snowflake message IDs. Must be unique per instance
    /// and fit the ID's 8-bit worker field (0..=255).
    pub worker_id: u16,
    /// Shared secret for deriving/verifying gateway connect tokens.
    pub gateway_secret: String,
    /// Heartbeat interval sent to clients in READY (ms). A connection is
    /// presumed dead after 1.5× this interval without a heartbeat.
    pub heartbeat_interval_ms: u64,
    /// Typing indicators auto-revert after this long without a refresh (ms).
    pub typing_timeout_ms: u64,
    /// Grace period before a fully disconnected user is broadcast offline (ms).
    pub presence_grace_ms: u64,
    /// Interval between full leaderboard recomputes from the ledger (ms).
    pub reconciliation_interval_ms: u64,
    /// Backplane reconnect backoff: base delay (ms), doubling per attempt.
    pub backplane_backoff_base_ms: u64,
    /// Backplane reconnect backoff: delay cap (ms).
    pub backplane_backoff_cap_ms: u64,
    /// Retry attempts before the instance is declared degraded.
    pub backplane_max_attempts: u32,
    /// Bounded outbound publish buffer while the backplane is down.
    pub backplane_buffer_size: usize,
    /// Maximum message content length (chars).
    pub max_message_len: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", 4010),
            instance_id: std::env::var("INSTANCE_ID")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| prefixed_ulid(prefix::INSTANCE)),
            worker_id: env_parse("WORKER_ID", 0),
            gateway_secret: required_var("GATEWAY_SECRET"),
            heartbeat_interval_ms: env_parse("HEARTBEAT_INTERVAL_MS", 45_000),
            typing_timeout_ms: env_parse("TYPING_TIMEOUT_MS", 5_000),
            presence_grace_ms: env_parse("PRESENCE_GRACE_MS", 5_000),
            reconciliation_interval_ms: env_parse("RECONCILIATION_INTERVAL_MS", 120_000),
            backplane_backoff_base_ms: env_parse("BACKPLANE_BACKOFF_BASE_MS", 1_000),
            backplane_backoff_cap_ms: env_parse("BACKPLANE_BACKOFF_CAP_MS", 30_000),
            backplane_max_attempts: env_parse("BACKPLANE_MAX_ATTEMPTS", 5),
            backplane_buffer_size: env_parse("BACKPLANE_BUFFER_SIZE", 1024),
            max_message_len: env_parse("MAX_MESSAGE_LEN", 4000),
        }
    }

    /// Configuration with short timers, for tests.
    pub fn for_tests() -> Self {
        Self {
            port: 0,
            instance_id: prefixed_ulid(prefix::INSTANCE),
            worker_id: 0,
            gateway_secret: "test-gateway-secret".to_string(),
            heartbeat_interval_ms: 45_000,
            typing_timeout_ms: 150,
            presence_grace_ms: 150,
            reconciliation_interval_ms: 60_000,
            backplane_backoff_base_ms: 10,
            backplane_backoff_cap_ms: 50,
            backplane_max_attempts: 3,
            backplane_buffer_size: 64,
            max_message_len: 4000,
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
