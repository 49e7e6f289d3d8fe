//! Shared pub/sub backplane: events published on any instance reach every
//! instance, including the publisher's own (local and remote delivery take
//! the same path).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::FanoutError;
use crate::gateway::presence::PresenceStatus;
use crate::models::leaderboard::Period;
use crate::models::message::{DeliveryStatus, Message};

/// Logical channel carrying all fan-out events.
pub const CHANNEL_FANOUT: &str = "fanout";

/// Capacity of in-memory subscription channels. Slow subscribers that fall
/// behind will skip events (RecvError::Lagged).
const SUBSCRIPTION_CAPACITY: usize = 4096;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// An event carried over the backplane, addressed by its payload: the fan-out
/// router on each instance decides which local connections receive it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackplaneEvent {
    /// A freshly persisted message looking for the receiver's connections.
    MessageSend { message: Message },
    /// A delivery-status change, notified back to the sender.
    MessageStatus {
        message_id: i64,
        sender_id: String,
        receiver_id: String,
        status: DeliveryStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        read_at: Option<DateTime<Utc>>,
    },
    /// A presence transition, broadcast to every instance.
    Presence {
        user_id: String,
        status: PresenceStatus,
    },
    /// A period's ranking changed.
    LeaderboardUpdated { period: Period },
}

// ---------------------------------------------------------------------------
// Backplane trait + in-memory implementation
// ---------------------------------------------------------------------------

/// A publish/subscribe primitive addressable by logical channel name.
///
/// Backed by a shared pub/sub store in production and by in-process broadcast
/// channels for single-node deployments and tests.
#[async_trait]
pub trait Backplane: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), FanoutError>;
    async fn subscribe(&self, channel: &str) -> broadcast::Receiver<String>;
}

pub struct MemoryBackplane {
    topics: DashMap<String, broadcast::Sender<String>>,
}

impl MemoryBackplane {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.topics
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIPTION_CAPACITY).0)
            .clone()
    }
}

impl Default for MemoryBackplane {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backplane for MemoryBackplane {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), FanoutError> {
        // send() errs only when there are no subscribers, which is fine.
        let _ = self.sender(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.sender(channel).subscribe()
    }
}

// ---------------------------------------------------------------------------
// Adapter: bounded buffering + exponential-backoff reconnect
// ---------------------------------------------------------------------------

/// Reconnect backoff policy: `base × 2^attempt`, capped, with light jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.cap);
        let jitter_ms = if self.base.as_millis() >= 4 {
            rand::thread_rng().gen_range(0..=(self.base.as_millis() as u64 / 4))
        } else {
            0
        };
        exp + Duration::from_millis(jitter_ms)
    }
}

/// Wraps a [`Backplane`] with failure handling: while the backplane is down,
/// outbound publishes are buffered up to a bound and retried with exponential
/// backoff; once retries are exhausted the instance is degraded and new
/// publishes fail with a retryable [`FanoutError::BackplaneUnavailable`].
pub struct BackplaneAdapter {
    inner: Arc<dyn Backplane>,
    policy: BackoffPolicy,
    buffer_cap: usize,
    buffer: Mutex<VecDeque<(String, String)>>,
    degraded: AtomicBool,
    retrying: AtomicBool,
}

impl BackplaneAdapter {
    pub fn new(inner: Arc<dyn Backplane>, policy: BackoffPolicy, buffer_cap: usize) -> Self {
        Self {
            inner,
            policy,
            buffer_cap,
            buffer: Mutex::new(VecDeque::new()),
            degraded: AtomicBool::new(false),
            retrying: AtomicBool::new(false),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Number of publishes currently buffered awaiting reconnection.
    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    pub async fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.inner.subscribe(channel).await
    }

    /// Serialize and publish a fan-out event on the shared channel.
    pub async fn publish_event(self: &Arc<Self>, event: &BackplaneEvent) -> Result<(), FanoutError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| FanoutError::persistence(format!("event serialization: {e}")))?;
        self.publish(CHANNEL_FANOUT, payload).await
    }

    /// Publish, buffering on failure. `Ok` means the payload was sent or
    /// queued; `Err(BackplaneUnavailable)` means it was rejected (degraded or
    /// buffer full) and the caller should fall back or retry later.
    pub async fn publish(self: &Arc<Self>, channel: &str, payload: String) -> Result<(), FanoutError> {
        if self.is_degraded() {
            return Err(FanoutError::BackplaneUnavailable);
        }

        // While a retry is in flight, keep new publishes behind the buffered
        // ones so channel order is preserved.
        if !self.buffer.lock().is_empty() {
            return self.enqueue(channel, payload);
        }

        match self.inner.publish(channel, payload.clone()).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!(%err, "backplane publish failed, buffering");
                let queued = self.enqueue(channel, payload);
                if queued.is_ok() {
                    self.spawn_retry();
                }
                queued
            }
        }
    }

    fn enqueue(&self, channel: &str, payload: String) -> Result<(), FanoutError> {
        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.buffer_cap {
            return Err(FanoutError::BackplaneUnavailable);
        }
        buffer.push_back((channel.to_string(), payload));
        Ok(())
    }

    fn spawn_retry(self: &Arc<Self>) {
        if self.retrying.swap(true, Ordering::SeqCst) {
            return; // A retry task is already running.
        }
        let adapter = Arc::clone(self);
        tokio::spawn(async move {
            adapter.retry_loop().await;
        });
    }

    async fn retry_loop(self: Arc<Self>) {
        for attempt in 0..self.policy.max_attempts {
            tokio::time::sleep(self.policy.delay(attempt)).await;
            if self.flush().await {
                self.degraded.store(false, Ordering::SeqCst);
                self.retrying.store(false, Ordering::SeqCst);
                tracing::info!(attempt, "backplane reconnected, buffer flushed");
                return;
            }
        }
        self.degraded.store(true, Ordering::SeqCst);
        self.retrying.store(false, Ordering::SeqCst);
        tracing::error!(
            attempts = self.policy.max_attempts,
            buffered = self.buffered(),
            "backplane unreachable, instance degraded"
        );
    }

    /// Drain the buffer in order. Returns true if everything was published.
    async fn flush(&self) -> bool {
        loop {
            let next = self.buffer.lock().front().cloned();
            let (channel, payload) = match next {
                Some(item) => item,
                None => return true,
            };
            if self
                .inner
                .publish(&channel, payload)
                .await
                .is_err()
            {
                return false;
            }
            self.buffer.lock().pop_front();
        }
    }

    /// Clear the degraded flag and retry any buffered publishes. Called when
    /// an operator or health probe observes the backplane is reachable again.
    pub fn reset(self: &Arc<Self>) {
        self.degraded.store(false, Ordering::SeqCst);
        if !self.buffer.lock().is_empty() {
            self.spawn_retry();
        }
    }
}
