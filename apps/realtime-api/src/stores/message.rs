use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::FanoutError;
use crate::models::message::{DeliveryStatus, Message};

/// Abstraction over the external message persistence store.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a new message. Must succeed before any delivery is visible.
    async fn persist(&self, message: Message) -> Result<i64, FanoutError>;

    /// Advance a message's delivery status. Same-status updates are no-ops;
    /// regressions are rejected so `read` can never be followed by `sent`.
    async fn update_status(
        &self,
        id: i64,
        status: DeliveryStatus,
        at: DateTime<Utc>,
    ) -> Result<Message, FanoutError>;

    async fn get(&self, id: i64) -> Result<Option<Message>, FanoutError>;

    /// Messages still in `sent` for a receiver, oldest first. Used to flush
    /// pending deliveries when the receiver reconnects.
    async fn pending_for(&self, receiver_id: &str) -> Result<Vec<Message>, FanoutError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation (single-node / tests)
// ---------------------------------------------------------------------------

pub struct MemoryMessageStore {
    inner: Mutex<HashMap<i64, Message>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn persist(&self, message: Message) -> Result<i64, FanoutError> {
        let id = message.id;
        self.inner.lock().insert(id, message);
        Ok(id)
    }

    async fn update_status(
        &self,
        id: i64,
        status: DeliveryStatus,
        at: DateTime<Utc>,
    ) -> Result<Message, FanoutError> {
        let mut inner = self.inner.lock();
        let message = inner
            .get_mut(&id)
            .ok_or_else(|| FanoutError::not_found(format!("Message {id} not found")))?;

        if message.delivery_status == status {
            return Ok(message.clone());
        }
        if !message.delivery_status.can_advance_to(status) {
            return Err(FanoutError::validation(format!(
                "illegal status transition {} -> {}",
                message.delivery_status.as_str(),
                status.as_str()
            )));
        }

        message.delivery_status = status;
        match status {
            DeliveryStatus::Delivered => message.delivered_at = Some(at),
            DeliveryStatus::Read => {
                if message.delivered_at.is_none() {
                    message.delivered_at = Some(at);
                }
                message.read_at = Some(at);
            }
            _ => {}
        }
        Ok(message.clone())
    }

    async fn get(&self, id: i64) -> Result<Option<Message>, FanoutError> {
        Ok(self.inner.lock().get(&id).cloned())
    }

    async fn pending_for(&self, receiver_id: &str) -> Result<Vec<Message>, FanoutError> {
        let mut pending: Vec<Message> = self
            .inner
            .lock()
            .values()
            .filter(|m| m.receiver_id == receiver_id && m.delivery_status == DeliveryStatus::Sent)
            .cloned()
            .collect();
        pending.sort_by_key(|m| m.id);
        Ok(pending)
    }
}
