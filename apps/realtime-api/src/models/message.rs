//! Message model (the fan-out-relevant subset) and delivery status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Delivery status of a message. Transitions are monotonic:
/// sent → delivered → read, or sent → failed (terminal). Never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    /// Whether a transition from `self` to `next` is a legal forward step.
    ///
    /// `sent → read` is allowed: a read receipt implies delivery even if the
    /// delivery ack was lost.
    pub fn can_advance_to(self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        matches!(
            (self, next),
            (Sent, Delivered) | (Sent, Read) | (Sent, Failed) | (Delivered, Read)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::Failed => "failed",
        }
    }
}

/// A direct message between two users within a thread.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Message {
    /// Snowflake ID. Encodes send time, so per-thread order is recoverable.
    pub id: i64,
    pub sender_id: String,
    pub receiver_id: String,
    pub thread_id: String,
    pub content: String,
    pub delivery_status: DeliveryStatus,
    pub sent_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}
