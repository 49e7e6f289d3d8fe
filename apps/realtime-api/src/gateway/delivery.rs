//! Message delivery pipeline: validate → persist → fan out → status track.
//!
//! Delivery is at-least-once. A message only becomes visible to anyone after
//! persistence succeeds, and duplicate deliveries collapse in the store
//! because same-status updates are no-ops.

use std::sync::Arc;

use chrono::Utc;
use refurnish_common::SnowflakeGenerator;
use serde_json::json;

use crate::config::Config;
use crate::error::{FanoutError, FieldError};
use crate::models::message::{DeliveryStatus, Message};
use crate::stores::devices::{DeviceDirectory, PushPayload};
use crate::stores::message::MessageStore;

use super::backplane::{BackplaneAdapter, BackplaneEvent};
use super::events::{EventName, OutboundEvent, SendMessagePayload};
use super::presence::PresenceTracker;
use super::registry::ConnectionRegistry;

pub struct DeliveryPipeline {
    config: Arc<Config>,
    snowflake: Arc<SnowflakeGenerator>,
    registry: Arc<ConnectionRegistry>,
    backplane: Arc<BackplaneAdapter>,
    presence: Arc<PresenceTracker>,
    messages: Arc<dyn MessageStore>,
    devices: Arc<dyn DeviceDirectory>,
}

impl DeliveryPipeline {
    pub fn new(
        config: Arc<Config>,
        snowflake: Arc<SnowflakeGenerator>,
        registry: Arc<ConnectionRegistry>,
        backplane: Arc<BackplaneAdapter>,
        presence: Arc<PresenceTracker>,
        messages: Arc<dyn MessageStore>,
        devices: Arc<dyn DeviceDirectory>,
    ) -> Self {
        Self {
            config,
            snowflake,
            registry,
            backplane,
            presence,
            messages,
            devices,
        }
    }

    /// Accept a message from a sender: validate, persist, then hand it to the
    /// fan-out path. Returns the persisted message (status `sent`).
    pub async fn send_message(
        &self,
        sender_id: &str,
        payload: SendMessagePayload,
    ) -> Result<Message, FanoutError> {
        let content = payload.content.trim();
        let mut errors = Vec::new();
        if content.is_empty() {
            errors.push(FieldError {
                field: "content".to_string(),
                message: "Message content is required".to_string(),
            });
        } else if content.chars().count() > self.config.max_message_len {
            errors.push(FieldError {
                field: "content".to_string(),
                message: format!(
                    "Message content must be {} characters or fewer",
                    self.config.max_message_len
                ),
            });
        }
        if payload.receiver_id.is_empty() {
            errors.push(FieldError {
                field: "receiver_id".to_string(),
                message: "receiver_id is required".to_string(),
            });
        }
        if payload.thread_id.is_empty() {
            errors.push(FieldError {
                field: "thread_id".to_string(),
                message: "thread_id is required".to_string(),
            });
        }
        if !errors.is_empty() {
            return Err(FanoutError::fields(errors));
        }

        let message = Message {
            id: self.snowflake.generate(),
            sender_id: sender_id.to_string(),
            receiver_id: payload.receiver_id,
            thread_id: payload.thread_id,
            content: content.to_string(),
            delivery_status: DeliveryStatus::Sent,
            sent_at: Utc::now(),
            delivered_at: None,
            read_at: None,
        };

        // Persistence gates everything downstream; a failed write means the
        // message never happened.
        self.messages.persist(message.clone()).await?;

        // Receiver offline everywhere: skip the live path and go straight to
        // push. The message stays `sent` and is flushed at reconnect.
        if !self.presence.is_online_anywhere(&message.receiver_id) {
            self.push_fallback(&message).await;
            return Ok(message);
        }

        // Local and remote delivery share the backplane path: every instance
        // (this one included) routes the event to its own connections.
        let publish = self
            .backplane
            .publish_event(&BackplaneEvent::MessageSend {
                message: message.clone(),
            })
            .await;

        if let Err(err) = publish {
            tracing::warn!(%err, message_id = message.id, "backplane down, local-only delivery");
            let delivered = self.deliver_local(&message).await?;
            if !delivered {
                self.push_fallback(&message).await;
            }
        }

        Ok(message)
    }

    /// Deliver a message to the receiver's connections on this instance.
    /// Returns true if at least one connection took it.
    ///
    /// Called from the fan-out router for every `MessageSend` event; instances
    /// without the receiver do nothing.
    pub async fn deliver_local(&self, message: &Message) -> Result<bool, FanoutError> {
        if !self.registry.has_user(&message.receiver_id) {
            return Ok(false);
        }

        let reached = self.registry.send_to_user(
            &message.receiver_id,
            OutboundEvent::new(
                EventName::MESSAGE_RECEIVED,
                serde_json::to_value(message)
                    .map_err(|e| FanoutError::persistence(format!("message serialization: {e}")))?,
            ),
        );
        if reached == 0 {
            return Ok(false);
        }

        let updated = self
            .messages
            .update_status(message.id, DeliveryStatus::Delivered, Utc::now())
            .await?;
        self.notify_status(&updated).await;
        Ok(true)
    }

    /// Flush messages still `sent` to a user who just connected. Returns the
    /// number of messages delivered.
    pub async fn flush_pending(&self, user_id: &str) -> Result<usize, FanoutError> {
        let pending = self.messages.pending_for(user_id).await?;
        let mut delivered = 0;
        for message in &pending {
            if self.deliver_local(message).await? {
                delivered += 1;
            }
        }
        if delivered > 0 {
            tracing::debug!(user_id, delivered, "flushed pending messages");
        }
        Ok(delivered)
    }

    /// Mark a message read by its receiver. Idempotent: re-reading an already
    /// read message neither errors nor re-notifies the sender.
    pub async fn mark_read(&self, reader_id: &str, message_id: i64) -> Result<Message, FanoutError> {
        let message = self
            .messages
            .get(message_id)
            .await?
            .ok_or_else(|| FanoutError::not_found(format!("Message {message_id} not found")))?;

        if message.receiver_id != reader_id {
            return Err(FanoutError::validation(
                "only the receiver can mark a message read",
            ));
        }
        if message.delivery_status == DeliveryStatus::Read {
            return Ok(message);
        }

        let updated = self
            .messages
            .update_status(message_id, DeliveryStatus::Read, Utc::now())
            .await?;
        self.notify_status(&updated).await;
        Ok(updated)
    }

    /// Terminal failure: the message could not be handed to anything. Only
    /// valid from `sent`.
    pub async fn mark_failed(&self, message_id: i64) -> Result<Message, FanoutError> {
        let updated = self
            .messages
            .update_status(message_id, DeliveryStatus::Failed, Utc::now())
            .await?;
        self.notify_status(&updated).await;
        Ok(updated)
    }

    /// Tell the sender about a status change, via the backplane when it is up
    /// and directly otherwise.
    async fn notify_status(&self, message: &Message) {
        let event = BackplaneEvent::MessageStatus {
            message_id: message.id,
            sender_id: message.sender_id.clone(),
            receiver_id: message.receiver_id.clone(),
            status: message.delivery_status,
            read_at: message.read_at,
        };
        if self.backplane.publish_event(&event).await.is_err() {
            self.registry
                .send_to_user(&message.sender_id, Self::status_event(message));
        }
    }

    /// The MESSAGE_STATUS_CHANGED dispatch for a message.
    pub fn status_event(message: &Message) -> OutboundEvent {
        OutboundEvent::new(
            EventName::MESSAGE_STATUS_CHANGED,
            json!({
                "message_id": message.id,
                "status": message.delivery_status,
                "read_at": message.read_at,
            }),
        )
    }

    /// Push-notification fallback for an offline receiver. Push failures are
    /// logged, never propagated: the message is persisted and will be flushed
    /// at reconnect regardless.
    pub async fn push_fallback(&self, message: &Message) {
        let tokens = match self.devices.devices_for(&message.receiver_id).await {
            Ok(tokens) => tokens,
            Err(err) => {
                tracing::warn!(%err, receiver_id = %message.receiver_id, "device lookup failed");
                return;
            }
        };
        if tokens.is_empty() {
            return;
        }

        let payload = PushPayload {
            title: "New message".to_string(),
            body: preview(&message.content),
            thread_id: message.thread_id.clone(),
            message_id: message.id,
        };
        for token in tokens {
            if let Err(err) = self.devices.send_push(&token, &payload).await {
                tracing::warn!(%err, receiver_id = %message.receiver_id, "push send failed");
            }
        }
    }
}

/// Truncate message content for a notification body.
fn preview(content: &str) -> String {
    const MAX: usize = 120;
    if content.chars().count() <= MAX {
        content.to_string()
    } else {
        let cut: String = content.chars().take(MAX).collect();
        format!("{cut}…")
    }
}
