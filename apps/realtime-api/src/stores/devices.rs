use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::FanoutError;

/// Payload handed to the push-notification provider when a message cannot be
/// delivered over a live connection.
#[derive(Debug, Clone, Serialize)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    pub thread_id: String,
    pub message_id: i64,
}

/// Abstraction over the external device-registration directory.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn devices_for(&self, user_id: &str) -> Result<Vec<String>, FanoutError>;
    async fn send_push(&self, device_token: &str, payload: &PushPayload) -> Result<(), FanoutError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation (single-node / tests)
// ---------------------------------------------------------------------------

pub struct MemoryDeviceDirectory {
    devices: Mutex<HashMap<String, Vec<String>>>,
    sent: Mutex<Vec<(String, PushPayload)>>,
}

impl MemoryDeviceDirectory {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn register_device(&self, user_id: &str, device_token: &str) {
        self.devices
            .lock()
            .entry(user_id.to_string())
            .or_default()
            .push(device_token.to_string());
    }

    /// Pushes dispatched so far, as `(device_token, payload)` pairs.
    pub fn pushes_sent(&self) -> Vec<(String, PushPayload)> {
        self.sent.lock().clone()
    }
}

impl Default for MemoryDeviceDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceDirectory for MemoryDeviceDirectory {
    async fn devices_for(&self, user_id: &str) -> Result<Vec<String>, FanoutError> {
        Ok(self
            .devices
            .lock()
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_push(
        &self,
        device_token: &str,
        payload: &PushPayload,
    ) -> Result<(), FanoutError> {
        self.sent
            .lock()
            .push((device_token.to_string(), payload.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn devices_round_trip() {
        let dir = MemoryDeviceDirectory::new();
        dir.register_device("usr_a", "dev_1");
        dir.register_device("usr_a", "dev_2");

        let tokens = dir.devices_for("usr_a").await.unwrap();
        assert_eq!(tokens, vec!["dev_1", "dev_2"]);
        assert!(dir.devices_for("usr_b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pushes_are_recorded() {
        let dir = MemoryDeviceDirectory::new();
        let payload = PushPayload {
            title: "New message".to_string(),
            body: "hello".to_string(),
            thread_id: "th_1".to_string(),
            message_id: 42,
        };
        dir.send_push("dev_1", &payload).await.unwrap();

        let sent = dir.pushes_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "dev_1");
        assert_eq!(sent[0].1.message_id, 42);
    }
}
