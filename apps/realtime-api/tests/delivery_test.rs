mod common;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use realtime_api::config::Config;
use realtime_api::error::FanoutError;
use realtime_api::gateway::backplane::MemoryBackplane;
use realtime_api::gateway::events::SendMessagePayload;
use realtime_api::models::message::{DeliveryStatus, Message};
use realtime_api::stores::devices::MemoryDeviceDirectory;
use realtime_api::stores::ledger::MemoryPointLedger;
use realtime_api::stores::message::MessageStore;
use realtime_api::AppState;

use common::{connect_and_identify, send_dispatch, start_server, test_state, wait_for_event};

fn payload(receiver: &str, content: &str) -> SendMessagePayload {
    SendMessagePayload {
        receiver_id: receiver.to_string(),
        thread_id: "th_1".to_string(),
        content: content.to_string(),
    }
}

#[tokio::test]
async fn offline_receiver_triggers_push_fallback() {
    let (state, stores) = test_state();
    stores.devices.register_device("usr_away", "dev_phone");

    let message = state
        .delivery
        .send_message("usr_here", payload("usr_away", "sofa on 5th street"))
        .await
        .unwrap();

    let pushes = stores.devices.pushes_sent();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].0, "dev_phone");
    assert_eq!(pushes[0].1.message_id, message.id);
    assert_eq!(pushes[0].1.thread_id, "th_1");

    // Still pending: reconnect will deliver it.
    let stored = stores.messages.get(message.id).await.unwrap().unwrap();
    assert_eq!(stored.delivery_status, DeliveryStatus::Sent);
}

#[tokio::test]
async fn pending_messages_flush_on_reconnect() {
    let (state, stores) = test_state();
    let secret = state.config.gateway_secret.clone();

    // Two messages land while the receiver is offline.
    let first = state
        .delivery
        .send_message("usr_a", payload("usr_late", "first"))
        .await
        .unwrap();
    let second = state
        .delivery
        .send_message("usr_a", payload("usr_late", "second"))
        .await
        .unwrap();

    let addr = start_server(state).await;
    let (_write, mut read) = connect_and_identify(addr, &secret, "usr_late").await;

    let got_first = wait_for_event(&mut read, "MESSAGE_RECEIVED").await;
    let got_second = wait_for_event(&mut read, "MESSAGE_RECEIVED").await;
    assert_eq!(got_first["id"].as_i64().unwrap(), first.id);
    assert_eq!(got_second["id"].as_i64().unwrap(), second.id);

    // Both advanced to delivered.
    let stored = stores.messages.get(second.id).await.unwrap().unwrap();
    assert_eq!(stored.delivery_status, DeliveryStatus::Delivered);
}

#[tokio::test]
async fn duplicate_delivery_does_not_renotify() {
    let (state, _stores) = test_state();
    let secret = state.config.gateway_secret.clone();
    let addr = start_server(state).await;

    let (mut write_a, mut read_a) = connect_and_identify(addr, &secret, "usr_a").await;
    let (mut write_b, mut read_b) = connect_and_identify(addr, &secret, "usr_b").await;

    send_dispatch(
        &mut write_a,
        "SEND_MESSAGE",
        serde_json::json!({
            "receiver_id": "usr_b",
            "thread_id": "th_1",
            "content": "hi"
        }),
    )
    .await;
    let received = wait_for_event(&mut read_b, "MESSAGE_RECEIVED").await;
    let message_id = received["id"].as_i64().unwrap();
    let delivered = wait_for_event(&mut read_a, "MESSAGE_STATUS_CHANGED").await;
    assert_eq!(delivered["status"], "delivered");

    // The receiver marks read twice; the sender hears exactly one read.
    send_dispatch(
        &mut write_b,
        "MARK_READ",
        serde_json::json!({ "message_id": message_id }),
    )
    .await;
    send_dispatch(
        &mut write_b,
        "MARK_READ",
        serde_json::json!({ "message_id": message_id }),
    )
    .await;

    let read_status = wait_for_event(&mut read_a, "MESSAGE_STATUS_CHANGED").await;
    assert_eq!(read_status["status"], "read");

    // No further status traffic for the sender: a fresh message's delivered
    // notification is the next thing read_a sees.
    send_dispatch(
        &mut write_a,
        "SEND_MESSAGE",
        serde_json::json!({
            "receiver_id": "usr_b",
            "thread_id": "th_1",
            "content": "again"
        }),
    )
    .await;
    let next = wait_for_event(&mut read_a, "MESSAGE_STATUS_CHANGED").await;
    assert_ne!(next["message_id"].as_i64().unwrap(), message_id);
}

/// Store whose writes always fail, to prove nothing is delivered when
/// persistence is down.
struct FailingStore;

#[async_trait]
impl MessageStore for FailingStore {
    async fn persist(&self, _message: Message) -> Result<i64, FanoutError> {
        Err(FanoutError::persistence("disk full"))
    }

    async fn update_status(
        &self,
        _id: i64,
        _status: DeliveryStatus,
        _at: DateTime<Utc>,
    ) -> Result<Message, FanoutError> {
        Err(FanoutError::persistence("disk full"))
    }

    async fn get(&self, _id: i64) -> Result<Option<Message>, FanoutError> {
        Ok(None)
    }

    async fn pending_for(&self, _receiver_id: &str) -> Result<Vec<Message>, FanoutError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn persistence_failure_means_no_delivery_and_no_push() {
    let devices = std::sync::Arc::new(MemoryDeviceDirectory::new());
    devices.register_device("usr_b", "dev_1");
    let state = AppState::new(
        Config::for_tests(),
        std::sync::Arc::new(MemoryBackplane::new()),
        std::sync::Arc::new(FailingStore),
        std::sync::Arc::new(MemoryPointLedger::new()),
        devices.clone(),
    );

    let err = state
        .delivery
        .send_message("usr_a", payload("usr_b", "hi"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "PERSISTENCE_ERROR");
    assert!(devices.pushes_sent().is_empty());
}

#[tokio::test]
async fn status_never_regresses_through_the_pipeline() {
    let (state, stores) = test_state();

    let message = state
        .delivery
        .send_message("usr_a", payload("usr_b", "hi"))
        .await
        .unwrap();
    state.delivery.mark_read("usr_b", message.id).await.unwrap();

    // A late delivered-update (say, a replayed fan-out event) is rejected by
    // the store and read_at survives.
    let err = stores
        .messages
        .update_status(message.id, DeliveryStatus::Delivered, Utc::now())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");

    let stored = stores.messages.get(message.id).await.unwrap().unwrap();
    assert_eq!(stored.delivery_status, DeliveryStatus::Read);
    assert!(stored.read_at.is_some());
}

#[tokio::test]
async fn offline_after_grace_broadcasts_and_push_takes_over() {
    let (state, stores) = test_state();
    let secret = state.config.gateway_secret.clone();
    stores.devices.register_device("usr_fickle", "dev_1");
    let addr = start_server(state.clone()).await;

    let (write, read) = connect_and_identify(addr, &secret, "usr_fickle").await;
    drop(write);
    drop(read);

    // for_tests() uses a 150ms grace period; the sweeper runs at grace/2.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!state.presence.is_online_anywhere("usr_fickle"));

    state
        .delivery
        .send_message("usr_a", payload("usr_fickle", "hello?"))
        .await
        .unwrap();
    assert_eq!(stores.devices.pushes_sent().len(), 1);
}
