//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::{tungstenite, MaybeTlsStream, WebSocketStream};

use realtime_api::auth::connect_token;
use realtime_api::config::Config;
use realtime_api::gateway::backplane::MemoryBackplane;
use realtime_api::stores::devices::MemoryDeviceDirectory;
use realtime_api::stores::ledger::MemoryPointLedger;
use realtime_api::stores::message::MemoryMessageStore;
use realtime_api::AppState;

pub type WsWrite = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, tungstenite::Message>;
pub type WsRead = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Concrete store handles, kept alongside the state so tests can inspect and
/// seed them.
pub struct TestStores {
    pub backplane: Arc<MemoryBackplane>,
    pub messages: Arc<MemoryMessageStore>,
    pub ledger: Arc<MemoryPointLedger>,
    pub devices: Arc<MemoryDeviceDirectory>,
}

/// Build an AppState on in-memory stores with fast test timers.
pub fn test_state() -> (AppState, TestStores) {
    let stores = TestStores {
        backplane: Arc::new(MemoryBackplane::new()),
        messages: Arc::new(MemoryMessageStore::new()),
        ledger: Arc::new(MemoryPointLedger::new()),
        devices: Arc::new(MemoryDeviceDirectory::new()),
    };
    let state = AppState::new(
        Config::for_tests(),
        stores.backplane.clone(),
        stores.messages.clone(),
        stores.ledger.clone(),
        stores.devices.clone(),
    );
    (state, stores)
}

/// Start a real TCP server with the fan-out router and background tasks
/// running. Returns the bound address.
pub async fn start_server(state: AppState) -> SocketAddr {
    state.spawn_router();
    realtime_api::tasks::spawn_all(&state);

    let app = realtime_api::routes::router().with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

/// Connect to the gateway and IDENTIFY as `user_id`. Returns the split stream
/// after asserting READY.
pub async fn connect_and_identify(
    addr: SocketAddr,
    secret: &str,
    user_id: &str,
) -> (WsWrite, WsRead) {
    let url = format!("ws://{addr}/gateway");
    let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");

    let (mut write, mut read) = ws_stream.split();

    let identify = serde_json::json!({
        "op": 2,
        "d": { "user_id": user_id, "token": connect_token(secret, user_id) }
    });
    write
        .send(tungstenite::Message::Text(identify.to_string().into()))
        .await
        .expect("send identify");

    let ready = wait_for_event(&mut read, "READY").await;
    assert_eq!(ready["user_id"], user_id);
    assert!(ready["connection_id"].as_str().unwrap().starts_with("cn_"));

    (write, read)
}

/// Send a client dispatch (op=0) frame.
pub async fn send_dispatch(write: &mut WsWrite, event: &str, data: serde_json::Value) {
    let frame = serde_json::json!({ "op": 0, "t": event, "d": data });
    write
        .send(tungstenite::Message::Text(frame.to_string().into()))
        .await
        .expect("send dispatch");
}

/// Read dispatches until one named `event` arrives, skipping everything else
/// (presence churn from other connections, for instance). Returns its `d`.
pub async fn wait_for_event(read: &mut WsRead, event: &str) -> serde_json::Value {
    let deadline = Duration::from_secs(5);
    loop {
        let msg = time::timeout(deadline, read.next())
            .await
            .unwrap_or_else(|_| panic!("timeout waiting for {event}"))
            .expect("stream ended")
            .expect("ws read error");

        let text = match msg {
            tungstenite::Message::Text(t) => t,
            tungstenite::Message::Close(frame) => {
                panic!("connection closed waiting for {event}: {frame:?}")
            }
            _ => continue,
        };
        let frame: serde_json::Value = serde_json::from_str(&text).expect("parse frame");
        if frame["op"] == 0 && frame["t"] == event {
            return frame["d"].clone();
        }
    }
}

/// Read until a close frame arrives, skipping any dispatches still in flight
/// (presence churn, for instance), and assert its code.
pub async fn expect_close(read: &mut WsRead, code: u16) {
    loop {
        let msg = time::timeout(Duration::from_secs(5), read.next())
            .await
            .expect("timeout waiting for close")
            .expect("stream ended")
            .expect("ws read error");

        match msg {
            tungstenite::Message::Close(Some(frame)) => {
                assert_eq!(
                    frame.code,
                    tungstenite::protocol::frame::coding::CloseCode::from(code)
                );
                return;
            }
            tungstenite::Message::Close(None) => return,
            tungstenite::Message::Text(_) => continue,
            _ => continue,
        }
    }
}
