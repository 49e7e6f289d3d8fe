//! WebSocket upgrade handler and per-connection event loop.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time;

use crate::AppState;

use super::events::{
    ClientMessage, GatewayMessage, HeartbeatPayload, IdentifyPayload, OutboundEvent, OP_DISPATCH,
    OP_HEARTBEAT, OP_IDENTIFY,
};
use super::handler::{handle_dispatch, handle_identify};
use super::session::GatewaySession;

/// Close codes (4000-range for application-level).
const CLOSE_UNKNOWN_ERROR: u16 = 4000;
const CLOSE_UNKNOWN_OPCODE: u16 = 4001;
const CLOSE_NOT_AUTHENTICATED: u16 = 4003;
const CLOSE_AUTH_FAILED: u16 = 4004;
const CLOSE_SESSION_TIMEOUT: u16 = 4009;

/// Timeout for receiving IDENTIFY after connection (seconds).
const IDENTIFY_TIMEOUT_SECS: u64 = 10;

pub fn router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Step 1: Wait for IDENTIFY within timeout.
    let identify_result = time::timeout(Duration::from_secs(IDENTIFY_TIMEOUT_SECS), async {
        while let Some(msg) = ws_rx.next().await {
            let msg = match msg {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!(?e, "ws read error during identify");
                    return Err("read error");
                }
            };

            let text = match msg {
                Message::Text(t) => t,
                Message::Close(_) => return Err("client closed"),
                Message::Ping(_) | Message::Pong(_) => continue,
                _ => continue,
            };

            let client_msg: ClientMessage = match serde_json::from_str(&text) {
                Ok(m) => m,
                Err(_) => {
                    let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Invalid JSON").await;
                    return Err("invalid json");
                }
            };

            if client_msg.op != OP_IDENTIFY {
                let _ = send_close(&mut ws_tx, CLOSE_NOT_AUTHENTICATED, "Expected IDENTIFY").await;
                return Err("expected identify");
            }

            let payload: IdentifyPayload =
                serde_json::from_value(client_msg.d).map_err(|_| "invalid identify payload")?;
            return Ok(payload);
        }
        Err("connection closed before identify")
    })
    .await;

    let payload = match identify_result {
        Ok(Ok(payload)) => payload,
        Ok(Err(reason)) => {
            tracing::debug!(%reason, "initial handshake failed");
            let _ = send_close(&mut ws_tx, CLOSE_AUTH_FAILED, reason).await;
            return;
        }
        Err(_timeout) => {
            let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Handshake timeout").await;
            return;
        }
    };

    let (session, ready_msg) = match handle_identify(&state, payload).await {
        Ok(result) => result,
        Err(reason) => {
            tracing::debug!(%reason, "identify failed");
            let _ = send_close(&mut ws_tx, CLOSE_AUTH_FAILED, reason).await;
            return;
        }
    };
    let session = Arc::new(session);

    // Register the connection before READY so nothing sent after READY can
    // miss this socket.
    let (conn_tx, conn_rx) = mpsc::unbounded_channel::<OutboundEvent>();
    state.registry.register(
        &session.user_id,
        &session.connection_id,
        &state.config.instance_id,
        conn_tx,
    );
    if let Some(status) = state.presence.connection_opened(&session.user_id) {
        publish_presence(&state, &session.user_id, status).await;
    }

    tracing::info!(
        connection_id = %session.connection_id,
        user_id = %session.user_id,
        "gateway connection established"
    );

    // Send READY.
    let ready_json = serde_json::to_string(&ready_msg).unwrap();
    if ws_tx.send(Message::Text(ready_json.into())).await.is_err() {
        cleanup(&state, &session).await;
        return;
    }

    // Flush messages that arrived while the user was offline.
    if let Err(err) = state.delivery.flush_pending(&session.user_id).await {
        tracing::error!(%err, user_id = %session.user_id, "pending flush failed");
    }

    run_session(session.clone(), &state, ws_tx, ws_rx, conn_rx).await;

    cleanup(&state, &session).await;

    tracing::info!(
        connection_id = %session.connection_id,
        user_id = %session.user_id,
        "gateway connection ended"
    );
}

/// Main session loop: read client messages, write queued dispatches, enforce
/// heartbeat.
async fn run_session(
    session: Arc<GatewaySession>,
    state: &AppState,
    mut ws_tx: futures_util::stream::SplitSink<WebSocket, Message>,
    mut ws_rx: futures_util::stream::SplitStream<WebSocket>,
    mut conn_rx: mpsc::UnboundedReceiver<OutboundEvent>,
) {
    // Heartbeat deadline: client must heartbeat within 1.5× the interval.
    let heartbeat_deadline = Duration::from_millis(state.config.heartbeat_interval_ms * 3 / 2);
    let mut heartbeat_timer = time::interval(heartbeat_deadline);
    heartbeat_timer.tick().await; // First tick fires immediately; skip it.
    let mut got_heartbeat = true;

    loop {
        tokio::select! {
            // Client sends us a message.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let client_msg: ClientMessage = match serde_json::from_str(&text) {
                            Ok(m) => m,
                            Err(_) => {
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Invalid JSON").await;
                                break;
                            }
                        };

                        match client_msg.op {
                            OP_HEARTBEAT => {
                                got_heartbeat = true;
                                state.registry.touch(&session.connection_id);
                                let payload: HeartbeatPayload =
                                    serde_json::from_value(client_msg.d).unwrap_or(HeartbeatPayload { seq: 0 });
                                let ack = GatewayMessage::heartbeat_ack(payload.seq);
                                let json = serde_json::to_string(&ack).unwrap();
                                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                                    break;
                                }
                            }
                            OP_DISPATCH => {
                                let Some(event_name) = client_msg.t else {
                                    let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Dispatch without event name").await;
                                    break;
                                };
                                state.registry.touch(&session.connection_id);
                                let replies =
                                    handle_dispatch(state, &session, &event_name, client_msg.d).await;
                                let mut write_failed = false;
                                for reply in replies {
                                    if write_event(&mut ws_tx, &session, reply).await.is_err() {
                                        write_failed = true;
                                        break;
                                    }
                                }
                                if write_failed {
                                    break;
                                }
                            }
                            OP_IDENTIFY => {
                                // Already identified.
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Already identified").await;
                                break;
                            }
                            _ => {
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_OPCODE, "Unknown opcode").await;
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(?e, connection_id = %session.connection_id, "ws read error");
                        break;
                    }
                    _ => continue,
                }
            }

            // Event queued for this connection by the fan-out router or a
            // handler on another connection.
            event = conn_rx.recv() => {
                match event {
                    Some(event) => {
                        if write_event(&mut ws_tx, &session, event).await.is_err() {
                            break;
                        }
                    }
                    // Registry dropped our sender (sweeper or replacement)
                    // while the socket may still be open; tell the client to
                    // tear down and IDENTIFY again.
                    None => {
                        let reconnect = GatewayMessage::reconnect("Session no longer registered");
                        let json = serde_json::to_string(&reconnect).unwrap();
                        let _ = ws_tx.send(Message::Text(json.into())).await;
                        break;
                    }
                }
            }

            // Heartbeat timeout check.
            _ = heartbeat_timer.tick() => {
                if !got_heartbeat {
                    tracing::debug!(
                        connection_id = %session.connection_id,
                        "heartbeat timeout, closing connection"
                    );
                    let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Heartbeat timeout").await;
                    break;
                }
                got_heartbeat = false;
            }
        }
    }
}

/// Assign the per-connection sequence number and write a dispatch frame.
async fn write_event(
    ws_tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    session: &GatewaySession,
    event: OutboundEvent,
) -> Result<(), axum::Error> {
    let msg = GatewayMessage::dispatch(&event.event_name, session.next_seq(), event.data);
    let json = serde_json::to_string(&msg).unwrap();
    ws_tx.send(Message::Text(json.into())).await
}

/// Deregister and update presence after the loop exits. The grace-period
/// sweeper decides when (whether) the user is broadcast offline.
async fn cleanup(state: &AppState, session: &GatewaySession) {
    state.registry.deregister(&session.connection_id);
    state.presence.connection_closed(&session.user_id);
}

async fn publish_presence(
    state: &AppState,
    user_id: &str,
    status: super::presence::PresenceStatus,
) {
    let event = super::backplane::BackplaneEvent::Presence {
        user_id: user_id.to_string(),
        status,
    };
    if let Err(err) = state.backplane.publish_event(&event).await {
        tracing::warn!(%err, user_id, "presence publish failed");
    }
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(
    ws_tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    code: u16,
    reason: &str,
) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(axum::extract::ws::CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
