//! Incoming opcode dispatch: IDENTIFY and client event handling.

use std::time::Duration;

use refurnish_common::id::{prefix, prefixed_ulid};
use serde_json::{json, Value};

use crate::auth;
use crate::error::FanoutError;
use crate::AppState;

use super::backplane::BackplaneEvent;
use super::delivery::DeliveryPipeline;
use super::events::{
    ClientEvent, EarnPointsPayload, EventName, GatewayMessage, IdentifyPayload, MarkReadPayload,
    OutboundEvent, SendMessagePayload, TypingPayload,
};
use super::session::GatewaySession;

/// Process an IDENTIFY opcode. Returns a (`GatewaySession`, READY message) on
/// success.
pub async fn handle_identify(
    state: &AppState,
    payload: IdentifyPayload,
) -> Result<(GatewaySession, GatewayMessage), &'static str> {
    if payload.user_id.is_empty() {
        return Err("user_id is required");
    }
    if !auth::verify_token(&state.config.gateway_secret, &payload.user_id, &payload.token) {
        return Err("Invalid connect token");
    }

    let balance = state
        .points
        .balance(&payload.user_id)
        .await
        .map_err(|_| "balance lookup failed")?;

    let connection_id = prefixed_ulid(prefix::CONNECTION);
    let session = GatewaySession::new(connection_id.clone(), payload.user_id.clone());

    let ready_data = json!({
        "connection_id": connection_id,
        "user_id": payload.user_id,
        "instance_id": state.config.instance_id,
        "heartbeat_interval": state.config.heartbeat_interval_ms,
        "balance": balance,
    });
    let seq = session.next_seq();
    let ready_msg = GatewayMessage::dispatch(EventName::READY, seq, ready_data);

    Ok((session, ready_msg))
}

/// Process a client dispatch (op=0). Returns the events to queue back to the
/// originating connection; failures become ERROR dispatches, never closes.
pub async fn handle_dispatch(
    state: &AppState,
    session: &GatewaySession,
    event_name: &str,
    data: Value,
) -> Vec<OutboundEvent> {
    match event_name {
        ClientEvent::SEND_MESSAGE => handle_send_message(state, session, data).await,
        ClientEvent::TYPING => handle_typing(state, session, data).await,
        ClientEvent::MARK_READ => handle_mark_read(state, session, data).await,
        ClientEvent::EARN_POINTS => handle_earn_points(state, session, data).await,
        other => vec![error_event(&FanoutError::validation(format!(
            "unknown event: {other}"
        )))],
    }
}

async fn handle_send_message(
    state: &AppState,
    session: &GatewaySession,
    data: Value,
) -> Vec<OutboundEvent> {
    let payload: SendMessagePayload = match serde_json::from_value(data) {
        Ok(p) => p,
        Err(err) => return vec![parse_error(&err)],
    };

    match state.delivery.send_message(&session.user_id, payload).await {
        Ok(message) => match serde_json::to_value(&message) {
            Ok(value) => vec![OutboundEvent::new(EventName::MESSAGE_SENT, value)],
            Err(err) => vec![error_event(&FanoutError::persistence(format!(
                "message serialization: {err}"
            )))],
        },
        Err(err) => vec![error_event(&err)],
    }
}

async fn handle_typing(
    state: &AppState,
    session: &GatewaySession,
    data: Value,
) -> Vec<OutboundEvent> {
    let payload: TypingPayload = match serde_json::from_value(data) {
        Ok(p) => p,
        Err(err) => return vec![parse_error(&err)],
    };

    if payload.is_typing {
        let (status, generation) = state
            .presence
            .start_typing(&session.user_id, &payload.thread_id);
        publish_presence(state, &session.user_id, status).await;

        // Auto-revert unless a refresh bumps the generation first.
        let state = state.clone();
        let user_id = session.user_id.clone();
        let thread_id = payload.thread_id.clone();
        let timeout = Duration::from_millis(state.config.typing_timeout_ms);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(status) = state
                .presence
                .revert_typing(&user_id, &thread_id, generation)
            {
                publish_presence(&state, &user_id, status).await;
            }
        });
    } else if let Some(status) = state
        .presence
        .stop_typing(&session.user_id, &payload.thread_id)
    {
        publish_presence(state, &session.user_id, status).await;
    }

    Vec::new()
}

async fn handle_mark_read(
    state: &AppState,
    session: &GatewaySession,
    data: Value,
) -> Vec<OutboundEvent> {
    let payload: MarkReadPayload = match serde_json::from_value(data) {
        Ok(p) => p,
        Err(err) => return vec![parse_error(&err)],
    };

    match state
        .delivery
        .mark_read(&session.user_id, payload.message_id)
        .await
    {
        // Confirm the new status to the reading device; the sender hears
        // about it through the fan-out path.
        Ok(message) => vec![DeliveryPipeline::status_event(&message)],
        Err(err) => vec![error_event(&err)],
    }
}

async fn handle_earn_points(
    state: &AppState,
    session: &GatewaySession,
    data: Value,
) -> Vec<OutboundEvent> {
    let payload: EarnPointsPayload = match serde_json::from_value(data) {
        Ok(p) => p,
        Err(err) => return vec![parse_error(&err)],
    };

    let applied = match state
        .points
        .apply(
            &session.user_id,
            &payload.action_type,
            payload.multiplier,
            payload.metadata,
        )
        .await
    {
        Ok(applied) => applied,
        Err(err) => return vec![error_event(&err)],
    };

    for &period in &applied.changed_periods {
        let publish = state
            .backplane
            .publish_event(&BackplaneEvent::LeaderboardUpdated { period })
            .await;
        if let Err(err) = publish {
            // Reconciliation broadcasts the repaired board later.
            tracing::warn!(%err, %period, "leaderboard update not published");
        }
    }

    vec![OutboundEvent::new(
        EventName::POINTS_EARNED,
        json!({
            "transaction": applied.transaction,
            "balance": applied.balance,
        }),
    )]
}

/// Publish a presence transition, falling back to a local broadcast when the
/// backplane is unavailable.
async fn publish_presence(
    state: &AppState,
    user_id: &str,
    status: super::presence::PresenceStatus,
) {
    let event = BackplaneEvent::Presence {
        user_id: user_id.to_string(),
        status: status.clone(),
    };
    if state.backplane.publish_event(&event).await.is_err() {
        state.registry.broadcast_all(OutboundEvent::new(
            EventName::PRESENCE_CHANGED,
            json!({
                "user_id": user_id,
                "presence": status,
            }),
        ));
    }
}

fn error_event(err: &FanoutError) -> OutboundEvent {
    OutboundEvent::new(
        EventName::ERROR,
        json!({
            "code": err.code(),
            "message": err.to_string(),
            "retryable": err.is_retryable(),
        }),
    )
}

fn parse_error(err: &serde_json::Error) -> OutboundEvent {
    error_event(&FanoutError::validation(format!("invalid payload: {err}")))
}
