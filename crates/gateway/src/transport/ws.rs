// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket frontend for the session protocol.
//!
//! Per-connection loop: `hello` authenticates against the injected
//! validator, `subscribe` attaches to a session actor and replays the
//! backlog, live events flow through per-subscription bounded queues, and
//! the server emits `pong` on the heartbeat interval. Protocol errors
//! answer with an `error` frame and keep the connection open; failed
//! authentication and capacity/ownership evictions close it.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use chrono::Utc;
use futures_util::stream::{self, BoxStream};
use futures_util::{SinkExt, StreamExt};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamMap;
use tracing::debug;

use crate::error::ErrorCode;
use crate::manager::SessionSpec;
use crate::protocol::{decode_client, encode_server, ClientMessage, ServerMessage, SessionState};
use crate::session::subscriber::{CloseSignal, MpscSink};

use super::GatewayState;

/// WebSocket upgrade handler. Authentication happens in-band via `hello`.
pub async fn ws_handler(
    State(state): State<Arc<GatewayState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(state, socket))
}

/// Identity established by a successful `hello`.
struct Identity {
    user_id: String,
    client_id: String,
    device_kind: String,
}

/// One item from a subscription stream.
enum SubEvent {
    Frame(ServerMessage),
    /// The actor dropped its sink: subscription over.
    Ended,
}

type SubStream = BoxStream<'static, SubEvent>;

async fn handle_connection(state: Arc<GatewayState>, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut outbound: StreamMap<String, SubStream> = StreamMap::new();
    let mut close_reasons: HashMap<String, CloseSignal> = HashMap::new();
    let mut identity: Option<Identity> = None;
    let mut heartbeat = tokio::time::interval(state.heartbeat);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    heartbeat.reset(); // the first tick is immediate otherwise

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(_)) | None => break,
                };
                match msg {
                    Message::Text(text) => {
                        let client_msg = match decode_client(&text) {
                            Ok(m) => m,
                            Err(_) => {
                                let err = ServerMessage::error(
                                    ErrorCode::InvalidMessage,
                                    "invalid message",
                                    None,
                                );
                                if send_json(&mut ws_tx, &err).await.is_err() {
                                    break;
                                }
                                continue;
                            }
                        };
                        let flow = handle_client_message(
                            &state,
                            client_msg,
                            &mut identity,
                            &mut ws_tx,
                            &mut outbound,
                            &mut close_reasons,
                        )
                        .await;
                        match flow {
                            Flow::Continue => {}
                            Flow::Close => break,
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }

            // An empty StreamMap yields None and the branch disables until
            // the next loop iteration.
            Some((session_id, event)) = outbound.next() => {
                match event {
                    SubEvent::Frame(msg) => {
                        if send_json(&mut ws_tx, &msg).await.is_err() {
                            break;
                        }
                    }
                    SubEvent::Ended => {
                        // Relay the actor's close reason, if any, then close
                        // the socket for capacity/ownership evictions.
                        let reason = close_reasons
                            .remove(&session_id)
                            .and_then(|signal| signal.get());
                        if let Some(code) = reason {
                            let err = ServerMessage::error(
                                code,
                                match code {
                                    ErrorCode::SlowSubscriber => "subscriber queue overflowed",
                                    ErrorCode::LeaseLost => "session ownership moved",
                                    _ => "subscription closed",
                                },
                                Some(session_id.clone()),
                            );
                            let _ = send_json(&mut ws_tx, &err).await;
                            if code.closes_connection() {
                                break;
                            }
                        }
                    }
                }
            }

            _ = heartbeat.tick() => {
                if send_json(&mut ws_tx, &ServerMessage::Pong {}).await.is_err() {
                    break;
                }
            }

            _ = state.shutdown.cancelled() => break,
        }
    }

    // Detach every live subscription for this connection.
    if let Some(ref identity) = identity {
        let session_ids: Vec<String> =
            outbound.iter().map(|(session_id, _)| session_id.clone()).collect();
        for session_id in session_ids {
            if let Some(handle) = state.manager.get_session(&session_id) {
                handle.detach(&identity.client_id).await;
            }
        }
    }
    debug!("connection closed");
}

enum Flow {
    Continue,
    Close,
}

async fn handle_client_message<S>(
    state: &Arc<GatewayState>,
    msg: ClientMessage,
    identity: &mut Option<Identity>,
    ws_tx: &mut S,
    outbound: &mut StreamMap<String, SubStream>,
    close_reasons: &mut HashMap<String, CloseSignal>,
) -> Flow
where
    S: SinkExt<Message> + Unpin,
{
    match msg {
        ClientMessage::Hello { client_id, device_type, token } => {
            match state.validator.validate(&token).await {
                Ok(user_id) => {
                    let reply = ServerMessage::HelloOk {
                        gateway_time: Utc::now(),
                        heartbeat_interval_ms: state.heartbeat.as_millis() as u64,
                        user_id: user_id.clone(),
                    };
                    *identity = Some(Identity { user_id, client_id, device_kind: device_type });
                    if send_json(ws_tx, &reply).await.is_err() {
                        return Flow::Close;
                    }
                    Flow::Continue
                }
                Err(code) => {
                    let err = ServerMessage::error(code, "authentication failed", None);
                    let _ = send_json(ws_tx, &err).await;
                    Flow::Close
                }
            }
        }

        ClientMessage::Ping {} => reply(ws_tx, ServerMessage::Pong {}).await,

        other => {
            let Some(identity) = identity.as_ref() else {
                return reply(
                    ws_tx,
                    ServerMessage::error(
                        ErrorCode::NotAuthenticated,
                        "hello required before this message",
                        None,
                    ),
                )
                .await;
            };
            handle_authed_message(state, other, identity, ws_tx, outbound, close_reasons).await
        }
    }
}

async fn handle_authed_message<S>(
    state: &Arc<GatewayState>,
    msg: ClientMessage,
    identity: &Identity,
    ws_tx: &mut S,
    outbound: &mut StreamMap<String, SubStream>,
    close_reasons: &mut HashMap<String, CloseSignal>,
) -> Flow
where
    S: SinkExt<Message> + Unpin,
{
    match msg {
        ClientMessage::Subscribe { session_id, last_ack_seq } => {
            let handle = match resolve_session(state, &session_id, identity).await {
                Ok(handle) => handle,
                Err(err) => return reply(ws_tx, err).await,
            };

            let (sink, rx, reason) = MpscSink::channel(state.subscriber_queue);
            let attach = handle
                .attach(&identity.client_id, &identity.device_kind, last_ack_seq, Box::new(sink))
                .await;
            let attached = match attach {
                Ok(attached) => attached,
                Err(code) => {
                    return reply(
                        ws_tx,
                        ServerMessage::error(code, "subscribe failed", Some(session_id)),
                    )
                    .await;
                }
            };

            let subscribed = ServerMessage::Subscribed {
                session_id: session_id.clone(),
                current_state: SessionState {
                    status: attached.status,
                    workflow_status: attached.workflow_status,
                },
                latest_seq: attached.latest_seq,
            };
            if send_json(ws_tx, &subscribed).await.is_err() {
                return Flow::Close;
            }

            // Replay directly on the socket; live frames queue behind it in
            // the subscription channel and stay in seq order.
            for event in attached.missed {
                let frame = ServerMessage::event(&session_id, event);
                if send_json(ws_tx, &frame).await.is_err() {
                    return Flow::Close;
                }
            }

            let stream: SubStream = ReceiverStream::new(rx)
                .map(SubEvent::Frame)
                .chain(stream::once(async { SubEvent::Ended }))
                .boxed();
            outbound.insert(session_id.clone(), stream);
            close_reasons.insert(session_id, reason);
            Flow::Continue
        }

        ClientMessage::Unsubscribe { session_id } => {
            if let Some(handle) = state.manager.get_session(&session_id) {
                handle.detach(&identity.client_id).await;
            }
            outbound.remove(&session_id);
            close_reasons.remove(&session_id);
            reply(ws_tx, ServerMessage::Unsubscribed { session_id }).await
        }

        ClientMessage::Input { session_id, client_input_id, data } => {
            let handle = match resolve_session(state, &session_id, identity).await {
                Ok(handle) => handle,
                Err(err) => return reply(ws_tx, err).await,
            };
            match handle.input(&data, &client_input_id).await {
                Ok(accepted_seq) => {
                    reply(
                        ws_tx,
                        ServerMessage::InputAck { session_id, client_input_id, accepted_seq },
                    )
                    .await
                }
                Err(code) => {
                    reply(ws_tx, ServerMessage::error(code, "input rejected", Some(session_id)))
                        .await
                }
            }
        }

        ClientMessage::Ack { session_id, seq } => {
            // Progress tracking only; the server never responds.
            if let Some(handle) = state.manager.get_session(&session_id) {
                handle.ack(&identity.client_id, seq).await;
            }
            Flow::Continue
        }

        ClientMessage::CreateSession { agent_type, working_directory, worktree_id, repository_id } => {
            let spec = SessionSpec {
                user_id: identity.user_id.clone(),
                agent_type,
                working_dir: working_directory,
                worktree_id,
                repository_id,
            };
            match state.manager.create_session(spec).await {
                Ok(handle) => {
                    let status = match handle.info().await {
                        Some(info) => info.status,
                        None => crate::session::lifecycle::SessionStatus::Provisioning,
                    };
                    reply(ws_tx, ServerMessage::SessionCreated { session_id: handle.id, status })
                        .await
                }
                Err(e) => {
                    reply(ws_tx, ServerMessage::error(e.code(), e.to_string(), None)).await
                }
            }
        }

        ClientMessage::StopSession { session_id } => {
            if let Err(err) = resolve_session(state, &session_id, identity).await {
                return reply(ws_tx, err).await;
            }
            match state.manager.remove_session(&session_id).await {
                Ok(()) => reply(ws_tx, ServerMessage::SessionStopped { session_id }).await,
                Err(e) => {
                    reply(
                        ws_tx,
                        ServerMessage::error(e.code(), e.to_string(), Some(session_id)),
                    )
                    .await
                }
            }
        }

        // hello and ping are handled by the caller.
        ClientMessage::Hello { .. } | ClientMessage::Ping {} => Flow::Continue,
    }
}

/// Locate (or claim and load) the session and enforce ownership.
async fn resolve_session(
    state: &Arc<GatewayState>,
    session_id: &str,
    identity: &Identity,
) -> Result<crate::session::SessionHandle, ServerMessage> {
    let handle = state.manager.get_or_load_session(session_id).await.map_err(|e| {
        ServerMessage::error(e.code(), e.to_string(), Some(session_id.to_owned()))
    })?;

    match handle.info().await {
        Some(info) if info.user_id != identity.user_id => Err(ServerMessage::error(
            ErrorCode::AccessDenied,
            "session belongs to another user",
            Some(session_id.to_owned()),
        )),
        _ => Ok(handle),
    }
}

async fn reply<S>(ws_tx: &mut S, msg: ServerMessage) -> Flow
where
    S: SinkExt<Message> + Unpin,
{
    if send_json(ws_tx, &msg).await.is_err() {
        return Flow::Close;
    }
    Flow::Continue
}

/// Send a JSON-serialized message over the WebSocket.
async fn send_json<S>(tx: &mut S, msg: &ServerMessage) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    tx.send(Message::Text(encode_server(msg).into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_tests.rs"]
mod tests;
