//! WebSocket Connection Handler
//!
//! Upgrades `GET /ws?client_id=<user id>`, registers the connection with the
//! hub and runs the session: a read loop that turns frames into routed
//! messages, and a writer task draining the connection's outbound queue.

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, error, info};

use super::messages::ClientFrame;
use super::session::SessionState;
use crate::application::hub::{Notice, NoticeCode, SendOutcome, ServerEvent};
use crate::application::router::{DispatchOutcome, RouterError};
use crate::shared::error::AppError;
use crate::startup::AppState;

/// Query parameters of the upgrade request.
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub client_id: Option<String>,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Result<Response, AppError> {
    let user_id = params
        .client_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::BadRequest("client_id is required".into()))?;

    if !state.gate.is_open() {
        return Err(AppError::Unavailable("server is shutting down".into()));
    }

    Ok(ws
        .max_message_size(state.settings.hub.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, user_id, state)))
}

/// Why a session's read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    ClientClosed,
    /// Queue closed by the hub (eviction, overflow, shutdown) or socket write failed
    WriterDone,
    IdleTimeout,
    IngressClosed,
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, user_id: String, state: AppState) {
    let handle = match state.hub.register(&user_id) {
        Ok(handle) => handle,
        Err(e) => {
            debug!(user_id = %user_id, error = %e, "Rejecting connection");
            return;
        }
    };
    let connection_id = handle.connection_id;
    let mut session = SessionState::new(user_id.clone(), connection_id);

    // Split socket for concurrent read/write
    let (sink, mut stream) = socket.split();
    let ping_every = state.settings.hub.ping_interval();
    let idle_timeout = state.settings.hub.idle_timeout();
    let mut writer = tokio::spawn(write_loop(sink, handle.receiver, ping_every));

    let ingress_closed = state.gate.closed();
    tokio::pin!(ingress_closed);

    let mut heartbeat_check = interval(ping_every);
    heartbeat_check.tick().await; // Skip first immediate tick

    // Main message loop
    let end = loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        session.record_frame();
                        handle_frame(text.as_str(), &session, &state).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        session.record_frame();
                        state.hub.notify(
                            &user_id,
                            Notice::new(NoticeCode::InvalidFrame).with_detail("binary frames are not supported"),
                        );
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        // Pong replies are handled automatically by axum
                        session.heartbeat();
                    }
                    Some(Ok(Message::Close(_))) | None => break SessionEnd::ClientClosed,
                    Some(Err(e)) => {
                        debug!(user_id = %user_id, error = %e, "WebSocket error");
                        break SessionEnd::ClientClosed;
                    }
                }
            }

            _ = &mut writer => break SessionEnd::WriterDone,

            _ = heartbeat_check.tick() => {
                if !session.is_alive(idle_timeout) {
                    info!(user_id = %user_id, "Idle timeout, closing connection");
                    break SessionEnd::IdleTimeout;
                }
                state.hub.touch(&user_id, connection_id);
            }

            _ = &mut ingress_closed => break SessionEnd::IngressClosed,
        }
    };

    // Cleanup
    match end {
        SessionEnd::IngressClosed => {
            // Stop reading but let the hub drain this queue during shutdown
            let _ = writer.await;
            state.hub.release(&user_id, connection_id);
        }
        SessionEnd::WriterDone => {
            state.hub.release(&user_id, connection_id);
        }
        SessionEnd::ClientClosed | SessionEnd::IdleTimeout => {
            state.hub.release(&user_id, connection_id);
            writer.abort();
        }
    }

    info!(
        user_id = %user_id,
        connection_id = %connection_id,
        frames = session.frames_received,
        reason = ?end,
        "User disconnected"
    );
}

/// Forward queued events to the socket and ping on a fixed interval.
///
/// Ends when the queue closes (after sending a close frame) or the socket
/// rejects a write.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut events: mpsc::Receiver<ServerEvent>,
    ping_every: Duration,
) {
    let mut ping = interval(ping_every);
    ping.tick().await;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let text = match event.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to serialize event: {}", e);
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Handle one inbound text frame
async fn handle_frame(text: &str, session: &SessionState, state: &AppState) {
    let user_id = session.user_id.as_str();

    let frame = match ClientFrame::parse(text) {
        Ok(frame) => frame,
        Err(e) => {
            state.hub.notify(
                user_id,
                Notice::new(NoticeCode::InvalidFrame).with_detail(e.to_string()),
            );
            return;
        }
    };
    let Some(message) = frame.into_message(user_id) else {
        state.hub.notify(
            user_id,
            Notice::new(NoticeCode::InvalidFrame).with_detail("receive_id is required"),
        );
        return;
    };
    let direct = !message.target.is_group();

    match state.router.dispatch(message).await {
        Ok(DispatchOutcome::Delivered(deliveries)) if direct => {
            for delivery in deliveries.iter().filter(|d| d.outcome != SendOutcome::Enqueued) {
                state.hub.notify(
                    user_id,
                    Notice::new(NoticeCode::UserOffline)
                        .with_target(delivery.user_id.clone())
                        .with_detail(delivery.outcome.as_str()),
                );
            }
        }
        Ok(_) => {}
        Err(RouterError::UnknownGroup(group_id)) => {
            state
                .hub
                .notify(user_id, Notice::new(NoticeCode::UnknownGroup).with_target(group_id));
        }
        Err(e @ RouterError::Bus(_)) => {
            state.hub.notify(
                user_id,
                Notice::new(NoticeCode::DeliveryFailed).with_detail(e.to_string()),
            );
        }
    }
}
