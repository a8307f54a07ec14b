use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, Uri},
    response::{IntoResponse, Response},
    Json,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::auth::Principal;
use crate::bridge::Connected;
use crate::protocol::{ClientMessage, ServerEvent};

use super::auth::authenticate;
use super::error::ApiError;
use super::AppState;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime: u64,
    sessions: usize,
}

pub(super) async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let stats = state
        .bridge
        .stats()
        .await
        .map_err(|_| ApiError::BridgeUnavailable)?;
    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.started.elapsed().as_secs(),
        sessions: stats.sessions,
    }))
}

/// One slot of the connection cap, released on drop.
pub(super) struct ConnectionSlot {
    count: Arc<AtomicUsize>,
}

impl ConnectionSlot {
    pub(super) fn acquire(count: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        let current = count.fetch_add(1, Ordering::AcqRel);
        if current >= max {
            count.fetch_sub(1, Ordering::Release);
            return None;
        }
        Some(Self {
            count: count.clone(),
        })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::Release);
    }
}

pub(super) async fn ws(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    // Authenticate before looking at the upgrade so a missing or bad token
    // is always reported as such.
    let principal = match authenticate(state.authenticator.as_ref(), &headers, &uri) {
        Ok(principal) => principal,
        Err(e) => return e.into_response(),
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    let Some(slot) = ConnectionSlot::acquire(&state.ws_count, state.max_connections) else {
        tracing::warn!(device = %principal.device, "connection cap reached, rejecting upgrade");
        return ApiError::TooManyConnections.into_response();
    };

    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_ws(socket, state, principal, slot))
}

type WsSink = SplitSink<WebSocket, Message>;

async fn send_event(ws_tx: &mut WsSink, event: &ServerEvent) -> Result<(), axum::Error> {
    ws_tx.send(Message::Text(event.to_json().into())).await
}

async fn send_close(ws_tx: &mut WsSink, reason: &'static str) {
    let close_frame = CloseFrame {
        code: axum::extract::ws::close_code::NORMAL,
        reason: reason.into(),
    };
    let _ = ws_tx.send(Message::Close(Some(close_frame))).await;
    let _ = ws_tx.flush().await;
}

async fn handle_ws(socket: WebSocket, state: AppState, principal: Principal, _slot: ConnectionSlot) {
    // Register this connection for graceful shutdown tracking
    let (_guard, mut shutdown_rx) = state.shutdown.register();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let Connected {
        conn,
        initial,
        mut events,
    } = match state.bridge.connect(principal).await {
        Ok(connected) => connected,
        Err(e) => {
            tracing::warn!(?e, "bridge refused connection");
            send_close(&mut ws_tx, "server shutting down").await;
            return;
        }
    };

    if *shutdown_rx.borrow() {
        send_close(&mut ws_tx, "server shutting down").await;
        state.bridge.disconnect(conn).await;
        return;
    }

    for event in &initial {
        if send_event(&mut ws_tx, event).await.is_err() {
            state.bridge.disconnect(conn).await;
            return;
        }
    }

    loop {
        tokio::select! {
            // Broadcast events -> WebSocket
            result = events.recv() => {
                match result {
                    Ok(event) => {
                        if send_event(&mut ws_tx, &event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(conn, n, "connection lagged, events dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        send_close(&mut ws_tx, "server shutting down").await;
                        break;
                    }
                }
            }

            // Client commands -> bridge
            msg = ws_rx.next() => {
                let replies = match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(message) => match state.bridge.dispatch(conn, message).await {
                                Ok(replies) => replies,
                                Err(_) => {
                                    send_close(&mut ws_tx, "server shutting down").await;
                                    break;
                                }
                            },
                            Err(e) => {
                                tracing::debug!(conn, error = %e, "unparseable client frame");
                                vec![ServerEvent::error(format!("Invalid message: {e}"))]
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        vec![ServerEvent::error("Binary frames are not supported")]
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue, // Ping/Pong handled automatically
                    Some(Err(_)) => break,
                };
                let mut failed = false;
                for reply in &replies {
                    if send_event(&mut ws_tx, reply).await.is_err() {
                        failed = true;
                        break;
                    }
                }
                if failed {
                    break;
                }
            }

            // Shutdown signal
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::debug!(conn, "WebSocket received shutdown signal, closing");
                    send_close(&mut ws_tx, "server shutting down").await;
                    break;
                }
            }
        }
    }

    state.bridge.disconnect(conn).await;
    // _guard and _slot are dropped here
}
