// ============================
// viewsync-lib/src/ws_router.rs
// ============================
//! WebSocket connection handling.
//!
//! One read loop and one write pump per connection. The read loop owns the
//! connection's dispatch context; the write pump drains the outbound
//! channel registered with the session layer, which preserves per-connection
//! event order.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;
use viewsync_common::events::{ClientEvent, ServerEvent};

use crate::dispatcher::{ConnContext, Dispatcher};
use crate::sessions::OUTBOUND_BUFFER;
use crate::AppState;

/// Handler for WebSocket upgrade requests.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, addr, state))
}

async fn handle_connection(socket: WebSocket, addr: SocketAddr, state: Arc<AppState>) {
    metrics::counter!("ws.connection").increment(1);
    metrics::gauge!("ws.active").increment(1.0);

    let conn_id = Uuid::new_v4().to_string();
    let (mut socket_tx, mut socket_rx) = socket.split();

    // Outbound channel: everything the rest of the server sends to this
    // connection flows through here, in order.
    let (event_tx, mut event_rx) = mpsc::channel::<ServerEvent>(OUTBOUND_BUFFER);
    state.connections.register(&conn_id, addr.ip(), event_tx);

    let write_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "failed to serialize outbound event");
                    continue;
                },
            };
            if socket_tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let dispatcher = Dispatcher::new(state.clone());
    let mut ctx = ConnContext::new(conn_id.clone(), addr.ip());
    debug!(conn = %conn_id, remote = %addr, "connection open");

    while let Some(Ok(message)) = socket_rx.next().await {
        match message {
            Message::Text(text) => {
                if let Err(retry_after) = state.rate_limiter.check(addr.ip()) {
                    state.connections.send_to(
                        &conn_id,
                        ServerEvent::RateLimitError {
                            message: "too many events, slow down".to_string(),
                            retry_after,
                        },
                    );
                    continue;
                }

                let event = match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => event,
                    Err(e) => {
                        // malformed payloads are dropped, never disconnected
                        warn!(conn = %conn_id, error = %e, "unparseable event");
                        metrics::counter!("event.rejected").increment(1);
                        continue;
                    },
                };

                dispatcher.dispatch(&mut ctx, event).await;

                if let Some(delay) = ctx.disconnect_after.take() {
                    tokio::time::sleep(delay).await;
                    break;
                }
            },
            Message::Close(_) => break,
            _ => {},
        }
    }

    dispatcher.connection_closed(&mut ctx).await;
    write_task.abort();
    debug!(conn = %conn_id, "connection closed");

    metrics::counter!("ws.disconnection").increment(1);
    metrics::gauge!("ws.active").decrement(1.0);
}
