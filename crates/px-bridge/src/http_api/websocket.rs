use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::{extract::State, response::IntoResponse};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::debug;

use super::state::ApiState;
use crate::protocol::{ClientFrame, ServerFrame};

/// GET /api/v1/ws -- real-time event streaming. JWT auth happens in the
/// auth layer (bearer header or `?token=` query parameter).
pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<ApiState>) {
    let hub = state.hub.clone();
    let (conn_id, rx) = hub.register();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let ping_interval = hub.settings().ping_interval;
    let idle_timeout = hub.settings().idle_timeout;

    // Writer: drain the hub buffer and keep the client alive with pings.
    // A disconnected buffer means the hub evicted us (slow consumer).
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval);
        ping.tick().await; // consume the immediate first tick
        loop {
            tokio::select! {
                frame = rx.recv_async() => match frame {
                    Ok(frame) => {
                        let json = serde_json::to_string(&frame).unwrap_or_default();
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => {
                        let _ = ws_tx
                            .send(Message::Close(Some(CloseFrame {
                                code: close_code::POLICY,
                                reason: "send buffer overflow; resync via REST".into(),
                            })))
                            .await;
                        break;
                    }
                },
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Reader: subscription management, client pings, idle timeout.
    loop {
        let incoming = tokio::time::timeout(idle_timeout, ws_rx.next()).await;
        match incoming {
            Err(_) => {
                debug!(conn_id, "websocket idle timeout");
                break;
            }
            Ok(None) | Ok(Some(Err(_))) => break,
            Ok(Some(Ok(message))) => match message {
                Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(ClientFrame::Subscribe { topics }) => {
                        hub.subscribe_topics(conn_id, &topics);
                    }
                    Ok(ClientFrame::Unsubscribe { topics }) => {
                        hub.unsubscribe_topics(conn_id, &topics);
                    }
                    Ok(ClientFrame::Ping) => {
                        hub.send_to(conn_id, ServerFrame::pong());
                    }
                    Err(err) => {
                        hub.send_to(
                            conn_id,
                            ServerFrame::error("bad_frame", err.to_string()),
                        );
                    }
                },
                Message::Close(_) => break,
                // Protocol-level ping/pong is handled by the transport.
                _ => {}
            },
        }
    }

    hub.unregister(conn_id);
    writer.abort();
}
