//! WebSocket client connections
//!
//! Each connection merges two outbound sources: replies addressed to it by
//! the dispatcher, and every event on the shared broadcaster.

use super::GatewayState;
use crate::protocol::ServerEvent;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};

/// Optional connection parameters
#[derive(Debug, Default, Deserialize)]
pub(crate) struct WsParams {
    /// Free-form client label, used only in logs
    caller: Option<String>,
}

pub(crate) async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    let caller = params.caller.unwrap_or_else(|| "anonymous".to_string());
    ws.on_upgrade(move |socket| handle_client_ws(socket, state, caller))
}

async fn handle_client_ws(socket: WebSocket, state: GatewayState, caller: String) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(
        connection_id = %connection_id,
        caller = %caller,
        "Client WebSocket connected"
    );

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (direct_tx, mut direct_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let mut events = state.registry.events().subscribe();

    // Forward direct replies and broadcast events → client
    let send_connection_id = connection_id.clone();
    let send_task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                reply = direct_rx.recv() => match reply {
                    Some(event) => event,
                    None => break,
                },
                broadcast = events.recv() => match broadcast {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            connection_id = %send_connection_id,
                            skipped,
                            "Client fell behind; events dropped"
                        );
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };

            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Failed to serialize {} event: {}", event.kind(), e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Receive client commands
    let dispatcher = state.dispatcher.clone();
    let recv_connection_id = connection_id.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    if let Some(reply) = dispatcher.handle_text(&text).await {
                        if direct_tx.send(reply).is_err() {
                            break;
                        }
                    }
                }
                Message::Close(_) => break,
                _ => {
                    tracing::trace!(
                        connection_id = %recv_connection_id,
                        "Ignoring non-text frame"
                    );
                }
            }
        }
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    tracing::info!(
        connection_id = %connection_id,
        caller = %caller,
        "Client WebSocket disconnected"
    );
}
