//! `GET /events`: streams structured events (tenant/zone/reconfig
//! lifecycle, plus re-emitted log lines) to management WebSocket clients.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use tracing::{debug, error, info};

use super::state::ManagementState;

pub async fn events_handler(ws: WebSocketUpgrade, State(state): State<ManagementState>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: ManagementState) {
    info!("management events client connected");
    let mut rx = state.events.subscribe();

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(json) => {
                            if let Err(e) = socket.send(Message::Text(json)).await {
                                error!("failed to send event to management client: {e}");
                                break;
                            }
                        }
                        Err(e) => error!("failed to serialize event: {e}"),
                    },
                    Err(e) => {
                        error!("event channel error: {e}");
                        break;
                    }
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(msg)) => {
                        if msg.is_close() {
                            debug!("management client closed connection");
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        error!("management websocket error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    info!("management events client disconnected");
}
