use crate::registry::SubscriptionRegistry;
use crate::watchlist::parse_watch_address;
use alloy_primitives::Address;
use anyhow::Result;
use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const OUTBOUND_BUFFER: usize = 64; // notices queued per connection before sends time out

#[derive(Clone)]
struct ServerState {
    registry: Arc<SubscriptionRegistry>,
    shutdown: CancellationToken,
}

/// Subscribe requests arrive as query parameters on the upgrade:
/// `ws://host:port/?type=subscribe&address=0x...`
#[derive(Debug, Deserialize)]
struct SubscribeParams {
    #[serde(rename = "type")]
    request_type: Option<String>,
    address: Option<String>,
}

#[derive(Serialize)]
struct Ack {
    message: String,
}

#[derive(Serialize)]
struct ErrorReply {
    error: String,
}

pub fn router(registry: Arc<SubscriptionRegistry>, shutdown: CancellationToken) -> Router {
    let state = ServerState { registry, shutdown };
    Router::new().route("/", get(ws_subscribe)).with_state(state)
}

/// Runs the subscriber endpoint until the token fires. Connection tasks
/// watch the same token, so open sockets close promptly on shutdown.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<SubscriptionRegistry>,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(
        "Subscriber endpoint listening on ws://{}",
        listener.local_addr()?
    );
    let app = router(registry, shutdown.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn ws_subscribe(
    ws: WebSocketUpgrade,
    Query(params): Query<SubscribeParams>,
    State(state): State<ServerState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

fn subscribe_target(params: &SubscribeParams) -> Result<Address, String> {
    if params.request_type.as_deref() != Some("subscribe") {
        return Err("expected query parameter type=subscribe".to_string());
    }
    let raw = params
        .address
        .as_deref()
        .ok_or_else(|| "missing address query parameter".to_string())?;
    parse_watch_address(raw).map_err(|e| e.to_string())
}

async fn handle_socket(socket: WebSocket, state: ServerState, params: SubscribeParams) {
    let address = match subscribe_target(&params) {
        Ok(address) => address,
        Err(reason) => {
            reject(socket, reason).await;
            return;
        }
    };

    let (tx, mut rx) = mpsc::channel(OUTBOUND_BUFFER);
    let id = state.registry.subscribe(address, tx);
    info!("Connection {} subscribed to {}", id, address);

    let (mut sender, mut receiver) = socket.split();

    let ack = Ack {
        message: format!("Subscribed to {address}"),
    };
    if let Ok(json) = serde_json::to_string(&ack) {
        if sender.send(Message::Text(json)).await.is_err() {
            state.registry.unsubscribe(id);
            return;
        }
    }

    loop {
        tokio::select! {
            notice = rx.recv() => {
                match notice {
                    Some(notice) => match serde_json::to_string(&notice) {
                        Ok(json) => {
                            if sender.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Failed to serialize notice: {}", e),
                    },
                    // The dispatcher dropped us after a failed send.
                    None => break,
                }
            }
            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
            _ = state.shutdown.cancelled() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    state.registry.unsubscribe(id);
    info!("Connection {} closed", id);
}

async fn reject(mut socket: WebSocket, reason: String) {
    warn!("Rejecting subscribe request: {}", reason);
    if let Ok(json) = serde_json::to_string(&ErrorReply { error: reason }) {
        let _ = socket.send(Message::Text(json)).await;
    }
    let _ = socket.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    #[test]
    fn accepts_a_well_formed_subscribe_request() {
        let params = SubscribeParams {
            request_type: Some("subscribe".to_string()),
            address: Some("0xDAC17F958D2EE523A2206206994597C13D831EC7".to_string()),
        };
        assert_eq!(
            subscribe_target(&params).unwrap(),
            address!("dac17f958d2ee523a2206206994597c13d831ec7")
        );
    }

    #[test]
    fn rejects_missing_type() {
        let params = SubscribeParams {
            request_type: None,
            address: Some("0xdac17f958d2ee523a2206206994597c13d831ec7".to_string()),
        };
        assert!(subscribe_target(&params).is_err());
    }

    #[test]
    fn rejects_missing_or_malformed_address() {
        let missing = SubscribeParams {
            request_type: Some("subscribe".to_string()),
            address: None,
        };
        assert!(subscribe_target(&missing).is_err());

        let malformed = SubscribeParams {
            request_type: Some("subscribe".to_string()),
            address: Some("not-an-address".to_string()),
        };
        assert!(subscribe_target(&malformed).is_err());
    }
}
