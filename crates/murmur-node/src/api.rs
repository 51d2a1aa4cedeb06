use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use murmur_shared::constants::MAX_MESSAGE_SIZE;
use murmur_shared::protocol::{BridgeCommand, BridgeEvent};
use murmur_store::parse_frame;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub community_id: Arc<str>,
    pub commands: mpsc::Sender<BridgeCommand>,
    /// Serialized bridge events, fanned out to every socket.
    pub events: broadcast::Sender<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    community: String,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        community: state.community_id.to_string(),
    })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.max_message_size(MAX_MESSAGE_SIZE * 2)
        .on_upgrade(|socket| handle_socket(socket, state))
}

/// Pump one data-socket connection: text frames in, bridge events out.
async fn handle_socket(socket: WebSocket, state: AppState) {
    info!("Data socket connected");
    let (mut sink, mut stream) = socket.split();
    let mut events = state.events.subscribe();

    let forward = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(frame) => {
                    if sink.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Data socket lagging, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let Some(command) = parse_frame(&text) else {
                    continue;
                };
                if state.commands.send(command).await.is_err() {
                    warn!("Storage bridge is gone, closing data socket");
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "Data socket read failed");
                break;
            }
        }
    }

    forward.abort();
    info!("Data socket disconnected");
}

/// Serialize bridge events and broadcast them to connected sockets.
pub fn spawn_event_fanout(
    mut bridge_events: mpsc::Receiver<BridgeEvent>,
    sockets: broadcast::Sender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = bridge_events.recv().await {
            match event.to_json() {
                Ok(frame) => {
                    // No connected socket is not an error.
                    let _ = sockets.send(frame);
                }
                Err(e) => warn!(error = %e, "Failed to encode bridge event"),
            }
        }
        debug!("Bridge event stream ended");
    })
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting data socket server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;

    fn state() -> (AppState, mpsc::Receiver<BridgeCommand>) {
        let (commands, rx) = mpsc::channel(8);
        let (events, _) = broadcast::channel(8);
        (
            AppState {
                community_id: Arc::from("c1"),
                commands,
                events,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_health_check() {
        let (state, _rx) = state();
        let response = build_router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ws_requires_upgrade() {
        let (state, _rx) = state();
        let response = build_router(state)
            .oneshot(Request::get("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_event_fanout_serializes() {
        let (tx, rx) = mpsc::channel(8);
        let (sockets, mut socket_rx) = broadcast::channel(8);
        let handle = spawn_event_fanout(rx, sockets);

        tx.send(BridgeEvent::PrivateConversationsLoaded {
            conversations: Vec::new(),
            community_id: "c1".into(),
        })
        .await
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        let frame = socket_rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "privateConversationsLoaded");
    }
}
