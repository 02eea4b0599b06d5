use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    http::StatusCode,
    routing::get,
    Json, Router,
};
use colored::*;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::channel::ws::{decode_binary, decode_text};
use crate::host::HostState;
use crate::protocol::{Diff, InboundMessage, OutboundMessage};

const RELAY_CAPACITY: usize = 1024;

/// A message headed to every connection except `origin`
#[derive(Debug, Clone)]
pub struct Relay {
    pub origin: Uuid,
    pub message: InboundMessage,
}

#[derive(Clone)]
pub struct AppState {
    pub host: Arc<HostState>,
    pub hub: broadcast::Sender<Relay>,
}

impl AppState {
    pub fn new(host: Arc<HostState>) -> Self {
        let (hub, _) = broadcast::channel(RELAY_CAPACITY);
        Self { host, hub }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "frame-sync host" }))
        .route("/health", get(|| async { Json("OK") }))
        .route("/state", get(get_state).post(push_state))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

pub async fn serve(port: u16, host: Arc<HostState>) -> Result<()> {
    let app = router(AppState::new(host));

    let addr = format!("0.0.0.0:{}", port);
    println!(
        "{} Host running at {}",
        "✓".green(),
        format!("ws://{}/ws", addr).bright_blue()
    );

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(state, socket))
}

async fn handle_ws(state: AppState, socket: WebSocket) {
    let connection = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();
    let (direct_tx, mut direct_rx) = mpsc::unbounded_channel::<InboundMessage>();
    info!(%connection, "app connected");

    // Replies to this app plus relays from the others. Replies go first so
    // the Init reply is never overtaken by a relay.
    let mut relays = state.hub.subscribe();
    let send_task = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                biased;
                Some(message) = direct_rx.recv() => message,
                relay = relays.recv() => match relay {
                    Ok(relay) if relay.origin == connection => continue,
                    Ok(relay) => relay.message,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            let text = message.to_wire().to_string();
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = receiver.next().await {
        let decoded = match frame {
            Ok(Message::Text(text)) => decode_text(text.as_str()),
            Ok(Message::Binary(bin)) => decode_binary(&bin),
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Err(_) => break,
        };

        let message = match decoded.and_then(|data| OutboundMessage::from_wire(&data)) {
            Ok(message) => message,
            Err(rejection) => {
                trace!(%connection, %rejection, "dropping frame");
                continue;
            }
        };
        debug!(%connection, kind = %message.kind(), "app message");

        let response = state.host.handle(message);
        for reply in response.replies {
            let _ = direct_tx.send(reply);
        }
        if let Some(message) = response.relay {
            let _ = state.hub.send(Relay {
                origin: connection,
                message,
            });
        }
    }

    send_task.abort();
    info!(%connection, "app disconnected");
}

async fn get_state(State(state): State<AppState>) -> Json<Value> {
    Json(Value::Object(state.host.document().unwrap_or_default()))
}

/// Push an authoritative diff to every connected app
async fn push_state(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let diff = Diff::try_from(body).map_err(|_| StatusCode::UNPROCESSABLE_ENTITY)?;
    let message = state.host.push(diff);
    let _ = state.hub.send(Relay {
        origin: Uuid::nil(),
        message,
    });
    Ok(Json(Value::Object(state.host.document().unwrap_or_default())))
}
