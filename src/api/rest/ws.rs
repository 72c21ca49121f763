use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::future;
use futures::stream;
use futures::SinkExt;
use futures::StreamExt;
use serde::Serialize;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use crate::engine::gateway::OfferEvent;
use crate::models::assignment::MatchEvent;
use crate::state::AppState;

#[derive(Serialize)]
#[serde(tag = "kind", content = "payload")]
enum Outbound {
    Match(MatchEvent),
    Offer(OfferEvent),
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Streams match outcomes and driver offers to one client.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    // lagged receivers skip what they missed
    let matches = BroadcastStream::new(state.match_events_tx.subscribe())
        .filter_map(|event| future::ready(event.ok().map(Outbound::Match)));
    let offers = BroadcastStream::new(state.offers_tx.subscribe())
        .filter_map(|event| future::ready(event.ok().map(Outbound::Offer)));
    let mut events = Box::pin(stream::select(matches, offers));

    info!("websocket client connected");

    let send_task = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to serialize event for ws");
                    continue;
                }
            };

            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    info!("websocket client disconnected");
}
