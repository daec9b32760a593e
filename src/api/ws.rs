// =============================================================================
// WebSocket Handler — push-based state updates
// =============================================================================
//
// Clients connect to `/api/v1/ws` and receive:
//   1. An immediate full StateSnapshot on connect.
//   2. A fresh snapshot whenever the state_version has changed, checked every
//      500 ms.
//
// The handler responds to Ping frames with Pong frames, stamps every outbound
// message with a per-connection sequence number, and cleans up silently on
// disconnect.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::app_state::AppState;

/// How often the push loop checks for a state-version change.
const PUSH_POLL_INTERVAL_MS: u64 = 500;

// =============================================================================
// WebSocket upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

// =============================================================================
// Connection handler
// =============================================================================

async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // Initial full snapshot.
    let mut last_sent_version = match send_snapshot(&mut sender, &state).await {
        Ok(version) => version,
        Err(e) => {
            warn!(error = %e, "failed to send initial WebSocket snapshot");
            return;
        }
    };

    let mut ticker = interval(Duration::from_millis(PUSH_POLL_INTERVAL_MS));

    loop {
        tokio::select! {
            // ── Push loop ───────────────────────────────────────────────
            _ = ticker.tick() => {
                let version = state.current_state_version();
                if version != last_sent_version {
                    match send_snapshot(&mut sender, &state).await {
                        Ok(sent) => last_sent_version = sent,
                        Err(e) => {
                            debug!(error = %e, "WebSocket push failed — closing");
                            return;
                        }
                    }
                }
            }

            // ── Recv loop ───────────────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(payload))) => {
                        if sender.send(Message::Pong(payload)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("WebSocket client disconnected");
                        return;
                    }
                    Some(Ok(_)) => {
                        // Text/Binary/Pong from clients are ignored; the feed
                        // is one-way.
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "WebSocket receive error — closing");
                        return;
                    }
                }
            }
        }
    }
}

/// Serialise and send the current snapshot; returns the version that was
/// sent so the push loop can suppress duplicates.
async fn send_snapshot(
    sender: &mut SplitSink<WebSocket, Message>,
    state: &AppState,
) -> anyhow::Result<u64> {
    let snapshot = state.build_snapshot();
    let version = snapshot.state_version;
    let sequence = state.ws_sequence_number.fetch_add(1, Ordering::Relaxed);

    let payload = serde_json::json!({
        "sequence": sequence,
        "snapshot": snapshot,
    });

    sender
        .send(Message::Text(payload.to_string()))
        .await
        .map_err(|e| anyhow::anyhow!("WebSocket send failed: {e}"))?;

    Ok(version)
}
