//! Per-connection websocket pumps.
//!
//! Two tasks per client: the write pump drains the client's hub queue into
//! the socket and pings on a timer; the read pump enforces the read
//! deadline and handles subscribe commands. Either pump ending tears the
//! client down.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use observer_common::types::{LatestData, SubscribeCommand};

use super::hub::Hub;
use super::AppState;

/// Large JSON payloads; anything beyond this disconnects the client.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Read deadline; a pong or any frame re-arms it.
const PONG_WAIT: Duration = Duration::from_secs(60);

/// Ping cadence, comfortably inside the pong deadline.
const PING_PERIOD: Duration = Duration::from_secs(54);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, Arc::clone(&state.hub)))
}

async fn handle_socket(socket: WebSocket, hub: Arc<Hub>) {
    let (id, queue_rx) = hub.register_client().await;
    let (sink, stream) = socket.split();

    let mut write_task = tokio::spawn(write_pump(sink, queue_rx));
    let mut read_task = tokio::spawn(read_pump(stream, Arc::clone(&hub), id));

    // The hub loop holds the only sender for the client's queue, so a prune
    // or unregister closes it and ends the write pump. Either pump ending
    // tears the whole connection down.
    tokio::select! {
        _ = &mut write_task => {
            // Queue closed (pruned) or the socket rejected a write
            read_task.abort();
            hub.unregister_client(id).await;
        }
        _ = &mut read_task => {
            // Client went away or hit the read deadline; unregistering
            // closes the queue and the write pump flushes the close frame
            hub.unregister_client(id).await;
            let _ = write_task.await;
        }
    }

    info!(client = id, "client disconnected");
}

async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut queue: mpsc::Receiver<LatestData>,
) {
    let mut ping = tokio::time::interval(PING_PERIOD);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            item = queue.recv() => {
                match item {
                    Some(payload) => {
                        let text = match serde_json::to_string(&payload) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(error = %e, "payload serialization failed");
                                continue;
                            }
                        };
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            return;
                        }
                    }
                    None => {
                        // Hub closed the queue (pruned or unregistered)
                        let _ = sink.send(Message::Close(None)).await;
                        return;
                    }
                }
            }

            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn read_pump(mut stream: SplitStream<WebSocket>, hub: Arc<Hub>, client_id: u64) {
    loop {
        let frame = match tokio::time::timeout(PONG_WAIT, stream.next()).await {
            Err(_) => {
                debug!("read deadline expired");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "websocket read error");
                return;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => {
                let cmd: SubscribeCommand = match serde_json::from_str(text.as_str()) {
                    Ok(cmd) => cmd,
                    Err(e) => {
                        warn!(error = %e, "unparseable client command, disconnecting");
                        return;
                    }
                };

                if cmd.command != "subscribe" {
                    continue;
                }

                hub.subscribe(client_id, &cmd).await;
            }
            Message::Close(_) => return,
            // Pongs and pings only matter for the deadline, which the
            // timeout above already re-armed.
            _ => {}
        }
    }
}
