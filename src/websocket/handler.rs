//! WebSocket relay.
//!
//! Forwards committed engine events to connected clients. A client
//! subscribes to the same logical channels the Redis bus uses
//! (`orderbook:{market}:{outcome}`, `trades:{market}`, `markets:{market}`,
//! `user:{user}`); unmatched events are dropped for that socket. No
//! business logic lives here.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::events::EventEnvelope;
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum ClientMessage {
    Subscribe { channels: Vec<String> },
    Unsubscribe { channels: Vec<String> },
    Ping,
}

pub async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();
    let mut events = state.events.subscribe();
    let mut channels: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            incoming = stream.next() => {
                let Some(Ok(message)) = incoming else { break };
                match message {
                    Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(ClientMessage::Subscribe { channels: wanted }) => {
                            channels.extend(wanted);
                            let ack = serde_json::json!({ "op": "subscribed", "channels": channels });
                            if sink.send(Message::Text(ack.to_string())).await.is_err() {
                                break;
                            }
                        }
                        Ok(ClientMessage::Unsubscribe { channels: dropped }) => {
                            for channel in dropped {
                                channels.remove(&channel);
                            }
                        }
                        Ok(ClientMessage::Ping) => {
                            let pong = serde_json::json!({ "op": "pong" });
                            if sink.send(Message::Text(pong.to_string())).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            tracing::debug!("unparseable ws message: {err}");
                        }
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            event = events.recv() => {
                match event {
                    Ok(envelope) => {
                        if !wants(&channels, &envelope) {
                            continue;
                        }
                        let Ok(payload) = serde_json::to_string(&envelope) else { continue };
                        if sink.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("ws client lagged {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

fn wants(channels: &HashSet<String>, envelope: &EventEnvelope) -> bool {
    envelope
        .event
        .channels()
        .iter()
        .any(|channel| channels.contains(channel))
}
