//! Per-connection WebSocket handling for the realtime protocol.
//!
//! Connection lifecycle: register with the hub, send the welcome frame,
//! process subscribe/unsubscribe/ping until the socket closes, then purge
//! the client from every channel.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::realtime::{ClientMessage, ServerMessage, SubscriptionHub};

fn encode(msg: &ServerMessage) -> Option<String> {
  match serde_json::to_string(msg) {
    Ok(s) => Some(s),
    Err(e) => {
      tracing::error!("failed to serialize server message: {}", e);
      None
    }
  }
}

pub async fn handle_socket(hub: Arc<SubscriptionHub>, socket: WebSocket) {
  let client_id = Uuid::new_v4();
  let (mut sink, mut stream) = socket.split();
  let (tx, mut rx) = mpsc::unbounded_channel::<String>();

  hub.register(client_id, tx.clone());
  tracing::debug!("realtime client {} connected", client_id);

  if let Some(frame) = encode(&ServerMessage::Connected) {
    let _ = tx.send(frame);
  }

  let send_task = tokio::spawn(async move {
    while let Some(frame) = rx.recv().await {
      if sink.send(Message::Text(frame.into())).await.is_err() {
        break;
      }
    }
  });

  while let Some(Ok(msg)) = stream.next().await {
    let text = match msg {
      Message::Text(text) => text,
      Message::Close(_) => break,
      _ => continue,
    };

    let reply = match serde_json::from_str::<ClientMessage>(&text) {
      Ok(ClientMessage::Subscribe { channel }) => {
        if hub.subscribe(client_id, &channel) {
          ServerMessage::Subscribed { channel }
        } else {
          ServerMessage::error(format!("invalid channel: {channel:?}"))
        }
      }
      Ok(ClientMessage::Unsubscribe { channel }) => {
        hub.unsubscribe(client_id, &channel);
        ServerMessage::Unsubscribed { channel }
      }
      Ok(ClientMessage::Ping) => ServerMessage::Pong,
      Err(e) => ServerMessage::error(format!("malformed message: {e}")),
    };
    if let Some(frame) = encode(&reply) {
      let _ = tx.send(frame);
    }
  }

  hub.remove_client(client_id);
  send_task.abort();
  tracing::debug!("realtime client {} disconnected", client_id);
}
