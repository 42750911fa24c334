//! WebSocket wire protocol for the change broadcaster.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
  Insert,
  Update,
  Delete,
}

/// One row change as delivered by the notification trigger. `table` is the
/// qualified `schema.table` name and doubles as the fanout channel key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
  pub table: String,
  pub operation: ChangeOperation,
  pub old: Option<Value>,
  pub new: Option<Value>,
  pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
  pub fn channel(&self) -> &str {
    &self.table
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
  Subscribe { channel: String },
  Unsubscribe { channel: String },
  Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
  Connected,
  Subscribed {
    channel: String,
  },
  Unsubscribed {
    channel: String,
  },
  Pong,
  Change {
    channel: String,
    #[serde(flatten)]
    event: ChangeEvent,
  },
  Error {
    message: String,
  },
}

impl ServerMessage {
  pub fn change(event: ChangeEvent) -> Self {
    Self::Change {
      channel: event.table.clone(),
      event,
    }
  }

  pub fn error(message: impl Into<String>) -> Self {
    Self::Error {
      message: message.into(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn client_messages_parse() {
    let msg: ClientMessage =
      serde_json::from_str(r#"{"type":"subscribe","channel":"public.orders"}"#).unwrap();
    assert!(matches!(msg, ClientMessage::Subscribe { channel } if channel == "public.orders"));

    let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
    assert!(matches!(msg, ClientMessage::Ping));
  }

  #[test]
  fn change_message_wire_shape() {
    let event = ChangeEvent {
      table: "public.orders".into(),
      operation: ChangeOperation::Insert,
      old: None,
      new: Some(serde_json::json!({ "id": 1 })),
      timestamp: "2026-01-05T10:00:00Z".parse().unwrap(),
    };
    let wire = serde_json::to_value(ServerMessage::change(event)).unwrap();
    assert_eq!(wire["type"], "change");
    assert_eq!(wire["channel"], "public.orders");
    assert_eq!(wire["table"], "public.orders");
    assert_eq!(wire["operation"], "INSERT");
    assert_eq!(wire["new"]["id"], 1);
  }

  #[test]
  fn notification_payload_parses() {
    let payload = r#"{
      "table": "public.orders",
      "operation": "UPDATE",
      "old": {"id": 1, "status": "new"},
      "new": {"id": 1, "status": "paid"},
      "timestamp": "2026-01-05T10:00:00.123456+00:00"
    }"#;
    let event: ChangeEvent = serde_json::from_str(payload).unwrap();
    assert_eq!(event.operation, ChangeOperation::Update);
    assert_eq!(event.channel(), "public.orders");
  }

  #[test]
  fn malformed_payload_is_an_error() {
    assert!(serde_json::from_str::<ChangeEvent>("{not json").is_err());
    assert!(serde_json::from_str::<ChangeEvent>(r#"{"table":"t"}"#).is_err());
  }
}
