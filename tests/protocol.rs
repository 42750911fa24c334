//! Wire-shape tests for the realtime protocol.

use pgward::realtime::{ChangeEvent, ChangeOperation, ClientMessage, ServerMessage};
use serde_json::json;

#[test]
fn server_messages_match_the_wire_format() {
  assert_eq!(
    serde_json::to_value(ServerMessage::Connected).unwrap(),
    json!({ "type": "connected" })
  );
  assert_eq!(
    serde_json::to_value(ServerMessage::Subscribed {
      channel: "public.orders".into()
    })
    .unwrap(),
    json!({ "type": "subscribed", "channel": "public.orders" })
  );
  assert_eq!(
    serde_json::to_value(ServerMessage::Unsubscribed {
      channel: "public.orders".into()
    })
    .unwrap(),
    json!({ "type": "unsubscribed", "channel": "public.orders" })
  );
  assert_eq!(
    serde_json::to_value(ServerMessage::Pong).unwrap(),
    json!({ "type": "pong" })
  );
}

#[test]
fn change_message_flattens_the_event() {
  let event = ChangeEvent {
    table: "public.orders".into(),
    operation: ChangeOperation::Delete,
    old: Some(json!({ "id": 9 })),
    new: None,
    timestamp: "2026-01-05T10:00:00Z".parse().unwrap(),
  };
  let wire = serde_json::to_value(ServerMessage::change(event)).unwrap();
  assert_eq!(wire["type"], "change");
  assert_eq!(wire["channel"], "public.orders");
  assert_eq!(wire["table"], "public.orders");
  assert_eq!(wire["operation"], "DELETE");
  assert_eq!(wire["old"]["id"], 9);
  assert!(wire["new"].is_null());
  assert!(wire.get("timestamp").is_some());
}

#[test]
fn client_messages_parse_from_the_documented_shapes() {
  let subscribe: ClientMessage =
    serde_json::from_value(json!({ "type": "subscribe", "channel": "public.orders" })).unwrap();
  assert!(matches!(subscribe, ClientMessage::Subscribe { .. }));

  let unsubscribe: ClientMessage =
    serde_json::from_value(json!({ "type": "unsubscribe", "channel": "public.orders" })).unwrap();
  assert!(matches!(unsubscribe, ClientMessage::Unsubscribe { .. }));

  let ping: ClientMessage = serde_json::from_value(json!({ "type": "ping" })).unwrap();
  assert!(matches!(ping, ClientMessage::Ping));

  assert!(serde_json::from_value::<ClientMessage>(json!({ "type": "shout" })).is_err());
  assert!(serde_json::from_value::<ClientMessage>(json!({ "type": "subscribe" })).is_err());
}

#[test]
fn trigger_payloads_deserialize_for_all_operations() {
  for (op, expect) in [
    ("INSERT", ChangeOperation::Insert),
    ("UPDATE", ChangeOperation::Update),
    ("DELETE", ChangeOperation::Delete),
  ] {
    let payload = json!({
      "table": "public.orders",
      "operation": op,
      "old": null,
      "new": { "id": 1 },
      "timestamp": "2026-01-05T10:00:00.5+00:00"
    });
    let event: ChangeEvent = serde_json::from_value(payload).unwrap();
    assert_eq!(event.operation, expect);
  }
}

#[test]
fn unknown_operations_are_rejected() {
  let payload = json!({
    "table": "public.orders",
    "operation": "TRUNCATE",
    "old": null,
    "new": null,
    "timestamp": "2026-01-05T10:00:00Z"
  });
  assert!(serde_json::from_value::<ChangeEvent>(payload).is_err());
}
