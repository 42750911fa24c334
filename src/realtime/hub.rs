//! Subscriber bookkeeping and fanout.
//!
//! The hub holds one outbound sender per connected client and a reverse
//! index from channel to subscriber set, so fanout is O(subscribers of that
//! channel), not O(all connections). Fanout reads vastly outnumber
//! subscription writes, hence the read-write lock.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use super::protocol::{ChangeEvent, ServerMessage};
use crate::db::sanitize::is_safe_identifier;

/// Pre-serialized frames go out per client through an unbounded channel; the
/// WebSocket task on the other end owns the actual socket write.
pub type Outbound = mpsc::UnboundedSender<String>;

#[derive(Default)]
pub struct SubscriptionHub {
  clients: RwLock<HashMap<Uuid, Outbound>>,
  /// channel -> subscribed clients
  channels: RwLock<HashMap<String, HashSet<Uuid>>>,
  /// client -> channels it subscribed to (for O(1) disconnect cleanup)
  memberships: RwLock<HashMap<Uuid, HashSet<String>>>,
}

/// A channel key is `schema.table`, both parts valid identifiers.
pub fn is_valid_channel(channel: &str) -> bool {
  match channel.split_once('.') {
    Some((schema, table)) => is_safe_identifier(schema) && is_safe_identifier(table),
    None => false,
  }
}

impl SubscriptionHub {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&self, client: Uuid, tx: Outbound) {
    self.clients.write().insert(client, tx);
  }

  pub fn subscribe(&self, client: Uuid, channel: &str) -> bool {
    if !is_valid_channel(channel) {
      return false;
    }
    self
      .channels
      .write()
      .entry(channel.to_string())
      .or_default()
      .insert(client);
    self
      .memberships
      .write()
      .entry(client)
      .or_default()
      .insert(channel.to_string());
    true
  }

  pub fn unsubscribe(&self, client: Uuid, channel: &str) {
    let mut channels = self.channels.write();
    if let Some(subscribers) = channels.get_mut(channel) {
      subscribers.remove(&client);
      if subscribers.is_empty() {
        channels.remove(channel);
      }
    }
    if let Some(membership) = self.memberships.write().get_mut(&client) {
      membership.remove(channel);
    }
  }

  /// Removes the client from every channel's subscriber set. Called on
  /// disconnect; repeated connect/disconnect cycles leave nothing behind.
  pub fn remove_client(&self, client: Uuid) {
    self.clients.write().remove(&client);
    if let Some(channels_joined) = self.memberships.write().remove(&client) {
      let mut channels = self.channels.write();
      for channel in channels_joined {
        if let Some(subscribers) = channels.get_mut(&channel) {
          subscribers.remove(&client);
          if subscribers.is_empty() {
            channels.remove(&channel);
          }
        }
      }
    }
  }

  /// Serializes the change once and writes it to every live subscriber of
  /// its channel. Dead senders (half-closed sockets) are swept afterwards.
  pub fn broadcast(&self, event: &ChangeEvent) {
    let subscribers: Vec<Uuid> = {
      let channels = self.channels.read();
      match channels.get(event.channel()) {
        Some(set) => set.iter().copied().collect(),
        None => return,
      }
    };

    let frame = match serde_json::to_string(&ServerMessage::change(event.clone())) {
      Ok(s) => s,
      Err(e) => {
        tracing::error!("failed to serialize change event: {}", e);
        return;
      }
    };

    let mut dead = Vec::new();
    {
      let clients = self.clients.read();
      for id in subscribers {
        match clients.get(&id) {
          Some(tx) if tx.send(frame.clone()).is_ok() => {}
          _ => dead.push(id),
        }
      }
    }
    for id in dead {
      self.remove_client(id);
    }
  }

  /// Drains the listener's broadcast stream into per-client fanout. Lagged
  /// receivers skip ahead rather than killing the task.
  pub async fn run(&self, mut rx: broadcast::Receiver<ChangeEvent>) {
    loop {
      match rx.recv().await {
        Ok(event) => self.broadcast(&event),
        Err(broadcast::error::RecvError::Lagged(missed)) => {
          tracing::warn!("change fanout lagging, {} events dropped", missed);
        }
        Err(broadcast::error::RecvError::Closed) => break,
      }
    }
  }

  pub fn subscriber_count(&self, channel: &str) -> usize {
    self
      .channels
      .read()
      .get(channel)
      .map(|s| s.len())
      .unwrap_or(0)
  }

  pub fn client_count(&self) -> usize {
    self.clients.read().len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::realtime::protocol::ChangeOperation;

  fn event(table: &str) -> ChangeEvent {
    ChangeEvent {
      table: table.to_string(),
      operation: ChangeOperation::Insert,
      old: None,
      new: Some(serde_json::json!({ "id": 1 })),
      timestamp: chrono::Utc::now(),
    }
  }

  #[test]
  fn channel_grammar() {
    assert!(is_valid_channel("public.orders"));
    assert!(!is_valid_channel("orders"));
    assert!(!is_valid_channel("public.orders; DROP"));
    assert!(!is_valid_channel(".orders"));
    assert!(!is_valid_channel("public."));
  }

  #[tokio::test]
  async fn fanout_reaches_only_subscribers() {
    let hub = SubscriptionHub::new();
    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    hub.register(a, tx_a);
    hub.register(b, tx_b);
    assert!(hub.subscribe(a, "public.orders"));
    assert!(hub.subscribe(b, "public.customers"));

    hub.broadcast(&event("public.orders"));

    let frame = rx_a.try_recv().unwrap();
    assert!(frame.contains("\"operation\":\"INSERT\""));
    assert!(rx_b.try_recv().is_err());
  }

  #[tokio::test]
  async fn disconnect_purges_every_channel() {
    let hub = SubscriptionHub::new();
    let (tx, _rx) = mpsc::unbounded_channel();
    let id = Uuid::new_v4();
    hub.register(id, tx);
    hub.subscribe(id, "public.orders");
    hub.subscribe(id, "public.customers");
    assert_eq!(hub.subscriber_count("public.orders"), 1);

    hub.remove_client(id);
    assert_eq!(hub.subscriber_count("public.orders"), 0);
    assert_eq!(hub.subscriber_count("public.customers"), 0);
    assert_eq!(hub.client_count(), 0);
  }

  #[tokio::test]
  async fn repeated_cycles_do_not_accumulate() {
    let hub = SubscriptionHub::new();
    for _ in 0..100 {
      let (tx, _rx) = mpsc::unbounded_channel();
      let id = Uuid::new_v4();
      hub.register(id, tx);
      hub.subscribe(id, "public.orders");
      hub.remove_client(id);
    }
    assert_eq!(hub.client_count(), 0);
    assert_eq!(hub.subscriber_count("public.orders"), 0);
  }

  #[tokio::test]
  async fn dead_senders_are_swept_on_broadcast() {
    let hub = SubscriptionHub::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let id = Uuid::new_v4();
    hub.register(id, tx);
    hub.subscribe(id, "public.orders");
    drop(rx);

    hub.broadcast(&event("public.orders"));
    assert_eq!(hub.client_count(), 0);
    assert_eq!(hub.subscriber_count("public.orders"), 0);
  }

  #[tokio::test]
  async fn unsubscribe_is_selective() {
    let hub = SubscriptionHub::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = Uuid::new_v4();
    hub.register(id, tx);
    hub.subscribe(id, "public.orders");
    hub.subscribe(id, "public.customers");
    hub.unsubscribe(id, "public.orders");

    hub.broadcast(&event("public.orders"));
    assert!(rx.try_recv().is_err());
    hub.broadcast(&event("public.customers"));
    assert!(rx.try_recv().is_ok());
  }
}
