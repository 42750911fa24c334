//! The dedicated LISTEN connection.
//!
//! One long-lived connection per cluster listens on a fixed channel and
//! feeds parsed change events into a broadcast stream the hub drains.
//! Malformed payloads are logged and dropped; a broken connection is retried
//! with a short backoff.

use std::time::Duration;

use futures_util::future::poll_fn;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_postgres::{AsyncMessage, NoTls};

use super::protocol::ChangeEvent;

/// The NOTIFY channel the trigger function targets.
pub const NOTIFY_CHANNEL: &str = "pgward_changes";

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub struct ChangeListener {
  config: tokio_postgres::Config,
  events: broadcast::Sender<ChangeEvent>,
}

impl ChangeListener {
  pub fn new(config: tokio_postgres::Config, events: broadcast::Sender<ChangeEvent>) -> Self {
    Self { config, events }
  }

  /// Spawns the listener task. It owns the dedicated connection and keeps
  /// reconnecting for the life of the process.
  pub fn spawn(self) -> JoinHandle<()> {
    tokio::spawn(async move {
      loop {
        match self.run_connection().await {
          Ok(()) => tracing::warn!("notification connection closed, reconnecting"),
          Err(e) => tracing::error!("notification connection failed: {e:#}"),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
      }
    })
  }

  async fn run_connection(&self) -> Result<(), anyhow::Error> {
    let (client, mut connection) = self.config.connect(NoTls).await?;

    // The connection future must be polled for LISTEN to take effect, and
    // notifications only surface through poll_message.
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let poll_task = tokio::spawn(async move {
      loop {
        match poll_fn(|cx| connection.poll_message(cx)).await {
          Some(Ok(AsyncMessage::Notification(n))) => {
            let _ = tx.send(n.payload().to_string());
          }
          Some(Ok(_)) => {}
          Some(Err(e)) => {
            tracing::error!("notification stream error: {}", e);
            break;
          }
          None => break,
        }
      }
    });

    client
      .batch_execute(&format!("LISTEN {NOTIFY_CHANNEL}"))
      .await?;
    tracing::info!("listening for row changes on '{NOTIFY_CHANNEL}'");

    while let Some(payload) = rx.recv().await {
      match serde_json::from_str::<ChangeEvent>(&payload) {
        Ok(event) => {
          // No receivers is fine: nobody is subscribed right now.
          let _ = self.events.send(event);
        }
        Err(e) => tracing::warn!("dropping malformed change payload: {}", e),
      }
    }

    // Keep the client alive until the stream ends; dropping it earlier
    // would close the connection underneath the poll task.
    drop(client);
    let _ = poll_task.await;
    Ok(())
  }
}
