//! Daemon wiring: builds the engine components once at process start and
//! passes them by reference to everything that needs them.

use std::sync::Arc;

use tokio::sync::broadcast;

use super::config::ServerConfig;
use super::routes::{self, AppState};
use crate::audit::{Auditor, TracingAuditor};
use crate::auth::StaticTokenAuth;
use crate::backup::BackupService;
use crate::db::PoolRegistry;
use crate::realtime::{ChangeEvent, ChangeListener, SubscriptionHub};

pub struct Daemon {
  config: ServerConfig,
  registry: Arc<PoolRegistry>,
  hub: Arc<SubscriptionHub>,
  backups: Arc<BackupService>,
  auditor: Arc<dyn Auditor>,
  change_tx: broadcast::Sender<ChangeEvent>,
  shutdown_tx: broadcast::Sender<()>,
}

impl Daemon {
  pub fn new(config: ServerConfig) -> Self {
    let registry = Arc::new(PoolRegistry::new(config.postgres.clone()));
    let backups = Arc::new(BackupService::new(&config.backup, config.postgres.clone()));
    let (change_tx, _) = broadcast::channel(1024);
    let (shutdown_tx, _) = broadcast::channel(1);
    Self {
      config,
      registry,
      hub: Arc::new(SubscriptionHub::new()),
      backups,
      auditor: Arc::new(TracingAuditor),
      change_tx,
      shutdown_tx,
    }
  }

  /// Trigger graceful shutdown.
  pub fn shutdown(&self) {
    tracing::info!("initiating graceful shutdown");
    let _ = self.shutdown_tx.send(());
  }

  pub async fn run(&self) -> Result<(), anyhow::Error> {
    // Dedicated LISTEN connection, independent of the request pools.
    let listen_config = self
      .registry
      .conn_config(self.registry.default_database())?;
    ChangeListener::new(listen_config, self.change_tx.clone()).spawn();

    // Fanout task drains listener events into per-client sends.
    let hub = self.hub.clone();
    let change_rx = self.change_tx.subscribe();
    tokio::spawn(async move {
      hub.run(change_rx).await;
    });

    let state = AppState {
      registry: self.registry.clone(),
      hub: self.hub.clone(),
      backups: self.backups.clone(),
      auditor: self.auditor.clone(),
      auth: Arc::new(StaticTokenAuth::new(&self.config.auth)),
      strict_filters: self.config.query.strict_filters,
    };
    let app = routes::router(state, &self.config);

    let addr = self.config.address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("pgward listening on {}", addr);

    let mut shutdown_rx = self.shutdown_tx.subscribe();
    axum::serve(
      listener,
      app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
      let _ = shutdown_rx.recv().await;
    })
    .await?;

    self.registry.shutdown_all();
    tracing::info!("shutdown complete");
    Ok(())
  }
}
