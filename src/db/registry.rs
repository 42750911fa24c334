//! Per-database connection pool registry.
//!
//! One pool exists per logical database name for the life of the process.
//! Pool construction is lazy and does not open connections; the first query
//! through a pool is where connection failures surface.

use std::collections::HashMap;
use std::sync::Arc;

use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use parking_lot::RwLock;
use tokio_postgres::NoTls;

use crate::db::sanitize::is_safe_identifier;
use crate::error::EngineError;
use crate::server::config::PostgresSection;

pub struct PoolRegistry {
  base: PostgresSection,
  pools: RwLock<HashMap<String, Arc<Pool>>>,
}

impl PoolRegistry {
  pub fn new(base: PostgresSection) -> Self {
    Self {
      base,
      pools: RwLock::new(HashMap::new()),
    }
  }

  /// Returns the cached pool for `database`, creating it on first access.
  /// Reads take the read lock; only the create-if-absent path writes.
  pub fn get_or_create(&self, database: &str) -> Result<Arc<Pool>, EngineError> {
    if !is_safe_identifier(database) {
      return Err(EngineError::validation(format!(
        "invalid database name: {database:?}"
      )));
    }

    if let Some(pool) = self.pools.read().get(database) {
      return Ok(pool.clone());
    }

    let mut pools = self.pools.write();
    // Re-check under the write lock: another request may have won the race.
    if let Some(pool) = pools.get(database) {
      return Ok(pool.clone());
    }

    let pool = Arc::new(self.build_pool(database)?);
    pools.insert(database.to_string(), pool.clone());
    tracing::info!("created connection pool for database {}", database);
    Ok(pool)
  }

  fn build_pool(&self, database: &str) -> Result<Pool, EngineError> {
    let mut cfg = Config::new();
    cfg.host = Some(self.base.host.clone());
    cfg.port = Some(self.base.port);
    cfg.user = Some(self.base.user.clone());
    cfg.password = Some(self.base.password.clone());
    cfg.dbname = Some(database.to_string());
    cfg.manager = Some(ManagerConfig {
      recycling_method: RecyclingMethod::Fast,
    });
    cfg.pool = Some(deadpool_postgres::PoolConfig::new(self.base.pool_size));
    cfg
      .create_pool(Some(Runtime::Tokio1), NoTls)
      .map_err(|e| EngineError::Internal(anyhow::anyhow!("pool construction failed: {e}")))
  }

  /// The default database configured for the cluster (used by the realtime
  /// listener and as the fallback admin database).
  pub fn default_database(&self) -> &str {
    &self.base.database
  }

  /// Connection parameters for components that open their own connections
  /// (the realtime listener). The dump tools get discrete args instead.
  pub fn conn_config(&self, database: &str) -> Result<tokio_postgres::Config, EngineError> {
    if !is_safe_identifier(database) {
      return Err(EngineError::validation(format!(
        "invalid database name: {database:?}"
      )));
    }
    let mut cfg = tokio_postgres::Config::new();
    cfg
      .host(&self.base.host)
      .port(self.base.port)
      .user(&self.base.user)
      .password(&self.base.password)
      .dbname(database);
    Ok(cfg)
  }

  /// Closes every pool. Close failures cannot block the others: deadpool
  /// close is synchronous and infallible, so this drains the whole map.
  pub fn shutdown_all(&self) {
    let mut pools = self.pools.write();
    for (name, pool) in pools.drain() {
      pool.close();
      tracing::info!("closed connection pool for database {}", name);
    }
  }

  #[cfg(test)]
  fn len(&self) -> usize {
    self.pools.read().len()
  }
}
