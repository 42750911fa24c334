use serde::{Deserialize, Serialize};
use std::path::Path;

/// Expand environment variables in a string.
/// Supports $VAR_NAME and ${VAR_NAME} syntax.
fn expand_env_vars(input: &str) -> String {
  let mut result = input.to_string();

  // Handle ${VAR_NAME} syntax first (more specific)
  while let Some(start) = result.find("${") {
    if let Some(end) = result[start..].find('}') {
      let var_name = &result[start + 2..start + end];
      let value = std::env::var(var_name).unwrap_or_default();
      result = format!("{}{}{}", &result[..start], value, &result[start + end + 1..]);
    } else {
      break;
    }
  }

  // Handle $VAR_NAME syntax (word boundary: alphanumeric + underscore)
  let mut i = 0;
  while i < result.len() {
    if result[i..].starts_with('$') && !result[i..].starts_with("${") {
      let rest = &result[i + 1..];
      let var_len = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .count();
      if var_len > 0 {
        let var_name = &rest[..var_len];
        let value = std::env::var(var_name).unwrap_or_default();
        result = format!("{}{}{}", &result[..i], value, &rest[var_len..]);
        i += value.len();
        continue;
      }
    }
    i += 1;
  }

  result
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
  #[serde(default)]
  pub server: ServerSection,
  #[serde(default)]
  pub postgres: PostgresSection,
  #[serde(default)]
  pub backup: BackupSection,
  #[serde(default)]
  pub query: QuerySection,
  #[serde(default)]
  pub auth: AuthSection,
  #[serde(default)]
  pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
  #[serde(default = "default_host")]
  pub host: String,
  #[serde(default = "default_port")]
  pub port: u16,
  /// CORS allowed origins. ["*"] is permissive mode for development.
  #[serde(default = "default_cors")]
  pub cors_origins: Vec<String>,
}

fn default_host() -> String {
  "0.0.0.0".into()
}
fn default_port() -> u16 {
  8080
}
fn default_cors() -> Vec<String> {
  vec!["*".to_string()]
}

impl Default for ServerSection {
  fn default() -> Self {
    Self {
      host: default_host(),
      port: default_port(),
      cors_origins: default_cors(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresSection {
  #[serde(default = "default_pg_host")]
  pub host: String,
  #[serde(default = "default_pg_port")]
  pub port: u16,
  #[serde(default = "default_pg_user")]
  pub user: String,
  #[serde(default)]
  pub password: String,
  /// Default database: the realtime listener attaches here, and it serves
  /// as the admin database for cluster-wide catalog queries.
  #[serde(default = "default_pg_database")]
  pub database: String,
  #[serde(default = "default_pool_size")]
  pub pool_size: usize,
}

fn default_pg_host() -> String {
  "localhost".into()
}
fn default_pg_port() -> u16 {
  5432
}
fn default_pg_user() -> String {
  "postgres".into()
}
fn default_pg_database() -> String {
  "postgres".into()
}
fn default_pool_size() -> usize {
  20
}

impl Default for PostgresSection {
  fn default() -> Self {
    Self {
      host: default_pg_host(),
      port: default_pg_port(),
      user: default_pg_user(),
      password: String::new(),
      database: default_pg_database(),
      pool_size: default_pool_size(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSection {
  #[serde(default = "default_backup_dir")]
  pub directory: String,
  /// Dump/restore child processes are killed past this bound.
  #[serde(default = "default_backup_timeout")]
  pub timeout_secs: u64,
}

fn default_backup_dir() -> String {
  "./backups".into()
}
fn default_backup_timeout() -> u64 {
  3600
}

impl Default for BackupSection {
  fn default() -> Self {
    Self {
      directory: default_backup_dir(),
      timeout_secs: default_backup_timeout(),
    }
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuerySection {
  /// Reject unknown filter operators/columns instead of dropping them.
  #[serde(default)]
  pub strict_filters: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSection {
  #[serde(default)]
  pub enabled: bool,
  #[serde(default)]
  pub admin_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
  #[serde(default = "default_level")]
  pub level: String,
}
fn default_level() -> String {
  "info".into()
}
impl Default for LoggingSection {
  fn default() -> Self {
    Self {
      level: default_level(),
    }
  }
}

impl ServerConfig {
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
    let content = std::fs::read_to_string(&path)?;
    let expanded = expand_env_vars(&content);
    Ok(serde_yaml::from_str(&expanded)?)
  }

  pub fn find_and_load() -> Result<Option<Self>, anyhow::Error> {
    for p in ["pgward.yaml", "pgward.yml"] {
      if Path::new(p).exists() {
        tracing::info!("Loading config from {}", p);
        return Ok(Some(Self::from_file(p)?));
      }
    }
    Ok(None)
  }

  pub fn address(&self) -> String {
    format!("{}:{}", self.server.host, self.server.port)
  }
}
