//! Backup and restore orchestration over the standard Postgres dump tools.
//!
//! The dump tools open their own connections, so this service depends on the
//! connection parameters only, never on the pools. Argument vectors are
//! constructed piecewise (no shell), and the password travels exclusively via
//! `PGPASSWORD` in the child environment.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::audit::AuditHook;
use crate::db::sanitize::is_safe_identifier;
use crate::error::EngineError;
use crate::server::config::{BackupSection, PostgresSection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupFormat {
  Plain,
  #[default]
  Custom,
  Tar,
}

impl BackupFormat {
  fn format_flag(self) -> &'static str {
    match self {
      Self::Plain => "p",
      Self::Custom => "c",
      Self::Tar => "t",
    }
  }

  fn extension(self, compress: bool) -> &'static str {
    match self {
      Self::Plain if compress => "sql.gz",
      Self::Plain => "sql",
      Self::Custom => "dump",
      Self::Tar => "tar",
    }
  }

  fn label(self, compress: bool) -> &'static str {
    match self {
      Self::Plain if compress => "plain-gzip",
      Self::Plain => "plain",
      Self::Custom => "custom",
      Self::Tar => "tar",
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackupOptions {
  #[serde(default)]
  pub format: BackupFormat,
  #[serde(default)]
  pub schema_only: bool,
  #[serde(default)]
  pub data_only: bool,
  #[serde(default)]
  pub compress: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RestoreOptions {
  /// Drop existing objects before recreating them.
  #[serde(default)]
  pub clean: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupDescriptor {
  pub filename: String,
  pub database: String,
  pub size_bytes: u64,
  pub created_at: DateTime<Utc>,
  pub format: String,
}

/// Rejects anything that could escape the backup directory. Runs before any
/// filesystem access.
fn check_filename(name: &str) -> Result<(), EngineError> {
  if name.is_empty()
    || name.contains('/')
    || name.contains('\\')
    || name.contains("..")
    || name.starts_with('.')
  {
    return Err(EngineError::validation(format!(
      "unsafe backup filename: {name:?}"
    )));
  }
  Ok(())
}

/// Parses `{database}_{%Y%m%dT%H%M%S}.{ext}` back into its parts.
pub fn parse_backup_filename(name: &str) -> Option<(String, DateTime<Utc>, String)> {
  let (stem, ext) = name.split_once('.')?;
  let format = match ext {
    "sql" => "plain",
    "sql.gz" => "plain-gzip",
    "dump" => "custom",
    "tar" => "tar",
    _ => return None,
  };
  let (database, ts) = stem.rsplit_once('_')?;
  let naive = NaiveDateTime::parse_from_str(ts, "%Y%m%dT%H%M%S").ok()?;
  Some((database.to_string(), naive.and_utc(), format.to_string()))
}

pub struct BackupService {
  dir: PathBuf,
  timeout: Duration,
  pg: PostgresSection,
}

impl BackupService {
  pub fn new(backup: &BackupSection, pg: PostgresSection) -> Self {
    Self {
      dir: PathBuf::from(&backup.directory),
      timeout: Duration::from_secs(backup.timeout_secs),
      pg,
    }
  }

  fn conn_args(&self, database: &str) -> Vec<String> {
    vec![
      "-h".into(),
      self.pg.host.clone(),
      "-p".into(),
      self.pg.port.to_string(),
      "-U".into(),
      self.pg.user.clone(),
      "-d".into(),
      database.to_string(),
      "--no-password".into(),
    ]
  }

  /// pg_dump argument vector for one backup. Pure; unit-tested without
  /// touching a database.
  pub fn dump_args(&self, database: &str, file: &Path, opts: &BackupOptions) -> Vec<String> {
    let mut args = self.conn_args(database);
    args.push("-F".into());
    args.push(opts.format.format_flag().into());
    if opts.schema_only {
      args.push("--schema-only".into());
    }
    if opts.data_only {
      args.push("--data-only".into());
    }
    if opts.format == BackupFormat::Plain && opts.compress {
      args.push("--compress=6".into());
    }
    args.push("-f".into());
    args.push(file.to_string_lossy().into_owned());
    args
  }

  /// pg_restore argument vector for custom/tar archives.
  pub fn restore_args(&self, database: &str, file: &Path, clean: bool) -> Vec<String> {
    let mut args = self.conn_args(database);
    if clean {
      args.push("--clean".into());
      args.push("--if-exists".into());
    }
    args.push(file.to_string_lossy().into_owned());
    args
  }

  /// psql argument vector; `file` is None when the script arrives on stdin.
  pub fn psql_args(&self, database: &str, file: Option<&Path>) -> Vec<String> {
    let mut args = self.conn_args(database);
    args.push("-v".into());
    args.push("ON_ERROR_STOP=1".into());
    if let Some(file) = file {
      args.push("-f".into());
      args.push(file.to_string_lossy().into_owned());
    }
    args
  }

  async fn run_tool(&self, tool: &str, args: &[String]) -> Result<(), EngineError> {
    let mut cmd = Command::new(tool);
    cmd
      .args(args)
      .env("PGPASSWORD", &self.pg.password)
      .stdin(Stdio::null())
      .kill_on_drop(true);
    match tokio::time::timeout(self.timeout, cmd.output()).await {
      Err(_) => Err(EngineError::validation(format!(
        "{tool} timed out after {}s",
        self.timeout.as_secs()
      ))),
      Ok(Err(e)) => Err(EngineError::validation(format!("failed to run {tool}: {e}"))),
      Ok(Ok(output)) if !output.status.success() => Err(EngineError::validation(format!(
        "{tool} failed: {}",
        String::from_utf8_lossy(&output.stderr).trim()
      ))),
      Ok(Ok(_)) => Ok(()),
    }
  }

  pub async fn create_backup(
    &self,
    database: &str,
    opts: &BackupOptions,
    hook: &AuditHook,
  ) -> Result<BackupDescriptor, EngineError> {
    if !is_safe_identifier(database) {
      return Err(EngineError::validation(format!(
        "invalid database name: {database:?}"
      )));
    }
    if opts.schema_only && opts.data_only {
      return Err(EngineError::validation(
        "schema_only and data_only are mutually exclusive",
      ));
    }
    tokio::fs::create_dir_all(&self.dir)
      .await
      .map_err(|e| EngineError::Internal(anyhow::anyhow!("backup directory: {e}")))?;

    let created_at = Utc::now();
    let filename = format!(
      "{database}_{}.{}",
      created_at.format("%Y%m%dT%H%M%S"),
      opts.format.extension(opts.compress)
    );
    let path = self.dir.join(&filename);

    let args = self.dump_args(database, &path, opts);
    if let Err(e) = self.run_tool("pg_dump", &args).await {
      // Never leave a partial dump behind.
      let _ = tokio::fs::remove_file(&path).await;
      return Err(e);
    }

    let size_bytes = tokio::fs::metadata(&path)
      .await
      .map(|m| m.len())
      .unwrap_or(0);

    hook.emit(
      "backup.create",
      database.to_string(),
      Some(serde_json::json!({
        "filename": filename,
        "format": opts.format.label(opts.compress),
        "schema_only": opts.schema_only,
        "data_only": opts.data_only,
      })),
    );
    tracing::info!("backup created: {} ({} bytes)", filename, size_bytes);

    Ok(BackupDescriptor {
      filename,
      database: database.to_string(),
      size_bytes,
      created_at,
      format: opts.format.label(opts.compress).to_string(),
    })
  }

  pub async fn restore_backup(
    &self,
    database: &str,
    filename: &str,
    opts: &RestoreOptions,
    hook: &AuditHook,
  ) -> Result<(), EngineError> {
    if !is_safe_identifier(database) {
      return Err(EngineError::validation(format!(
        "invalid database name: {database:?}"
      )));
    }
    check_filename(filename)?;
    let path = self.dir.join(filename);
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
      return Err(EngineError::not_found(format!("backup {filename:?} not found")));
    }

    if filename.ends_with(".dump") || filename.ends_with(".tar") {
      let args = self.restore_args(database, &path, opts.clean);
      self.run_tool("pg_restore", &args).await?;
    } else if filename.ends_with(".gz") {
      self.restore_gzip(database, &path).await?;
    } else {
      let args = self.psql_args(database, Some(&path));
      self.run_tool("psql", &args).await?;
    }

    hook.emit(
      "backup.restore",
      database.to_string(),
      Some(serde_json::json!({ "filename": filename, "clean": opts.clean })),
    );
    tracing::info!("restored {} into {}", filename, database);
    Ok(())
  }

  /// Decompresses with gunzip and streams the plain SQL into psql's stdin.
  /// Two children, one async copy between them, no shell.
  async fn restore_gzip(&self, database: &str, path: &Path) -> Result<(), EngineError> {
    let mut gunzip = Command::new("gunzip")
      .arg("-c")
      .arg(path)
      .stdout(Stdio::piped())
      .stderr(Stdio::null())
      .kill_on_drop(true)
      .spawn()
      .map_err(|e| EngineError::validation(format!("failed to run gunzip: {e}")))?;

    let mut psql = Command::new("psql")
      .args(self.psql_args(database, None))
      .env("PGPASSWORD", &self.pg.password)
      .stdin(Stdio::piped())
      .stdout(Stdio::null())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()
      .map_err(|e| EngineError::validation(format!("failed to run psql: {e}")))?;

    let mut gz_out = gunzip
      .stdout
      .take()
      .ok_or_else(|| EngineError::Internal(anyhow::anyhow!("gunzip stdout unavailable")))?;
    let mut psql_in = psql
      .stdin
      .take()
      .ok_or_else(|| EngineError::Internal(anyhow::anyhow!("psql stdin unavailable")))?;

    let pipeline = async {
      tokio::io::copy(&mut gz_out, &mut psql_in).await?;
      // Close psql's stdin so it can finish.
      drop(psql_in);
      let output = psql.wait_with_output().await?;
      let _ = gunzip.wait().await;
      Ok::<_, std::io::Error>(output)
    };

    match tokio::time::timeout(self.timeout, pipeline).await {
      Err(_) => Err(EngineError::validation(format!(
        "restore timed out after {}s",
        self.timeout.as_secs()
      ))),
      Ok(Err(e)) => Err(EngineError::validation(format!("restore pipeline failed: {e}"))),
      Ok(Ok(output)) if !output.status.success() => Err(EngineError::validation(format!(
        "psql failed: {}",
        String::from_utf8_lossy(&output.stderr).trim()
      ))),
      Ok(Ok(_)) => Ok(()),
    }
  }

  /// Lists backups on disk, optionally filtered to one database. A missing
  /// or unreadable directory means "no backups yet", not a failure.
  pub async fn list_backups(
    &self,
    database: Option<&str>,
  ) -> Result<Vec<BackupDescriptor>, EngineError> {
    let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
      return Ok(Vec::new());
    };
    let mut backups = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
      let name = entry.file_name().to_string_lossy().into_owned();
      let Some((db, created_at, format)) = parse_backup_filename(&name) else {
        continue;
      };
      if let Some(wanted) = database {
        if db != wanted {
          continue;
        }
      }
      let size_bytes = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
      backups.push(BackupDescriptor {
        filename: name,
        database: db,
        size_bytes,
        created_at,
        format,
      });
    }
    backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(backups)
  }

  pub async fn delete_backup(&self, filename: &str, hook: &AuditHook) -> Result<(), EngineError> {
    check_filename(filename)?;
    let path = self.dir.join(filename);
    match tokio::fs::remove_file(&path).await {
      Ok(()) => {
        hook.emit("backup.delete", filename.to_string(), None);
        Ok(())
      }
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        Err(EngineError::not_found(format!("backup {filename:?} not found")))
      }
      Err(e) => Err(EngineError::Internal(anyhow::anyhow!("delete backup: {e}"))),
    }
  }
}
