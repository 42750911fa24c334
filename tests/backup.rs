//! Backup orchestration tests: argument construction, filename layout and
//! safety checks. Nothing here talks to a database or runs the dump tools.

use std::path::Path;
use std::sync::Arc;

use pgward::audit::{AuditEvent, AuditHook, Auditor};
use pgward::backup::{parse_backup_filename, BackupFormat, BackupOptions, BackupService, RestoreOptions};
use pgward::error::EngineError;
use pgward::server::config::{BackupSection, PostgresSection};

struct NullAuditor;
impl Auditor for NullAuditor {
  fn log(&self, _event: AuditEvent) {}
}

fn hook() -> AuditHook {
  AuditHook::new(Arc::new(NullAuditor), "tests", None)
}

fn service(dir: &Path) -> BackupService {
  BackupService::new(
    &BackupSection {
      directory: dir.to_string_lossy().into_owned(),
      timeout_secs: 30,
    },
    PostgresSection {
      host: "db.internal".into(),
      port: 5433,
      user: "admin".into(),
      password: "s3cret".into(),
      database: "postgres".into(),
      pool_size: 4,
    },
  )
}

#[test]
fn dump_args_cover_option_combinations() {
  let dir = tempfile::tempdir().unwrap();
  let svc = service(dir.path());
  let file = dir.path().join("sales_20260107T101500.dump");

  let args = svc.dump_args(
    "sales",
    &file,
    &BackupOptions {
      format: BackupFormat::Custom,
      schema_only: false,
      data_only: false,
      compress: false,
    },
  );
  assert!(args.windows(2).any(|w| w[0] == "-h" && w[1] == "db.internal"));
  assert!(args.windows(2).any(|w| w[0] == "-p" && w[1] == "5433"));
  assert!(args.windows(2).any(|w| w[0] == "-d" && w[1] == "sales"));
  assert!(args.windows(2).any(|w| w[0] == "-F" && w[1] == "c"));
  assert!(args.contains(&"--no-password".to_string()));

  let args = svc.dump_args(
    "sales",
    &file,
    &BackupOptions {
      format: BackupFormat::Plain,
      schema_only: true,
      data_only: false,
      compress: true,
    },
  );
  assert!(args.windows(2).any(|w| w[0] == "-F" && w[1] == "p"));
  assert!(args.contains(&"--schema-only".to_string()));
  assert!(args.contains(&"--compress=6".to_string()));

  let args = svc.dump_args(
    "sales",
    &file,
    &BackupOptions {
      format: BackupFormat::Tar,
      schema_only: false,
      data_only: true,
      compress: false,
    },
  );
  assert!(args.windows(2).any(|w| w[0] == "-F" && w[1] == "t"));
  assert!(args.contains(&"--data-only".to_string()));
  // compress only applies to plain format
  assert!(!args.iter().any(|a| a.starts_with("--compress")));
}

#[test]
fn password_never_appears_in_argument_vectors() {
  let dir = tempfile::tempdir().unwrap();
  let svc = service(dir.path());
  let file = dir.path().join("sales_20260107T101500.sql");

  let dump = svc.dump_args("sales", &file, &BackupOptions::default());
  let restore = svc.restore_args("sales", &file, true);
  let psql = svc.psql_args("sales", Some(&file));
  for args in [dump, restore, psql] {
    assert!(
      !args.iter().any(|a| a.contains("s3cret")),
      "password leaked into {args:?}"
    );
  }
}

#[test]
fn restore_args_include_clean_only_when_asked() {
  let dir = tempfile::tempdir().unwrap();
  let svc = service(dir.path());
  let file = dir.path().join("sales_20260107T101500.dump");

  let args = svc.restore_args("sales", &file, false);
  assert!(!args.contains(&"--clean".to_string()));

  let args = svc.restore_args("sales", &file, true);
  assert!(args.contains(&"--clean".to_string()));
  assert!(args.contains(&"--if-exists".to_string()));
}

#[test]
fn psql_args_stop_on_error() {
  let dir = tempfile::tempdir().unwrap();
  let svc = service(dir.path());
  let args = svc.psql_args("sales", None);
  assert!(args.windows(2).any(|w| w[0] == "-v" && w[1] == "ON_ERROR_STOP=1"));
  assert!(!args.contains(&"-f".to_string()));
}

#[test]
fn filename_layout_round_trips() {
  let (db, ts, format) = parse_backup_filename("sales_20260107T101500.sql").unwrap();
  assert_eq!(db, "sales");
  assert_eq!(format, "plain");
  assert_eq!(ts.format("%Y%m%dT%H%M%S").to_string(), "20260107T101500");

  let (_, _, format) = parse_backup_filename("sales_20260107T101500.sql.gz").unwrap();
  assert_eq!(format, "plain-gzip");
  let (_, _, format) = parse_backup_filename("sales_20260107T101500.dump").unwrap();
  assert_eq!(format, "custom");
  let (_, _, format) = parse_backup_filename("sales_20260107T101500.tar").unwrap();
  assert_eq!(format, "tar");

  // database names may themselves contain underscores
  let (db, _, _) = parse_backup_filename("sales_eu_west_20260107T101500.dump").unwrap();
  assert_eq!(db, "sales_eu_west");

  assert!(parse_backup_filename("notes.txt").is_none());
  assert!(parse_backup_filename("no-timestamp.sql").is_none());
}

#[test]
fn same_second_backups_differ_by_extension() {
  // plain vs custom for the same database and timestamp collide on the stem
  // but never on the full filename
  let plain = "sales_20260107T101500.sql";
  let custom = "sales_20260107T101500.dump";
  assert_ne!(plain, custom);
  let (db_a, ts_a, _) = parse_backup_filename(plain).unwrap();
  let (db_b, ts_b, _) = parse_backup_filename(custom).unwrap();
  assert_eq!(db_a, db_b);
  assert_eq!(ts_a, ts_b);
}

#[tokio::test]
async fn restore_rejects_traversal_before_touching_disk() {
  let dir = tempfile::tempdir().unwrap();
  let svc = service(dir.path());
  for name in ["../evil.sql", "a/b.sql", "..", "nested\\evil.sql", ".hidden.sql", ""] {
    let result = svc
      .restore_backup("sales", name, &RestoreOptions::default(), &hook())
      .await;
    assert!(
      matches!(result, Err(EngineError::Validation(_))),
      "accepted {name:?}"
    );
  }
}

#[tokio::test]
async fn restore_missing_file_is_not_found() {
  let dir = tempfile::tempdir().unwrap();
  let svc = service(dir.path());
  let result = svc
    .restore_backup("sales", "sales_20260107T101500.dump", &RestoreOptions::default(), &hook())
    .await;
  assert!(matches!(result, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn restore_rejects_bad_database_names() {
  let dir = tempfile::tempdir().unwrap();
  let svc = service(dir.path());
  let result = svc
    .restore_backup("sales; DROP", "x.sql", &RestoreOptions::default(), &hook())
    .await;
  assert!(matches!(result, Err(EngineError::Validation(_))));
}

#[tokio::test]
async fn listing_missing_directory_means_no_backups() {
  let svc = service(Path::new("/nonexistent/backups"));
  let backups = svc.list_backups(None).await.unwrap();
  assert!(backups.is_empty());
}

#[tokio::test]
async fn listing_filters_by_database_and_sorts_newest_first() {
  let dir = tempfile::tempdir().unwrap();
  for name in [
    "sales_20260105T090000.dump",
    "sales_20260107T101500.sql",
    "billing_20260106T120000.tar",
    "README.md",
  ] {
    std::fs::write(dir.path().join(name), b"data").unwrap();
  }
  let svc = service(dir.path());

  let all = svc.list_backups(None).await.unwrap();
  assert_eq!(all.len(), 3);
  assert_eq!(all[0].filename, "sales_20260107T101500.sql");
  assert_eq!(all[0].size_bytes, 4);

  let sales = svc.list_backups(Some("sales")).await.unwrap();
  assert_eq!(sales.len(), 2);
  assert!(sales.iter().all(|b| b.database == "sales"));
}

#[tokio::test]
async fn delete_checks_filename_and_existence() {
  let dir = tempfile::tempdir().unwrap();
  let svc = service(dir.path());

  let result = svc.delete_backup("../../etc/passwd", &hook()).await;
  assert!(matches!(result, Err(EngineError::Validation(_))));

  let result = svc.delete_backup("sales_20260107T101500.sql", &hook()).await;
  assert!(matches!(result, Err(EngineError::NotFound(_))));

  std::fs::write(dir.path().join("sales_20260107T101500.sql"), b"-- dump").unwrap();
  svc
    .delete_backup("sales_20260107T101500.sql", &hook())
    .await
    .unwrap();
  assert!(!dir.path().join("sales_20260107T101500.sql").exists());
}

#[tokio::test]
async fn create_rejects_contradictory_options() {
  let dir = tempfile::tempdir().unwrap();
  let svc = service(dir.path());
  let result = svc
    .create_backup(
      "sales",
      &BackupOptions {
        schema_only: true,
        data_only: true,
        ..Default::default()
      },
      &hook(),
    )
    .await;
  assert!(matches!(result, Err(EngineError::Validation(_))));

  let result = svc
    .create_backup("sales; DROP", &BackupOptions::default(), &hook())
    .await;
  assert!(matches!(result, Err(EngineError::Validation(_))));
}
