//! Trigger wiring for change notifications.
//!
//! Nothing here runs automatically: making a table's changes flow into the
//! notification channel is an explicit per-table opt-in via
//! [`enable_table`], reversed by [`disable_table`].

use deadpool_postgres::Pool;

use super::listener::NOTIFY_CHANNEL;
use crate::audit::AuditHook;
use crate::db::sanitize::{quote_ident, quote_qualified};
use crate::error::EngineError;

/// Name of the shared trigger function installed once per database.
pub const NOTIFY_FUNCTION: &str = "pgward_notify_change";

const TRIGGER_PREFIX: &str = "pgward_changes_";

/// The trigger function: builds the JSON change payload and notifies the
/// fixed channel. Payloads that would exceed the NOTIFY size limit drop the
/// row images and keep the envelope.
pub fn notify_function_sql() -> String {
  format!(
    r#"CREATE OR REPLACE FUNCTION {NOTIFY_FUNCTION}() RETURNS TRIGGER AS $$
DECLARE
    payload TEXT;
BEGIN
    payload := json_build_object(
        'table', TG_TABLE_SCHEMA || '.' || TG_TABLE_NAME,
        'operation', TG_OP,
        'old', CASE WHEN TG_OP = 'INSERT' THEN NULL ELSE row_to_json(OLD) END,
        'new', CASE WHEN TG_OP = 'DELETE' THEN NULL ELSE row_to_json(NEW) END,
        'timestamp', now()
    )::text;
    -- NOTIFY payloads are capped at 8000 bytes; oversized rows keep the envelope only.
    IF octet_length(payload) > 7800 THEN
        payload := json_build_object(
            'table', TG_TABLE_SCHEMA || '.' || TG_TABLE_NAME,
            'operation', TG_OP,
            'old', NULL,
            'new', NULL,
            'timestamp', now()
        )::text;
    END IF;
    PERFORM pg_notify('{NOTIFY_CHANNEL}', payload);
    RETURN NEW;
END;
$$ LANGUAGE plpgsql"#
  )
}

fn trigger_name(table: &str) -> String {
  let mut name = format!("{TRIGGER_PREFIX}{table}");
  name.truncate(crate::db::sanitize::MAX_IDENTIFIER_LENGTH);
  name
}

/// Statement attaching the notification trigger to one table.
pub fn create_trigger_sql(schema: &str, table: &str) -> Result<String, EngineError> {
  let target = quote_qualified(schema, table)?;
  let trigger = quote_ident(&trigger_name(table))?;
  Ok(format!(
    "CREATE TRIGGER {trigger} AFTER INSERT OR UPDATE OR DELETE ON {target} \
     FOR EACH ROW EXECUTE FUNCTION {NOTIFY_FUNCTION}()"
  ))
}

/// Statement removing the notification trigger from one table.
pub fn drop_trigger_sql(schema: &str, table: &str) -> Result<String, EngineError> {
  let target = quote_qualified(schema, table)?;
  let trigger = quote_ident(&trigger_name(table))?;
  Ok(format!("DROP TRIGGER IF EXISTS {trigger} ON {target}"))
}

/// Installs the trigger function (idempotent) and the per-table trigger.
pub async fn enable_table(
  pool: &Pool,
  database: &str,
  schema: &str,
  table: &str,
  hook: &AuditHook,
) -> Result<(), EngineError> {
  let drop_first = drop_trigger_sql(schema, table)?;
  let create = create_trigger_sql(schema, table)?;
  let client = pool.get().await?;
  client.batch_execute(&notify_function_sql()).await?;
  client.batch_execute(&drop_first).await?;
  client.batch_execute(&create).await?;
  hook.emit(
    "realtime.enable",
    format!("{database}.{schema}.{table}"),
    None,
  );
  Ok(())
}

pub async fn disable_table(
  pool: &Pool,
  database: &str,
  schema: &str,
  table: &str,
  hook: &AuditHook,
) -> Result<(), EngineError> {
  let sql = drop_trigger_sql(schema, table)?;
  pool.get().await?.batch_execute(&sql).await?;
  hook.emit(
    "realtime.disable",
    format!("{database}.{schema}.{table}"),
    None,
  );
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn function_notifies_the_fixed_channel() {
    let sql = notify_function_sql();
    assert!(sql.contains("pg_notify('pgward_changes'"));
    assert!(sql.contains("TG_TABLE_SCHEMA || '.' || TG_TABLE_NAME"));
    assert!(sql.contains("row_to_json(NEW)"));
  }

  #[test]
  fn trigger_statements_quote_identifiers() {
    let sql = create_trigger_sql("public", "orders").unwrap();
    assert!(sql.contains("ON \"public\".\"orders\""));
    assert!(sql.contains("\"pgward_changes_orders\""));
    assert!(drop_trigger_sql("public", "orders")
      .unwrap()
      .starts_with("DROP TRIGGER IF EXISTS"));
  }

  #[test]
  fn trigger_statements_reject_bad_names() {
    assert!(create_trigger_sql("public", "orders; DROP").is_err());
    assert!(drop_trigger_sql("pub lic", "orders").is_err());
  }
}
