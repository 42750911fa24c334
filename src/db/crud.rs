//! Single-row DML and the operator SQL console.
//!
//! Row lookups take an explicit key column (default `id` at the API layer):
//! the engine has no innate notion of a table's key outside introspection.

use deadpool_postgres::Pool;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_postgres::SimpleQueryMessage;

use crate::audit::AuditHook;
use crate::db::query::param_refs;
use crate::db::sanitize::{is_safe_identifier, quote_ident, quote_qualified};
use crate::db::value::{row_to_json, BindValue};
use crate::error::EngineError;

fn qualified_target(database: &str, schema: &str, table: &str) -> String {
  format!("{database}.{schema}.{table}")
}

/// Collects bindable (column, value) pairs from a JSON body, silently
/// dropping fields whose key fails identifier validation.
fn bindable_fields(
  fields: &Map<String, Value>,
) -> Result<(Vec<String>, Vec<BindValue>), EngineError> {
  let mut cols = Vec::new();
  let mut params = Vec::new();
  for (key, value) in fields {
    if !is_safe_identifier(key) {
      tracing::debug!("dropping field with invalid name: {:?}", key);
      continue;
    }
    cols.push(quote_ident(key)?);
    params.push(BindValue::from_json(value));
  }
  Ok((cols, params))
}

pub async fn insert_row(
  pool: &Pool,
  database: &str,
  schema: &str,
  table: &str,
  fields: &Map<String, Value>,
  hook: &AuditHook,
) -> Result<Value, EngineError> {
  let target = quote_qualified(schema, table)?;
  let (cols, params) = bindable_fields(fields)?;
  if cols.is_empty() {
    return Err(EngineError::validation("no valid fields to insert"));
  }
  let placeholders: Vec<String> = (1..=params.len()).map(|n| format!("${n}")).collect();
  let sql = format!(
    "INSERT INTO {target} ({}) VALUES ({}) RETURNING *",
    cols.join(", "),
    placeholders.join(", ")
  );
  let client = pool.get().await?;
  let row = client.query_one(sql.as_str(), &param_refs(&params)).await?;
  hook.emit(
    "row.insert",
    qualified_target(database, schema, table),
    None,
  );
  Ok(row_to_json(&row))
}

pub async fn update_row(
  pool: &Pool,
  database: &str,
  schema: &str,
  table: &str,
  key_column: &str,
  key: &str,
  fields: &Map<String, Value>,
  hook: &AuditHook,
) -> Result<Value, EngineError> {
  let target = quote_qualified(schema, table)?;
  let key_col = quote_ident(key_column)?;
  let (cols, mut params) = bindable_fields(fields)?;
  if cols.is_empty() {
    return Err(EngineError::validation("no valid fields to update"));
  }
  let assignments: Vec<String> = cols
    .iter()
    .enumerate()
    .map(|(i, col)| format!("{col} = ${}", i + 1))
    .collect();
  params.push(BindValue::Text(key.to_string()));
  let sql = format!(
    "UPDATE {target} SET {} WHERE {key_col} = ${} RETURNING *",
    assignments.join(", "),
    params.len()
  );
  let client = pool.get().await?;
  let row = client
    .query_opt(sql.as_str(), &param_refs(&params))
    .await?
    .ok_or_else(|| {
      EngineError::not_found(format!("no row with {key_column} = {key} in {schema}.{table}"))
    })?;
  hook.emit(
    "row.update",
    qualified_target(database, schema, table),
    Some(serde_json::json!({ "key_column": key_column, "key": key })),
  );
  Ok(row_to_json(&row))
}

pub async fn delete_row(
  pool: &Pool,
  database: &str,
  schema: &str,
  table: &str,
  key_column: &str,
  key: &str,
  hook: &AuditHook,
) -> Result<Value, EngineError> {
  let target = quote_qualified(schema, table)?;
  let key_col = quote_ident(key_column)?;
  let params = vec![BindValue::Text(key.to_string())];
  let sql = format!("DELETE FROM {target} WHERE {key_col} = $1 RETURNING *");
  let client = pool.get().await?;
  let row = client
    .query_opt(sql.as_str(), &param_refs(&params))
    .await?
    .ok_or_else(|| {
      EngineError::not_found(format!("no row with {key_column} = {key} in {schema}.{table}"))
    })?;
  hook.emit(
    "row.delete",
    qualified_target(database, schema, table),
    Some(serde_json::json!({ "key_column": key_column, "key": key })),
  );
  Ok(row_to_json(&row))
}

#[derive(Debug, Serialize)]
pub struct SqlResult {
  pub rows: Vec<Value>,
  pub rows_affected: u64,
}

/// Runs operator-supplied SQL over the simple-query protocol, which keeps
/// multi-statement scripts working and sidesteps parameter typing entirely.
/// Access is gated at the API layer; no validation happens here by design.
pub async fn execute_sql(
  pool: &Pool,
  database: &str,
  sql: &str,
  hook: &AuditHook,
) -> Result<SqlResult, EngineError> {
  let client = pool.get().await?;
  let messages = client.simple_query(sql).await?;

  let mut rows = Vec::new();
  let mut rows_affected = 0;
  for message in messages {
    match message {
      SimpleQueryMessage::Row(row) => {
        let mut obj = Map::with_capacity(row.len());
        for (idx, col) in row.columns().iter().enumerate() {
          let cell = row
            .get(idx)
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null);
          obj.insert(col.name().to_string(), cell);
        }
        rows.push(Value::Object(obj));
      }
      SimpleQueryMessage::CommandComplete(n) => rows_affected += n,
      _ => {}
    }
  }

  hook.emit(
    "sql.execute",
    database.to_string(),
    Some(serde_json::json!({ "statement_bytes": sql.len() })),
  );
  Ok(SqlResult {
    rows,
    rows_affected,
  })
}
