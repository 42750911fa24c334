//! Table, column and index DDL.
//!
//! DDL cannot take bind parameters, so everything that lands in the
//! statement text is either a validated+quoted identifier, a whitelisted
//! type or method name, or an escaped literal.

use deadpool_postgres::Pool;
use serde::Deserialize;

use crate::audit::AuditHook;
use crate::db::sanitize::{
  escape_literal, is_safe_identifier, quote_ident, quote_qualified, validate_column_type,
  MAX_IDENTIFIER_LENGTH,
};
use crate::error::EngineError;

fn default_true() -> bool {
  true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnDef {
  pub name: String,
  pub data_type: String,
  #[serde(default = "default_true")]
  pub nullable: bool,
  #[serde(default)]
  pub default: Option<String>,
  #[serde(default)]
  pub primary_key: bool,
}

/// Default expressions allowed verbatim; anything else becomes an escaped
/// string literal.
const DEFAULT_EXPRESSIONS: &[&str] = &["now()", "current_timestamp", "gen_random_uuid()"];

fn render_default(value: &str) -> Result<String, EngineError> {
  let lowered = value.trim().to_ascii_lowercase();
  if DEFAULT_EXPRESSIONS.contains(&lowered.as_str()) {
    Ok(lowered)
  } else {
    escape_literal(value)
  }
}

fn render_column(def: &ColumnDef) -> Result<String, EngineError> {
  validate_column_type(&def.data_type)?;
  let mut rendered = format!("{} {}", quote_ident(&def.name)?, def.data_type.trim());
  if !def.nullable {
    rendered.push_str(" NOT NULL");
  }
  if let Some(default) = &def.default {
    rendered.push_str(" DEFAULT ");
    rendered.push_str(&render_default(default)?);
  }
  Ok(rendered)
}

fn qualified_target(database: &str, schema: &str, table: &str) -> String {
  format!("{database}.{schema}.{table}")
}

pub async fn create_table(
  pool: &Pool,
  database: &str,
  schema: &str,
  table: &str,
  columns: &[ColumnDef],
  hook: &AuditHook,
) -> Result<(), EngineError> {
  let target = quote_qualified(schema, table)?;
  if columns.is_empty() {
    return Err(EngineError::validation("a table needs at least one column"));
  }
  let mut parts: Vec<String> = columns.iter().map(render_column).collect::<Result<_, _>>()?;
  let pk: Vec<String> = columns
    .iter()
    .filter(|c| c.primary_key)
    .map(|c| quote_ident(&c.name))
    .collect::<Result<_, _>>()?;
  if !pk.is_empty() {
    parts.push(format!("PRIMARY KEY ({})", pk.join(", ")));
  }
  let sql = format!("CREATE TABLE {target} ({})", parts.join(", "));
  pool.get().await?.execute(sql.as_str(), &[]).await?;
  hook.emit(
    "table.create",
    qualified_target(database, schema, table),
    Some(serde_json::json!({ "columns": columns.len() })),
  );
  Ok(())
}

pub async fn drop_table(
  pool: &Pool,
  database: &str,
  schema: &str,
  table: &str,
  cascade: bool,
  hook: &AuditHook,
) -> Result<(), EngineError> {
  let target = quote_qualified(schema, table)?;
  let sql = if cascade {
    format!("DROP TABLE {target} CASCADE")
  } else {
    format!("DROP TABLE {target}")
  };
  pool.get().await?.execute(sql.as_str(), &[]).await?;
  hook.emit(
    "table.drop",
    qualified_target(database, schema, table),
    Some(serde_json::json!({ "cascade": cascade })),
  );
  Ok(())
}

pub async fn truncate_table(
  pool: &Pool,
  database: &str,
  schema: &str,
  table: &str,
  hook: &AuditHook,
) -> Result<(), EngineError> {
  let target = quote_qualified(schema, table)?;
  let sql = format!("TRUNCATE TABLE {target}");
  pool.get().await?.execute(sql.as_str(), &[]).await?;
  hook.emit(
    "table.truncate",
    qualified_target(database, schema, table),
    None,
  );
  Ok(())
}

pub async fn add_column(
  pool: &Pool,
  database: &str,
  schema: &str,
  table: &str,
  def: &ColumnDef,
  hook: &AuditHook,
) -> Result<(), EngineError> {
  let target = quote_qualified(schema, table)?;
  let sql = format!("ALTER TABLE {target} ADD COLUMN {}", render_column(def)?);
  pool.get().await?.execute(sql.as_str(), &[]).await?;
  hook.emit(
    "column.add",
    format!("{}.{}", qualified_target(database, schema, table), def.name),
    Some(serde_json::json!({ "data_type": def.data_type })),
  );
  Ok(())
}

pub async fn drop_column(
  pool: &Pool,
  database: &str,
  schema: &str,
  table: &str,
  column: &str,
  hook: &AuditHook,
) -> Result<(), EngineError> {
  let target = quote_qualified(schema, table)?;
  let col = quote_ident(column)?;
  let sql = format!("ALTER TABLE {target} DROP COLUMN {col}");
  pool.get().await?.execute(sql.as_str(), &[]).await?;
  hook.emit(
    "column.drop",
    format!("{}.{}", qualified_target(database, schema, table), column),
    None,
  );
  Ok(())
}

const INDEX_METHODS: &[&str] = &["btree", "hash", "gin", "gist", "brin", "spgist"];

#[derive(Debug, Clone, Deserialize)]
pub struct IndexDef {
  #[serde(default)]
  pub name: Option<String>,
  pub columns: Vec<String>,
  #[serde(default)]
  pub unique: bool,
  #[serde(default)]
  pub method: Option<String>,
}

/// Creates an index and returns its name (generated from the table and
/// column names when the caller did not provide one).
pub async fn create_index(
  pool: &Pool,
  database: &str,
  schema: &str,
  table: &str,
  def: &IndexDef,
  hook: &AuditHook,
) -> Result<String, EngineError> {
  let target = quote_qualified(schema, table)?;
  if def.columns.is_empty() {
    return Err(EngineError::validation("an index needs at least one column"));
  }
  let cols: Vec<String> = def.columns.iter().map(|c| quote_ident(c)).collect::<Result<_, _>>()?;

  let name = match &def.name {
    Some(n) => n.clone(),
    None => {
      let mut generated = format!("idx_{}_{}", table, def.columns.join("_"));
      generated.truncate(MAX_IDENTIFIER_LENGTH);
      generated
    }
  };
  let quoted_name = quote_ident(&name)?;

  let method = match &def.method {
    Some(m) => {
      let lowered = m.to_ascii_lowercase();
      if !INDEX_METHODS.contains(&lowered.as_str()) {
        return Err(EngineError::validation(format!(
          "unsupported index method: {m:?}"
        )));
      }
      format!(" USING {lowered}")
    }
    None => String::new(),
  };

  let unique = if def.unique { "UNIQUE " } else { "" };
  let sql = format!(
    "CREATE {unique}INDEX {quoted_name} ON {target}{method} ({})",
    cols.join(", ")
  );
  pool.get().await?.execute(sql.as_str(), &[]).await?;
  hook.emit(
    "index.create",
    format!("{}.{}", qualified_target(database, schema, table), name),
    Some(serde_json::json!({ "unique": def.unique, "columns": def.columns })),
  );
  Ok(name)
}

pub async fn drop_index(
  pool: &Pool,
  database: &str,
  schema: &str,
  index: &str,
  hook: &AuditHook,
) -> Result<(), EngineError> {
  if !is_safe_identifier(index) {
    return Err(EngineError::validation(format!("invalid index name: {index:?}")));
  }
  let target = quote_qualified(schema, index)?;
  let sql = format!("DROP INDEX {target}");
  pool.get().await?.execute(sql.as_str(), &[]).await?;
  hook.emit("index.drop", format!("{database}.{schema}.{index}"), None);
  Ok(())
}
