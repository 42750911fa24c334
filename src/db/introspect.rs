//! Read-only catalog introspection.
//!
//! Every operation is one parameterized query against the system catalogs.
//! Identifier-shaped inputs are validated up front; a bad schema or table
//! name here is a malformed request and fails loudly.

use deadpool_postgres::Pool;
use serde::Serialize;

use crate::db::sanitize::is_safe_identifier;
use crate::error::EngineError;

#[derive(Debug, Clone, Serialize)]
pub struct TableInfo {
  pub name: String,
  pub schema: String,
  pub estimated_rows: Option<i64>,
  pub total_size_bytes: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ColumnInfo {
  pub name: String,
  pub data_type: String,
  pub nullable: bool,
  pub default: Option<String>,
  pub primary_key: bool,
  pub position: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexInfo {
  pub name: String,
  pub columns: Vec<String>,
  pub unique: bool,
  pub primary: bool,
  pub method: Option<String>,
  pub definition: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConstraintInfo {
  pub name: String,
  pub table: String,
  pub kind: String,
  pub definition: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForeignKeyInfo {
  pub constraint: String,
  pub column: String,
  pub foreign_table: String,
  pub foreign_column: String,
  pub on_delete: String,
  pub on_update: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionInfo {
  pub name: String,
  pub arguments: String,
  pub returns: String,
  pub language: String,
  pub definition: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TriggerInfo {
  pub name: String,
  pub table: String,
  pub timing: String,
  pub event: String,
  pub statement: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ViewInfo {
  pub name: String,
  pub definition: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtensionInfo {
  pub name: String,
  pub version: String,
  pub schema: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnumTypeInfo {
  pub name: String,
  pub values: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaCounts {
  pub tables: usize,
  pub views: usize,
  pub functions: usize,
  pub triggers: usize,
  pub constraints: usize,
  pub enum_types: usize,
  pub extensions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaReport {
  pub schema: String,
  pub counts: SchemaCounts,
  pub tables: Vec<TableInfo>,
  pub views: Vec<ViewInfo>,
  pub functions: Vec<FunctionInfo>,
  pub triggers: Vec<TriggerInfo>,
  pub constraints: Vec<ConstraintInfo>,
  pub enum_types: Vec<EnumTypeInfo>,
  pub extensions: Vec<ExtensionInfo>,
}

fn check_ident(kind: &str, s: &str) -> Result<(), EngineError> {
  if is_safe_identifier(s) {
    Ok(())
  } else {
    Err(EngineError::validation(format!("invalid {kind} name: {s:?}")))
  }
}

pub async fn list_databases(pool: &Pool) -> Result<Vec<String>, EngineError> {
  let rows = pool
    .get()
    .await?
    .query(
      "SELECT datname FROM pg_database WHERE NOT datistemplate ORDER BY datname",
      &[],
    )
    .await?;
  Ok(rows.into_iter().map(|r| r.get(0)).collect())
}

pub async fn list_schemas(pool: &Pool) -> Result<Vec<String>, EngineError> {
  let rows = pool
    .get()
    .await?
    .query(
      "SELECT schema_name FROM information_schema.schemata
       WHERE schema_name NOT LIKE 'pg\\_%' AND schema_name <> 'information_schema'
       ORDER BY schema_name",
      &[],
    )
    .await?;
  Ok(rows.into_iter().map(|r| r.get(0)).collect())
}

pub async fn list_tables(pool: &Pool, schema: &str) -> Result<Vec<TableInfo>, EngineError> {
  check_ident("schema", schema)?;
  let rows = pool
    .get()
    .await?
    .query(
      "SELECT t.table_name,
              s.n_live_tup,
              pg_total_relation_size(quote_ident($1) || '.' || quote_ident(t.table_name))
       FROM information_schema.tables t
       LEFT JOIN pg_stat_user_tables s
         ON s.schemaname = t.table_schema AND s.relname = t.table_name
       WHERE t.table_schema = $1 AND t.table_type = 'BASE TABLE'
       ORDER BY t.table_name",
      &[&schema],
    )
    .await?;
  Ok(
    rows
      .into_iter()
      .map(|r| TableInfo {
        name: r.get(0),
        schema: schema.to_string(),
        estimated_rows: r.get(1),
        total_size_bytes: r.get(2),
      })
      .collect(),
  )
}

pub async fn list_columns(
  pool: &Pool,
  schema: &str,
  table: &str,
) -> Result<Vec<ColumnInfo>, EngineError> {
  check_ident("schema", schema)?;
  check_ident("table", table)?;
  let rows = pool
    .get()
    .await?
    .query(
      "SELECT c.column_name,
              format_type(a.atttypid, a.atttypmod) AS data_type,
              c.is_nullable = 'YES' AS nullable,
              c.column_default,
              pk.column_name IS NOT NULL AS primary_key,
              c.ordinal_position
       FROM information_schema.columns c
       JOIN pg_class t ON t.relname = c.table_name
       JOIN pg_namespace n ON n.oid = t.relnamespace AND n.nspname = c.table_schema
       JOIN pg_attribute a ON a.attrelid = t.oid AND a.attname = c.column_name
       LEFT JOIN (
         SELECT kcu.column_name
         FROM information_schema.table_constraints tc
         JOIN information_schema.key_column_usage kcu
           ON tc.constraint_name = kcu.constraint_name
          AND tc.table_schema = kcu.table_schema
         WHERE tc.table_schema = $1 AND tc.table_name = $2
           AND tc.constraint_type = 'PRIMARY KEY'
       ) pk ON c.column_name = pk.column_name
       WHERE c.table_schema = $1 AND c.table_name = $2
       ORDER BY c.ordinal_position",
      &[&schema, &table],
    )
    .await?;
  Ok(
    rows
      .into_iter()
      .map(|r| ColumnInfo {
        name: r.get(0),
        data_type: r.get(1),
        nullable: r.get(2),
        default: r.get(3),
        primary_key: r.get(4),
        position: r.get(5),
      })
      .collect(),
  )
}

pub async fn list_indexes(
  pool: &Pool,
  schema: &str,
  table: &str,
) -> Result<Vec<IndexInfo>, EngineError> {
  check_ident("schema", schema)?;
  check_ident("table", table)?;
  let rows = pool
    .get()
    .await?
    .query(
      "SELECT i.relname,
              array_agg(a.attname ORDER BY array_position(ix.indkey, a.attnum)),
              ix.indisunique,
              ix.indisprimary,
              am.amname,
              pg_get_indexdef(ix.indexrelid)
       FROM pg_index ix
       JOIN pg_class i ON i.oid = ix.indexrelid
       JOIN pg_class t ON t.oid = ix.indrelid
       JOIN pg_namespace n ON n.oid = t.relnamespace
       LEFT JOIN pg_am am ON am.oid = i.relam
       JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
       WHERE n.nspname = $1 AND t.relname = $2
       GROUP BY i.relname, ix.indisunique, ix.indisprimary, am.amname, ix.indexrelid",
      &[&schema, &table],
    )
    .await?;
  Ok(
    rows
      .into_iter()
      .map(|r| IndexInfo {
        name: r.get(0),
        columns: r.get(1),
        unique: r.get(2),
        primary: r.get(3),
        method: r.get(4),
        definition: r.get(5),
      })
      .collect(),
  )
}

pub async fn list_constraints(
  pool: &Pool,
  schema: &str,
  table: Option<&str>,
) -> Result<Vec<ConstraintInfo>, EngineError> {
  check_ident("schema", schema)?;
  if let Some(t) = table {
    check_ident("table", t)?;
  }
  let client = pool.get().await?;
  let rows = match table {
    Some(t) => {
      client
        .query(
          "SELECT con.conname, rel.relname, con.contype::text, pg_get_constraintdef(con.oid)
           FROM pg_constraint con
           JOIN pg_class rel ON rel.oid = con.conrelid
           JOIN pg_namespace nsp ON nsp.oid = rel.relnamespace
           WHERE nsp.nspname = $1 AND rel.relname = $2
           ORDER BY con.conname",
          &[&schema, &t],
        )
        .await?
    }
    None => {
      client
        .query(
          "SELECT con.conname, rel.relname, con.contype::text, pg_get_constraintdef(con.oid)
           FROM pg_constraint con
           JOIN pg_class rel ON rel.oid = con.conrelid
           JOIN pg_namespace nsp ON nsp.oid = rel.relnamespace
           WHERE nsp.nspname = $1
           ORDER BY rel.relname, con.conname",
          &[&schema],
        )
        .await?
    }
  };
  Ok(
    rows
      .into_iter()
      .map(|r| {
        let kind: String = r.get(2);
        ConstraintInfo {
          name: r.get(0),
          table: r.get(1),
          kind: match kind.as_str() {
            "p" => "primary key".into(),
            "f" => "foreign key".into(),
            "u" => "unique".into(),
            "c" => "check".into(),
            "x" => "exclusion".into(),
            other => other.into(),
          },
          definition: r.get(3),
        }
      })
      .collect(),
  )
}

pub async fn list_foreign_keys(
  pool: &Pool,
  schema: &str,
  table: &str,
) -> Result<Vec<ForeignKeyInfo>, EngineError> {
  check_ident("schema", schema)?;
  check_ident("table", table)?;
  let rows = pool
    .get()
    .await?
    .query(
      "SELECT tc.constraint_name,
              kcu.column_name,
              ccu.table_name,
              ccu.column_name,
              rc.delete_rule,
              rc.update_rule
       FROM information_schema.table_constraints tc
       JOIN information_schema.key_column_usage kcu
         ON tc.constraint_name = kcu.constraint_name
        AND tc.table_schema = kcu.table_schema
       JOIN information_schema.constraint_column_usage ccu
         ON ccu.constraint_name = tc.constraint_name
        AND ccu.table_schema = tc.table_schema
       JOIN information_schema.referential_constraints rc
         ON rc.constraint_name = tc.constraint_name
        AND rc.constraint_schema = tc.table_schema
       WHERE tc.table_schema = $1 AND tc.table_name = $2
         AND tc.constraint_type = 'FOREIGN KEY'",
      &[&schema, &table],
    )
    .await?;
  Ok(
    rows
      .into_iter()
      .map(|r| ForeignKeyInfo {
        constraint: r.get(0),
        column: r.get(1),
        foreign_table: r.get(2),
        foreign_column: r.get(3),
        on_delete: r.get(4),
        on_update: r.get(5),
      })
      .collect(),
  )
}

pub async fn list_functions(pool: &Pool, schema: &str) -> Result<Vec<FunctionInfo>, EngineError> {
  check_ident("schema", schema)?;
  let rows = pool
    .get()
    .await?
    .query(
      "SELECT p.proname,
              pg_get_function_arguments(p.oid),
              pg_get_function_result(p.oid),
              l.lanname,
              CASE WHEN l.lanname <> 'internal' AND l.lanname <> 'c'
                   THEN pg_get_functiondef(p.oid) END
       FROM pg_proc p
       JOIN pg_namespace n ON n.oid = p.pronamespace
       JOIN pg_language l ON l.oid = p.prolang
       WHERE n.nspname = $1 AND p.prokind = 'f'
       ORDER BY p.proname",
      &[&schema],
    )
    .await?;
  Ok(
    rows
      .into_iter()
      .map(|r| FunctionInfo {
        name: r.get(0),
        arguments: r.get(1),
        returns: r.get(2),
        language: r.get(3),
        definition: r.get(4),
      })
      .collect(),
  )
}

pub async fn list_triggers(pool: &Pool, schema: &str) -> Result<Vec<TriggerInfo>, EngineError> {
  check_ident("schema", schema)?;
  let rows = pool
    .get()
    .await?
    .query(
      "SELECT trigger_name, event_object_table, action_timing,
              event_manipulation, action_statement
       FROM information_schema.triggers
       WHERE trigger_schema = $1
       ORDER BY event_object_table, trigger_name",
      &[&schema],
    )
    .await?;
  Ok(
    rows
      .into_iter()
      .map(|r| TriggerInfo {
        name: r.get(0),
        table: r.get(1),
        timing: r.get(2),
        event: r.get(3),
        statement: r.get(4),
      })
      .collect(),
  )
}

pub async fn list_views(pool: &Pool, schema: &str) -> Result<Vec<ViewInfo>, EngineError> {
  check_ident("schema", schema)?;
  let rows = pool
    .get()
    .await?
    .query(
      "SELECT table_name, view_definition
       FROM information_schema.views
       WHERE table_schema = $1
       ORDER BY table_name",
      &[&schema],
    )
    .await?;
  Ok(
    rows
      .into_iter()
      .map(|r| ViewInfo {
        name: r.get(0),
        definition: r.get(1),
      })
      .collect(),
  )
}

pub async fn list_extensions(pool: &Pool) -> Result<Vec<ExtensionInfo>, EngineError> {
  let rows = pool
    .get()
    .await?
    .query(
      "SELECT e.extname, e.extversion, n.nspname
       FROM pg_extension e
       JOIN pg_namespace n ON n.oid = e.extnamespace
       ORDER BY e.extname",
      &[],
    )
    .await?;
  Ok(
    rows
      .into_iter()
      .map(|r| ExtensionInfo {
        name: r.get(0),
        version: r.get(1),
        schema: r.get(2),
      })
      .collect(),
  )
}

pub async fn list_enum_types(pool: &Pool, schema: &str) -> Result<Vec<EnumTypeInfo>, EngineError> {
  check_ident("schema", schema)?;
  let rows = pool
    .get()
    .await?
    .query(
      "SELECT t.typname, array_agg(e.enumlabel ORDER BY e.enumsortorder)
       FROM pg_type t
       JOIN pg_enum e ON e.enumtypid = t.oid
       JOIN pg_namespace n ON n.oid = t.typnamespace
       WHERE n.nspname = $1
       GROUP BY t.typname
       ORDER BY t.typname",
      &[&schema],
    )
    .await?;
  Ok(
    rows
      .into_iter()
      .map(|r| EnumTypeInfo {
        name: r.get(0),
        values: r.get(1),
      })
      .collect(),
  )
}

/// Runs the per-schema catalog queries concurrently over the same pool and
/// aggregates counts.
pub async fn full_schema(pool: &Pool, schema: &str) -> Result<SchemaReport, EngineError> {
  check_ident("schema", schema)?;
  let (tables, views, functions, triggers, constraints, enum_types, extensions) = tokio::join!(
    list_tables(pool, schema),
    list_views(pool, schema),
    list_functions(pool, schema),
    list_triggers(pool, schema),
    list_constraints(pool, schema, None),
    list_enum_types(pool, schema),
    list_extensions(pool),
  );
  let (tables, views, functions, triggers, constraints, enum_types, extensions) = (
    tables?,
    views?,
    functions?,
    triggers?,
    constraints?,
    enum_types?,
    extensions?,
  );
  Ok(SchemaReport {
    schema: schema.to_string(),
    counts: SchemaCounts {
      tables: tables.len(),
      views: views.len(),
      functions: functions.len(),
      triggers: triggers.len(),
      constraints: constraints.len(),
      enum_types: enum_types.len(),
      extensions: extensions.len(),
    },
    tables,
    views,
    functions,
    triggers,
    constraints,
    enum_types,
    extensions,
  })
}
