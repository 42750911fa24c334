//! Role management.
//!
//! CREATE/DROP ROLE and GRANT/REVOKE cannot be parameterized, so role names
//! go through the identifier validator, privileges through a whitelist, and
//! passwords through literal escaping. Passwords never reach the audit sink
//! or the logs.

use deadpool_postgres::Pool;
use serde::{Deserialize, Serialize};

use crate::audit::AuditHook;
use crate::db::sanitize::{escape_literal, quote_ident};
use crate::error::EngineError;

#[derive(Debug, Clone, Serialize)]
pub struct RoleInfo {
  pub name: String,
  pub superuser: bool,
  pub create_db: bool,
  pub create_role: bool,
  pub login: bool,
  pub connection_limit: i32,
}

pub async fn list_roles(pool: &Pool) -> Result<Vec<RoleInfo>, EngineError> {
  let rows = pool
    .get()
    .await?
    .query(
      "SELECT rolname, rolsuper, rolcreatedb, rolcreaterole, rolcanlogin, rolconnlimit
       FROM pg_roles
       WHERE rolname NOT LIKE 'pg\\_%'
       ORDER BY rolname",
      &[],
    )
    .await?;
  Ok(
    rows
      .into_iter()
      .map(|r| RoleInfo {
        name: r.get(0),
        superuser: r.get(1),
        create_db: r.get(2),
        create_role: r.get(3),
        login: r.get(4),
        connection_limit: r.get(5),
      })
      .collect(),
  )
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRole {
  pub name: String,
  #[serde(default)]
  pub password: Option<String>,
  #[serde(default)]
  pub login: bool,
  #[serde(default)]
  pub superuser: bool,
  #[serde(default)]
  pub createdb: bool,
  #[serde(default)]
  pub createrole: bool,
}

pub async fn create_role(
  pool: &Pool,
  database: &str,
  req: &CreateRole,
  hook: &AuditHook,
) -> Result<(), EngineError> {
  let name = quote_ident(&req.name)?;
  let mut sql = format!("CREATE ROLE {name} WITH");
  sql.push_str(if req.login { " LOGIN" } else { " NOLOGIN" });
  if req.superuser {
    sql.push_str(" SUPERUSER");
  }
  if req.createdb {
    sql.push_str(" CREATEDB");
  }
  if req.createrole {
    sql.push_str(" CREATEROLE");
  }
  if let Some(password) = &req.password {
    sql.push_str(" PASSWORD ");
    sql.push_str(&escape_literal(password)?);
  }
  pool.get().await?.execute(sql.as_str(), &[]).await?;
  hook.emit(
    "role.create",
    format!("{database}.{}", req.name),
    Some(serde_json::json!({
      "login": req.login,
      "superuser": req.superuser,
      "createdb": req.createdb,
      "createrole": req.createrole,
    })),
  );
  Ok(())
}

pub async fn drop_role(
  pool: &Pool,
  database: &str,
  name: &str,
  hook: &AuditHook,
) -> Result<(), EngineError> {
  let quoted = quote_ident(name)?;
  let sql = format!("DROP ROLE {quoted}");
  pool.get().await?.execute(sql.as_str(), &[]).await?;
  hook.emit("role.drop", format!("{database}.{name}"), None);
  Ok(())
}

const TABLE_PRIVILEGES: &[&str] = &[
  "SELECT",
  "INSERT",
  "UPDATE",
  "DELETE",
  "TRUNCATE",
  "REFERENCES",
  "TRIGGER",
  "ALL",
];

const SCHEMA_PRIVILEGES: &[&str] = &["USAGE", "CREATE", "ALL"];

fn validate_privilege(privilege: &str, allowed: &[&str]) -> Result<String, EngineError> {
  let upper = privilege.to_ascii_uppercase();
  if allowed.contains(&upper.as_str()) {
    Ok(upper)
  } else {
    Err(EngineError::validation(format!(
      "unsupported privilege: {privilege:?}"
    )))
  }
}

pub async fn grant_schema(
  pool: &Pool,
  database: &str,
  schema: &str,
  role: &str,
  privilege: &str,
  hook: &AuditHook,
) -> Result<(), EngineError> {
  let privilege = validate_privilege(privilege, SCHEMA_PRIVILEGES)?;
  let schema_q = quote_ident(schema)?;
  let role_q = quote_ident(role)?;
  let sql = format!("GRANT {privilege} ON SCHEMA {schema_q} TO {role_q}");
  pool.get().await?.execute(sql.as_str(), &[]).await?;
  hook.emit(
    "role.grant",
    format!("{database}.{schema}"),
    Some(serde_json::json!({ "role": role, "privilege": privilege })),
  );
  Ok(())
}

pub async fn grant_tables(
  pool: &Pool,
  database: &str,
  schema: &str,
  role: &str,
  privilege: &str,
  hook: &AuditHook,
) -> Result<(), EngineError> {
  let privilege = validate_privilege(privilege, TABLE_PRIVILEGES)?;
  let schema_q = quote_ident(schema)?;
  let role_q = quote_ident(role)?;
  let sql = format!("GRANT {privilege} ON ALL TABLES IN SCHEMA {schema_q} TO {role_q}");
  pool.get().await?.execute(sql.as_str(), &[]).await?;
  hook.emit(
    "role.grant",
    format!("{database}.{schema}.*"),
    Some(serde_json::json!({ "role": role, "privilege": privilege })),
  );
  Ok(())
}

pub async fn revoke_tables(
  pool: &Pool,
  database: &str,
  schema: &str,
  role: &str,
  privilege: &str,
  hook: &AuditHook,
) -> Result<(), EngineError> {
  let privilege = validate_privilege(privilege, TABLE_PRIVILEGES)?;
  let schema_q = quote_ident(schema)?;
  let role_q = quote_ident(role)?;
  let sql = format!("REVOKE {privilege} ON ALL TABLES IN SCHEMA {schema_q} FROM {role_q}");
  pool.get().await?.execute(sql.as_str(), &[]).await?;
  hook.emit(
    "role.revoke",
    format!("{database}.{schema}.*"),
    Some(serde_json::json!({ "role": role, "privilege": privilege })),
  );
  Ok(())
}
