//! HTTP surface: thin resource-oriented routes over the engine.
//!
//! Handlers resolve a pool, delegate to the engine modules, and return JSON.
//! Business logic lives in `db`, `backup` and `realtime`; error translation
//! happens once in `EngineError::into_response`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::header;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use super::config::ServerConfig;
use super::ws;
use crate::audit::{AuditHook, Auditor};
use crate::auth::{require_role, AuthProvider, Role, User};
use crate::backup::{BackupOptions, BackupService, RestoreOptions};
use crate::db::{crud, introspect, query, roles, tables, PoolRegistry};
use crate::error::EngineError;
use crate::realtime::{ddl, SubscriptionHub};

#[derive(Clone)]
pub struct AppState {
  pub registry: Arc<PoolRegistry>,
  pub hub: Arc<SubscriptionHub>,
  pub backups: Arc<BackupService>,
  pub auditor: Arc<dyn Auditor>,
  pub auth: Arc<dyn AuthProvider>,
  pub strict_filters: bool,
}

impl AppState {
  fn hook(&self, user: &User, addr: &SocketAddr) -> AuditHook {
    AuditHook::new(self.auditor.clone(), user.name.clone(), Some(addr.ip()))
  }
}

async fn require_auth(
  State(state): State<AppState>,
  mut req: Request,
  next: Next,
) -> Result<Response, EngineError> {
  let token = req
    .headers()
    .get(header::AUTHORIZATION)
    .and_then(|h| h.to_str().ok())
    .and_then(|h| h.strip_prefix("Bearer "))
    .unwrap_or("");
  let user = state.auth.authenticate(token).await?;
  req.extensions_mut().insert(user);
  Ok(next.run(req).await)
}

pub fn router(state: AppState, config: &ServerConfig) -> Router {
  let cors = if config.server.cors_origins.iter().any(|o| o == "*") {
    CorsLayer::new()
      .allow_origin(Any)
      .allow_methods(Any)
      .allow_headers(Any)
  } else {
    let origins: Vec<axum::http::HeaderValue> = config
      .server
      .cors_origins
      .iter()
      .filter_map(|o| o.parse().ok())
      .collect();
    CorsLayer::new()
      .allow_origin(AllowOrigin::list(origins))
      .allow_methods(Any)
      .allow_headers(Any)
  };

  let api = Router::new()
    .route("/databases", get(list_databases))
    .route("/db/{db}/schemas", get(list_schemas))
    .route("/db/{db}/schemas/{schema}", get(full_schema))
    .route("/db/{db}/schemas/{schema}/tables", get(list_tables).post(create_table))
    .route(
      "/db/{db}/schemas/{schema}/tables/{table}",
      delete(drop_table),
    )
    .route(
      "/db/{db}/schemas/{schema}/tables/{table}/truncate",
      post(truncate_table),
    )
    .route(
      "/db/{db}/schemas/{schema}/tables/{table}/columns",
      get(list_columns).post(add_column),
    )
    .route(
      "/db/{db}/schemas/{schema}/tables/{table}/columns/{column}",
      delete(drop_column),
    )
    .route(
      "/db/{db}/schemas/{schema}/tables/{table}/indexes",
      get(list_indexes).post(create_index),
    )
    .route("/db/{db}/schemas/{schema}/indexes/{index}", delete(drop_index))
    .route(
      "/db/{db}/schemas/{schema}/tables/{table}/constraints",
      get(list_constraints),
    )
    .route(
      "/db/{db}/schemas/{schema}/tables/{table}/foreign-keys",
      get(list_foreign_keys),
    )
    .route(
      "/db/{db}/schemas/{schema}/tables/{table}/rows",
      get(list_rows).post(insert_row),
    )
    .route(
      "/db/{db}/schemas/{schema}/tables/{table}/rows/{key}",
      get(get_row).patch(update_row).delete(delete_row),
    )
    .route(
      "/db/{db}/schemas/{schema}/tables/{table}/realtime",
      post(enable_realtime).delete(disable_realtime),
    )
    .route("/db/{db}/schemas/{schema}/functions", get(list_functions))
    .route("/db/{db}/schemas/{schema}/triggers", get(list_triggers))
    .route("/db/{db}/schemas/{schema}/views", get(list_views))
    .route("/db/{db}/schemas/{schema}/types", get(list_enum_types))
    .route("/db/{db}/extensions", get(list_extensions))
    .route("/db/{db}/roles", get(list_roles).post(create_role))
    .route("/db/{db}/roles/{role}", delete(drop_role))
    .route("/db/{db}/roles/{role}/grant", post(grant_role))
    .route("/db/{db}/roles/{role}/revoke", post(revoke_role))
    .route("/db/{db}/sql", post(execute_sql))
    .route("/db/{db}/backups", get(list_db_backups).post(create_backup))
    .route("/db/{db}/backups/{filename}/restore", post(restore_backup))
    .route("/backups", get(list_backups))
    .route("/backups/{filename}", delete(delete_backup))
    .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

  Router::new()
    .route("/health", get(health))
    .route("/realtime", get(realtime_ws))
    .nest("/api", api)
    .layer(cors)
    .with_state(state)
}

async fn health() -> Json<Value> {
  Json(json!({ "status": "ok" }))
}

/// The realtime socket authenticates through a `token` query parameter,
/// since browsers cannot set headers on WebSocket upgrades.
async fn realtime_ws(
  State(state): State<AppState>,
  Query(params): Query<HashMap<String, String>>,
  ws: WebSocketUpgrade,
) -> Response {
  let token = params.get("token").map(String::as_str).unwrap_or("");
  match state.auth.authenticate(token).await {
    Ok(_) => {
      let hub = state.hub.clone();
      ws.on_upgrade(move |socket| ws::handle_socket(hub, socket))
    }
    Err(e) => e.into_response(),
  }
}

// ── introspection ────────────────────────────────────────────────

async fn list_databases(State(state): State<AppState>) -> Result<Json<Value>, EngineError> {
  let pool = state.registry.get_or_create(state.registry.default_database())?;
  Ok(Json(json!(introspect::list_databases(&pool).await?)))
}

async fn list_schemas(
  State(state): State<AppState>,
  Path(db): Path<String>,
) -> Result<Json<Value>, EngineError> {
  let pool = state.registry.get_or_create(&db)?;
  Ok(Json(json!(introspect::list_schemas(&pool).await?)))
}

async fn full_schema(
  State(state): State<AppState>,
  Path((db, schema)): Path<(String, String)>,
) -> Result<Json<Value>, EngineError> {
  let pool = state.registry.get_or_create(&db)?;
  Ok(Json(json!(introspect::full_schema(&pool, &schema).await?)))
}

async fn list_tables(
  State(state): State<AppState>,
  Path((db, schema)): Path<(String, String)>,
) -> Result<Json<Value>, EngineError> {
  let pool = state.registry.get_or_create(&db)?;
  Ok(Json(json!(introspect::list_tables(&pool, &schema).await?)))
}

async fn list_columns(
  State(state): State<AppState>,
  Path((db, schema, table)): Path<(String, String, String)>,
) -> Result<Json<Value>, EngineError> {
  let pool = state.registry.get_or_create(&db)?;
  Ok(Json(json!(
    introspect::list_columns(&pool, &schema, &table).await?
  )))
}

async fn list_indexes(
  State(state): State<AppState>,
  Path((db, schema, table)): Path<(String, String, String)>,
) -> Result<Json<Value>, EngineError> {
  let pool = state.registry.get_or_create(&db)?;
  Ok(Json(json!(
    introspect::list_indexes(&pool, &schema, &table).await?
  )))
}

async fn list_constraints(
  State(state): State<AppState>,
  Path((db, schema, table)): Path<(String, String, String)>,
) -> Result<Json<Value>, EngineError> {
  let pool = state.registry.get_or_create(&db)?;
  Ok(Json(json!(
    introspect::list_constraints(&pool, &schema, Some(&table)).await?
  )))
}

async fn list_foreign_keys(
  State(state): State<AppState>,
  Path((db, schema, table)): Path<(String, String, String)>,
) -> Result<Json<Value>, EngineError> {
  let pool = state.registry.get_or_create(&db)?;
  Ok(Json(json!(
    introspect::list_foreign_keys(&pool, &schema, &table).await?
  )))
}

async fn list_functions(
  State(state): State<AppState>,
  Path((db, schema)): Path<(String, String)>,
) -> Result<Json<Value>, EngineError> {
  let pool = state.registry.get_or_create(&db)?;
  Ok(Json(json!(introspect::list_functions(&pool, &schema).await?)))
}

async fn list_triggers(
  State(state): State<AppState>,
  Path((db, schema)): Path<(String, String)>,
) -> Result<Json<Value>, EngineError> {
  let pool = state.registry.get_or_create(&db)?;
  Ok(Json(json!(introspect::list_triggers(&pool, &schema).await?)))
}

async fn list_views(
  State(state): State<AppState>,
  Path((db, schema)): Path<(String, String)>,
) -> Result<Json<Value>, EngineError> {
  let pool = state.registry.get_or_create(&db)?;
  Ok(Json(json!(introspect::list_views(&pool, &schema).await?)))
}

async fn list_enum_types(
  State(state): State<AppState>,
  Path((db, schema)): Path<(String, String)>,
) -> Result<Json<Value>, EngineError> {
  let pool = state.registry.get_or_create(&db)?;
  Ok(Json(json!(
    introspect::list_enum_types(&pool, &schema).await?
  )))
}

async fn list_extensions(
  State(state): State<AppState>,
  Path(db): Path<String>,
) -> Result<Json<Value>, EngineError> {
  let pool = state.registry.get_or_create(&db)?;
  Ok(Json(json!(introspect::list_extensions(&pool).await?)))
}

// ── rows ─────────────────────────────────────────────────────────

async fn list_rows(
  State(state): State<AppState>,
  Path((db, schema, table)): Path<(String, String, String)>,
  Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<query::RowPage>, EngineError> {
  let pool = state.registry.get_or_create(&db)?;
  let spec = query::parse_query(&params, state.strict_filters)?;
  Ok(Json(query::fetch_rows(&pool, &schema, &table, &spec).await?))
}

fn key_column(params: &HashMap<String, String>) -> String {
  params
    .get("key_column")
    .cloned()
    .unwrap_or_else(|| "id".to_string())
}

async fn get_row(
  State(state): State<AppState>,
  Path((db, schema, table, key)): Path<(String, String, String, String)>,
  Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, EngineError> {
  let pool = state.registry.get_or_create(&db)?;
  let key_col = key_column(&params);
  query::fetch_row(&pool, &schema, &table, &key_col, &key)
    .await?
    .map(Json)
    .ok_or_else(|| {
      EngineError::not_found(format!("no row with {key_col} = {key} in {schema}.{table}"))
    })
}

async fn insert_row(
  State(state): State<AppState>,
  Path((db, schema, table)): Path<(String, String, String)>,
  ConnectInfo(addr): ConnectInfo<SocketAddr>,
  Extension(user): Extension<User>,
  Json(body): Json<Map<String, Value>>,
) -> Result<Json<Value>, EngineError> {
  let pool = state.registry.get_or_create(&db)?;
  let hook = state.hook(&user, &addr);
  Ok(Json(
    crud::insert_row(&pool, &db, &schema, &table, &body, &hook).await?,
  ))
}

async fn update_row(
  State(state): State<AppState>,
  Path((db, schema, table, key)): Path<(String, String, String, String)>,
  Query(params): Query<HashMap<String, String>>,
  ConnectInfo(addr): ConnectInfo<SocketAddr>,
  Extension(user): Extension<User>,
  Json(body): Json<Map<String, Value>>,
) -> Result<Json<Value>, EngineError> {
  let pool = state.registry.get_or_create(&db)?;
  let hook = state.hook(&user, &addr);
  let key_col = key_column(&params);
  Ok(Json(
    crud::update_row(&pool, &db, &schema, &table, &key_col, &key, &body, &hook).await?,
  ))
}

async fn delete_row(
  State(state): State<AppState>,
  Path((db, schema, table, key)): Path<(String, String, String, String)>,
  Query(params): Query<HashMap<String, String>>,
  ConnectInfo(addr): ConnectInfo<SocketAddr>,
  Extension(user): Extension<User>,
) -> Result<Json<Value>, EngineError> {
  let pool = state.registry.get_or_create(&db)?;
  let hook = state.hook(&user, &addr);
  let key_col = key_column(&params);
  Ok(Json(
    crud::delete_row(&pool, &db, &schema, &table, &key_col, &key, &hook).await?,
  ))
}

// ── DDL ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateTableBody {
  name: String,
  columns: Vec<tables::ColumnDef>,
}

async fn create_table(
  State(state): State<AppState>,
  Path((db, schema)): Path<(String, String)>,
  ConnectInfo(addr): ConnectInfo<SocketAddr>,
  Extension(user): Extension<User>,
  Json(body): Json<CreateTableBody>,
) -> Result<Json<Value>, EngineError> {
  require_role(&user, &[Role::Admin])?;
  let pool = state.registry.get_or_create(&db)?;
  let hook = state.hook(&user, &addr);
  tables::create_table(&pool, &db, &schema, &body.name, &body.columns, &hook).await?;
  Ok(Json(json!({ "created": body.name })))
}

#[derive(Deserialize)]
struct CascadeParams {
  #[serde(default)]
  cascade: bool,
}

async fn drop_table(
  State(state): State<AppState>,
  Path((db, schema, table)): Path<(String, String, String)>,
  Query(params): Query<CascadeParams>,
  ConnectInfo(addr): ConnectInfo<SocketAddr>,
  Extension(user): Extension<User>,
) -> Result<Json<Value>, EngineError> {
  require_role(&user, &[Role::Admin])?;
  let pool = state.registry.get_or_create(&db)?;
  let hook = state.hook(&user, &addr);
  tables::drop_table(&pool, &db, &schema, &table, params.cascade, &hook).await?;
  Ok(Json(json!({ "dropped": table })))
}

async fn truncate_table(
  State(state): State<AppState>,
  Path((db, schema, table)): Path<(String, String, String)>,
  ConnectInfo(addr): ConnectInfo<SocketAddr>,
  Extension(user): Extension<User>,
) -> Result<Json<Value>, EngineError> {
  require_role(&user, &[Role::Admin])?;
  let pool = state.registry.get_or_create(&db)?;
  let hook = state.hook(&user, &addr);
  tables::truncate_table(&pool, &db, &schema, &table, &hook).await?;
  Ok(Json(json!({ "truncated": table })))
}

async fn add_column(
  State(state): State<AppState>,
  Path((db, schema, table)): Path<(String, String, String)>,
  ConnectInfo(addr): ConnectInfo<SocketAddr>,
  Extension(user): Extension<User>,
  Json(body): Json<tables::ColumnDef>,
) -> Result<Json<Value>, EngineError> {
  require_role(&user, &[Role::Admin])?;
  let pool = state.registry.get_or_create(&db)?;
  let hook = state.hook(&user, &addr);
  tables::add_column(&pool, &db, &schema, &table, &body, &hook).await?;
  Ok(Json(json!({ "added": body.name })))
}

async fn drop_column(
  State(state): State<AppState>,
  Path((db, schema, table, column)): Path<(String, String, String, String)>,
  ConnectInfo(addr): ConnectInfo<SocketAddr>,
  Extension(user): Extension<User>,
) -> Result<Json<Value>, EngineError> {
  require_role(&user, &[Role::Admin])?;
  let pool = state.registry.get_or_create(&db)?;
  let hook = state.hook(&user, &addr);
  tables::drop_column(&pool, &db, &schema, &table, &column, &hook).await?;
  Ok(Json(json!({ "dropped": column })))
}

async fn create_index(
  State(state): State<AppState>,
  Path((db, schema, table)): Path<(String, String, String)>,
  ConnectInfo(addr): ConnectInfo<SocketAddr>,
  Extension(user): Extension<User>,
  Json(body): Json<tables::IndexDef>,
) -> Result<Json<Value>, EngineError> {
  require_role(&user, &[Role::Admin])?;
  let pool = state.registry.get_or_create(&db)?;
  let hook = state.hook(&user, &addr);
  let name = tables::create_index(&pool, &db, &schema, &table, &body, &hook).await?;
  Ok(Json(json!({ "created": name })))
}

async fn drop_index(
  State(state): State<AppState>,
  Path((db, schema, index)): Path<(String, String, String)>,
  ConnectInfo(addr): ConnectInfo<SocketAddr>,
  Extension(user): Extension<User>,
) -> Result<Json<Value>, EngineError> {
  require_role(&user, &[Role::Admin])?;
  let pool = state.registry.get_or_create(&db)?;
  let hook = state.hook(&user, &addr);
  tables::drop_index(&pool, &db, &schema, &index, &hook).await?;
  Ok(Json(json!({ "dropped": index })))
}

// ── roles ────────────────────────────────────────────────────────

async fn list_roles(
  State(state): State<AppState>,
  Path(db): Path<String>,
) -> Result<Json<Value>, EngineError> {
  let pool = state.registry.get_or_create(&db)?;
  Ok(Json(json!(roles::list_roles(&pool).await?)))
}

async fn create_role(
  State(state): State<AppState>,
  Path(db): Path<String>,
  ConnectInfo(addr): ConnectInfo<SocketAddr>,
  Extension(user): Extension<User>,
  Json(body): Json<roles::CreateRole>,
) -> Result<Json<Value>, EngineError> {
  require_role(&user, &[Role::Admin])?;
  let pool = state.registry.get_or_create(&db)?;
  let hook = state.hook(&user, &addr);
  roles::create_role(&pool, &db, &body, &hook).await?;
  Ok(Json(json!({ "created": body.name })))
}

async fn drop_role(
  State(state): State<AppState>,
  Path((db, role)): Path<(String, String)>,
  ConnectInfo(addr): ConnectInfo<SocketAddr>,
  Extension(user): Extension<User>,
) -> Result<Json<Value>, EngineError> {
  require_role(&user, &[Role::Admin])?;
  let pool = state.registry.get_or_create(&db)?;
  let hook = state.hook(&user, &addr);
  roles::drop_role(&pool, &db, &role, &hook).await?;
  Ok(Json(json!({ "dropped": role })))
}

#[derive(Deserialize)]
struct GrantBody {
  schema: String,
  privilege: String,
  /// "schema" grants on the schema itself, "tables" on all its tables.
  #[serde(default = "default_grant_on")]
  on: String,
}

fn default_grant_on() -> String {
  "tables".to_string()
}

async fn grant_role(
  State(state): State<AppState>,
  Path((db, role)): Path<(String, String)>,
  ConnectInfo(addr): ConnectInfo<SocketAddr>,
  Extension(user): Extension<User>,
  Json(body): Json<GrantBody>,
) -> Result<Json<Value>, EngineError> {
  require_role(&user, &[Role::Admin])?;
  let pool = state.registry.get_or_create(&db)?;
  let hook = state.hook(&user, &addr);
  match body.on.as_str() {
    "schema" => roles::grant_schema(&pool, &db, &body.schema, &role, &body.privilege, &hook).await?,
    "tables" => roles::grant_tables(&pool, &db, &body.schema, &role, &body.privilege, &hook).await?,
    other => {
      return Err(EngineError::validation(format!(
        "grant target must be 'schema' or 'tables', got {other:?}"
      )))
    }
  }
  Ok(Json(json!({ "granted": body.privilege })))
}

async fn revoke_role(
  State(state): State<AppState>,
  Path((db, role)): Path<(String, String)>,
  ConnectInfo(addr): ConnectInfo<SocketAddr>,
  Extension(user): Extension<User>,
  Json(body): Json<GrantBody>,
) -> Result<Json<Value>, EngineError> {
  require_role(&user, &[Role::Admin])?;
  let pool = state.registry.get_or_create(&db)?;
  let hook = state.hook(&user, &addr);
  roles::revoke_tables(&pool, &db, &body.schema, &role, &body.privilege, &hook).await?;
  Ok(Json(json!({ "revoked": body.privilege })))
}

// ── ad-hoc SQL ───────────────────────────────────────────────────

#[derive(Deserialize)]
struct SqlBody {
  sql: String,
}

async fn execute_sql(
  State(state): State<AppState>,
  Path(db): Path<String>,
  ConnectInfo(addr): ConnectInfo<SocketAddr>,
  Extension(user): Extension<User>,
  Json(body): Json<SqlBody>,
) -> Result<Json<crud::SqlResult>, EngineError> {
  require_role(&user, &[Role::Admin])?;
  let pool = state.registry.get_or_create(&db)?;
  let hook = state.hook(&user, &addr);
  Ok(Json(crud::execute_sql(&pool, &db, &body.sql, &hook).await?))
}

// ── realtime wiring ──────────────────────────────────────────────

async fn enable_realtime(
  State(state): State<AppState>,
  Path((db, schema, table)): Path<(String, String, String)>,
  ConnectInfo(addr): ConnectInfo<SocketAddr>,
  Extension(user): Extension<User>,
) -> Result<Json<Value>, EngineError> {
  require_role(&user, &[Role::Admin])?;
  let pool = state.registry.get_or_create(&db)?;
  let hook = state.hook(&user, &addr);
  ddl::enable_table(&pool, &db, &schema, &table, &hook).await?;
  Ok(Json(json!({ "channel": format!("{schema}.{table}") })))
}

async fn disable_realtime(
  State(state): State<AppState>,
  Path((db, schema, table)): Path<(String, String, String)>,
  ConnectInfo(addr): ConnectInfo<SocketAddr>,
  Extension(user): Extension<User>,
) -> Result<Json<Value>, EngineError> {
  require_role(&user, &[Role::Admin])?;
  let pool = state.registry.get_or_create(&db)?;
  let hook = state.hook(&user, &addr);
  ddl::disable_table(&pool, &db, &schema, &table, &hook).await?;
  Ok(Json(json!({ "channel": format!("{schema}.{table}") })))
}

// ── backups ──────────────────────────────────────────────────────

async fn create_backup(
  State(state): State<AppState>,
  Path(db): Path<String>,
  ConnectInfo(addr): ConnectInfo<SocketAddr>,
  Extension(user): Extension<User>,
  Json(body): Json<BackupOptions>,
) -> Result<Json<Value>, EngineError> {
  require_role(&user, &[Role::Admin])?;
  let hook = state.hook(&user, &addr);
  let descriptor = state.backups.create_backup(&db, &body, &hook).await?;
  Ok(Json(json!(descriptor)))
}

async fn restore_backup(
  State(state): State<AppState>,
  Path((db, filename)): Path<(String, String)>,
  ConnectInfo(addr): ConnectInfo<SocketAddr>,
  Extension(user): Extension<User>,
  Json(body): Json<RestoreOptions>,
) -> Result<Json<Value>, EngineError> {
  require_role(&user, &[Role::Admin])?;
  let hook = state.hook(&user, &addr);
  state
    .backups
    .restore_backup(&db, &filename, &body, &hook)
    .await?;
  Ok(Json(json!({ "restored": filename, "database": db })))
}

async fn list_db_backups(
  State(state): State<AppState>,
  Path(db): Path<String>,
) -> Result<Json<Value>, EngineError> {
  Ok(Json(json!(state.backups.list_backups(Some(&db)).await?)))
}

#[derive(Deserialize)]
struct BackupListParams {
  database: Option<String>,
}

async fn list_backups(
  State(state): State<AppState>,
  Query(params): Query<BackupListParams>,
) -> Result<Json<Value>, EngineError> {
  Ok(Json(json!(
    state.backups.list_backups(params.database.as_deref()).await?
  )))
}

async fn delete_backup(
  State(state): State<AppState>,
  Path(filename): Path<String>,
  ConnectInfo(addr): ConnectInfo<SocketAddr>,
  Extension(user): Extension<User>,
) -> Result<Json<Value>, EngineError> {
  require_role(&user, &[Role::Admin])?;
  let hook = state.hook(&user, &addr);
  state.backups.delete_backup(&filename, &hook).await?;
  Ok(Json(json!({ "deleted": filename })))
}
