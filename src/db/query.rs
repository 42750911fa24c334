//! Dynamic query builder: declarative filter/sort/select/pagination
//! parameters in, parameterized SQL out.
//!
//! The parser is permissive by default: an unknown operator or an invalid
//! filter column degrades that one filter instead of failing the request.
//! Path identifiers (database/schema/table) are different: those fail hard
//! in the builders. `strict_filters` flips the permissive policy so client
//! bugs surface instead of being masked.

use deadpool_postgres::Pool;
use postgres_types::ToSql;
use serde::Serialize;
use serde_json::Value;

use crate::db::introspect;
use crate::db::sanitize::{is_safe_identifier, quote_ident, quote_qualified};
use crate::db::value::{row_to_json, BindValue};
use crate::error::EngineError;

/// Hard cap on a single page of rows.
pub const MAX_LIMIT: i64 = 1000;

/// Query-string keys that are never treated as filters.
pub const RESERVED_PARAMS: &[&str] = &["select", "order", "limit", "offset", "page", "per_page"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
  Eq,
  Neq,
  Gt,
  Gte,
  Lt,
  Lte,
  Like,
  Ilike,
  Is,
  In,
  Fts,
}

impl FilterOp {
  fn parse(s: &str) -> Option<Self> {
    match s {
      "eq" => Some(Self::Eq),
      "neq" => Some(Self::Neq),
      "gt" => Some(Self::Gt),
      "gte" => Some(Self::Gte),
      "lt" => Some(Self::Lt),
      "lte" => Some(Self::Lte),
      "like" => Some(Self::Like),
      "ilike" => Some(Self::Ilike),
      "is" => Some(Self::Is),
      "in" => Some(Self::In),
      "fts" => Some(Self::Fts),
      _ => None,
    }
  }

  fn comparison_sql(self) -> &'static str {
    match self {
      Self::Eq => "=",
      Self::Neq => "!=",
      Self::Gt => ">",
      Self::Gte => ">=",
      Self::Lt => "<",
      Self::Lte => "<=",
      Self::Like => "LIKE",
      Self::Ilike => "ILIKE",
      _ => unreachable!("not a comparison operator"),
    }
  }
}

#[derive(Debug, Clone)]
pub struct Filter {
  pub column: String,
  pub op: FilterOp,
  pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
  #[default]
  Asc,
  Desc,
}

/// Parsed query parameters for one listing request. Built fresh per request,
/// never persisted.
#[derive(Debug, Clone)]
pub struct QuerySpec {
  pub filters: Vec<Filter>,
  pub order: Vec<(String, SortDirection)>,
  pub select: Option<Vec<String>>,
  pub limit: i64,
  pub offset: i64,
}

impl Default for QuerySpec {
  fn default() -> Self {
    Self {
      filters: Vec::new(),
      order: Vec::new(),
      select: None,
      limit: MAX_LIMIT,
      offset: 0,
    }
  }
}

fn clamp_limit(v: i64) -> i64 {
  v.clamp(0, MAX_LIMIT)
}

/// Parses raw query-string pairs into a [`QuerySpec`].
pub fn parse_query(params: &[(String, String)], strict: bool) -> Result<QuerySpec, EngineError> {
  let mut spec = QuerySpec::default();
  let mut page: Option<i64> = None;
  let mut limit_set = false;
  let mut offset_set = false;

  for (key, value) in params {
    match key.as_str() {
      "select" => {
        if value.is_empty() || value == "*" {
          continue;
        }
        let cols: Vec<String> = value
          .split(',')
          .map(str::trim)
          .filter(|c| is_safe_identifier(c))
          .map(str::to_string)
          .collect();
        spec.select = Some(cols);
      }
      "order" => {
        for entry in value.split(',') {
          let entry = entry.trim();
          if entry.is_empty() {
            continue;
          }
          let (col, dir) = match entry.split_once('.') {
            Some((c, d)) if d.eq_ignore_ascii_case("desc") => (c, SortDirection::Desc),
            Some((c, _)) => (c, SortDirection::Asc),
            None => (entry, SortDirection::Asc),
          };
          if is_safe_identifier(col) {
            spec.order.push((col.to_string(), dir));
          } else if strict {
            return Err(EngineError::validation(format!(
              "invalid order column: {col:?}"
            )));
          }
        }
      }
      "limit" => {
        if let Ok(v) = value.parse::<i64>() {
          spec.limit = clamp_limit(v);
          limit_set = true;
        } else if strict {
          return Err(EngineError::validation(format!("invalid limit: {value:?}")));
        }
      }
      "offset" => {
        if let Ok(v) = value.parse::<i64>() {
          spec.offset = v.max(0);
          offset_set = true;
        } else if strict {
          return Err(EngineError::validation(format!("invalid offset: {value:?}")));
        }
      }
      "page" => {
        if let Ok(v) = value.parse::<i64>() {
          page = Some(v.max(1));
        }
      }
      "per_page" => {
        if let Ok(v) = value.parse::<i64>() {
          if !limit_set {
            spec.limit = clamp_limit(v);
          }
        }
      }
      column => {
        if !is_safe_identifier(column) {
          if strict {
            return Err(EngineError::validation(format!(
              "invalid filter column: {column:?}"
            )));
          }
          continue;
        }
        let Some((op_str, raw)) = value.split_once('.') else {
          if strict {
            return Err(EngineError::validation(format!(
              "filter {column:?} is missing an operator"
            )));
          }
          continue;
        };
        let Some(op) = FilterOp::parse(op_str) else {
          if strict {
            return Err(EngineError::validation(format!(
              "unknown filter operator: {op_str:?}"
            )));
          }
          continue;
        };
        if op == FilterOp::Is && !matches!(raw, "null" | "true" | "false") {
          if strict {
            return Err(EngineError::validation(format!(
              "'is' accepts null, true or false, got {raw:?}"
            )));
          }
          continue;
        }
        spec.filters.push(Filter {
          column: column.to_string(),
          op,
          value: raw.to_string(),
        });
      }
    }
  }

  if let Some(page) = page {
    if !offset_set {
      spec.offset = (page - 1).saturating_mul(spec.limit);
    }
  }

  Ok(spec)
}

/// A rendered statement plus its bind values, ready for execution.
#[derive(Debug)]
pub struct BuiltQuery {
  pub sql: String,
  pub params: Vec<BindValue>,
}

fn render_where(filters: &[Filter], params: &mut Vec<BindValue>) -> Result<String, EngineError> {
  let mut conditions = Vec::with_capacity(filters.len());
  for f in filters {
    let col = quote_ident(&f.column)?;
    match f.op {
      FilterOp::Eq | FilterOp::Neq | FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte => {
        params.push(BindValue::Text(f.value.clone()));
        conditions.push(format!("{col} {} ${}", f.op.comparison_sql(), params.len()));
      }
      FilterOp::Like | FilterOp::Ilike => {
        params.push(BindValue::Text(f.value.replace('*', "%")));
        conditions.push(format!("{col} {} ${}", f.op.comparison_sql(), params.len()));
      }
      FilterOp::Is => {
        let rendered = match f.value.as_str() {
          "null" => "IS NULL",
          "true" => "IS TRUE",
          "false" => "IS FALSE",
          other => {
            return Err(EngineError::validation(format!(
              "invalid 'is' value: {other:?}"
            )))
          }
        };
        conditions.push(format!("{col} {rendered}"));
      }
      FilterOp::In => {
        let mut placeholders = Vec::new();
        for item in f.value.split(',') {
          params.push(BindValue::Text(item.to_string()));
          placeholders.push(format!("${}", params.len()));
        }
        conditions.push(format!("{col} IN ({})", placeholders.join(", ")));
      }
      FilterOp::Fts => {
        params.push(BindValue::Text(f.value.clone()));
        conditions.push(format!(
          "to_tsvector({col}::text) @@ plainto_tsquery(${})",
          params.len()
        ));
      }
    }
  }
  Ok(conditions.join(" AND "))
}

fn render_select_list(
  select: Option<&[String]>,
  live_columns: &[String],
) -> Result<String, EngineError> {
  let Some(requested) = select else {
    return Ok("*".to_string());
  };
  let kept: Vec<String> = requested
    .iter()
    .filter(|c| live_columns.iter().any(|l| l == *c))
    .map(|c| quote_ident(c))
    .collect::<Result<_, _>>()?;
  if kept.is_empty() {
    return Ok("*".to_string());
  }
  Ok(kept.join(", "))
}

fn render_order(order: &[(String, SortDirection)]) -> Result<String, EngineError> {
  let rendered: Vec<String> = order
    .iter()
    .map(|(col, dir)| {
      Ok(format!(
        "{} {}",
        quote_ident(col)?,
        match dir {
          SortDirection::Asc => "ASC",
          SortDirection::Desc => "DESC",
        }
      ))
    })
    .collect::<Result<_, EngineError>>()?;
  Ok(rendered.join(", "))
}

/// Builds the page query: SELECT list with WHERE / ORDER BY / LIMIT / OFFSET.
pub fn build_select(
  schema: &str,
  table: &str,
  spec: &QuerySpec,
  live_columns: &[String],
) -> Result<BuiltQuery, EngineError> {
  let target = quote_qualified(schema, table)?;
  let select_list = render_select_list(spec.select.as_deref(), live_columns)?;
  let mut params = Vec::new();
  let where_sql = render_where(&spec.filters, &mut params)?;

  let mut sql = format!("SELECT {select_list} FROM {target}");
  if !where_sql.is_empty() {
    sql.push_str(" WHERE ");
    sql.push_str(&where_sql);
  }
  if !spec.order.is_empty() {
    sql.push_str(" ORDER BY ");
    sql.push_str(&render_order(&spec.order)?);
  }
  // limit/offset are validated integers, not user text.
  sql.push_str(&format!(" LIMIT {} OFFSET {}", spec.limit, spec.offset));
  Ok(BuiltQuery { sql, params })
}

/// Builds the companion total-count query over the same WHERE/parameter set.
pub fn build_count(schema: &str, table: &str, spec: &QuerySpec) -> Result<BuiltQuery, EngineError> {
  let target = quote_qualified(schema, table)?;
  let mut params = Vec::new();
  let where_sql = render_where(&spec.filters, &mut params)?;
  let mut sql = format!("SELECT COUNT(*) FROM {target}");
  if !where_sql.is_empty() {
    sql.push_str(" WHERE ");
    sql.push_str(&where_sql);
  }
  Ok(BuiltQuery { sql, params })
}

/// Builds the single-row lookup by an explicit key column.
pub fn build_select_one(
  schema: &str,
  table: &str,
  key_column: &str,
  key: &str,
) -> Result<BuiltQuery, EngineError> {
  let target = quote_qualified(schema, table)?;
  let col = quote_ident(key_column)?;
  Ok(BuiltQuery {
    sql: format!("SELECT * FROM {target} WHERE {col} = $1 LIMIT 1"),
    params: vec![BindValue::Text(key.to_string())],
  })
}

#[derive(Debug, Serialize)]
pub struct RowPage {
  pub rows: Vec<Value>,
  pub total: i64,
  pub limit: i64,
  pub offset: i64,
}

pub(crate) fn param_refs(params: &[BindValue]) -> Vec<&(dyn ToSql + Sync)> {
  params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

/// Runs the page and count queries for one listing request.
///
/// The two statements share parameters but not a snapshot; under concurrent
/// writes the total can drift from the page. This matches the original
/// behavior and is accepted (see DESIGN.md).
pub async fn fetch_rows(
  pool: &Pool,
  schema: &str,
  table: &str,
  spec: &QuerySpec,
) -> Result<RowPage, EngineError> {
  let columns = introspect::list_columns(pool, schema, table).await?;
  if columns.is_empty() {
    return Err(EngineError::not_found(format!(
      "table {schema}.{table} does not exist"
    )));
  }
  let live: Vec<String> = columns.into_iter().map(|c| c.name).collect();

  let page_q = build_select(schema, table, spec, &live)?;
  let count_q = build_count(schema, table, spec)?;

  let client = pool.get().await?;
  let rows = client.query(page_q.sql.as_str(), &param_refs(&page_q.params)).await?;
  let total: i64 = client
    .query_one(count_q.sql.as_str(), &param_refs(&count_q.params))
    .await?
    .get(0);

  Ok(RowPage {
    rows: rows.iter().map(row_to_json).collect(),
    total,
    limit: spec.limit,
    offset: spec.offset,
  })
}

/// Fetches one row by key column, or None.
pub async fn fetch_row(
  pool: &Pool,
  schema: &str,
  table: &str,
  key_column: &str,
  key: &str,
) -> Result<Option<Value>, EngineError> {
  let q = build_select_one(schema, table, key_column, key)?;
  let client = pool.get().await?;
  let row = client.query_opt(q.sql.as_str(), &param_refs(&q.params)).await?;
  Ok(row.as_ref().map(row_to_json))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn pairs(entries: &[(&str, &str)]) -> Vec<(String, String)> {
    entries
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect()
  }

  #[test]
  fn parses_comparison_filters() {
    let spec = parse_query(&pairs(&[("age", "gt.18"), ("name", "eq.alice")]), false).unwrap();
    assert_eq!(spec.filters.len(), 2);
    assert_eq!(spec.filters[0].op, FilterOp::Gt);
    assert_eq!(spec.filters[0].value, "18");
    assert_eq!(spec.filters[1].op, FilterOp::Eq);
  }

  #[test]
  fn drops_unknown_operators_when_permissive() {
    let spec = parse_query(&pairs(&[("age", "wibble.18")]), false).unwrap();
    assert!(spec.filters.is_empty());
  }

  #[test]
  fn strict_mode_rejects_unknown_operators() {
    assert!(parse_query(&pairs(&[("age", "wibble.18")]), true).is_err());
    assert!(parse_query(&pairs(&[("bad;col", "eq.1")]), true).is_err());
    assert!(parse_query(&pairs(&[("age", "noperator")]), true).is_err());
  }

  #[test]
  fn drops_invalid_filter_columns() {
    let spec = parse_query(&pairs(&[("bad;col", "eq.1"), ("ok", "eq.1")]), false).unwrap();
    assert_eq!(spec.filters.len(), 1);
    assert_eq!(spec.filters[0].column, "ok");
  }

  #[test]
  fn limit_is_clamped() {
    let spec = parse_query(&pairs(&[("limit", "99999")]), false).unwrap();
    assert_eq!(spec.limit, MAX_LIMIT);
    let spec = parse_query(&pairs(&[("limit", "-5")]), false).unwrap();
    assert_eq!(spec.limit, 0);
    let spec = parse_query(&pairs(&[("offset", "-3")]), false).unwrap();
    assert_eq!(spec.offset, 0);
  }

  #[test]
  fn page_derives_offset() {
    let spec = parse_query(&pairs(&[("page", "3"), ("per_page", "20")]), false).unwrap();
    assert_eq!(spec.limit, 20);
    assert_eq!(spec.offset, 40);
  }

  #[test]
  fn reserved_params_are_never_filters() {
    let spec = parse_query(&pairs(&[("select", "eq.x"), ("order", "eq.y")]), false).unwrap();
    assert!(spec.filters.is_empty());
  }

  #[test]
  fn one_placeholder_per_filter_value() {
    let spec = parse_query(
      &pairs(&[("age", "gt.18"), ("status", "in.new,open,closed"), ("q", "fts.rust")]),
      false,
    )
    .unwrap();
    let live = vec!["age".to_string(), "status".to_string(), "q".to_string()];
    let q = build_select("public", "things", &spec, &live).unwrap();
    // 1 (gt) + 3 (in) + 1 (fts)
    assert_eq!(q.params.len(), 5);
    for n in 1..=5 {
      assert!(q.sql.contains(&format!("${n}")), "missing ${n} in {}", q.sql);
    }
    // raw values never appear in the SQL text
    assert!(!q.sql.contains("18"));
    assert!(!q.sql.contains("open"));
    assert!(!q.sql.contains("rust"));
  }

  #[test]
  fn like_translates_wildcards() {
    let spec = parse_query(&pairs(&[("name", "ilike.*smith*")]), false).unwrap();
    let q = build_select("public", "people", &spec, &["name".to_string()]).unwrap();
    assert!(q.sql.contains("ILIKE $1"));
    match &q.params[0] {
      BindValue::Text(s) => assert_eq!(s, "%smith%"),
      other => panic!("unexpected param {other:?}"),
    }
  }

  #[test]
  fn is_operator_renders_without_params() {
    let spec = parse_query(
      &pairs(&[("deleted_at", "is.null"), ("active", "is.true")]),
      false,
    )
    .unwrap();
    let q = build_select("public", "t", &spec, &[]).unwrap();
    assert!(q.sql.contains("\"deleted_at\" IS NULL"));
    assert!(q.sql.contains("\"active\" IS TRUE"));
    assert!(q.params.is_empty());
  }

  #[test]
  fn is_operator_rejects_other_values() {
    let spec = parse_query(&pairs(&[("x", "is.banana")]), false).unwrap();
    assert!(spec.filters.is_empty());
  }

  #[test]
  fn select_intersects_live_columns() {
    let live = vec!["id".to_string(), "name".to_string(), "email".to_string()];
    let spec = parse_query(&pairs(&[("select", "name,bogus")]), false).unwrap();
    let q = build_select("public", "users", &spec, &live).unwrap();
    assert!(q.sql.starts_with("SELECT \"name\" FROM"));

    let spec = parse_query(&pairs(&[("select", "")]), false).unwrap();
    let q = build_select("public", "users", &spec, &live).unwrap();
    assert!(q.sql.starts_with("SELECT * FROM"));
  }

  #[test]
  fn select_falls_back_to_star_when_nothing_survives() {
    let live = vec!["id".to_string()];
    let spec = parse_query(&pairs(&[("select", "bogus,missing")]), false).unwrap();
    let q = build_select("public", "users", &spec, &live).unwrap();
    assert!(q.sql.starts_with("SELECT * FROM"));
  }

  #[test]
  fn order_parses_direction() {
    let spec = parse_query(&pairs(&[("order", "name.desc,age,bad col.desc")]), false).unwrap();
    assert_eq!(
      spec.order,
      vec![
        ("name".to_string(), SortDirection::Desc),
        ("age".to_string(), SortDirection::Asc),
      ]
    );
    let q = build_select("public", "t", &spec, &[]).unwrap();
    assert!(q.sql.contains("ORDER BY \"name\" DESC, \"age\" ASC"));
  }

  #[test]
  fn count_query_shares_where_but_not_pagination() {
    let spec = parse_query(
      &pairs(&[("age", "gt.18"), ("order", "age.desc"), ("limit", "10")]),
      false,
    )
    .unwrap();
    let q = build_count("public", "users", &spec).unwrap();
    assert!(q.sql.starts_with("SELECT COUNT(*)"));
    assert!(q.sql.contains("\"age\" > $1"));
    assert!(!q.sql.contains("ORDER BY"));
    assert!(!q.sql.contains("LIMIT"));
    assert_eq!(q.params.len(), 1);
  }

  #[test]
  fn path_identifiers_fail_hard() {
    let spec = QuerySpec::default();
    assert!(build_select("public; DROP", "users", &spec, &[]).is_err());
    assert!(build_select("public", "users--", &spec, &[]).is_err());
    assert!(build_select_one("public", "users", "id;", "1").is_err());
  }

  #[test]
  fn select_one_binds_the_key() {
    let q = build_select_one("public", "users", "id", "42").unwrap();
    assert_eq!(
      q.sql,
      "SELECT * FROM \"public\".\"users\" WHERE \"id\" = $1 LIMIT 1"
    );
    assert_eq!(q.params.len(), 1);
  }
}
