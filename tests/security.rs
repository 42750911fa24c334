//! Security tests for pgward
//!
//! These tests verify that the injection defenses hold:
//! - identifier validation and quoting
//! - parameterization of every filter value
//! - filename safety for backup restore/delete

use pgward::db::query::{self, QuerySpec};
use pgward::db::sanitize::{is_safe_identifier, quote_ident, quote_qualified};

// =============================================================================
// Identifier validation
// =============================================================================

#[test]
fn quote_succeeds_iff_identifier_is_safe() {
  let cases = [
    ("users", true),
    ("_private", true),
    ("order_items", true),
    ("report-2024", true),
    ("", false),
    ("1users", false),
    ("has space", false),
    ("semi;colon", false),
    ("qu'ote", false),
    ("qu\"ote", false),
    ("tab\tchar", false),
    ("new\nline", false),
  ];
  for (ident, safe) in cases {
    assert_eq!(is_safe_identifier(ident), safe, "identifier {ident:?}");
    assert_eq!(quote_ident(ident).is_ok(), safe, "quoting {ident:?}");
  }
}

#[test]
fn classic_injection_identifiers_are_rejected() {
  let attempts = [
    "users; DROP TABLE users;--",
    "' OR '1'='1",
    "users/**/OR/**/1=1",
    "users--",
    "users)",
    "pg_catalog.pg_roles",
  ];
  for attempt in attempts {
    assert!(quote_ident(attempt).is_err(), "accepted {attempt:?}");
    assert!(quote_qualified("public", attempt).is_err());
    assert!(quote_qualified(attempt, "users").is_err());
  }
}

// =============================================================================
// Filter parameterization
// =============================================================================

fn pairs(entries: &[(&str, &str)]) -> Vec<(String, String)> {
  entries
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

#[test]
fn filter_values_never_reach_sql_text() {
  let params = pairs(&[
    ("name", "eq.'; DROP TABLE users;--"),
    ("age", "gt.18 OR 1=1"),
    ("status", "in.a','b"),
  ]);
  let spec = query::parse_query(&params, false).unwrap();
  let live = vec!["name".to_string(), "age".to_string(), "status".to_string()];
  let q = query::build_select("public", "users", &spec, &live).unwrap();
  assert!(!q.sql.contains("DROP"));
  assert!(!q.sql.contains("1=1"));
  assert!(!q.sql.contains('\''));
  // every value is a placeholder
  assert_eq!(q.params.len(), 4); // eq + gt + in(2 items)
}

#[test]
fn malicious_filter_columns_are_dropped_not_interpolated() {
  let params = pairs(&[("col; DROP TABLE x", "eq.1"), ("ok_col", "eq.1")]);
  let spec = query::parse_query(&params, false).unwrap();
  let q = query::build_select("public", "t", &spec, &["ok_col".to_string()]).unwrap();
  assert!(!q.sql.contains("DROP"));
  assert!(q.sql.contains("\"ok_col\""));
}

#[test]
fn order_columns_cannot_inject() {
  let params = pairs(&[("order", "name; DROP TABLE x.desc,age.desc")]);
  let spec = query::parse_query(&params, false).unwrap();
  let q = query::build_select("public", "t", &spec, &[]).unwrap();
  assert!(!q.sql.contains("DROP"));
}

#[test]
fn select_columns_cannot_inject() {
  let params = pairs(&[("select", "name,(SELECT password FROM pg_shadow)")]);
  let spec = query::parse_query(&params, false).unwrap();
  let live = vec!["name".to_string()];
  let q = query::build_select("public", "t", &spec, &live).unwrap();
  assert!(!q.sql.contains("pg_shadow"));
  assert!(q.sql.starts_with("SELECT \"name\" FROM"));
}

#[test]
fn hostile_path_identifiers_fail_the_request() {
  let spec = QuerySpec::default();
  assert!(query::build_select("public'; --", "users", &spec, &[]).is_err());
  assert!(query::build_count("public", "users; DROP", &spec).is_err());
  assert!(query::build_select_one("public", "users", "id OR 1=1", "1").is_err());
}
