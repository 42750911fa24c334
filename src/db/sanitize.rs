//! Identifier validation and quoting.
//!
//! Every name (database, schema, table, column, role, index) that ends up
//! literally inside SQL text passes through this module first. The query and
//! mutation builders never construct SQL from an unvalidated identifier.

use crate::error::EngineError;

/// Postgres truncates identifiers at 63 bytes; anything longer is suspect.
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Returns true when `s` matches `^[A-Za-z_][A-Za-z0-9_-]*$` and fits the
/// length bound.
pub fn is_safe_identifier(s: &str) -> bool {
  if s.is_empty() || s.len() > MAX_IDENTIFIER_LENGTH {
    return false;
  }
  let mut chars = s.chars();
  let first = chars.next().unwrap();
  if !first.is_ascii_alphabetic() && first != '_' {
    return false;
  }
  chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Quotes `s` for use as an identifier in SQL text.
///
/// Validates first and fails loudly: quoting is never reached for an
/// identifier that did not pass [`is_safe_identifier`].
pub fn quote_ident(s: &str) -> Result<String, EngineError> {
  if !is_safe_identifier(s) {
    return Err(EngineError::validation(format!("invalid identifier: {s:?}")));
  }
  Ok(format!("\"{}\"", s.replace('"', "\"\"")))
}

/// Quotes a `schema.name` pair.
pub fn quote_qualified(schema: &str, name: &str) -> Result<String, EngineError> {
  Ok(format!("{}.{}", quote_ident(schema)?, quote_ident(name)?))
}

/// Escapes a string for the few DDL positions that cannot take a bind
/// parameter (role passwords, column defaults). Single quotes are doubled;
/// null bytes are rejected outright.
pub fn escape_literal(s: &str) -> Result<String, EngineError> {
  if s.contains('\0') {
    return Err(EngineError::validation("null bytes not allowed in literals"));
  }
  Ok(format!("'{}'", s.replace('\'', "''")))
}

/// Column types accepted by the DDL layer. Type names are not identifiers,
/// so they get their own whitelist instead of the identifier grammar.
const COLUMN_TYPES: &[&str] = &[
  "smallint",
  "integer",
  "int",
  "bigint",
  "serial",
  "bigserial",
  "real",
  "double precision",
  "numeric",
  "decimal",
  "boolean",
  "text",
  "varchar",
  "character varying",
  "char",
  "character",
  "uuid",
  "date",
  "time",
  "timetz",
  "timestamp",
  "timestamptz",
  "timestamp with time zone",
  "timestamp without time zone",
  "json",
  "jsonb",
  "bytea",
  "inet",
  "cidr",
  "macaddr",
  "interval",
];

/// Validates a column type: a whitelisted base type, an optional
/// `(n)` / `(n,m)` size suffix, and an optional `[]` array marker.
pub fn is_safe_column_type(s: &str) -> bool {
  let mut t = s.trim().to_ascii_lowercase();
  if let Some(stripped) = t.strip_suffix("[]") {
    t = stripped.trim_end().to_string();
  }
  if let Some(open) = t.find('(') {
    if !t.ends_with(')') {
      return false;
    }
    let args = &t[open + 1..t.len() - 1];
    if args.is_empty() || !args.chars().all(|c| c.is_ascii_digit() || c == ',' || c == ' ') {
      return false;
    }
    t.truncate(open);
    t = t.trim_end().to_string();
  }
  COLUMN_TYPES.contains(&t.as_str())
}

pub fn validate_column_type(s: &str) -> Result<(), EngineError> {
  if is_safe_column_type(s) {
    Ok(())
  } else {
    Err(EngineError::validation(format!("unsupported column type: {s:?}")))
  }
}
