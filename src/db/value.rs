//! Dynamic parameter binding and row rendering.
//!
//! Filter values arrive as untyped text and row fields as JSON; the column
//! types they bind against are only known to the server. [`BindValue`] keeps
//! the raw input and encodes itself against the parameter type Postgres
//! infers during prepare, so `age > $1` binds an int8 while `name = $1`
//! binds text from the same wire input. The reverse direction,
//! [`row_to_json`], renders result rows to JSON by column type.

use std::error::Error;
use std::fmt::Write as _;

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use postgres_types::{to_sql_checked, FromSql, IsNull, ToSql, Type};
use serde_json::Value;
use tokio_postgres::Row;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum BindValue {
  Null,
  /// Raw text from a query parameter or a scalar JSON field.
  Text(String),
  /// Structured JSON from a request body, kept intact for json/jsonb columns.
  Json(Value),
}

impl BindValue {
  /// Converts a JSON field value into a bind value. Scalars keep their
  /// textual form so they can still bind non-JSON columns.
  pub fn from_json(value: &Value) -> Self {
    match value {
      Value::Null => Self::Null,
      Value::String(s) => Self::Text(s.clone()),
      Value::Bool(b) => Self::Text(b.to_string()),
      Value::Number(n) => Self::Text(n.to_string()),
      Value::Array(_) | Value::Object(_) => Self::Json(value.clone()),
    }
  }

  fn encode_text(
    raw: &str,
    ty: &Type,
    out: &mut BytesMut,
  ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
    match *ty {
      Type::BOOL => parse_bool(raw)?.to_sql(ty, out),
      Type::INT2 => raw.trim().parse::<i16>()?.to_sql(ty, out),
      Type::INT4 => raw.trim().parse::<i32>()?.to_sql(ty, out),
      Type::INT8 => raw.trim().parse::<i64>()?.to_sql(ty, out),
      Type::OID => raw.trim().parse::<u32>()?.to_sql(ty, out),
      Type::FLOAT4 => raw.trim().parse::<f32>()?.to_sql(ty, out),
      Type::FLOAT8 => raw.trim().parse::<f64>()?.to_sql(ty, out),
      Type::NUMERIC => encode_numeric(raw.trim(), out),
      Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
        raw.to_sql(ty, out)
      }
      Type::UUID => Uuid::parse_str(raw.trim())?.to_sql(ty, out),
      Type::TIMESTAMPTZ => parse_timestamptz(raw)?.to_sql(ty, out),
      Type::TIMESTAMP => parse_timestamp(raw)?.to_sql(ty, out),
      Type::DATE => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")?.to_sql(ty, out),
      Type::TIME => NaiveTime::parse_from_str(raw.trim(), "%H:%M:%S%.f")?.to_sql(ty, out),
      Type::JSON | Type::JSONB => {
        let parsed: Value =
          serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        parsed.to_sql(ty, out)
      }
      _ => Err(format!("unsupported parameter type: {ty}").into()),
    }
  }
}

impl ToSql for BindValue {
  fn to_sql(
    &self,
    ty: &Type,
    out: &mut BytesMut,
  ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
    match self {
      Self::Null => Ok(IsNull::Yes),
      Self::Text(raw) => Self::encode_text(raw, ty, out),
      Self::Json(value) => match *ty {
        Type::JSON | Type::JSONB => value.to_sql(ty, out),
        _ => Self::encode_text(&value.to_string(), ty, out),
      },
    }
  }

  fn accepts(_ty: &Type) -> bool {
    // The match in to_sql is the real gate; unsupported types error there
    // and surface as a Database error.
    true
  }

  to_sql_checked!();
}

fn parse_bool(raw: &str) -> Result<bool, Box<dyn Error + Sync + Send>> {
  match raw.trim().to_ascii_lowercase().as_str() {
    "true" | "t" | "1" => Ok(true),
    "false" | "f" | "0" => Ok(false),
    other => Err(format!("invalid boolean: {other:?}").into()),
  }
}

fn parse_timestamptz(raw: &str) -> Result<DateTime<Utc>, Box<dyn Error + Sync + Send>> {
  let raw = raw.trim();
  if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
    return Ok(dt.with_timezone(&Utc));
  }
  // Bare timestamps are taken as UTC.
  Ok(parse_timestamp(raw)?.and_utc())
}

fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, Box<dyn Error + Sync + Send>> {
  let raw = raw.trim();
  for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
      return Ok(dt);
    }
  }
  if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
    if let Some(dt) = d.and_hms_opt(0, 0, 0) {
      return Ok(dt);
    }
  }
  Err(format!("invalid timestamp: {raw:?}").into())
}

const NUMERIC_NEG: u16 = 0x4000;

/// Encodes a decimal string into the numeric wire format: base-10000 digit
/// groups with a weight for the first group's position.
fn encode_numeric(raw: &str, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
  let (neg, body) = match raw.as_bytes().first() {
    Some(b'-') => (true, &raw[1..]),
    Some(b'+') => (false, &raw[1..]),
    _ => (false, raw),
  };
  let mut parts = body.splitn(2, '.');
  let int_part = parts.next().unwrap_or("");
  let frac_part = parts.next().unwrap_or("");
  if body.is_empty()
    || (int_part.is_empty() && frac_part.is_empty())
    || !int_part.bytes().all(|b| b.is_ascii_digit())
    || !frac_part.bytes().all(|b| b.is_ascii_digit())
  {
    return Err(format!("invalid numeric: {raw:?}").into());
  }

  let dscale = frac_part.len() as u16;
  let int_part = int_part.trim_start_matches('0');

  // Align digit groups on the decimal point: pad the integer part on the
  // left and the fraction on the right to multiples of 4.
  let mut padded = String::new();
  let int_pad = (4 - int_part.len() % 4) % 4;
  padded.push_str(&"0".repeat(int_pad));
  padded.push_str(int_part);
  let int_groups = padded.len() / 4;
  padded.push_str(frac_part);
  let frac_pad = (4 - padded.len() % 4) % 4;
  padded.push_str(&"0".repeat(frac_pad));

  let mut digits: Vec<u16> = padded
    .as_bytes()
    .chunks(4)
    .map(|c| std::str::from_utf8(c).unwrap().parse::<u16>().unwrap())
    .collect();

  let mut weight = int_groups as i32 - 1;
  while digits.first() == Some(&0) {
    digits.remove(0);
    weight -= 1;
  }
  while digits.last() == Some(&0) {
    digits.pop();
  }

  if digits.is_empty() {
    weight = 0;
  }
  let sign = if neg && !digits.is_empty() { NUMERIC_NEG } else { 0 };

  out.put_i16(digits.len() as i16);
  out.put_i16(weight as i16);
  out.put_u16(sign);
  out.put_u16(dscale);
  for d in digits {
    out.put_u16(d);
  }
  Ok(IsNull::No)
}

/// Decodes the numeric wire format back into a decimal string.
fn decode_numeric(raw: &[u8]) -> Result<String, Box<dyn Error + Sync + Send>> {
  fn read_u16(raw: &[u8], at: usize) -> Result<u16, Box<dyn Error + Sync + Send>> {
    raw
      .get(at..at + 2)
      .map(|b| u16::from_be_bytes([b[0], b[1]]))
      .ok_or_else(|| "truncated numeric value".into())
  }

  let ndigits = read_u16(raw, 0)? as usize;
  let weight = read_u16(raw, 2)? as i16 as i32;
  let sign = read_u16(raw, 4)?;
  let dscale = read_u16(raw, 6)? as usize;
  if sign == 0xC000 {
    return Ok("NaN".to_string());
  }
  let mut digits = Vec::with_capacity(ndigits);
  for i in 0..ndigits {
    digits.push(read_u16(raw, 8 + i * 2)?);
  }

  let mut s = String::new();
  if sign == NUMERIC_NEG {
    s.push('-');
  }
  if weight < 0 || ndigits == 0 {
    s.push('0');
  } else {
    for i in 0..=weight as usize {
      let d = digits.get(i).copied().unwrap_or(0);
      if i == 0 {
        let _ = write!(s, "{d}");
      } else {
        let _ = write!(s, "{d:04}");
      }
    }
  }
  if dscale > 0 {
    let mut frac = String::new();
    if weight < -1 {
      frac.push_str(&"0000".repeat((-weight - 1) as usize));
    }
    let first_frac = (weight + 1).max(0) as usize;
    for d in digits.iter().skip(first_frac) {
      let _ = write!(frac, "{d:04}");
    }
    while frac.len() < dscale {
      frac.push('0');
    }
    frac.truncate(dscale);
    s.push('.');
    s.push_str(&frac);
  }
  Ok(s)
}

/// Numeric column value carried as its exact decimal text, the same way the
/// node-postgres driver surfaces numerics.
struct PgNumeric(String);

impl<'a> FromSql<'a> for PgNumeric {
  fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
    decode_numeric(raw).map(PgNumeric)
  }

  fn accepts(ty: &Type) -> bool {
    *ty == Type::NUMERIC
  }
}

/// Renders one result row as a JSON object keyed by column name.
pub fn row_to_json(row: &Row) -> Value {
  let mut map = serde_json::Map::with_capacity(row.len());
  for (idx, col) in row.columns().iter().enumerate() {
    map.insert(col.name().to_string(), cell_to_json(row, idx, col.type_()));
  }
  Value::Object(map)
}

fn cell_to_json(row: &Row, idx: usize, ty: &Type) -> Value {
  fn get<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Option<T> {
    row.try_get::<_, Option<T>>(idx).ok().flatten()
  }

  match *ty {
    Type::BOOL => get::<bool>(row, idx).map(Value::Bool),
    Type::INT2 => get::<i16>(row, idx).map(|v| Value::Number(v.into())),
    Type::INT4 => get::<i32>(row, idx).map(|v| Value::Number(v.into())),
    Type::INT8 => get::<i64>(row, idx).map(|v| Value::Number(v.into())),
    Type::OID => get::<u32>(row, idx).map(|v| Value::Number(v.into())),
    Type::FLOAT4 => {
      get::<f32>(row, idx).and_then(|v| serde_json::Number::from_f64(v as f64).map(Value::Number))
    }
    Type::FLOAT8 => {
      get::<f64>(row, idx).and_then(|v| serde_json::Number::from_f64(v).map(Value::Number))
    }
    Type::NUMERIC => get::<PgNumeric>(row, idx).map(|v| Value::String(v.0)),
    Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::CHAR => {
      get::<String>(row, idx).map(Value::String)
    }
    Type::UUID => get::<Uuid>(row, idx).map(|v| Value::String(v.to_string())),
    Type::TIMESTAMPTZ => get::<DateTime<Utc>>(row, idx).map(|v| Value::String(v.to_rfc3339())),
    Type::TIMESTAMP => {
      get::<NaiveDateTime>(row, idx).map(|v| Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
    }
    Type::DATE => get::<NaiveDate>(row, idx).map(|v| Value::String(v.format("%Y-%m-%d").to_string())),
    Type::TIME => get::<NaiveTime>(row, idx).map(|v| Value::String(v.format("%H:%M:%S%.f").to_string())),
    Type::JSON | Type::JSONB => get::<Value>(row, idx),
    Type::BYTEA => get::<Vec<u8>>(row, idx).map(|bytes| {
      let mut s = String::with_capacity(2 + bytes.len() * 2);
      s.push_str("\\x");
      for b in bytes {
        let _ = write!(s, "{b:02x}");
      }
      Value::String(s)
    }),
    // Anything else: fall back to text if the driver allows it.
    _ => get::<String>(row, idx).map(Value::String),
  }
  .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn numeric_bytes(raw: &str) -> Vec<u8> {
    let mut out = BytesMut::new();
    encode_numeric(raw, &mut out).unwrap();
    out.to_vec()
  }

  fn fields(buf: &[u8]) -> (i16, i16, u16, u16, Vec<u16>) {
    let ndigits = i16::from_be_bytes([buf[0], buf[1]]);
    let weight = i16::from_be_bytes([buf[2], buf[3]]);
    let sign = u16::from_be_bytes([buf[4], buf[5]]);
    let dscale = u16::from_be_bytes([buf[6], buf[7]]);
    let digits = buf[8..]
      .chunks(2)
      .map(|c| u16::from_be_bytes([c[0], c[1]]))
      .collect();
    (ndigits, weight, sign, dscale, digits)
  }

  #[test]
  fn numeric_encoding_layout() {
    let (ndigits, weight, sign, dscale, digits) = fields(&numeric_bytes("12345.67"));
    // 1 2345 . 6700 -> groups [1, 2345, 6700], first group weight 1
    assert_eq!(ndigits, 3);
    assert_eq!(weight, 1);
    assert_eq!(sign, 0);
    assert_eq!(dscale, 2);
    assert_eq!(digits, vec![1, 2345, 6700]);
  }

  #[test]
  fn numeric_encoding_small_fraction() {
    let (ndigits, weight, sign, dscale, digits) = fields(&numeric_bytes("-0.00000001"));
    assert_eq!(ndigits, 1);
    assert_eq!(weight, -2);
    assert_eq!(sign, NUMERIC_NEG);
    assert_eq!(dscale, 8);
    assert_eq!(digits, vec![1000]);
  }

  #[test]
  fn numeric_encoding_zero() {
    let (ndigits, weight, sign, dscale, digits) = fields(&numeric_bytes("0.00"));
    assert_eq!(ndigits, 0);
    assert_eq!(weight, 0);
    assert_eq!(sign, 0);
    assert_eq!(dscale, 2);
    assert!(digits.is_empty());
  }

  #[test]
  fn numeric_round_trips() {
    for v in ["0", "1", "-1", "12345.67", "0.5", "9999.9999", "1000000", "0.00000001"] {
      let bytes = numeric_bytes(v);
      let decoded = decode_numeric(&bytes).unwrap();
      // Zero normalizes its sign and padding but keeps the scale.
      if v == "0" {
        assert_eq!(decoded, "0");
      } else {
        assert_eq!(decoded, *v, "round trip of {v}");
      }
    }
  }

  #[test]
  fn numeric_rejects_garbage() {
    let mut out = BytesMut::new();
    assert!(encode_numeric("12a4", &mut out).is_err());
    assert!(encode_numeric("1.2.3", &mut out).is_err());
    assert!(encode_numeric("", &mut out).is_err());
    assert!(encode_numeric("1; DROP TABLE users", &mut out).is_err());
  }

  #[test]
  fn text_binds_by_inferred_type() {
    let mut out = BytesMut::new();
    let v = BindValue::Text("42".into());
    v.to_sql(&Type::INT8, &mut out).unwrap();
    assert_eq!(out.as_ref(), 42i64.to_be_bytes());

    let mut out = BytesMut::new();
    v.to_sql(&Type::TEXT, &mut out).unwrap();
    assert_eq!(out.as_ref(), b"42");
  }

  #[test]
  fn text_rejects_mismatched_type() {
    let mut out = BytesMut::new();
    let v = BindValue::Text("not a number".into());
    assert!(v.to_sql(&Type::INT4, &mut out).is_err());
  }

  #[test]
  fn bool_parsing() {
    assert!(parse_bool("true").unwrap());
    assert!(parse_bool("T").unwrap());
    assert!(!parse_bool("0").unwrap());
    assert!(parse_bool("maybe").is_err());
  }

  #[test]
  fn json_field_scalars_keep_text_form() {
    match BindValue::from_json(&serde_json::json!(7)) {
      BindValue::Text(s) => assert_eq!(s, "7"),
      other => panic!("unexpected: {other:?}"),
    }
    assert!(matches!(
      BindValue::from_json(&Value::Null),
      BindValue::Null
    ));
    assert!(matches!(
      BindValue::from_json(&serde_json::json!({"a": 1})),
      BindValue::Json(_)
    ));
  }
}
