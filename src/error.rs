//! Central error taxonomy.
//!
//! Every engine operation returns `EngineError`; the HTTP layer translates it
//! to a response in exactly one place (the `IntoResponse` impl below).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  /// Malformed input: bad identifier, missing field, unsafe filename.
  /// Recoverable; the caller can fix the request and retry.
  #[error("{0}")]
  Validation(String),

  #[error("{0}")]
  NotFound(String),

  #[error("authentication required")]
  Unauthorized,

  #[error("insufficient privileges")]
  Forbidden,

  /// Engine-level failure surfaced by Postgres, annotated with whatever
  /// metadata the server reported.
  #[error("database error: {message}")]
  Database {
    code: Option<String>,
    constraint: Option<String>,
    table: Option<String>,
    message: String,
  },

  #[error("internal error")]
  Internal(#[from] anyhow::Error),
}

impl EngineError {
  pub fn validation(msg: impl Into<String>) -> Self {
    Self::Validation(msg.into())
  }

  pub fn not_found(msg: impl Into<String>) -> Self {
    Self::NotFound(msg.into())
  }
}

impl From<tokio_postgres::Error> for EngineError {
  fn from(err: tokio_postgres::Error) -> Self {
    match err.as_db_error() {
      Some(db) => Self::Database {
        code: Some(db.code().code().to_string()),
        constraint: db.constraint().map(str::to_string),
        table: db.table().map(str::to_string),
        message: db.message().to_string(),
      },
      None => Self::Database {
        code: None,
        constraint: None,
        table: None,
        message: err.to_string(),
      },
    }
  }
}

impl From<deadpool_postgres::PoolError> for EngineError {
  fn from(err: deadpool_postgres::PoolError) -> Self {
    if let deadpool_postgres::PoolError::Backend(e) = err {
      return e.into();
    }
    Self::Database {
      code: None,
      constraint: None,
      table: None,
      message: err.to_string(),
    }
  }
}

impl IntoResponse for EngineError {
  fn into_response(self) -> Response {
    let (status, body) = match &self {
      Self::Validation(msg) => (
        StatusCode::BAD_REQUEST,
        json!({ "error": "validation", "message": msg }),
      ),
      Self::NotFound(msg) => (
        StatusCode::NOT_FOUND,
        json!({ "error": "not_found", "message": msg }),
      ),
      Self::Unauthorized => (
        StatusCode::UNAUTHORIZED,
        json!({ "error": "unauthorized", "message": self.to_string() }),
      ),
      Self::Forbidden => (
        StatusCode::FORBIDDEN,
        json!({ "error": "forbidden", "message": self.to_string() }),
      ),
      Self::Database {
        code,
        constraint,
        table,
        message,
      } => (
        StatusCode::BAD_REQUEST,
        json!({
          "error": "database",
          "message": message,
          "code": code,
          "constraint": constraint,
          "table": table,
        }),
      ),
      Self::Internal(err) => {
        tracing::error!("internal error: {:#}", err);
        (
          StatusCode::INTERNAL_SERVER_ERROR,
          json!({ "error": "internal", "message": "internal error" }),
        )
      }
    };
    (status, Json(body)).into_response()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn validation_displays_message() {
    let e = EngineError::validation("bad column name");
    assert_eq!(e.to_string(), "bad column name");
  }

  #[test]
  fn internal_hides_detail() {
    let e = EngineError::Internal(anyhow::anyhow!("secret connection string"));
    assert_eq!(e.to_string(), "internal error");
  }
}
