//! Authentication collaborator interface.
//!
//! Token issuance lives outside this service; the engine only needs
//! "who is calling and what are they allowed to do". The bundled
//! implementation checks a SHA-256 hash of a statically configured admin
//! token, which is enough to run the daemon stand-alone.

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::EngineError;
use crate::server::config::AuthSection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  /// Full access including DDL, roles, backups and restores.
  Admin,
  /// Row-level reads and writes only.
  Operator,
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
  pub name: String,
  pub role: Role,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
  async fn authenticate(&self, token: &str) -> Result<User, EngineError>;
}

pub fn require_role(user: &User, roles: &[Role]) -> Result<(), EngineError> {
  if roles.contains(&user.role) {
    Ok(())
  } else {
    Err(EngineError::Forbidden)
  }
}

fn hash_token(token: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(token.as_bytes());
  format!("{:x}", hasher.finalize())
}

/// Static-token provider: compares the SHA-256 hex digest of the presented
/// bearer token against the configured admin token's digest. With auth
/// disabled every caller is an anonymous admin (development mode).
pub struct StaticTokenAuth {
  enabled: bool,
  admin_hash: Option<String>,
}

impl StaticTokenAuth {
  pub fn new(section: &AuthSection) -> Self {
    Self {
      enabled: section.enabled,
      admin_hash: section.admin_token.as_deref().map(hash_token),
    }
  }
}

#[async_trait]
impl AuthProvider for StaticTokenAuth {
  async fn authenticate(&self, token: &str) -> Result<User, EngineError> {
    if !self.enabled {
      return Ok(User {
        name: "anonymous".into(),
        role: Role::Admin,
      });
    }
    match &self.admin_hash {
      Some(hash) if *hash == hash_token(token) => Ok(User {
        name: "admin".into(),
        role: Role::Admin,
      }),
      _ => Err(EngineError::Unauthorized),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn section(enabled: bool, token: Option<&str>) -> AuthSection {
    AuthSection {
      enabled,
      admin_token: token.map(str::to_string),
    }
  }

  #[tokio::test]
  async fn disabled_auth_admits_everyone() {
    let auth = StaticTokenAuth::new(&section(false, None));
    let user = auth.authenticate("anything").await.unwrap();
    assert_eq!(user.role, Role::Admin);
  }

  #[tokio::test]
  async fn valid_token_is_admin() {
    let auth = StaticTokenAuth::new(&section(true, Some("s3cret")));
    assert!(auth.authenticate("s3cret").await.is_ok());
    assert!(matches!(
      auth.authenticate("wrong").await,
      Err(EngineError::Unauthorized)
    ));
  }

  #[tokio::test]
  async fn enabled_without_token_rejects_all() {
    let auth = StaticTokenAuth::new(&section(true, None));
    assert!(auth.authenticate("anything").await.is_err());
  }

  #[test]
  fn role_gate() {
    let admin = User {
      name: "a".into(),
      role: Role::Admin,
    };
    let operator = User {
      name: "o".into(),
      role: Role::Operator,
    };
    assert!(require_role(&admin, &[Role::Admin]).is_ok());
    assert!(require_role(&operator, &[Role::Admin]).is_err());
    assert!(require_role(&operator, &[Role::Admin, Role::Operator]).is_ok());
  }
}
