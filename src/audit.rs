//! Audit event emission.
//!
//! Every mutating operation emits one event naming the actor, the action,
//! and the fully qualified target. The sink is a collaborator behind the
//! [`Auditor`] trait; emission is fire-and-forget and can never abort the
//! operation that triggered it.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
  pub actor: String,
  pub action: String,
  pub target: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub metadata: Option<Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub ip_address: Option<IpAddr>,
  pub timestamp: DateTime<Utc>,
}

pub trait Auditor: Send + Sync {
  fn log(&self, event: AuditEvent);
}

/// Default sink: structured log records under the `audit` target. Swapping
/// in a persistent sink is a matter of implementing [`Auditor`].
pub struct TracingAuditor;

impl Auditor for TracingAuditor {
  fn log(&self, event: AuditEvent) {
    tracing::info!(
      target: "audit",
      actor = %event.actor,
      action = %event.action,
      audit_target = %event.target,
      ip = ?event.ip_address,
      metadata = ?event.metadata,
      "audit event"
    );
  }
}

/// Per-request emission handle: the sink plus the actor context, passed into
/// the mutation layer so events are emitted after the statement succeeds
/// without coupling the mutations to any particular sink.
#[derive(Clone)]
pub struct AuditHook {
  auditor: Arc<dyn Auditor>,
  actor: String,
  ip_address: Option<IpAddr>,
}

impl AuditHook {
  pub fn new(auditor: Arc<dyn Auditor>, actor: impl Into<String>, ip_address: Option<IpAddr>) -> Self {
    Self {
      auditor,
      actor: actor.into(),
      ip_address,
    }
  }

  pub fn emit(&self, action: &str, target: impl Into<String>, metadata: Option<Value>) {
    self.auditor.log(AuditEvent {
      actor: self.actor.clone(),
      action: action.to_string(),
      target: target.into(),
      metadata,
      ip_address: self.ip_address,
      timestamp: Utc::now(),
    });
  }
}

#[cfg(test)]
pub mod testing {
  use super::*;
  use parking_lot::Mutex;

  /// Collects events for assertions.
  #[derive(Default)]
  pub struct RecordingAuditor {
    pub events: Mutex<Vec<AuditEvent>>,
  }

  impl Auditor for RecordingAuditor {
    fn log(&self, event: AuditEvent) {
      self.events.lock().push(event);
    }
  }
}
