//! Structured audit events for the downstream audit/notification subsystem.
//!
//! Every transition, approval, and ledger write produces one event whether it
//! succeeded or not. Delivery is the consumer's business; sinks here only log
//! or buffer.

use crate::error::ErrorKind;
use crate::identity::Actor;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "kind")]
pub enum Outcome {
    Success,
    Failed(FailureKind),
}

/// Serializable mirror of [`ErrorKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Forbidden,
    NotFound,
    Guard,
    Conflict,
    Integrity,
    KeyUnavailable,
    Storage,
}

impl From<ErrorKind> for FailureKind {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Validation => Self::Validation,
            ErrorKind::Forbidden => Self::Forbidden,
            ErrorKind::NotFound => Self::NotFound,
            ErrorKind::Guard => Self::Guard,
            ErrorKind::Conflict => Self::Conflict,
            ErrorKind::Integrity => Self::Integrity,
            ErrorKind::KeyUnavailable => Self::KeyUnavailable,
            ErrorKind::Storage => Self::Storage,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Failed(kind) => write!(f, "failed:{kind:?}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub actor_id: String,
    pub actor_role: String,
    /// Dotted action name, e.g. `assessment.submit`.
    pub action: String,
    /// Resource path, e.g. `assessment/<id>/category/<id>`.
    pub resource: String,
    pub outcome: Outcome,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        actor: &Actor,
        action: impl Into<String>,
        resource: impl Into<String>,
        outcome: Outcome,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            actor_id: actor.user_id.clone(),
            actor_role: actor.role.as_str().to_string(),
            action: action.into(),
            resource: resource.into(),
            outcome,
            at,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &AuditEvent);
}

/// Default sink: one structured log line per event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &AuditEvent) {
        match event.outcome {
            Outcome::Success => tracing::info!(
                actor = %event.actor_id,
                role = %event.actor_role,
                action = %event.action,
                resource = %event.resource,
                outcome = %event.outcome,
                "audit"
            ),
            Outcome::Failed(_) => tracing::warn!(
                actor = %event.actor_id,
                role = %event.actor_role,
                action = %event.action,
                resource = %event.resource,
                outcome = %event.outcome,
                "audit"
            ),
        }
    }
}

/// Buffers events in memory for observers and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn actions(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.action.clone()).collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &AuditEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_keeps_order() {
        let sink = MemorySink::new();
        let actor = Actor::reviewer("rev-1");
        let now = Utc::now();
        sink.emit(&AuditEvent::new(&actor, "approval.grant", "a/1", Outcome::Success, now));
        sink.emit(&AuditEvent::new(
            &actor,
            "approval.revoke",
            "a/1",
            Outcome::Failed(FailureKind::Guard),
            now,
        ));
        assert_eq!(sink.actions(), vec!["approval.grant", "approval.revoke"]);
        assert!(sink.events()[0].succeeded());
        assert!(!sink.events()[1].succeeded());
    }

    #[test]
    fn outcome_serializes_with_kind() {
        let json = serde_json::to_string(&Outcome::Failed(FailureKind::Integrity)).unwrap();
        assert_eq!(json, r#"{"status":"failed","kind":"integrity"}"#);
        let json = serde_json::to_string(&Outcome::Success).unwrap();
        assert_eq!(json, r#"{"status":"success"}"#);
    }
}
