//! Append-only audit events.
//!
//! Every state transition, ingress decision, and configuration change
//! writes one of these. Events are ordered by `(workspace_id, ts, seq)`;
//! the daemon assigns `seq` monotonically within its connection.
//!
//! Integration events accept only a token's `last4` - there is no
//! constructor that takes the token itself, so a full secret cannot reach
//! an audit payload by construction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::WorkspaceId;

/// Who performed an audited action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Actor {
    /// An interactive user, identified by the authenticated subject.
    User {
        /// Authenticated subject id.
        subject: String,
    },
    /// The CI ingress acting on behalf of a workspace.
    Ci,
    /// The run worker or another internal component.
    System,
}

/// One audit event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
    /// Who acted.
    pub actor: Actor,
    /// Dotted event type, e.g. `run.state_changed`.
    pub event_type: String,
    /// Structured detail. Free-form, but never a secret.
    pub payload: Value,
    /// When the event happened.
    pub ts: DateTime<Utc>,
}

impl AuditEvent {
    /// Creates an event stamped now.
    #[must_use]
    pub fn new(
        workspace_id: WorkspaceId,
        actor: Actor,
        event_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            workspace_id,
            actor,
            event_type: event_type.into(),
            payload,
            ts: Utc::now(),
        }
    }

    /// Integration stored or rotated. Takes the token's `last4` only.
    #[must_use]
    pub fn integration_stored(workspace_id: WorkspaceId, actor: Actor, token_last4: &str) -> Self {
        Self::new(
            workspace_id,
            actor,
            "integration.stored",
            serde_json::json!({ "token_last4": token_last4 }),
        )
    }

    /// Integration disabled.
    #[must_use]
    pub fn integration_disabled(workspace_id: WorkspaceId, actor: Actor) -> Self {
        Self::new(workspace_id, actor, "integration.disabled", Value::Null)
    }

    /// A run changed state.
    #[must_use]
    pub fn run_state_changed(
        workspace_id: WorkspaceId,
        run_id: crate::ids::RunId,
        from: &str,
        to: &str,
    ) -> Self {
        Self::new(
            workspace_id,
            Actor::System,
            "run.state_changed",
            serde_json::json!({ "run_id": run_id, "from": from, "to": to }),
        )
    }

    /// A CI request was accepted or rejected.
    #[must_use]
    pub fn ci_request(workspace_id: WorkspaceId, accepted: bool, detail: &str) -> Self {
        Self::new(
            workspace_id,
            Actor::Ci,
            if accepted {
                "ci.request_accepted"
            } else {
                "ci.request_rejected"
            },
            serde_json::json!({ "detail": detail }),
        )
    }
}

/// Sink for audit events. The daemon's implementation appends to SQLite;
/// tests collect in memory.
pub trait AuditSink: Send + Sync {
    /// Appends one event. Append-only: implementations never update or
    /// delete.
    fn append(&self, event: AuditEvent);
}

/// In-memory sink for tests.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: std::sync::Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("lock poisoned").clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, event: AuditEvent) {
        self.events.lock().expect("lock poisoned").push(event);
    }
}
