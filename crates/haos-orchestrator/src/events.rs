//! Durable audit event facade.
//!
//! Every state-affecting operation in the executor, pool, quality engine
//! and supervisor appends at least one event. The persistence engine is
//! pluggable; an in-memory sink backs the tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Severity attached to audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSeverity {
    Info,
    Warning,
    High,
}

/// Append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub workflow_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub worker_id: Option<Uuid>,
    pub kind: String,
    pub payload_hash: u64,
    pub principal: Option<String>,
    pub severity: EventSeverity,
}

impl AuditEvent {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            workflow_id: None,
            task_id: None,
            worker_id: None,
            kind: kind.into(),
            payload_hash: 0,
            principal: None,
            severity: EventSeverity::Info,
        }
    }

    pub fn workflow(mut self, id: Uuid) -> Self {
        self.workflow_id = Some(id);
        self
    }

    pub fn task(mut self, id: Uuid) -> Self {
        self.task_id = Some(id);
        self
    }

    pub fn worker(mut self, id: Uuid) -> Self {
        self.worker_id = Some(id);
        self
    }

    pub fn principal_name(mut self, subject: impl Into<String>) -> Self {
        self.principal = Some(subject.into());
        self
    }

    pub fn severity(mut self, severity: EventSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Hash of the payload rather than the payload itself; audit storage
    /// must not retain request content.
    pub fn payload(mut self, payload: &serde_json::Value) -> Self {
        let mut hasher = DefaultHasher::new();
        payload.to_string().hash(&mut hasher);
        self.payload_hash = hasher.finish();
        self
    }
}

/// Append-only event store facade.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn append(&self, event: AuditEvent);
}

/// In-process sink retaining events for inspection.
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn of_kind(&self, kind: &str) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    pub fn count_of(&self, kind: &str) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn append(&self, event: AuditEvent) {
        tracing::debug!(
            kind = %event.kind,
            workflow_id = ?event.workflow_id,
            task_id = ?event.task_id,
            worker_id = ?event.worker_id,
            "audit event"
        );
        self.events.lock().push(event);
    }
}
