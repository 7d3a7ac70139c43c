//! Audit trail of a checkout. Every session event is recorded under the
//! correlation id of the request that carried it, including events the session
//! refused.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::visit::VisitId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Applied,
    Rejected,
    /// An invariant broke; nothing from this session may be submitted.
    Fatal,
}

/// Who is driving a session and under which request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditContext {
    pub visit_id: VisitId,
    pub correlation_id: String,
    pub actor: String,
}

impl AuditContext {
    pub fn new(
        visit_id: VisitId,
        correlation_id: impl Into<String>,
        actor: impl Into<String>,
    ) -> Self {
        Self { visit_id, correlation_id: correlation_id.into(), actor: actor.into() }
    }

    pub fn record(&self, session_event: &str, outcome: AuditOutcome) -> AuditEvent {
        AuditEvent {
            event_id: Uuid::new_v4(),
            visit_id: self.visit_id.clone(),
            correlation_id: self.correlation_id.clone(),
            actor: self.actor.clone(),
            session_event: session_event.to_owned(),
            outcome,
            details: BTreeMap::new(),
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub visit_id: VisitId,
    pub correlation_id: String,
    pub actor: String,
    /// Snake-case name of the session event, e.g. `stage_product`.
    pub session_event: String,
    pub outcome: AuditOutcome,
    pub details: BTreeMap<String, String>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn with_detail(mut self, key: &str, value: impl Into<String>) -> Self {
        self.details.insert(key.to_owned(), value.into());
        self
    }

    pub fn detail(&self, key: &str) -> Option<&str> {
        self.details.get(key).map(String::as_str)
    }
}

pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

/// Keeps the trail in memory; replays print it with the transcript.
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl InMemoryAuditSink {
    fn guard(&self) -> MutexGuard<'_, Vec<AuditEvent>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.guard().clone()
    }

    pub fn rejections(&self) -> Vec<AuditEvent> {
        self.guard()
            .iter()
            .filter(|event| event.outcome != AuditOutcome::Applied)
            .cloned()
            .collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn emit(&self, event: AuditEvent) {
        self.guard().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::{AuditContext, AuditOutcome, AuditSink, InMemoryAuditSink};
    use crate::domain::visit::VisitId;

    #[test]
    fn events_carry_the_request_context() {
        let context =
            AuditContext::new(VisitId("V-2026-0042".to_owned()), "req-123", "clinician-7");
        let sink = InMemoryAuditSink::default();

        sink.emit(
            context.record("stage_product", AuditOutcome::Applied).with_detail("queue", "idle"),
        );
        sink.emit(context.record("retry", AuditOutcome::Rejected));

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|event| event.correlation_id == "req-123"));
        assert_eq!(events[0].visit_id, VisitId("V-2026-0042".to_owned()));
        assert_eq!(events[0].detail("queue"), Some("idle"));
        assert_ne!(events[0].event_id, events[1].event_id);

        let rejections = sink.rejections();
        assert_eq!(rejections.len(), 1);
        assert_eq!(rejections[0].session_event, "retry");
    }
}
