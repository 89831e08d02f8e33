use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::DecisionError;
use crate::{CaseId, EventId, RunId};

/// The closed set of auditable moments in a case lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    LinkInferred,
    LinkConfirmed,
    LinkRemoved,
    RunStarted,
    PolicyResolved,
    FactsDerived,
    RulesEvaluated,
    PackBuilt,
    RunPendingReview,
    RunAbandoned,
    RunApproved,
    RunEscalated,
    RunOverridden,
}

impl AuditEventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LinkInferred => "LINK_INFERRED",
            Self::LinkConfirmed => "LINK_CONFIRMED",
            Self::LinkRemoved => "LINK_REMOVED",
            Self::RunStarted => "RUN_STARTED",
            Self::PolicyResolved => "POLICY_RESOLVED",
            Self::FactsDerived => "FACTS_DERIVED",
            Self::RulesEvaluated => "RULES_EVALUATED",
            Self::PackBuilt => "PACK_BUILT",
            Self::RunPendingReview => "RUN_PENDING_REVIEW",
            Self::RunAbandoned => "RUN_ABANDONED",
            Self::RunApproved => "RUN_APPROVED",
            Self::RunEscalated => "RUN_ESCALATED",
            Self::RunOverridden => "RUN_OVERRIDDEN",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "LINK_INFERRED" => Some(Self::LinkInferred),
            "LINK_CONFIRMED" => Some(Self::LinkConfirmed),
            "LINK_REMOVED" => Some(Self::LinkRemoved),
            "RUN_STARTED" => Some(Self::RunStarted),
            "POLICY_RESOLVED" => Some(Self::PolicyResolved),
            "FACTS_DERIVED" => Some(Self::FactsDerived),
            "RULES_EVALUATED" => Some(Self::RulesEvaluated),
            "PACK_BUILT" => Some(Self::PackBuilt),
            "RUN_PENDING_REVIEW" => Some(Self::RunPendingReview),
            "RUN_ABANDONED" => Some(Self::RunAbandoned),
            "RUN_APPROVED" => Some(Self::RunApproved),
            "RUN_ESCALATED" => Some(Self::RunEscalated),
            "RUN_OVERRIDDEN" => Some(Self::RunOverridden),
            _ => None,
        }
    }
}

/// One append-only ledger entry. `predecessor` points at the prior event for
/// the same case, so the per-case trail forms a causal chain with exactly one
/// head (the earliest event, where it is `None`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub event_id: EventId,
    pub case_id: CaseId,
    pub run_id: Option<RunId>,
    pub event_type: AuditEventType,
    pub payload: serde_json::Value,
    pub actor: String,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    pub predecessor: Option<EventId>,
}

impl AuditEvent {
    /// # Errors
    /// Returns [`DecisionError::Validation`] when the actor is blank; every
    /// ledger entry names who (or what) caused it.
    pub fn validate(&self) -> Result<(), DecisionError> {
        if self.actor.trim().is_empty() {
            return Err(DecisionError::Validation(
                "audit event actor MUST be provided".to_string(),
            ));
        }
        Ok(())
    }
}
