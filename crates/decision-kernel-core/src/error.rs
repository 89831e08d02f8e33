use crate::link::LinkState;
use crate::run::DecisionAction;
use crate::{CaseId, LinkId, RunId};

/// Typed failure taxonomy for the decision loop.
///
/// Each variant maps to one boundary: link transitions and rationale checks
/// are rejected locally and are retryable after correction; missing policy
/// and missing primary evidence are terminal for the run; a rule definition
/// fault is isolated to its rule and never aborts the pass.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum DecisionError {
    #[error("invalid link transition: link {link_id} is {state}, only inferred links may transition")]
    InvalidLinkTransition { link_id: LinkId, state: LinkState },

    #[error("no applicable policy: {0}")]
    NoApplicablePolicy(String),

    #[error("insufficient evidence: {0}")]
    InsufficientEvidence(String),

    #[error("rule definition error in rule {rule_id}: {reason}")]
    RuleDefinitionError { rule_id: String, reason: String },

    #[error("rationale required for {action} on run {run_id}")]
    RationaleRequired { run_id: RunId, action: DecisionAction },

    #[error("a decision run is already active for case {0}")]
    RunAlreadyActive(CaseId),

    #[error("evidence query error: {0}")]
    Query(String),

    #[error("validation error: {0}")]
    Validation(String),
}
