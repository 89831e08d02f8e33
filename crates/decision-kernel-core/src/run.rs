use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::case::Case;
use crate::error::DecisionError;
use crate::evidence::{Clause, EvidenceRef, PriceItem};
use crate::fact::{self, DerivationConfig, DerivedFact};
use crate::link::{CaseDocumentLink, LinkState};
use crate::pack::{build_pack, EvidencePack, SupportingContext};
use crate::policy::{resolve_policy, PolicyBundle, RuleSet};
use crate::rule::{evaluate_rules, RuleFault, RuleVerdict};
use crate::{CaseId, DocumentId, RunId};

/// Lifecycle of one decision run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Draft,
    PendingReview,
    Approved,
    Escalated,
    Overridden,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::PendingReview => "pending_review",
            Self::Approved => "approved",
            Self::Escalated => "escalated",
            Self::Overridden => "overridden",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "pending_review" => Some(Self::PendingReview),
            "approved" => Some(Self::Approved),
            "escalated" => Some(Self::Escalated),
            "overridden" => Some(Self::Overridden),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Approved | Self::Escalated | Self::Overridden)
    }

    /// An active run blocks new runs for the same case.
    #[must_use]
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

/// Reviewer action on a run pending review.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Approve,
    Escalate,
    Override,
}

impl DecisionAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Escalate => "escalate",
            Self::Override => "override",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "approve" => Some(Self::Approve),
            "escalate" => Some(Self::Escalate),
            "override" => Some(Self::Override),
            _ => None,
        }
    }
}

impl Display for DecisionAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The frozen evidence universe for one run: every link row for the case and
/// the extracted rows of every linked document, captured before derivation so
/// concurrent ingestion cannot skew a pass in flight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EvidenceSnapshot {
    pub links: Vec<CaseDocumentLink>,
    pub price_items: BTreeMap<DocumentId, Vec<PriceItem>>,
    pub clauses: BTreeMap<DocumentId, Vec<Clause>>,
}

impl EvidenceSnapshot {
    /// Effective state per document. A document with both a removed and a
    /// live link row takes the live one; confirmed beats inferred.
    #[must_use]
    pub fn link_states(&self) -> BTreeMap<DocumentId, LinkState> {
        fn rank(state: LinkState) -> u8 {
            match state {
                LinkState::Removed => 0,
                LinkState::Inferred => 1,
                LinkState::Confirmed => 2,
            }
        }

        let mut states: BTreeMap<DocumentId, LinkState> = BTreeMap::new();
        for link in &self.links {
            states
                .entry(link.document_id)
                .and_modify(|current| {
                    if rank(link.state) > rank(*current) {
                        *current = link.state;
                    }
                })
                .or_insert(link.state);
        }
        states
    }
}

/// One complete decision run record: resolution snapshot, derived facts,
/// verdicts, faults, and the evidence pack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionRun {
    pub run_id: RunId,
    pub case_id: CaseId,
    pub policy_id: String,
    pub policy_version: String,
    pub selector_id: String,
    pub technique: String,
    pub rule_set_id: String,
    /// Hash of the evidence snapshot and policy version; two runs with equal
    /// hashes are byte-for-byte reproducible.
    pub input_hash: String,
    pub status: RunStatus,
    pub requires_escalation: bool,
    pub facts: Vec<DerivedFact>,
    pub verdicts: Vec<RuleVerdict>,
    pub faults: Vec<RuleFault>,
    pub pack: EvidencePack,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub created_by: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub decided_at: Option<OffsetDateTime>,
    pub decided_by: Option<String>,
    pub rationale: Option<String>,
}

impl DecisionRun {
    /// Apply a reviewer decision to a run pending review.
    ///
    /// Approve leaves no rationale requirement; escalate and override MUST
    /// carry one. A run flagged `requires_escalation` cannot be approved.
    ///
    /// # Errors
    /// Returns [`DecisionError::Validation`] for a blank actor, a run not
    /// pending review, or approving past a `requires_escalation` flag;
    /// [`DecisionError::RationaleRequired`] when escalate/override lack one.
    pub fn record_decision(
        &self,
        action: DecisionAction,
        rationale: Option<&str>,
        actor: &str,
        now: OffsetDateTime,
    ) -> Result<Self, DecisionError> {
        if actor.trim().is_empty() {
            return Err(DecisionError::Validation(
                "actor MUST be provided for every decision".to_string(),
            ));
        }
        if self.status != RunStatus::PendingReview {
            return Err(DecisionError::Validation(format!(
                "run {} is {}, not pending_review",
                self.run_id,
                self.status.as_str()
            )));
        }

        let rationale = rationale.map(str::trim).filter(|r| !r.is_empty());
        let status = match action {
            DecisionAction::Approve => {
                if self.requires_escalation {
                    return Err(DecisionError::Validation(format!(
                        "run {} carries rule faults and MUST be escalated or overridden",
                        self.run_id
                    )));
                }
                RunStatus::Approved
            }
            DecisionAction::Escalate | DecisionAction::Override => {
                if rationale.is_none() {
                    return Err(DecisionError::RationaleRequired {
                        run_id: self.run_id,
                        action,
                    });
                }
                if action == DecisionAction::Escalate {
                    RunStatus::Escalated
                } else {
                    RunStatus::Overridden
                }
            }
        };

        let mut decided = self.clone();
        decided.status = status;
        decided.decided_at = Some(now);
        decided.decided_by = Some(actor.to_string());
        decided.rationale = rationale.map(str::to_string);
        Ok(decided)
    }
}

/// Fact keys a rule set's logic reads. Malformed logic contributes nothing
/// here; it surfaces as a fault during evaluation instead.
fn referenced_fact_keys(rule_set: &RuleSet) -> BTreeSet<String> {
    let mut keys = BTreeSet::new();
    for rule in &rule_set.rules {
        let Some(object) = rule.logic.as_object() else {
            continue;
        };
        let body = object
            .get("compare")
            .or_else(|| object.get("present"))
            .and_then(serde_json::Value::as_object);
        let Some(body) = body else { continue };
        for field in ["fact", "fact_ref"] {
            if let Some(key) = body.get(field).and_then(serde_json::Value::as_str) {
                if !key.trim().is_empty() {
                    keys.insert(key.to_string());
                }
            }
        }
    }
    keys
}

fn supporting_context(
    rule_set: &RuleSet,
    facts: &[DerivedFact],
    snapshot: &EvidenceSnapshot,
    link_states: &BTreeMap<DocumentId, LinkState>,
) -> Vec<SupportingContext> {
    let derived: BTreeMap<&str, &DerivedFact> =
        facts.iter().map(|f| (f.fact_key.as_str(), f)).collect();
    let mut context = Vec::new();

    for key in referenced_fact_keys(rule_set) {
        match derived.get(key.as_str()) {
            // Rule wanted this fact but no confirmed evidence produced it.
            // Surface matching rows from inferred links so the reviewer can
            // see what confirming would unlock.
            None => {
                for (document_id, items) in &snapshot.price_items {
                    if link_states.get(document_id) != Some(&LinkState::Inferred) {
                        continue;
                    }
                    for item in items {
                        if item.fact_key == key {
                            context.push(SupportingContext {
                                fact_key: key.clone(),
                                evidence: EvidenceRef::from_price_item(item),
                                reason: "source link not confirmed".to_string(),
                            });
                        }
                    }
                }
            }
            Some(fact) => {
                let max_required = rule_set
                    .rules
                    .iter()
                    .map(|rule| rule.min_confidence)
                    .fold(0.0_f32, f32::max);
                if fact.confidence < max_required {
                    for citation in &fact.citations {
                        context.push(SupportingContext {
                            fact_key: key.clone(),
                            evidence: citation.clone(),
                            reason: "fact below rule confidence threshold".to_string(),
                        });
                    }
                }
            }
        }
    }

    context
}

/// Assemble one complete decision run from a frozen evidence snapshot.
///
/// Pure: no clocks, no IDs, no I/O beyond the arguments. The store drives
/// this inside a single transaction and persists the result.
///
/// # Errors
/// - [`DecisionError::Validation`] when the case or bundle is malformed.
/// - [`DecisionError::NoApplicablePolicy`] when no selector matches.
/// - [`DecisionError::InsufficientEvidence`] when the pack would hold zero
///   PRIMARY items.
#[allow(clippy::too_many_arguments)]
pub fn assemble_run(
    run_id: RunId,
    case: &Case,
    snapshot: &EvidenceSnapshot,
    bundle: &PolicyBundle,
    config: &DerivationConfig,
    input_hash: &str,
    created_by: &str,
    now: OffsetDateTime,
) -> Result<DecisionRun, DecisionError> {
    case.validate()?;
    bundle.validate()?;
    if created_by.trim().is_empty() {
        return Err(DecisionError::Validation(
            "created_by MUST be provided for a run".to_string(),
        ));
    }

    let link_states = snapshot.link_states();

    let mut observations = Vec::new();
    for (document_id, items) in &snapshot.price_items {
        if link_states.get(document_id) == Some(&LinkState::Confirmed) {
            observations.extend(fact::observations_from_price_items(items));
        }
    }
    let facts = fact::derive_facts(case.case_id, &observations, config)?;

    let resolution = resolve_policy(&case.signals, bundle)?;
    let Some(rule_set) = bundle.rule_set(&resolution.rule_set_id) else {
        return Err(DecisionError::Validation(format!(
            "resolved rule_set `{}` is missing from the bundle",
            resolution.rule_set_id
        )));
    };

    let evaluation = evaluate_rules(&facts, rule_set);
    let context = supporting_context(rule_set, &facts, snapshot, &link_states);
    let pack = build_pack(&evaluation.verdicts, &facts, &context, &link_states)?;

    if pack.primary_count() == 0 {
        return Err(DecisionError::InsufficientEvidence(format!(
            "case {} produced no primary evidence; confirm at least one link",
            case.case_id
        )));
    }

    Ok(DecisionRun {
        run_id,
        case_id: case.case_id,
        policy_id: resolution.policy_id,
        policy_version: resolution.policy_version,
        selector_id: resolution.selector_id,
        technique: resolution.technique,
        rule_set_id: resolution.rule_set_id,
        input_hash: input_hash.to_string(),
        status: RunStatus::PendingReview,
        requires_escalation: !evaluation.faults.is_empty(),
        facts,
        verdicts: evaluation.verdicts,
        faults: evaluation.faults,
        pack,
        created_at: now,
        created_by: created_by.to_string(),
        decided_at: None,
        decided_by: None,
        rationale: None,
    })
}
