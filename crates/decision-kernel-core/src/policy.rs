use serde::{Deserialize, Serialize};

use crate::case::{CaseSignals, SignalValue};
use crate::error::DecisionError;
use crate::pack::EvidenceTag;
use crate::rule::Severity;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PredicateOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// One conjunct of a selector predicate over case signals.
///
/// Text signals support `eq`/`ne`; numeric signals support the full set.
/// A type mismatch or missing signal never matches — selectors fall through
/// to the next priority instead of guessing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalPredicate {
    pub signal: String,
    pub op: PredicateOp,
    pub value: SignalValue,
}

impl SignalPredicate {
    #[must_use]
    pub fn matches(&self, signals: &CaseSignals) -> bool {
        let Some(actual) = signals.get(&self.signal) else {
            return false;
        };

        match (&self.value, actual) {
            (SignalValue::Text(expected), SignalValue::Text(actual)) => match self.op {
                PredicateOp::Eq => actual == expected,
                PredicateOp::Ne => actual != expected,
                _ => false,
            },
            (SignalValue::Number(expected), SignalValue::Number(actual)) => match self.op {
                PredicateOp::Eq => (actual - expected).abs() <= f64::EPSILON,
                PredicateOp::Ne => (actual - expected).abs() > f64::EPSILON,
                PredicateOp::Gt => actual > expected,
                PredicateOp::Gte => actual >= expected,
                PredicateOp::Lt => actual < expected,
                PredicateOp::Lte => actual <= expected,
            },
            _ => false,
        }
    }
}

/// Maps case-signal predicates to a technique and rule set. An empty `when`
/// list is a catch-all.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicySelector {
    pub selector_id: String,
    pub priority: i64,
    #[serde(default)]
    pub when: Vec<SignalPredicate>,
    pub technique: String,
    pub rule_set: String,
}

fn default_min_confidence() -> f32 {
    0.0
}

fn default_evidence_class() -> EvidenceTag {
    EvidenceTag::Primary
}

/// DB-resident rule definition. `logic` stays as raw JSON until evaluation
/// time so a malformed shape surfaces as a per-rule definition error instead
/// of poisoning bundle loading.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleSpec {
    pub rule_id: String,
    pub severity: Severity,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
    #[serde(default = "default_evidence_class")]
    pub evidence_class: EvidenceTag,
    pub logic: serde_json::Value,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleSet {
    pub rule_set_id: String,
    pub version: String,
    pub rules: Vec<RuleSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyMeta {
    pub policy_id: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// One immutable policy version: selectors plus the rule sets they point at.
/// Loaded whole into memory at run start; a run never observes a policy edit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyBundle {
    pub meta: PolicyMeta,
    pub selectors: Vec<PolicySelector>,
    pub rule_sets: Vec<RuleSet>,
}

impl PolicyBundle {
    /// # Errors
    /// Returns [`DecisionError::Validation`] for empty identifiers, duplicate
    /// selector/rule-set ids, or selectors pointing at unknown rule sets.
    pub fn validate(&self) -> Result<(), DecisionError> {
        if self.meta.policy_id.trim().is_empty() || self.meta.version.trim().is_empty() {
            return Err(DecisionError::Validation(
                "policy meta MUST carry policy_id and version".to_string(),
            ));
        }
        if self.selectors.is_empty() {
            return Err(DecisionError::Validation(
                "policy MUST define at least one selector".to_string(),
            ));
        }

        let mut selector_ids = std::collections::BTreeSet::new();
        for selector in &self.selectors {
            if selector.selector_id.trim().is_empty()
                || selector.technique.trim().is_empty()
                || selector.rule_set.trim().is_empty()
            {
                return Err(DecisionError::Validation(format!(
                    "selector `{}` MUST carry selector_id, technique, and rule_set",
                    selector.selector_id
                )));
            }
            if !selector_ids.insert(selector.selector_id.as_str()) {
                return Err(DecisionError::Validation(format!(
                    "duplicate selector_id `{}`",
                    selector.selector_id
                )));
            }
            if self.rule_set(&selector.rule_set).is_none() {
                return Err(DecisionError::Validation(format!(
                    "selector `{}` references unknown rule_set `{}`",
                    selector.selector_id, selector.rule_set
                )));
            }
        }

        let mut rule_set_ids = std::collections::BTreeSet::new();
        for rule_set in &self.rule_sets {
            if !rule_set_ids.insert(rule_set.rule_set_id.as_str()) {
                return Err(DecisionError::Validation(format!(
                    "duplicate rule_set_id `{}`",
                    rule_set.rule_set_id
                )));
            }
            let mut rule_ids = std::collections::BTreeSet::new();
            for rule in &rule_set.rules {
                if rule.rule_id.trim().is_empty() {
                    return Err(DecisionError::Validation(format!(
                        "rule_set `{}` carries a rule without rule_id",
                        rule_set.rule_set_id
                    )));
                }
                if !rule_ids.insert(rule.rule_id.as_str()) {
                    return Err(DecisionError::Validation(format!(
                        "duplicate rule_id `{}` in rule_set `{}`",
                        rule.rule_id, rule_set.rule_set_id
                    )));
                }
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn rule_set(&self, rule_set_id: &str) -> Option<&RuleSet> {
        self.rule_sets.iter().find(|rule_set| rule_set.rule_set_id == rule_set_id)
    }
}

/// Outcome of policy resolution, snapshotted onto the run record.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PolicyResolution {
    pub policy_id: String,
    pub policy_version: String,
    pub selector_id: String,
    pub technique: String,
    pub rule_set_id: String,
}

/// Select the applicable technique and rule set for a case.
///
/// Selectors are evaluated in priority order (ascending; 1 is highest),
/// ties broken by rule-set id ascending, first match wins — deterministic
/// for identical signals and policy version.
///
/// # Errors
/// Returns [`DecisionError::NoApplicablePolicy`] when no selector matches.
pub fn resolve_policy(
    signals: &CaseSignals,
    bundle: &PolicyBundle,
) -> Result<PolicyResolution, DecisionError> {
    let mut ordered: Vec<&PolicySelector> = bundle.selectors.iter().collect();
    ordered.sort_by(|lhs, rhs| {
        lhs.priority
            .cmp(&rhs.priority)
            .then_with(|| lhs.rule_set.cmp(&rhs.rule_set))
            .then_with(|| lhs.selector_id.cmp(&rhs.selector_id))
    });

    for selector in ordered {
        if selector.when.iter().all(|predicate| predicate.matches(signals)) {
            return Ok(PolicyResolution {
                policy_id: bundle.meta.policy_id.clone(),
                policy_version: bundle.meta.version.clone(),
                selector_id: selector.selector_id.clone(),
                technique: selector.technique.clone(),
                rule_set_id: selector.rule_set.clone(),
            });
        }
    }

    Err(DecisionError::NoApplicablePolicy(format!(
        "no selector in policy {}@{} matches the case signals",
        bundle.meta.policy_id, bundle.meta.version
    )))
}
