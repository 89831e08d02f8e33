use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::evidence::EvidenceRef;
use crate::fact::DerivedFact;
use crate::policy::{RuleSet, RuleSpec};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum VerdictOutcome {
    Pass,
    Fail,
    Inconclusive,
}

/// One rule's judgement over the derived facts, with the citations that
/// justify it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleVerdict {
    pub rule_id: String,
    pub outcome: VerdictOutcome,
    pub severity: Severity,
    pub cited_facts: Vec<String>,
    pub cited_evidence: Vec<EvidenceRef>,
    pub explanation: String,
}

/// A rule whose stored logic could not be compiled. Faults are isolated to
/// their rule and force reviewer escalation rather than aborting the pass.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RuleFault {
    pub rule_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Evaluation {
    pub verdicts: Vec<RuleVerdict>,
    pub faults: Vec<RuleFault>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Lt,
    Lte,
    Gt,
    Gte,
}

impl CompareOp {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "lt" => Some(Self::Lt),
            "lte" => Some(Self::Lte),
            "gt" => Some(Self::Gt),
            "gte" => Some(Self::Gte),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Gt => "gt",
            Self::Gte => "gte",
        }
    }

    fn holds(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Lt => lhs < rhs,
            Self::Lte => lhs <= rhs,
            Self::Gt => lhs > rhs,
            Self::Gte => lhs >= rhs,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Literal(f64),
    Fact(String),
}

/// Executable form of a rule's stored JSON logic.
#[derive(Debug, Clone, PartialEq)]
enum CompiledLogic {
    Compare {
        fact: String,
        op: CompareOp,
        operand: Operand,
        scale: f64,
    },
    Present {
        fact: String,
    },
}

fn required_str(object: &serde_json::Map<String, serde_json::Value>, key: &str) -> Result<String, String> {
    match object.get(key) {
        Some(serde_json::Value::String(value)) if !value.trim().is_empty() => Ok(value.clone()),
        Some(_) => Err(format!("`{key}` must be a non-empty string")),
        None => Err(format!("missing `{key}`")),
    }
}

fn compile(logic: &serde_json::Value) -> Result<CompiledLogic, String> {
    let Some(object) = logic.as_object() else {
        return Err("logic must be a JSON object".to_string());
    };

    if let Some(compare) = object.get("compare") {
        let Some(body) = compare.as_object() else {
            return Err("`compare` must be a JSON object".to_string());
        };
        let fact = required_str(body, "fact")?;
        let op_raw = required_str(body, "op")?;
        let Some(op) = CompareOp::parse(&op_raw) else {
            return Err(format!("unknown compare op `{op_raw}`"));
        };

        let operand = match (body.get("value"), body.get("fact_ref")) {
            (Some(value), None) => match value.as_f64() {
                Some(literal) if literal.is_finite() => Operand::Literal(literal),
                _ => return Err("`value` must be a finite number".to_string()),
            },
            (None, Some(fact_ref)) => match fact_ref.as_str() {
                Some(key) if !key.trim().is_empty() => Operand::Fact(key.to_string()),
                _ => return Err("`fact_ref` must be a non-empty string".to_string()),
            },
            (Some(_), Some(_)) => {
                return Err("`compare` takes `value` or `fact_ref`, not both".to_string())
            }
            (None, None) => return Err("`compare` requires `value` or `fact_ref`".to_string()),
        };

        let scale = match body.get("scale") {
            None => 1.0,
            Some(raw) => match raw.as_f64() {
                Some(scale) if scale.is_finite() && scale > 0.0 => scale,
                _ => return Err("`scale` must be a positive finite number".to_string()),
            },
        };

        return Ok(CompiledLogic::Compare { fact, op, operand, scale });
    }

    if let Some(present) = object.get("present") {
        let Some(body) = present.as_object() else {
            return Err("`present` must be a JSON object".to_string());
        };
        let fact = required_str(body, "fact")?;
        return Ok(CompiledLogic::Present { fact });
    }

    Err("logic must carry a `compare` or `present` shape".to_string())
}

fn confident_fact<'a>(
    facts: &'a BTreeMap<&str, &DerivedFact>,
    key: &str,
    min_confidence: f32,
) -> Result<&'a DerivedFact, VerdictOutcome> {
    match facts.get(key) {
        None => Err(VerdictOutcome::Inconclusive),
        Some(fact) if fact.confidence < min_confidence => Err(VerdictOutcome::Inconclusive),
        Some(fact) => Ok(*fact),
    }
}

fn citations(facts: &[&DerivedFact]) -> (Vec<String>, Vec<EvidenceRef>) {
    let mut keys: Vec<String> = facts.iter().map(|fact| fact.fact_key.clone()).collect();
    keys.sort();
    keys.dedup();

    let mut evidence: Vec<EvidenceRef> = facts
        .iter()
        .flat_map(|fact| fact.citations.iter().cloned())
        .collect();
    evidence.sort();
    evidence.dedup();

    (keys, evidence)
}

fn apply(rule: &RuleSpec, logic: &CompiledLogic, facts: &BTreeMap<&str, &DerivedFact>) -> RuleVerdict {
    let (outcome, cited, explanation) = match logic {
        CompiledLogic::Compare { fact, op, operand, scale } => {
            let lhs = match confident_fact(facts, fact, rule.min_confidence) {
                Ok(lhs) => lhs,
                Err(outcome) => {
                    return RuleVerdict {
                        rule_id: rule.rule_id.clone(),
                        outcome,
                        severity: rule.severity,
                        cited_facts: Vec::new(),
                        cited_evidence: Vec::new(),
                        explanation: format!(
                            "fact `{fact}` is absent or below confidence {:.2}",
                            rule.min_confidence
                        ),
                    }
                }
            };

            let (rhs_value, rhs_label, cited) = match operand {
                Operand::Literal(literal) => (*literal, format!("{literal}"), vec![lhs]),
                Operand::Fact(key) => match confident_fact(facts, key, rule.min_confidence) {
                    Ok(rhs) => (rhs.value, format!("{} ({})", rhs.value, key), vec![lhs, rhs]),
                    Err(outcome) => {
                        return RuleVerdict {
                            rule_id: rule.rule_id.clone(),
                            outcome,
                            severity: rule.severity,
                            cited_facts: Vec::new(),
                            cited_evidence: Vec::new(),
                            explanation: format!(
                                "referenced fact `{key}` is absent or below confidence {:.2}",
                                rule.min_confidence
                            ),
                        }
                    }
                },
            };

            let rhs = rhs_value * scale;
            let outcome = if op.holds(lhs.value, rhs) {
                VerdictOutcome::Pass
            } else {
                VerdictOutcome::Fail
            };
            let explanation = if (*scale - 1.0).abs() > f64::EPSILON {
                format!("{fact} = {} {} {rhs_label} x {scale}", lhs.value, op.as_str())
            } else {
                format!("{fact} = {} {} {rhs_label}", lhs.value, op.as_str())
            };
            (outcome, cited, explanation)
        }
        CompiledLogic::Present { fact } => match facts.get(fact.as_str()) {
            None => (
                VerdictOutcome::Fail,
                Vec::new(),
                format!("required fact `{fact}` was not derived"),
            ),
            Some(present) if present.confidence < rule.min_confidence => (
                VerdictOutcome::Inconclusive,
                vec![*present],
                format!(
                    "fact `{fact}` present at confidence {:.2}, below {:.2}",
                    present.confidence, rule.min_confidence
                ),
            ),
            Some(present) => (
                VerdictOutcome::Pass,
                vec![*present],
                format!("fact `{fact}` present at confidence {:.2}", present.confidence),
            ),
        },
    };

    let (cited_facts, cited_evidence) = citations(&cited);
    RuleVerdict {
        rule_id: rule.rule_id.clone(),
        outcome,
        severity: rule.severity,
        cited_facts,
        cited_evidence,
        explanation,
    }
}

/// Evaluate every rule in the set against the derived facts.
///
/// Rules run in definition order and each produces exactly one verdict or one
/// fault; a fault in one rule never suppresses its neighbours.
#[must_use]
pub fn evaluate_rules(facts: &[DerivedFact], rule_set: &RuleSet) -> Evaluation {
    let by_key: BTreeMap<&str, &DerivedFact> = facts
        .iter()
        .map(|fact| (fact.fact_key.as_str(), fact))
        .collect();

    let mut evaluation = Evaluation::default();
    for rule in &rule_set.rules {
        match compile(&rule.logic) {
            Ok(logic) => evaluation.verdicts.push(apply(rule, &logic, &by_key)),
            Err(reason) => evaluation.faults.push(RuleFault {
                rule_id: rule.rule_id.clone(),
                reason,
            }),
        }
    }
    evaluation
}
