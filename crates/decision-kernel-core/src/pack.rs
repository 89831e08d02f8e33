use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::DecisionError;
use crate::evidence::EvidenceRef;
use crate::fact::DerivedFact;
use crate::link::LinkState;
use crate::rule::RuleVerdict;
use crate::DocumentId;

/// Evidentiary weight class. PRIMARY items justify the decision and may only
/// cite confirmed links; SUPPORTING items add reviewer context.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceTag {
    Primary,
    Supporting,
}

impl EvidenceTag {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Supporting => "supporting",
        }
    }
}

/// One entry in the reviewer-facing evidence pack.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EvidenceItem {
    pub tag: EvidenceTag,
    pub rule_id: Option<String>,
    pub fact_key: Option<String>,
    pub evidence: EvidenceRef,
    pub low_confidence: bool,
    pub note: Option<String>,
}

/// Supporting material surfaced alongside the verdicts: rows from documents
/// whose links were never confirmed, or citations behind under-confident
/// facts.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SupportingContext {
    pub fact_key: String,
    pub evidence: EvidenceRef,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EvidencePack {
    pub items: Vec<EvidenceItem>,
}

impl EvidencePack {
    #[must_use]
    pub fn primary_count(&self) -> usize {
        self.items
            .iter()
            .filter(|item| item.tag == EvidenceTag::Primary)
            .count()
    }
}

fn fact_key_for<'a>(facts: &'a [DerivedFact], evidence: &EvidenceRef) -> Option<&'a str> {
    facts
        .iter()
        .find(|fact| fact.citations.contains(evidence))
        .map(|fact| fact.fact_key.as_str())
}

/// Assemble the evidence pack from verdict citations and supporting context.
///
/// Every verdict citation becomes a PRIMARY item and MUST point at a document
/// with a confirmed link; anything else is a pipeline invariant violation, not
/// a reviewer-facing condition. SUPPORTING items from removed links are
/// silently dropped, and items from inferred links are flagged
/// `low_confidence`. Output order is total: PRIMARY by (rule, citation), then
/// SUPPORTING by (fact, document, page anchor), citation fields breaking any
/// remaining tie.
///
/// # Errors
/// Returns [`DecisionError::Validation`] when a verdict cites a document
/// without a confirmed link.
pub fn build_pack(
    verdicts: &[RuleVerdict],
    facts: &[DerivedFact],
    context: &[SupportingContext],
    link_states: &BTreeMap<DocumentId, LinkState>,
) -> Result<EvidencePack, DecisionError> {
    let mut primary: Vec<EvidenceItem> = Vec::new();
    for verdict in verdicts {
        for evidence in &verdict.cited_evidence {
            match link_states.get(&evidence.document_id) {
                Some(LinkState::Confirmed) => {}
                state => {
                    return Err(DecisionError::Validation(format!(
                        "verdict {} cites document {} whose link is {}, not confirmed",
                        verdict.rule_id,
                        evidence.document_id,
                        state.map_or("absent", |s| s.as_str()),
                    )))
                }
            }
            primary.push(EvidenceItem {
                tag: EvidenceTag::Primary,
                rule_id: Some(verdict.rule_id.clone()),
                fact_key: fact_key_for(facts, evidence).map(str::to_string),
                evidence: evidence.clone(),
                low_confidence: false,
                note: None,
            });
        }
    }
    primary.sort_by(|lhs, rhs| {
        lhs.rule_id
            .cmp(&rhs.rule_id)
            .then_with(|| lhs.evidence.cmp(&rhs.evidence))
    });
    primary.dedup();

    let mut supporting: Vec<EvidenceItem> = Vec::new();
    for entry in context {
        let state = link_states.get(&entry.evidence.document_id);
        if matches!(state, Some(LinkState::Removed)) {
            continue;
        }
        supporting.push(EvidenceItem {
            tag: EvidenceTag::Supporting,
            rule_id: None,
            fact_key: Some(entry.fact_key.clone()),
            evidence: entry.evidence.clone(),
            low_confidence: matches!(state, Some(LinkState::Inferred) | None),
            note: Some(entry.reason.clone()),
        });
    }
    supporting.sort_by(|lhs, rhs| {
        lhs.fact_key
            .cmp(&rhs.fact_key)
            .then_with(|| lhs.evidence.document_id.cmp(&rhs.evidence.document_id))
            .then_with(|| lhs.evidence.page_anchor.cmp(&rhs.evidence.page_anchor))
            .then_with(|| lhs.evidence.cmp(&rhs.evidence))
    });
    supporting.dedup();

    let mut items = primary;
    items.extend(supporting);
    Ok(EvidencePack { items })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::FactMethod;
    use crate::rule::{Severity, VerdictOutcome};
    use crate::{CaseId, PriceItemId};

    fn evidence(document_id: DocumentId, page: u32) -> EvidenceRef {
        EvidenceRef {
            document_id,
            price_item_id: Some(PriceItemId::new()),
            clause_id: None,
            page_anchor: Some(page),
        }
    }

    fn verdict(rule_id: &str, cited: Vec<EvidenceRef>) -> RuleVerdict {
        RuleVerdict {
            rule_id: rule_id.to_string(),
            outcome: VerdictOutcome::Pass,
            severity: Severity::High,
            cited_facts: vec!["unit_price_benchmark".to_string()],
            cited_evidence: cited,
            explanation: "within cap".to_string(),
        }
    }

    fn fact_with(citations: Vec<EvidenceRef>) -> DerivedFact {
        DerivedFact {
            case_id: CaseId::new(),
            fact_key: "unit_price_benchmark".to_string(),
            value: 120.0,
            unit: None,
            confidence: 0.8,
            method: FactMethod::Median,
            citations,
        }
    }

    #[test]
    fn primary_items_come_from_verdicts_over_confirmed_links() {
        let doc = DocumentId::new();
        let cite = evidence(doc, 2);
        let mut states = BTreeMap::new();
        states.insert(doc, LinkState::Confirmed);

        let pack = match build_pack(
            &[verdict("PRICE-01", vec![cite.clone()])],
            &[fact_with(vec![cite])],
            &[],
            &states,
        ) {
            Ok(pack) => pack,
            Err(err) => panic!("pack should build: {err}"),
        };

        assert_eq!(pack.primary_count(), 1);
        assert_eq!(pack.items[0].rule_id.as_deref(), Some("PRICE-01"));
        assert_eq!(pack.items[0].fact_key.as_deref(), Some("unit_price_benchmark"));
        assert!(!pack.items[0].low_confidence);
    }

    #[test]
    fn verdict_citing_unconfirmed_link_is_an_invariant_violation() {
        let doc = DocumentId::new();
        let mut states = BTreeMap::new();
        states.insert(doc, LinkState::Inferred);

        let result = build_pack(&[verdict("PRICE-01", vec![evidence(doc, 1)])], &[], &[], &states);
        assert!(matches!(result, Err(DecisionError::Validation(_))));
    }

    #[test]
    fn supporting_from_inferred_link_is_flagged_low_confidence() {
        let confirmed = DocumentId::new();
        let inferred = DocumentId::new();
        let mut states = BTreeMap::new();
        states.insert(confirmed, LinkState::Confirmed);
        states.insert(inferred, LinkState::Inferred);

        let pack = match build_pack(
            &[],
            &[],
            &[
                SupportingContext {
                    fact_key: "freight_estimate".to_string(),
                    evidence: evidence(inferred, 4),
                    reason: "source link not confirmed".to_string(),
                },
                SupportingContext {
                    fact_key: "freight_estimate".to_string(),
                    evidence: evidence(confirmed, 1),
                    reason: "fact below confidence threshold".to_string(),
                },
            ],
            &states,
        ) {
            Ok(pack) => pack,
            Err(err) => panic!("pack should build: {err}"),
        };

        assert_eq!(pack.items.len(), 2);
        let low: Vec<bool> = pack.items.iter().map(|item| item.low_confidence).collect();
        assert!(low.contains(&true) && low.contains(&false));
    }

    #[test]
    fn removed_link_material_never_enters_the_pack() {
        let removed = DocumentId::new();
        let mut states = BTreeMap::new();
        states.insert(removed, LinkState::Removed);

        let pack = match build_pack(
            &[],
            &[],
            &[SupportingContext {
                fact_key: "freight_estimate".to_string(),
                evidence: evidence(removed, 4),
                reason: "source link not confirmed".to_string(),
            }],
            &states,
        ) {
            Ok(pack) => pack,
            Err(err) => panic!("pack should build: {err}"),
        };
        assert!(pack.items.is_empty());
    }

    #[test]
    fn supporting_items_within_a_document_order_by_page_anchor() {
        let doc = DocumentId::new();
        let mut states = BTreeMap::new();
        states.insert(doc, LinkState::Confirmed);

        // Row ids deliberately run against page order.
        let late_page = EvidenceRef {
            document_id: doc,
            price_item_id: Some(PriceItemId(ulid::Ulid(1))),
            clause_id: None,
            page_anchor: Some(9),
        };
        let early_page = EvidenceRef {
            document_id: doc,
            price_item_id: Some(PriceItemId(ulid::Ulid(2))),
            clause_id: None,
            page_anchor: Some(1),
        };
        let context = vec![
            SupportingContext {
                fact_key: "freight_estimate".to_string(),
                evidence: late_page,
                reason: "fact below confidence threshold".to_string(),
            },
            SupportingContext {
                fact_key: "freight_estimate".to_string(),
                evidence: early_page,
                reason: "fact below confidence threshold".to_string(),
            },
        ];

        let pack = match build_pack(&[], &[], &context, &states) {
            Ok(pack) => pack,
            Err(err) => panic!("pack should build: {err}"),
        };

        assert_eq!(pack.items[0].evidence.page_anchor, Some(1));
        assert_eq!(pack.items[1].evidence.page_anchor, Some(9));
    }

    #[test]
    fn pack_order_is_primary_then_supporting_and_deterministic() {
        let doc_a = DocumentId::new();
        let doc_b = DocumentId::new();
        let mut states = BTreeMap::new();
        states.insert(doc_a, LinkState::Confirmed);
        states.insert(doc_b, LinkState::Confirmed);

        let cite_a = evidence(doc_a, 1);
        let cite_b = evidence(doc_b, 2);
        let verdicts = vec![
            verdict("Z-RULE", vec![cite_b.clone()]),
            verdict("A-RULE", vec![cite_a.clone()]),
        ];
        let context = vec![SupportingContext {
            fact_key: "freight_estimate".to_string(),
            evidence: cite_a.clone(),
            reason: "fact below confidence threshold".to_string(),
        }];

        let first = match build_pack(&verdicts, &[], &context, &states) {
            Ok(pack) => pack,
            Err(err) => panic!("pack should build: {err}"),
        };
        let reordered = vec![verdicts[1].clone(), verdicts[0].clone()];
        let second = match build_pack(&reordered, &[], &context, &states) {
            Ok(pack) => pack,
            Err(err) => panic!("pack should build: {err}"),
        };

        assert_eq!(first, second);
        assert_eq!(first.items[0].rule_id.as_deref(), Some("A-RULE"));
        assert_eq!(first.items[2].tag, EvidenceTag::Supporting);
    }
}
