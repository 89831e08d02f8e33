use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::case::Case;
use crate::error::DecisionError;
use crate::evidence::{DocumentHit, ReadinessLevel};
use crate::{CaseId, DocumentId, LinkId};

/// Link lifecycle. INFERRED is the only non-terminal state; a terminal link
/// is never reused — re-linking allocates a new record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Inferred,
    Confirmed,
    Removed,
}

impl LinkState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inferred => "inferred",
            Self::Confirmed => "confirmed",
            Self::Removed => "removed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "inferred" => Some(Self::Inferred),
            "confirmed" => Some(Self::Confirmed),
            "removed" => Some(Self::Removed),
            _ => None,
        }
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveredVia {
    Relational,
    Vector,
    Manual,
}

impl DiscoveredVia {
    /// Precedence when one document is surfaced by several techniques at the
    /// same score: relational evidence is the strongest signal.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Relational => 3,
            Self::Vector => 2,
            Self::Manual => 1,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Relational => "relational",
            Self::Vector => "vector",
            Self::Manual => "manual",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "relational" => Some(Self::Relational),
            "vector" => Some(Self::Vector),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// One case-document association record with its full decision trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaseDocumentLink {
    pub link_id: LinkId,
    pub case_id: CaseId,
    pub document_id: DocumentId,
    pub state: LinkState,
    pub discovered_via: DiscoveredVia,
    pub match_score: f64,
    pub actor: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub decided_at: Option<OffsetDateTime>,
    pub decided_by: Option<String>,
}

impl CaseDocumentLink {
    /// Promote an INFERRED link to CONFIRMED, making its document
    /// decision-eligible.
    ///
    /// # Errors
    /// Returns [`DecisionError::InvalidLinkTransition`] when the link is not
    /// INFERRED, and [`DecisionError::Validation`] when the actor is blank.
    pub fn confirm(&self, actor: &str, now: OffsetDateTime) -> Result<Self, DecisionError> {
        self.transition(LinkState::Confirmed, actor, now)
    }

    /// Retire an INFERRED link. Removed links never feed derivation and may
    /// never re-enter the pack.
    ///
    /// # Errors
    /// Returns [`DecisionError::InvalidLinkTransition`] when the link is not
    /// INFERRED, and [`DecisionError::Validation`] when the actor is blank.
    pub fn remove(&self, actor: &str, now: OffsetDateTime) -> Result<Self, DecisionError> {
        self.transition(LinkState::Removed, actor, now)
    }

    fn transition(
        &self,
        to: LinkState,
        actor: &str,
        now: OffsetDateTime,
    ) -> Result<Self, DecisionError> {
        if actor.trim().is_empty() {
            return Err(DecisionError::Validation(
                "actor MUST be provided for every link transition".to_string(),
            ));
        }
        if self.state != LinkState::Inferred {
            return Err(DecisionError::InvalidLinkTransition {
                link_id: self.link_id,
                state: self.state,
            });
        }

        let mut next = self.clone();
        next.state = to;
        next.decided_at = Some(now);
        next.decided_by = Some(actor.to_string());
        Ok(next)
    }
}

/// Thresholds for discovery. Parameterized rather than hard-coded; defaults
/// follow the loaded policy profile where one is provided.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkerConfig {
    /// Minimum cosine similarity for a vector hit to become an inferred link.
    pub vector_threshold: f64,
    /// Documents below this readiness tier are invisible to discovery.
    pub min_readiness: ReadinessLevel,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self { vector_threshold: 0.78, min_readiness: ReadinessLevel::L4 }
    }
}

/// Turn discovery hits into INFERRED links.
///
/// Deterministic and idempotent: hits are deduplicated per document keeping
/// the highest score (technique rank breaks score ties), documents already
/// holding a live link are skipped, and output is ordered by document id
/// ascending. Running twice over the same inputs proposes the same set once.
#[must_use]
pub fn propose_links(
    case: &Case,
    hits: &[DocumentHit],
    existing: &[CaseDocumentLink],
    config: &LinkerConfig,
    actor: &str,
    now: OffsetDateTime,
) -> Vec<CaseDocumentLink> {
    let mut best: BTreeMap<DocumentId, &DocumentHit> = BTreeMap::new();

    for hit in hits {
        if hit.document.readiness.rank() < config.min_readiness.rank() {
            continue;
        }
        if hit.matched_via == DiscoveredVia::Vector && hit.score < config.vector_threshold {
            continue;
        }
        if !hit.score.is_finite() {
            continue;
        }

        match best.get(&hit.document.document_id) {
            Some(current)
                if (current.score, current.matched_via.rank())
                    >= (hit.score, hit.matched_via.rank()) => {}
            _ => {
                best.insert(hit.document.document_id, hit);
            }
        }
    }

    let live: std::collections::BTreeSet<DocumentId> = existing
        .iter()
        .filter(|link| link.state != LinkState::Removed)
        .map(|link| link.document_id)
        .collect();

    best.into_values()
        .filter(|hit| !live.contains(&hit.document.document_id))
        .map(|hit| CaseDocumentLink {
            link_id: LinkId::new(),
            case_id: case.case_id,
            document_id: hit.document.document_id,
            state: LinkState::Inferred,
            discovered_via: hit.matched_via,
            match_score: hit.score,
            actor: actor.to_string(),
            created_at: now,
            decided_at: None,
            decided_by: None,
        })
        .collect()
}
