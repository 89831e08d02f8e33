//! Deterministic decision core for procurement cases.
//!
//! Everything in this crate is pure: the same case snapshot, evidence set,
//! and policy version always produce the same facts, verdicts, and evidence
//! pack, byte for byte. Persistence and transactions live in the store crate.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub mod audit;
pub mod case;
pub mod error;
pub mod evidence;
pub mod fact;
pub mod link;
pub mod pack;
pub mod policy;
pub mod rule;
pub mod run;

pub use audit::{AuditEvent, AuditEventType};
pub use case::{Case, CaseLine, CaseSignals, SignalValue};
pub use error::DecisionError;
pub use evidence::{
    cosine_similarity, Clause, DocumentHit, DocumentQuery, DocumentRef, EvidenceGateway,
    EvidenceRef, PriceItem, ReadinessLevel,
};
pub use fact::{derive_facts, scaled_confidence, DerivationConfig, DerivedFact, FactMethod, Observation};
pub use link::{propose_links, CaseDocumentLink, DiscoveredVia, LinkState, LinkerConfig};
pub use pack::{build_pack, EvidenceItem, EvidencePack, EvidenceTag, SupportingContext};
pub use policy::{
    resolve_policy, PolicyBundle, PolicyMeta, PolicyResolution, PolicySelector, PredicateOp,
    RuleSet, RuleSpec, SignalPredicate,
};
pub use rule::{evaluate_rules, Evaluation, RuleFault, RuleVerdict, Severity, VerdictOutcome};
pub use run::{assemble_run, DecisionAction, DecisionRun, EvidenceSnapshot, RunStatus};

macro_rules! ulid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Ok(Self(Ulid::from_string(value)?))
            }
        }
    };
}

ulid_id!(
    /// Stable identifier for a procurement case (one PO intake).
    CaseId
);
ulid_id!(
    /// Identifier assigned to a document by the ingestion collaborator.
    DocumentId
);
ulid_id!(
    /// Identifier for one case-document link record. Re-linking after removal
    /// allocates a fresh one; history is never overwritten.
    LinkId
);
ulid_id!(
    /// Identifier for one decision run (one orchestration pass).
    RunId
);
ulid_id!(
    /// Identifier for one append-only audit event.
    EventId
);
ulid_id!(PriceItemId);
ulid_id!(ClauseId);
ulid_id!(ChunkId);
