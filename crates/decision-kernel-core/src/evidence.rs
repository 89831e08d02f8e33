use serde::{Deserialize, Serialize};

use crate::error::DecisionError;
use crate::link::DiscoveredVia;
use crate::{ClauseId, DocumentId, PriceItemId};

/// Ingestion-assigned maturity tier gating whether a document may be used.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessLevel {
    L0,
    L1,
    L2,
    L3,
    L4,
    L5,
    L6,
}

impl ReadinessLevel {
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::L0 => 0,
            Self::L1 => 1,
            Self::L2 => 2,
            Self::L3 => 3,
            Self::L4 => 4,
            Self::L5 => 5,
            Self::L6 => 6,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::L0 => "l0",
            Self::L1 => "l1",
            Self::L2 => "l2",
            Self::L3 => "l3",
            Self::L4 => "l4",
            Self::L5 => "l5",
            Self::L6 => "l6",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "l0" => Some(Self::L0),
            "l1" => Some(Self::L1),
            "l2" => Some(Self::L2),
            "l3" => Some(Self::L3),
            "l4" => Some(Self::L4),
            "l5" => Some(Self::L5),
            "l6" => Some(Self::L6),
            _ => None,
        }
    }
}

/// Reference to a confirmed, readiness-qualified document as exposed by the
/// ingestion collaborator. The decision core never mutates these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentRef {
    pub document_id: DocumentId,
    pub doc_type: String,
    pub vendor_id: Option<String>,
    pub readiness: ReadinessLevel,
    pub source_uri: String,
}

/// Extracted price row, keyed by the fact it can contribute to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceItem {
    pub price_item_id: PriceItemId,
    pub document_id: DocumentId,
    pub fact_key: String,
    pub unit_price: f64,
    pub currency: String,
    pub page_anchor: Option<u32>,
    pub extraction_confidence: f32,
}

/// Extracted contractual clause. Clause text is what relational discovery
/// scans for PO references.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Clause {
    pub clause_id: ClauseId,
    pub document_id: DocumentId,
    pub text: String,
    pub page_anchor: Option<u32>,
    pub extraction_confidence: f32,
}

/// Citation of the exact evidentiary row a fact or verdict was computed from.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
pub struct EvidenceRef {
    pub document_id: DocumentId,
    pub price_item_id: Option<PriceItemId>,
    pub clause_id: Option<ClauseId>,
    pub page_anchor: Option<u32>,
}

impl EvidenceRef {
    #[must_use]
    pub fn from_price_item(item: &PriceItem) -> Self {
        Self {
            document_id: item.document_id,
            price_item_id: Some(item.price_item_id),
            clause_id: None,
            page_anchor: item.page_anchor,
        }
    }

    #[must_use]
    pub fn from_clause(clause: &Clause) -> Self {
        Self {
            document_id: clause.document_id,
            price_item_id: None,
            clause_id: Some(clause.clause_id),
            page_anchor: clause.page_anchor,
        }
    }
}

/// Query against the ingestion collaborator's document corpus.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DocumentQuery {
    pub vendor_id: Option<String>,
    pub po_reference: Option<String>,
    pub query_embedding: Option<Vec<f32>>,
    pub min_readiness: Option<ReadinessLevel>,
}

/// One discovery candidate with the technique that surfaced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentHit {
    pub document: DocumentRef,
    pub matched_via: DiscoveredVia,
    pub score: f64,
}

/// Read-only capability over confirmed evidence. The single seam between the
/// decision loop and the ingestion collaborator; implementations hide the
/// relational-filter and vector-similarity mechanics.
pub trait EvidenceGateway {
    /// Find readiness-qualified documents matching the relational and/or
    /// semantic query, one hit per (document, technique) pair.
    ///
    /// # Errors
    /// Returns [`DecisionError::Query`] when the underlying store fails.
    fn find_confirmable_documents(
        &self,
        query: &DocumentQuery,
    ) -> Result<Vec<DocumentHit>, DecisionError>;

    /// Extracted price rows for one document.
    ///
    /// # Errors
    /// Returns [`DecisionError::Query`] when the underlying store fails.
    fn price_items(&self, document_id: DocumentId) -> Result<Vec<PriceItem>, DecisionError>;

    /// Extracted clauses for one document.
    ///
    /// # Errors
    /// Returns [`DecisionError::Query`] when the underlying store fails.
    fn clauses(&self, document_id: DocumentId) -> Result<Vec<Clause>, DecisionError>;
}

/// Cosine similarity between a query embedding and a stored chunk embedding.
/// Returns 0.0 for mismatched dimensions or zero-magnitude vectors rather
/// than failing discovery outright.
#[must_use]
pub fn cosine_similarity(lhs: &[f32], rhs: &[f32]) -> f64 {
    if lhs.len() != rhs.len() || lhs.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0_f64;
    let mut lhs_norm = 0.0_f64;
    let mut rhs_norm = 0.0_f64;
    for (a, b) in lhs.iter().zip(rhs.iter()) {
        dot += f64::from(*a) * f64::from(*b);
        lhs_norm += f64::from(*a) * f64::from(*a);
        rhs_norm += f64::from(*b) * f64::from(*b);
    }

    if lhs_norm == 0.0 || rhs_norm == 0.0 {
        return 0.0;
    }

    dot / (lhs_norm.sqrt() * rhs_norm.sqrt())
}
