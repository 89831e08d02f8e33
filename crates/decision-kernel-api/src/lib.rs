//! Facade over the core and store crates. The CLI and service both drive the
//! kernel exclusively through this API, so every entry opens the store and
//! migrates before touching data.

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use decision_kernel_core::{
    AuditEvent, Case, CaseDocumentLink, CaseId, CaseLine, CaseSignals, ChunkId, Clause, ClauseId,
    DecisionAction, DecisionRun, DocumentId, DocumentRef, EvidencePack, LinkId, LinkerConfig,
    PolicyBundle, PriceItem, PriceItemId, ReadinessLevel, RunId,
};
use decision_kernel_store_sqlite::{CaseSummary, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateCaseRequest {
    pub case_id: Option<CaseId>,
    pub vendor_id: String,
    pub po_reference: String,
    pub currency: String,
    #[serde(default)]
    pub lines: Vec<CaseLine>,
    #[serde(default)]
    pub signals: CaseSignals,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceItemInput {
    pub fact_key: String,
    pub unit_price: f64,
    pub currency: String,
    #[serde(default)]
    pub page_anchor: Option<u32>,
    pub extraction_confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClauseInput {
    pub text: String,
    #[serde(default)]
    pub page_anchor: Option<u32>,
    pub extraction_confidence: f32,
}

/// One document with its extracted rows, registered in a single call the way
/// the ingestion collaborator delivers them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AddDocumentRequest {
    pub document_id: Option<DocumentId>,
    pub doc_type: String,
    #[serde(default)]
    pub vendor_id: Option<String>,
    pub readiness: ReadinessLevel,
    pub source_uri: String,
    #[serde(default)]
    pub price_items: Vec<PriceItemInput>,
    #[serde(default)]
    pub clauses: Vec<ClauseInput>,
    #[serde(default)]
    pub chunk_embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoverLinksRequest {
    pub case_id: CaseId,
    #[serde(default)]
    pub vector_threshold: Option<f64>,
    #[serde(default)]
    pub min_readiness: Option<ReadinessLevel>,
    #[serde(default)]
    pub query_embedding: Option<Vec<f32>>,
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordDecisionRequest {
    pub run_id: RunId,
    pub action: DecisionAction,
    #[serde(default)]
    pub rationale: Option<String>,
    pub actor: String,
}

#[derive(Debug, Clone)]
pub struct DecisionKernelApi {
    db_path: PathBuf,
}

impl DecisionKernelApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Intake one procurement case.
    ///
    /// # Errors
    /// Returns an error when case validation or persistence fails.
    pub fn create_case(&self, input: CreateCaseRequest) -> Result<Case> {
        let mut store = self.open_migrated()?;
        let case = Case {
            case_id: input.case_id.unwrap_or_default(),
            vendor_id: input.vendor_id,
            po_reference: input.po_reference,
            currency: input.currency,
            lines: input.lines,
            signals: input.signals,
            created_at: input.created_at.unwrap_or_else(OffsetDateTime::now_utc),
        };
        store.insert_case(&case)?;
        Ok(case)
    }

    /// Fetch one case header with lines and signals.
    ///
    /// # Errors
    /// Returns an error when lookup fails or the case does not exist.
    pub fn get_case(&self, case_id: CaseId) -> Result<Case> {
        let store = self.open_migrated()?;
        store.get_case(case_id)?.ok_or_else(|| anyhow!("case not found: {case_id}"))
    }

    /// Register one document together with its extracted rows and embeddings.
    ///
    /// # Errors
    /// Returns an error when any insert fails.
    pub fn add_document(&self, input: AddDocumentRequest) -> Result<DocumentRef> {
        let mut store = self.open_migrated()?;
        let document = DocumentRef {
            document_id: input.document_id.unwrap_or_default(),
            doc_type: input.doc_type,
            vendor_id: input.vendor_id,
            readiness: input.readiness,
            source_uri: input.source_uri,
        };
        store.insert_document(&document)?;

        for item in input.price_items {
            store.insert_price_item(&PriceItem {
                price_item_id: PriceItemId::new(),
                document_id: document.document_id,
                fact_key: item.fact_key,
                unit_price: item.unit_price,
                currency: item.currency,
                page_anchor: item.page_anchor,
                extraction_confidence: item.extraction_confidence,
            })?;
        }
        for clause in input.clauses {
            store.insert_clause(&Clause {
                clause_id: ClauseId::new(),
                document_id: document.document_id,
                text: clause.text,
                page_anchor: clause.page_anchor,
                extraction_confidence: clause.extraction_confidence,
            })?;
        }
        for embedding in input.chunk_embeddings {
            store.insert_chunk(ChunkId::new(), document.document_id, &embedding)?;
        }

        Ok(document)
    }

    /// Parse, validate, and persist one policy bundle from YAML.
    ///
    /// # Errors
    /// Returns an error when the YAML is malformed, the bundle is invalid, or
    /// persistence fails.
    pub fn load_policy(&self, yaml: &str, activate: bool) -> Result<PolicyBundle> {
        let bundle: PolicyBundle =
            serde_yaml::from_str(yaml).map_err(|err| anyhow!("invalid policy yaml: {err}"))?;
        let mut store = self.open_migrated()?;
        store.store_policy(&bundle, activate)?;
        Ok(bundle)
    }

    /// The currently active policy bundle.
    ///
    /// # Errors
    /// Returns an error when lookup fails or no bundle is active.
    pub fn active_policy(&self) -> Result<PolicyBundle> {
        let store = self.open_migrated()?;
        store.active_policy()?.ok_or_else(|| anyhow!("no active policy bundle"))
    }

    /// Run discovery for a case and persist the proposed INFERRED links.
    ///
    /// # Errors
    /// Returns an error when the case is unknown or discovery fails.
    pub fn discover_links(&self, input: DiscoverLinksRequest) -> Result<Vec<CaseDocumentLink>> {
        let mut store = self.open_migrated()?;
        let mut config = LinkerConfig::default();
        if let Some(threshold) = input.vector_threshold {
            config.vector_threshold = threshold;
        }
        if let Some(min_readiness) = input.min_readiness {
            config.min_readiness = min_readiness;
        }
        store.discover_links(
            input.case_id,
            &config,
            input.query_embedding.as_deref(),
            &input.actor,
        )
    }

    /// Confirm one INFERRED link.
    ///
    /// # Errors
    /// Returns an error when the link is unknown or not INFERRED.
    pub fn confirm_link(&self, link_id: LinkId, actor: &str) -> Result<CaseDocumentLink> {
        let mut store = self.open_migrated()?;
        store.confirm_link(link_id, actor)
    }

    /// Remove one INFERRED link.
    ///
    /// # Errors
    /// Returns an error when the link is unknown or not INFERRED.
    pub fn remove_link(&self, link_id: LinkId, actor: &str) -> Result<CaseDocumentLink> {
        let mut store = self.open_migrated()?;
        store.remove_link(link_id, actor)
    }

    /// All link rows for one case.
    ///
    /// # Errors
    /// Returns an error when the read fails.
    pub fn list_links(&self, case_id: CaseId) -> Result<Vec<CaseDocumentLink>> {
        let store = self.open_migrated()?;
        store.links_for_case(case_id)
    }

    /// Execute one full decision pass for a case.
    ///
    /// # Errors
    /// Returns an error when a run is already active, no policy applies, the
    /// evidence is insufficient, or persistence fails.
    pub fn start_run(&self, case_id: CaseId, actor: &str) -> Result<DecisionRun> {
        let mut store = self.open_migrated()?;
        store.start_run(case_id, actor)
    }

    /// Fetch one run by id.
    ///
    /// # Errors
    /// Returns an error when lookup fails or the run does not exist.
    pub fn get_run(&self, run_id: RunId) -> Result<DecisionRun> {
        let store = self.open_migrated()?;
        store.get_run(run_id)?.ok_or_else(|| anyhow!("run not found: {run_id}"))
    }

    /// The most recent run for a case.
    ///
    /// # Errors
    /// Returns an error when lookup fails or the case has no runs.
    pub fn latest_run(&self, case_id: CaseId) -> Result<DecisionRun> {
        let store = self.open_migrated()?;
        store.latest_run(case_id)?.ok_or_else(|| anyhow!("case has no runs: {case_id}"))
    }

    /// The reviewer-facing evidence pack of the latest run for a case.
    ///
    /// # Errors
    /// Returns an error when lookup fails or the case has no runs.
    pub fn evidence_pack(&self, case_id: CaseId) -> Result<EvidencePack> {
        Ok(self.latest_run(case_id)?.pack)
    }

    /// Apply a reviewer decision to a run pending review.
    ///
    /// # Errors
    /// Returns an error when the guards reject the action or persistence fails.
    pub fn record_decision(&self, input: RecordDecisionRequest) -> Result<DecisionRun> {
        let mut store = self.open_migrated()?;
        store.record_decision(
            input.run_id,
            input.action,
            input.rationale.as_deref(),
            &input.actor,
        )
    }

    /// The full append-only trail for one case in causal order.
    ///
    /// # Errors
    /// Returns an error when the read fails.
    pub fn audit_trail(&self, case_id: CaseId) -> Result<Vec<AuditEvent>> {
        let store = self.open_migrated()?;
        store.audit_trail(case_id)
    }

    /// Case header plus link counts and the latest run header.
    ///
    /// # Errors
    /// Returns an error when the case is unknown.
    pub fn case_summary(&self, case_id: CaseId) -> Result<CaseSummary> {
        let store = self.open_migrated()?;
        store.case_summary(case_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use decision_kernel_core::{LinkState, RunStatus, SignalValue};

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("decisionkernel-api-{}.sqlite3", ulid::Ulid::new()))
    }

    const POLICY_YAML: &str = r"
meta:
  policy_id: procurement-default
  version: '2024.1'
selectors:
  - selector_id: mro
    priority: 1
    when:
      - signal: category
        op: eq
        value: MRO
    technique: CONTRACT_BASELINE
    rule_set: rs-price
rule_sets:
  - rule_set_id: rs-price
    version: '1'
    rules:
      - rule_id: PRICE-01
        severity: high
        min_confidence: 0.4
        logic:
          compare:
            fact: unit_price_benchmark
            op: lte
            value: 150.0
";

    fn seed_case(api: &DecisionKernelApi) -> Result<CaseId> {
        let mut signals = CaseSignals::new();
        signals.insert("category".to_string(), SignalValue::Text("MRO".to_string()));
        let case = api.create_case(CreateCaseRequest {
            case_id: None,
            vendor_id: "V-001".to_string(),
            po_reference: "PO-2024-0042".to_string(),
            currency: "THB".to_string(),
            lines: vec![CaseLine {
                item_id: "SKU-9".to_string(),
                description: "industrial bearing".to_string(),
                quantity: 40.0,
                unit_price: 125.5,
            }],
            signals,
            created_at: None,
        })?;
        Ok(case.case_id)
    }

    fn seed_document(api: &DecisionKernelApi) -> Result<DocumentRef> {
        api.add_document(AddDocumentRequest {
            document_id: None,
            doc_type: "contract".to_string(),
            vendor_id: Some("V-001".to_string()),
            readiness: ReadinessLevel::L5,
            source_uri: "file:///contracts/v-001.pdf".to_string(),
            price_items: vec![
                PriceItemInput {
                    fact_key: "unit_price_benchmark".to_string(),
                    unit_price: 118.0,
                    currency: "THB".to_string(),
                    page_anchor: Some(3),
                    extraction_confidence: 0.9,
                },
                PriceItemInput {
                    fact_key: "unit_price_benchmark".to_string(),
                    unit_price: 120.0,
                    currency: "THB".to_string(),
                    page_anchor: Some(3),
                    extraction_confidence: 0.9,
                },
                PriceItemInput {
                    fact_key: "unit_price_benchmark".to_string(),
                    unit_price: 124.0,
                    currency: "THB".to_string(),
                    page_anchor: Some(4),
                    extraction_confidence: 0.85,
                },
            ],
            clauses: vec![ClauseInput {
                text: "Pricing fixed per PO-2024-0042 appendix B.".to_string(),
                page_anchor: Some(12),
                extraction_confidence: 0.95,
            }],
            chunk_embeddings: Vec::new(),
        })
    }

    #[test]
    fn end_to_end_case_to_approved_run() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = DecisionKernelApi::new(db_path.clone());

        let case_id = seed_case(&api)?;
        seed_document(&api)?;
        api.load_policy(POLICY_YAML, true)?;

        let links = api.discover_links(DiscoverLinksRequest {
            case_id,
            vector_threshold: None,
            min_readiness: None,
            query_embedding: None,
            actor: "system".to_string(),
        })?;
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].state, LinkState::Inferred);

        let confirmed = api.confirm_link(links[0].link_id, "reviewer-1")?;
        assert_eq!(confirmed.state, LinkState::Confirmed);

        let run = api.start_run(case_id, "reviewer-1")?;
        assert_eq!(run.status, RunStatus::PendingReview);
        assert!(run.pack.primary_count() >= 1);

        let pack = api.evidence_pack(case_id)?;
        assert_eq!(pack, run.pack);

        let decided = api.record_decision(RecordDecisionRequest {
            run_id: run.run_id,
            action: DecisionAction::Approve,
            rationale: None,
            actor: "reviewer-1".to_string(),
        })?;
        assert_eq!(decided.status, RunStatus::Approved);

        let trail = api.audit_trail(case_id)?;
        assert!(trail.len() >= 9);

        let summary = api.case_summary(case_id)?;
        assert_eq!(summary.link_counts.get("confirmed"), Some(&1));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn malformed_policy_yaml_is_rejected_before_persistence() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = DecisionKernelApi::new(db_path.clone());

        let result = api.load_policy("selectors: [not a bundle", true);
        assert!(result.is_err());
        assert!(api.active_policy().is_err());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn migrate_dry_run_reports_pending_without_applying() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = DecisionKernelApi::new(db_path.clone());

        let planned = api.migrate(true)?;
        assert!(planned.dry_run);
        assert_eq!(planned.would_apply_versions, vec![1]);
        assert_eq!(planned.after_version, None);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(1));
        assert_eq!(applied.up_to_date, Some(true));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }
}
