//! SQLite persistence for the decision kernel.
//!
//! Every multi-step write happens inside one `BEGIN IMMEDIATE` transaction so
//! audit events, link rows, and run rows commit or roll back together. The
//! core crate stays pure; this crate owns clocks, IDs at the boundary, and
//! the input-hash snapshot.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use decision_kernel_core::{
    assemble_run, cosine_similarity, propose_links, AuditEvent, AuditEventType, Case,
    CaseDocumentLink, CaseId, CaseLine, ChunkId, Clause, ClauseId, DecisionAction, DecisionError,
    DecisionRun, DerivationConfig, DiscoveredVia, DocumentHit, DocumentId, DocumentQuery,
    DocumentRef, EventId, EvidenceGateway, EvidenceSnapshot, LinkId, LinkState, LinkerConfig,
    PolicyBundle, PriceItem, PriceItemId, ReadinessLevel, RunId, RunStatus,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS cases (
  case_id TEXT PRIMARY KEY,
  vendor_id TEXT NOT NULL,
  po_reference TEXT NOT NULL,
  currency TEXT NOT NULL,
  signals_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS case_lines (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  case_id TEXT NOT NULL,
  item_id TEXT NOT NULL,
  description TEXT NOT NULL,
  quantity REAL NOT NULL,
  unit_price REAL NOT NULL,
  FOREIGN KEY (case_id) REFERENCES cases(case_id)
);

CREATE TABLE IF NOT EXISTS documents (
  document_id TEXT PRIMARY KEY,
  doc_type TEXT NOT NULL,
  vendor_id TEXT,
  readiness TEXT NOT NULL CHECK (readiness IN ('l0','l1','l2','l3','l4','l5','l6')),
  source_uri TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS price_items (
  price_item_id TEXT PRIMARY KEY,
  document_id TEXT NOT NULL,
  fact_key TEXT NOT NULL,
  unit_price REAL NOT NULL,
  currency TEXT NOT NULL,
  page_anchor INTEGER,
  extraction_confidence REAL NOT NULL,
  FOREIGN KEY (document_id) REFERENCES documents(document_id)
);

CREATE TABLE IF NOT EXISTS clauses (
  clause_id TEXT PRIMARY KEY,
  document_id TEXT NOT NULL,
  body TEXT NOT NULL,
  page_anchor INTEGER,
  extraction_confidence REAL NOT NULL,
  FOREIGN KEY (document_id) REFERENCES documents(document_id)
);

CREATE TABLE IF NOT EXISTS document_chunks (
  chunk_id TEXT PRIMARY KEY,
  document_id TEXT NOT NULL,
  embedding_json TEXT NOT NULL,
  FOREIGN KEY (document_id) REFERENCES documents(document_id)
);

CREATE TABLE IF NOT EXISTS policies (
  policy_id TEXT NOT NULL,
  version TEXT NOT NULL,
  bundle_json TEXT NOT NULL,
  active INTEGER NOT NULL DEFAULT 0 CHECK (active IN (0, 1)),
  loaded_at TEXT NOT NULL,
  PRIMARY KEY (policy_id, version)
);

CREATE TABLE IF NOT EXISTS case_document_links (
  link_id TEXT PRIMARY KEY,
  case_id TEXT NOT NULL,
  document_id TEXT NOT NULL,
  state TEXT NOT NULL CHECK (state IN ('inferred','confirmed','removed')),
  discovered_via TEXT NOT NULL CHECK (discovered_via IN ('relational','vector','manual')),
  match_score REAL NOT NULL,
  actor TEXT NOT NULL,
  created_at TEXT NOT NULL,
  decided_at TEXT,
  decided_by TEXT,
  FOREIGN KEY (case_id) REFERENCES cases(case_id),
  FOREIGN KEY (document_id) REFERENCES documents(document_id)
);

CREATE TABLE IF NOT EXISTS decision_runs (
  run_id TEXT PRIMARY KEY,
  case_id TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('draft','pending_review','approved','escalated','overridden')),
  policy_id TEXT NOT NULL,
  policy_version TEXT NOT NULL,
  rule_set_id TEXT NOT NULL,
  input_hash TEXT NOT NULL,
  requires_escalation INTEGER NOT NULL CHECK (requires_escalation IN (0, 1)),
  created_at TEXT NOT NULL,
  created_by TEXT NOT NULL,
  decided_at TEXT,
  decided_by TEXT,
  rationale TEXT,
  run_json TEXT NOT NULL,
  FOREIGN KEY (case_id) REFERENCES cases(case_id)
);

CREATE TABLE IF NOT EXISTS derived_facts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL,
  fact_key TEXT NOT NULL,
  value REAL NOT NULL,
  unit TEXT,
  confidence REAL NOT NULL,
  method TEXT NOT NULL CHECK (method IN ('median','fallback','single_source')),
  citations_json TEXT NOT NULL,
  FOREIGN KEY (run_id) REFERENCES decision_runs(run_id)
);

CREATE TABLE IF NOT EXISTS rule_verdicts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL,
  rule_id TEXT NOT NULL,
  outcome TEXT NOT NULL CHECK (outcome IN ('pass','fail','inconclusive')),
  severity TEXT NOT NULL CHECK (severity IN ('low','medium','high','critical')),
  cited_facts_json TEXT NOT NULL,
  cited_evidence_json TEXT NOT NULL,
  explanation TEXT NOT NULL,
  FOREIGN KEY (run_id) REFERENCES decision_runs(run_id)
);

CREATE TABLE IF NOT EXISTS audit_events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  case_id TEXT NOT NULL,
  run_id TEXT,
  event_type TEXT NOT NULL CHECK (event_type IN (
    'LINK_INFERRED','LINK_CONFIRMED','LINK_REMOVED',
    'RUN_STARTED','POLICY_RESOLVED','FACTS_DERIVED','RULES_EVALUATED','PACK_BUILT',
    'RUN_PENDING_REVIEW','RUN_ABANDONED','RUN_APPROVED','RUN_ESCALATED','RUN_OVERRIDDEN'
  )),
  payload_json TEXT NOT NULL,
  actor TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  predecessor TEXT,
  FOREIGN KEY (case_id) REFERENCES cases(case_id)
);

CREATE INDEX IF NOT EXISTS idx_price_items_document ON price_items(document_id);
CREATE INDEX IF NOT EXISTS idx_clauses_document ON clauses(document_id);
CREATE INDEX IF NOT EXISTS idx_chunks_document ON document_chunks(document_id);
CREATE INDEX IF NOT EXISTS idx_links_case ON case_document_links(case_id);
CREATE INDEX IF NOT EXISTS idx_runs_case ON decision_runs(case_id);
CREATE INDEX IF NOT EXISTS idx_audit_events_case ON audit_events(case_id);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// Row-level view of a case used by the CLI and service summary endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaseSummary {
    pub case: Case,
    pub link_counts: BTreeMap<String, i64>,
    pub latest_run: Option<RunHeader>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunHeader {
    pub run_id: String,
    pub status: String,
    pub requires_escalation: bool,
    pub created_at: String,
}

impl SqliteStore {
    /// Open a SQLite-backed decision store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version == 0 {
            self.conn
                .execute_batch(MIGRATION_001_SQL)
                .context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
        }

        let version = current_schema_version(&self.conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Persist one validated case header with its lines.
    ///
    /// # Errors
    /// Returns an error when validation fails or any write in the transaction fails.
    pub fn insert_case(&mut self, case: &Case) -> Result<()> {
        case.validate().map_err(|err| anyhow!("case validation failed: {err}"))?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transaction")?;

        tx.execute(
            "INSERT INTO cases(case_id, vendor_id, po_reference, currency, signals_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                case.case_id.to_string(),
                case.vendor_id,
                case.po_reference,
                case.currency,
                serde_json::to_string(&case.signals).context("failed to serialize case signals")?,
                rfc3339(case.created_at)?,
            ],
        )
        .context("failed to insert case")?;

        for line in &case.lines {
            tx.execute(
                "INSERT INTO case_lines(case_id, item_id, description, quantity, unit_price)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    case.case_id.to_string(),
                    line.item_id,
                    line.description,
                    line.quantity,
                    line.unit_price,
                ],
            )
            .context("failed to insert case line")?;
        }

        tx.commit().context("failed to commit case transaction")?;
        Ok(())
    }

    /// Load one case with its lines and signals.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn get_case(&self, case_id: CaseId) -> Result<Option<Case>> {
        load_case(&self.conn, case_id)
    }

    /// Register a document surfaced by the ingestion collaborator.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_document(&mut self, document: &DocumentRef) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO documents(document_id, doc_type, vendor_id, readiness, source_uri)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    document.document_id.to_string(),
                    document.doc_type,
                    document.vendor_id,
                    document.readiness.as_str(),
                    document.source_uri,
                ],
            )
            .context("failed to insert document")?;
        Ok(())
    }

    /// Register one extracted price row for a document.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_price_item(&mut self, item: &PriceItem) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO price_items(
                    price_item_id, document_id, fact_key, unit_price, currency, page_anchor, extraction_confidence
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    item.price_item_id.to_string(),
                    item.document_id.to_string(),
                    item.fact_key,
                    item.unit_price,
                    item.currency,
                    item.page_anchor,
                    f64::from(item.extraction_confidence),
                ],
            )
            .context("failed to insert price item")?;
        Ok(())
    }

    /// Register one extracted clause for a document.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_clause(&mut self, clause: &Clause) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO clauses(clause_id, document_id, body, page_anchor, extraction_confidence)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    clause.clause_id.to_string(),
                    clause.document_id.to_string(),
                    clause.text,
                    clause.page_anchor,
                    f64::from(clause.extraction_confidence),
                ],
            )
            .context("failed to insert clause")?;
        Ok(())
    }

    /// Register one embedding chunk used by vector discovery.
    ///
    /// # Errors
    /// Returns an error when serialization or the insert fails.
    pub fn insert_chunk(
        &mut self,
        chunk_id: ChunkId,
        document_id: DocumentId,
        embedding: &[f32],
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO document_chunks(chunk_id, document_id, embedding_json)
                 VALUES (?1, ?2, ?3)",
                params![
                    chunk_id.to_string(),
                    document_id.to_string(),
                    serde_json::to_string(embedding).context("failed to serialize embedding")?,
                ],
            )
            .context("failed to insert document chunk")?;
        Ok(())
    }

    /// Persist one immutable policy bundle version, optionally activating it.
    ///
    /// Activation is exclusive: at most one bundle is active at a time.
    ///
    /// # Errors
    /// Returns an error when bundle validation or persistence fails.
    pub fn store_policy(&mut self, bundle: &PolicyBundle, activate: bool) -> Result<()> {
        bundle.validate().map_err(|err| anyhow!("policy validation failed: {err}"))?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transaction")?;

        if activate {
            tx.execute("UPDATE policies SET active = 0 WHERE active = 1", [])
                .context("failed to deactivate previous policy")?;
        }

        tx.execute(
            "INSERT INTO policies(policy_id, version, bundle_json, active, loaded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                bundle.meta.policy_id,
                bundle.meta.version,
                serde_json::to_string(bundle).context("failed to serialize policy bundle")?,
                i64::from(activate),
                now_rfc3339()?,
            ],
        )
        .context("failed to insert policy bundle")?;

        tx.commit().context("failed to commit policy transaction")?;
        Ok(())
    }

    /// Load the single active policy bundle, if one has been activated.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn active_policy(&self) -> Result<Option<PolicyBundle>> {
        load_active_policy(&self.conn)
    }

    /// All link rows for one case, oldest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn links_for_case(&self, case_id: CaseId) -> Result<Vec<CaseDocumentLink>> {
        load_links(&self.conn, case_id)
    }

    /// Run discovery for a case and persist the proposed INFERRED links.
    ///
    /// Idempotent: documents already holding a live link are skipped, so a
    /// second pass over unchanged evidence proposes nothing. The existing-link
    /// read, the discovery queries, and the inserts all happen inside one
    /// `BEGIN IMMEDIATE` transaction; two handles discovering the same case
    /// cannot both propose a link for the same document.
    ///
    /// # Errors
    /// Returns an error when the case is unknown, discovery queries fail, or
    /// persistence fails.
    pub fn discover_links(
        &mut self,
        case_id: CaseId,
        config: &LinkerConfig,
        query_embedding: Option<&[f32]>,
        actor: &str,
    ) -> Result<Vec<CaseDocumentLink>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transaction")?;

        let case = load_case(&tx, case_id)?.ok_or_else(|| anyhow!("unknown case: {case_id}"))?;

        let query = DocumentQuery {
            vendor_id: Some(case.vendor_id.clone()),
            po_reference: Some(case.po_reference.clone()),
            query_embedding: query_embedding.map(<[f32]>::to_vec),
            min_readiness: Some(config.min_readiness),
        };
        let hits = confirmable_documents(&tx, &query)
            .map_err(|err| anyhow!("discovery query failed: {err}"))?;
        let existing = load_links(&tx, case_id)?;
        let now = OffsetDateTime::now_utc();
        let proposed = propose_links(&case, &hits, &existing, config, actor, now);

        for link in &proposed {
            insert_link(&tx, link)?;
            append_event(
                &tx,
                case_id,
                None,
                AuditEventType::LinkInferred,
                serde_json::json!({
                    "link_id": link.link_id.to_string(),
                    "document_id": link.document_id.to_string(),
                    "discovered_via": link.discovered_via.as_str(),
                    "match_score": link.match_score,
                }),
                actor,
            )?;
        }

        tx.commit().context("failed to commit discovery transaction")?;
        Ok(proposed)
    }

    /// Confirm an INFERRED link, making its document decision-eligible.
    ///
    /// # Errors
    /// Returns an error when the link is unknown, the transition is invalid,
    /// or persistence fails.
    pub fn confirm_link(&mut self, link_id: LinkId, actor: &str) -> Result<CaseDocumentLink> {
        self.transition_link(link_id, actor, LinkState::Confirmed)
    }

    /// Remove an INFERRED link. The row is retained; only its state changes.
    ///
    /// # Errors
    /// Returns an error when the link is unknown, the transition is invalid,
    /// or persistence fails.
    pub fn remove_link(&mut self, link_id: LinkId, actor: &str) -> Result<CaseDocumentLink> {
        self.transition_link(link_id, actor, LinkState::Removed)
    }

    fn transition_link(
        &mut self,
        link_id: LinkId,
        actor: &str,
        to: LinkState,
    ) -> Result<CaseDocumentLink> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transaction")?;

        let link = load_link(&tx, link_id)?.ok_or_else(|| anyhow!("unknown link: {link_id}"))?;
        let now = OffsetDateTime::now_utc();
        let decided = match to {
            LinkState::Confirmed => link.confirm(actor, now)?,
            LinkState::Removed => link.remove(actor, now)?,
            LinkState::Inferred => {
                return Err(anyhow!("links cannot transition back to inferred"))
            }
        };

        tx.execute(
            "UPDATE case_document_links SET state = ?1, decided_at = ?2, decided_by = ?3
             WHERE link_id = ?4",
            params![
                decided.state.as_str(),
                decided.decided_at.map(rfc3339).transpose()?,
                decided.decided_by,
                link_id.to_string(),
            ],
        )
        .context("failed to update link state")?;

        let event_type = if to == LinkState::Confirmed {
            AuditEventType::LinkConfirmed
        } else {
            AuditEventType::LinkRemoved
        };
        append_event(
            &tx,
            decided.case_id,
            None,
            event_type,
            serde_json::json!({
                "link_id": link_id.to_string(),
                "document_id": decided.document_id.to_string(),
            }),
            actor,
        )?;

        tx.commit().context("failed to commit link transaction")?;
        Ok(decided)
    }

    /// Execute one full decision pass for a case and persist the result.
    ///
    /// The whole pass runs inside one `BEGIN IMMEDIATE` transaction: the
    /// active-run check, the evidence snapshot, assembly, and every audit
    /// event commit together. When assembly fails for lack of policy or
    /// primary evidence, only the RUN_STARTED and RUN_ABANDONED events are
    /// kept; no run row is written.
    ///
    /// # Errors
    /// Returns [`DecisionError::RunAlreadyActive`] (wrapped) when the case
    /// already has a non-terminal run, the assembly errors from the core
    /// crate, or any persistence error.
    pub fn start_run(&mut self, case_id: CaseId, actor: &str) -> Result<DecisionRun> {
        let config = DerivationConfig::default();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start run transaction")?;

        let active: Option<String> = tx
            .query_row(
                "SELECT run_id FROM decision_runs
                 WHERE case_id = ?1 AND status IN ('draft', 'pending_review')
                 LIMIT 1",
                params![case_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to check for active runs")?;
        if active.is_some() {
            return Err(DecisionError::RunAlreadyActive(case_id).into());
        }

        let case = load_case(&tx, case_id)?.ok_or_else(|| anyhow!("unknown case: {case_id}"))?;
        let bundle = load_active_policy(&tx)?
            .ok_or_else(|| anyhow!("no active policy bundle; load one before starting runs"))?;

        let links = load_links(&tx, case_id)?;
        let mut price_items = BTreeMap::new();
        let mut clauses = BTreeMap::new();
        for document_id in links.iter().map(|link| link.document_id) {
            if price_items.contains_key(&document_id) {
                continue;
            }
            price_items.insert(document_id, load_price_items(&tx, document_id)?);
            clauses.insert(document_id, load_clauses(&tx, document_id)?);
        }
        let snapshot = EvidenceSnapshot { links, price_items, clauses };

        let input_hash = snapshot_hash(&case, &snapshot, &bundle)?;
        let run_id = RunId::new();
        let now = OffsetDateTime::now_utc();

        append_event(
            &tx,
            case_id,
            Some(run_id),
            AuditEventType::RunStarted,
            serde_json::json!({ "input_hash": input_hash }),
            actor,
        )?;

        let run = match assemble_run(
            run_id, &case, &snapshot, &bundle, &config, &input_hash, actor, now,
        ) {
            Ok(run) => run,
            Err(
                err @ (DecisionError::InsufficientEvidence(_)
                | DecisionError::NoApplicablePolicy(_)),
            ) => {
                append_event(
                    &tx,
                    case_id,
                    Some(run_id),
                    AuditEventType::RunAbandoned,
                    serde_json::json!({ "reason": err.to_string() }),
                    actor,
                )?;
                tx.commit().context("failed to commit abandoned run events")?;
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };

        append_event(
            &tx,
            case_id,
            Some(run_id),
            AuditEventType::PolicyResolved,
            serde_json::json!({
                "policy_id": run.policy_id,
                "policy_version": run.policy_version,
                "selector_id": run.selector_id,
                "technique": run.technique,
                "rule_set_id": run.rule_set_id,
            }),
            actor,
        )?;
        append_event(
            &tx,
            case_id,
            Some(run_id),
            AuditEventType::FactsDerived,
            serde_json::json!({ "fact_count": run.facts.len() }),
            actor,
        )?;
        append_event(
            &tx,
            case_id,
            Some(run_id),
            AuditEventType::RulesEvaluated,
            serde_json::json!({
                "verdict_count": run.verdicts.len(),
                "fault_count": run.faults.len(),
            }),
            actor,
        )?;
        append_event(
            &tx,
            case_id,
            Some(run_id),
            AuditEventType::PackBuilt,
            serde_json::json!({
                "primary_count": run.pack.primary_count(),
                "item_count": run.pack.items.len(),
            }),
            actor,
        )?;

        insert_run(&tx, &run)?;

        append_event(
            &tx,
            case_id,
            Some(run_id),
            AuditEventType::RunPendingReview,
            serde_json::json!({ "requires_escalation": run.requires_escalation }),
            actor,
        )?;

        tx.commit().context("failed to commit run transaction")?;
        Ok(run)
    }

    /// Apply a reviewer decision to a run and record the matching audit event.
    ///
    /// # Errors
    /// Returns an error when the run is unknown, the decision guards reject
    /// the action, or persistence fails.
    pub fn record_decision(
        &mut self,
        run_id: RunId,
        action: DecisionAction,
        rationale: Option<&str>,
        actor: &str,
    ) -> Result<DecisionRun> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transaction")?;

        let run = load_run(&tx, run_id)?.ok_or_else(|| anyhow!("unknown run: {run_id}"))?;
        let now = OffsetDateTime::now_utc();
        let decided = run.record_decision(action, rationale, actor, now)?;

        tx.execute(
            "UPDATE decision_runs
             SET status = ?1, decided_at = ?2, decided_by = ?3, rationale = ?4, run_json = ?5
             WHERE run_id = ?6",
            params![
                decided.status.as_str(),
                decided.decided_at.map(rfc3339).transpose()?,
                decided.decided_by,
                decided.rationale,
                serde_json::to_string(&decided).context("failed to serialize decided run")?,
                run_id.to_string(),
            ],
        )
        .context("failed to update run decision")?;

        let event_type = match action {
            DecisionAction::Approve => AuditEventType::RunApproved,
            DecisionAction::Escalate => AuditEventType::RunEscalated,
            DecisionAction::Override => AuditEventType::RunOverridden,
        };
        append_event(
            &tx,
            decided.case_id,
            Some(run_id),
            event_type,
            serde_json::json!({
                "action": action.as_str(),
                "rationale": decided.rationale,
            }),
            actor,
        )?;

        tx.commit().context("failed to commit decision transaction")?;
        Ok(decided)
    }

    /// Retrieve one run by its identifier.
    ///
    /// # Errors
    /// Returns an error when lookup or JSON deserialization fails.
    pub fn get_run(&self, run_id: RunId) -> Result<Option<DecisionRun>> {
        load_run(&self.conn, run_id)
    }

    /// The most recent run for a case, if any.
    ///
    /// # Errors
    /// Returns an error when lookup or JSON deserialization fails.
    pub fn latest_run(&self, case_id: CaseId) -> Result<Option<DecisionRun>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT run_json FROM decision_runs
                 WHERE case_id = ?1
                 ORDER BY created_at DESC, run_id DESC
                 LIMIT 1",
                params![case_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to query latest run")?;
        json.map(|raw| {
            serde_json::from_str(&raw).context("failed to deserialize stored run")
        })
        .transpose()
    }

    /// The full append-only trail for one case in causal order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn audit_trail(&self, case_id: CaseId) -> Result<Vec<AuditEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id, case_id, run_id, event_type, payload_json, actor, recorded_at, predecessor
             FROM audit_events
             WHERE case_id = ?1
             ORDER BY id ASC",
        )?;

        let mut rows = stmt.query(params![case_id.to_string()])?;
        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            let event_id_raw: String = row.get(0)?;
            let case_id_raw: String = row.get(1)?;
            let run_id_raw: Option<String> = row.get(2)?;
            let event_type_raw: String = row.get(3)?;
            let payload_json: String = row.get(4)?;
            let recorded_at_raw: String = row.get(6)?;
            let predecessor_raw: Option<String> = row.get(7)?;

            events.push(AuditEvent {
                event_id: EventId(parse_ulid(&event_id_raw)?),
                case_id: CaseId(parse_ulid(&case_id_raw)?),
                run_id: run_id_raw.map(|raw| parse_ulid(&raw).map(RunId)).transpose()?,
                event_type: AuditEventType::parse(&event_type_raw)
                    .ok_or_else(|| anyhow!("unknown event_type: {event_type_raw}"))?,
                payload: serde_json::from_str(&payload_json)
                    .context("failed to deserialize audit payload")?,
                actor: row.get(5)?,
                recorded_at: parse_rfc3339(&recorded_at_raw)?,
                predecessor: predecessor_raw
                    .map(|raw| parse_ulid(&raw).map(EventId))
                    .transpose()?,
            });
        }

        Ok(events)
    }

    /// Case header plus link-state counts and the latest run header.
    ///
    /// # Errors
    /// Returns an error when the case is unknown or any read fails.
    pub fn case_summary(&self, case_id: CaseId) -> Result<CaseSummary> {
        let case = self
            .get_case(case_id)?
            .ok_or_else(|| anyhow!("unknown case: {case_id}"))?;

        let mut stmt = self.conn.prepare(
            "SELECT state, COUNT(*) FROM case_document_links WHERE case_id = ?1 GROUP BY state",
        )?;
        let mut rows = stmt.query(params![case_id.to_string()])?;
        let mut link_counts = BTreeMap::new();
        while let Some(row) = rows.next()? {
            link_counts.insert(row.get::<_, String>(0)?, row.get::<_, i64>(1)?);
        }

        let latest_run = self
            .conn
            .query_row(
                "SELECT run_id, status, requires_escalation, created_at
                 FROM decision_runs
                 WHERE case_id = ?1
                 ORDER BY created_at DESC, run_id DESC
                 LIMIT 1",
                params![case_id.to_string()],
                |row| {
                    Ok(RunHeader {
                        run_id: row.get(0)?,
                        status: row.get(1)?,
                        requires_escalation: row.get::<_, i64>(2)? == 1,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .context("failed to query latest run header")?;

        Ok(CaseSummary { case, link_counts, latest_run })
    }
}

impl EvidenceGateway for SqliteStore {
    fn find_confirmable_documents(
        &self,
        query: &DocumentQuery,
    ) -> Result<Vec<DocumentHit>, DecisionError> {
        confirmable_documents(&self.conn, query)
    }

    fn price_items(&self, document_id: DocumentId) -> Result<Vec<PriceItem>, DecisionError> {
        load_price_items(&self.conn, document_id).map_err(query_err)
    }

    fn clauses(&self, document_id: DocumentId) -> Result<Vec<Clause>, DecisionError> {
        load_clauses(&self.conn, document_id).map_err(query_err)
    }
}

fn query_err(err: impl std::fmt::Display) -> DecisionError {
    DecisionError::Query(err.to_string())
}

fn confirmable_documents(
    conn: &Connection,
    query: &DocumentQuery,
) -> Result<Vec<DocumentHit>, DecisionError> {
    let min_rank = query.min_readiness.map_or(0, ReadinessLevel::rank);
    let mut hits = Vec::new();

    if let Some(vendor_id) = &query.vendor_id {
        let documents = documents_by_vendor(conn, vendor_id)?;
        for document in documents {
            if document.readiness.rank() < min_rank {
                continue;
            }
            hits.push(DocumentHit {
                document,
                matched_via: DiscoveredVia::Relational,
                score: 1.0,
            });
        }
    }

    if let Some(po_reference) = &query.po_reference {
        let documents = documents_by_clause_reference(conn, po_reference)?;
        for document in documents {
            if document.readiness.rank() < min_rank {
                continue;
            }
            hits.push(DocumentHit {
                document,
                matched_via: DiscoveredVia::Relational,
                score: 1.0,
            });
        }
    }

    if let Some(embedding) = &query.query_embedding {
        for (document_id, score) in vector_scores(conn, embedding)? {
            let document = load_document(conn, document_id)?
                .ok_or_else(|| query_err(format!("chunk references unknown document {document_id}")))?;
            if document.readiness.rank() < min_rank {
                continue;
            }
            hits.push(DocumentHit { document, matched_via: DiscoveredVia::Vector, score });
        }
    }

    Ok(hits)
}

fn documents_by_vendor(conn: &Connection, vendor_id: &str) -> Result<Vec<DocumentRef>, DecisionError> {
    let mut stmt = conn
        .prepare(
            "SELECT document_id, doc_type, vendor_id, readiness, source_uri
             FROM documents WHERE vendor_id = ?1
             ORDER BY document_id ASC",
        )
        .map_err(query_err)?;
    collect_documents(&mut stmt, params![vendor_id])
}

fn documents_by_clause_reference(
    conn: &Connection,
    po_reference: &str,
) -> Result<Vec<DocumentRef>, DecisionError> {
    let pattern = format!("%{po_reference}%");
    let mut stmt = conn
        .prepare(
            "SELECT DISTINCT d.document_id, d.doc_type, d.vendor_id, d.readiness, d.source_uri
             FROM documents d
             JOIN clauses c ON c.document_id = d.document_id
             WHERE c.body LIKE ?1
             ORDER BY d.document_id ASC",
        )
        .map_err(query_err)?;
    collect_documents(&mut stmt, params![pattern])
}

fn collect_documents(
    stmt: &mut rusqlite::Statement<'_>,
    params: impl rusqlite::Params,
) -> Result<Vec<DocumentRef>, DecisionError> {
    let mut rows = stmt.query(params).map_err(query_err)?;
    let mut documents = Vec::new();
    while let Some(row) = rows.next().map_err(query_err)? {
        documents.push(document_from_row(row)?);
    }
    Ok(documents)
}

fn document_from_row(row: &rusqlite::Row<'_>) -> Result<DocumentRef, DecisionError> {
    let document_id_raw: String = row.get(0).map_err(query_err)?;
    let readiness_raw: String = row.get(3).map_err(query_err)?;
    Ok(DocumentRef {
        document_id: DocumentId(
            Ulid::from_string(&document_id_raw)
                .map_err(|_| query_err(format!("invalid ULID: {document_id_raw}")))?,
        ),
        doc_type: row.get(1).map_err(query_err)?,
        vendor_id: row.get(2).map_err(query_err)?,
        readiness: ReadinessLevel::parse(&readiness_raw)
            .ok_or_else(|| query_err(format!("unknown readiness: {readiness_raw}")))?,
        source_uri: row.get(4).map_err(query_err)?,
    })
}

fn load_document(
    conn: &Connection,
    document_id: DocumentId,
) -> Result<Option<DocumentRef>, DecisionError> {
    let mut stmt = conn
        .prepare(
            "SELECT document_id, doc_type, vendor_id, readiness, source_uri
             FROM documents WHERE document_id = ?1",
        )
        .map_err(query_err)?;
    let mut rows = stmt.query(params![document_id.to_string()]).map_err(query_err)?;
    match rows.next().map_err(query_err)? {
        Some(row) => Ok(Some(document_from_row(row)?)),
        None => Ok(None),
    }
}

/// Best cosine score per document across its chunks, document id ascending.
fn vector_scores(
    conn: &Connection,
    embedding: &[f32],
) -> Result<Vec<(DocumentId, f64)>, DecisionError> {
    let mut stmt = conn
        .prepare("SELECT document_id, embedding_json FROM document_chunks ORDER BY chunk_id ASC")
        .map_err(query_err)?;
    let mut rows = stmt.query([]).map_err(query_err)?;

    let mut best: BTreeMap<DocumentId, f64> = BTreeMap::new();
    while let Some(row) = rows.next().map_err(query_err)? {
        let document_id_raw: String = row.get(0).map_err(query_err)?;
        let embedding_json: String = row.get(1).map_err(query_err)?;
        let document_id = DocumentId(
            Ulid::from_string(&document_id_raw)
                .map_err(|_| query_err(format!("invalid ULID: {document_id_raw}")))?,
        );
        let stored: Vec<f32> = serde_json::from_str(&embedding_json)
            .map_err(|err| query_err(format!("invalid stored embedding: {err}")))?;
        let score = cosine_similarity(embedding, &stored);
        best.entry(document_id)
            .and_modify(|current| {
                if score > *current {
                    *current = score;
                }
            })
            .or_insert(score);
    }

    Ok(best.into_iter().collect())
}

fn load_case(conn: &Connection, case_id: CaseId) -> Result<Option<Case>> {
    let header = conn
        .query_row(
            "SELECT vendor_id, po_reference, currency, signals_json, created_at
             FROM cases WHERE case_id = ?1",
            params![case_id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()
        .context("failed to query case")?;

    let Some((vendor_id, po_reference, currency, signals_json, created_at_raw)) = header else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT item_id, description, quantity, unit_price
         FROM case_lines WHERE case_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![case_id.to_string()], |row| {
        Ok(CaseLine {
            item_id: row.get(0)?,
            description: row.get(1)?,
            quantity: row.get(2)?,
            unit_price: row.get(3)?,
        })
    })?;
    let mut lines = Vec::new();
    for row in rows {
        lines.push(row?);
    }

    Ok(Some(Case {
        case_id,
        vendor_id,
        po_reference,
        currency,
        lines,
        signals: serde_json::from_str(&signals_json)
            .context("failed to deserialize case signals")?,
        created_at: parse_rfc3339(&created_at_raw)?,
    }))
}

fn load_links(conn: &Connection, case_id: CaseId) -> Result<Vec<CaseDocumentLink>> {
    let mut stmt = conn.prepare(
        "SELECT link_id, document_id, state, discovered_via, match_score, actor,
                created_at, decided_at, decided_by
         FROM case_document_links
         WHERE case_id = ?1
         ORDER BY link_id ASC",
    )?;

    let mut rows = stmt.query(params![case_id.to_string()])?;
    let mut links = Vec::new();
    while let Some(row) = rows.next()? {
        links.push(link_from_row(case_id, row)?);
    }
    Ok(links)
}

fn load_link(conn: &Connection, link_id: LinkId) -> Result<Option<CaseDocumentLink>> {
    let mut stmt = conn.prepare(
        "SELECT link_id, document_id, state, discovered_via, match_score, actor,
                created_at, decided_at, decided_by, case_id
         FROM case_document_links
         WHERE link_id = ?1",
    )?;
    let mut rows = stmt.query(params![link_id.to_string()])?;
    match rows.next()? {
        Some(row) => {
            let case_id_raw: String = row.get(9)?;
            let case_id = CaseId(parse_ulid(&case_id_raw)?);
            Ok(Some(link_from_row(case_id, row)?))
        }
        None => Ok(None),
    }
}

fn link_from_row(case_id: CaseId, row: &rusqlite::Row<'_>) -> Result<CaseDocumentLink> {
    let link_id_raw: String = row.get(0)?;
    let document_id_raw: String = row.get(1)?;
    let state_raw: String = row.get(2)?;
    let via_raw: String = row.get(3)?;
    let created_at_raw: String = row.get(6)?;
    let decided_at_raw: Option<String> = row.get(7)?;

    Ok(CaseDocumentLink {
        link_id: LinkId(parse_ulid(&link_id_raw)?),
        case_id,
        document_id: DocumentId(parse_ulid(&document_id_raw)?),
        state: LinkState::parse(&state_raw)
            .ok_or_else(|| anyhow!("unknown link state: {state_raw}"))?,
        discovered_via: DiscoveredVia::parse(&via_raw)
            .ok_or_else(|| anyhow!("unknown discovery technique: {via_raw}"))?,
        match_score: row.get(4)?,
        actor: row.get(5)?,
        created_at: parse_rfc3339(&created_at_raw)?,
        decided_at: decided_at_raw.as_deref().map(parse_rfc3339).transpose()?,
        decided_by: row.get(8)?,
    })
}

fn insert_link(tx: &rusqlite::Transaction<'_>, link: &CaseDocumentLink) -> Result<()> {
    tx.execute(
        "INSERT INTO case_document_links(
            link_id, case_id, document_id, state, discovered_via, match_score,
            actor, created_at, decided_at, decided_by
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            link.link_id.to_string(),
            link.case_id.to_string(),
            link.document_id.to_string(),
            link.state.as_str(),
            link.discovered_via.as_str(),
            link.match_score,
            link.actor,
            rfc3339(link.created_at)?,
            link.decided_at.map(rfc3339).transpose()?,
            link.decided_by,
        ],
    )
    .context("failed to insert case-document link")?;
    Ok(())
}

fn load_price_items(conn: &Connection, document_id: DocumentId) -> Result<Vec<PriceItem>> {
    let mut stmt = conn.prepare(
        "SELECT price_item_id, fact_key, unit_price, currency, page_anchor, extraction_confidence
         FROM price_items
         WHERE document_id = ?1
         ORDER BY price_item_id ASC",
    )?;
    let mut rows = stmt.query(params![document_id.to_string()])?;
    let mut items = Vec::new();
    while let Some(row) = rows.next()? {
        let price_item_id_raw: String = row.get(0)?;
        items.push(PriceItem {
            price_item_id: PriceItemId(parse_ulid(&price_item_id_raw)?),
            document_id,
            fact_key: row.get(1)?,
            unit_price: row.get(2)?,
            currency: row.get(3)?,
            page_anchor: row.get(4)?,
            extraction_confidence: row.get(5)?,
        });
    }
    Ok(items)
}

fn load_clauses(conn: &Connection, document_id: DocumentId) -> Result<Vec<Clause>> {
    let mut stmt = conn.prepare(
        "SELECT clause_id, body, page_anchor, extraction_confidence
         FROM clauses
         WHERE document_id = ?1
         ORDER BY clause_id ASC",
    )?;
    let mut rows = stmt.query(params![document_id.to_string()])?;
    let mut clauses = Vec::new();
    while let Some(row) = rows.next()? {
        let clause_id_raw: String = row.get(0)?;
        clauses.push(Clause {
            clause_id: ClauseId(parse_ulid(&clause_id_raw)?),
            document_id,
            text: row.get(1)?,
            page_anchor: row.get(2)?,
            extraction_confidence: row.get(3)?,
        });
    }
    Ok(clauses)
}

fn load_active_policy(conn: &Connection) -> Result<Option<PolicyBundle>> {
    let json: Option<String> = conn
        .query_row(
            "SELECT bundle_json FROM policies WHERE active = 1 LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()
        .context("failed to query active policy")?;
    json.map(|raw| serde_json::from_str(&raw).context("failed to deserialize stored policy"))
        .transpose()
}

fn insert_run(tx: &rusqlite::Transaction<'_>, run: &DecisionRun) -> Result<()> {
    tx.execute(
        "INSERT INTO decision_runs(
            run_id, case_id, status, policy_id, policy_version, rule_set_id,
            input_hash, requires_escalation, created_at, created_by,
            decided_at, decided_by, rationale, run_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            run.run_id.to_string(),
            run.case_id.to_string(),
            run.status.as_str(),
            run.policy_id,
            run.policy_version,
            run.rule_set_id,
            run.input_hash,
            i64::from(run.requires_escalation),
            rfc3339(run.created_at)?,
            run.created_by,
            run.decided_at.map(rfc3339).transpose()?,
            run.decided_by,
            run.rationale,
            serde_json::to_string(run).context("failed to serialize run")?,
        ],
    )
    .context("failed to insert decision run")?;

    for fact in &run.facts {
        tx.execute(
            "INSERT INTO derived_facts(run_id, fact_key, value, unit, confidence, method, citations_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run.run_id.to_string(),
                fact.fact_key,
                fact.value,
                fact.unit,
                f64::from(fact.confidence),
                fact.method.as_str(),
                serde_json::to_string(&fact.citations)
                    .context("failed to serialize fact citations")?,
            ],
        )
        .context("failed to insert derived fact")?;
    }

    for verdict in &run.verdicts {
        tx.execute(
            "INSERT INTO rule_verdicts(
                run_id, rule_id, outcome, severity, cited_facts_json, cited_evidence_json, explanation
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run.run_id.to_string(),
                verdict.rule_id,
                verdict_outcome_str(verdict.outcome),
                verdict.severity.as_str(),
                serde_json::to_string(&verdict.cited_facts)
                    .context("failed to serialize cited facts")?,
                serde_json::to_string(&verdict.cited_evidence)
                    .context("failed to serialize cited evidence")?,
                verdict.explanation,
            ],
        )
        .context("failed to insert rule verdict")?;
    }

    Ok(())
}

fn verdict_outcome_str(outcome: decision_kernel_core::VerdictOutcome) -> &'static str {
    match outcome {
        decision_kernel_core::VerdictOutcome::Pass => "pass",
        decision_kernel_core::VerdictOutcome::Fail => "fail",
        decision_kernel_core::VerdictOutcome::Inconclusive => "inconclusive",
    }
}

fn load_run(conn: &Connection, run_id: RunId) -> Result<Option<DecisionRun>> {
    let json: Option<String> = conn
        .query_row(
            "SELECT run_json FROM decision_runs WHERE run_id = ?1",
            params![run_id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .context("failed to query run")?;
    json.map(|raw| serde_json::from_str(&raw).context("failed to deserialize stored run"))
        .transpose()
}

/// Append one audit event inside the caller's transaction. The predecessor is
/// the most recent event for the same case by insertion order, so the chain
/// survives clock skew between events written in the same millisecond.
fn append_event(
    tx: &rusqlite::Transaction<'_>,
    case_id: CaseId,
    run_id: Option<RunId>,
    event_type: AuditEventType,
    payload: serde_json::Value,
    actor: &str,
) -> Result<AuditEvent> {
    let predecessor_raw: Option<String> = tx
        .query_row(
            "SELECT event_id FROM audit_events WHERE case_id = ?1 ORDER BY id DESC LIMIT 1",
            params![case_id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .context("failed to query predecessor event")?;

    let event = AuditEvent {
        event_id: EventId::new(),
        case_id,
        run_id,
        event_type,
        payload,
        actor: actor.to_string(),
        recorded_at: OffsetDateTime::now_utc(),
        predecessor: predecessor_raw
            .map(|raw| parse_ulid(&raw).map(EventId))
            .transpose()?,
    };
    event.validate().map_err(|err| anyhow!("audit event validation failed: {err}"))?;

    tx.execute(
        "INSERT INTO audit_events(
            event_id, case_id, run_id, event_type, payload_json, actor, recorded_at, predecessor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            event.event_id.to_string(),
            event.case_id.to_string(),
            event.run_id.map(|id| id.to_string()),
            event.event_type.as_str(),
            serde_json::to_string(&event.payload).context("failed to serialize audit payload")?,
            event.actor,
            rfc3339(event.recorded_at)?,
            event.predecessor.map(|id| id.to_string()),
        ],
    )
    .context("failed to append audit event")?;

    Ok(event)
}

/// SHA-256 over the canonical JSON of everything a run reads: the case, the
/// frozen evidence snapshot, and the policy identity. Equal hashes mean a
/// byte-for-byte reproducible run.
fn snapshot_hash(case: &Case, snapshot: &EvidenceSnapshot, bundle: &PolicyBundle) -> Result<String> {
    let canonical = serde_json::to_vec(&serde_json::json!({
        "case": case,
        "snapshot": snapshot,
        "policy_id": bundle.meta.policy_id,
        "policy_version": bundle.meta.version,
    }))
    .context("failed to serialize run inputs for hashing")?;

    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(format!("{:x}", hasher.finalize()))
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )
    .context("failed to read current schema version")
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, rfc3339(OffsetDateTime::now_utc())?],
    )
    .context("failed to record schema version")?;
    Ok(())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_ulid(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use decision_kernel_core::{
        CaseSignals, PolicyMeta, PolicySelector, PredicateOp, RuleSet, RuleSpec, Severity,
        SignalPredicate, SignalValue, VerdictOutcome,
    };
    use serde_json::json;

    fn open_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn mk_case() -> Case {
        let mut signals = CaseSignals::new();
        signals.insert("category".to_string(), SignalValue::Text("MRO".to_string()));
        Case {
            case_id: CaseId::new(),
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
            created_at: OffsetDateTime::now_utc(),
        }
    }

    fn mk_document(vendor_id: &str, readiness: ReadinessLevel) -> DocumentRef {
        DocumentRef {
            document_id: DocumentId::new(),
            doc_type: "contract".to_string(),
            vendor_id: Some(vendor_id.to_string()),
            readiness,
            source_uri: "file:///contracts/v-001.pdf".to_string(),
        }
    }

    fn mk_price_item(document_id: DocumentId, fact_key: &str, unit_price: f64) -> PriceItem {
        PriceItem {
            price_item_id: PriceItemId::new(),
            document_id,
            fact_key: fact_key.to_string(),
            unit_price,
            currency: "THB".to_string(),
            page_anchor: Some(3),
            extraction_confidence: 0.9,
        }
    }

    fn mk_bundle() -> PolicyBundle {
        PolicyBundle {
            meta: PolicyMeta {
                policy_id: "procurement-default".to_string(),
                version: "2024.1".to_string(),
                description: None,
            },
            selectors: vec![PolicySelector {
                selector_id: "mro".to_string(),
                priority: 1,
                when: vec![SignalPredicate {
                    signal: "category".to_string(),
                    op: PredicateOp::Eq,
                    value: SignalValue::Text("MRO".to_string()),
                }],
                technique: "CONTRACT_BASELINE".to_string(),
                rule_set: "rs-price".to_string(),
            }],
            rule_sets: vec![RuleSet {
                rule_set_id: "rs-price".to_string(),
                version: "1".to_string(),
                rules: vec![RuleSpec {
                    rule_id: "PRICE-01".to_string(),
                    severity: Severity::High,
                    min_confidence: 0.4,
                    evidence_class: decision_kernel_core::EvidenceTag::Primary,
                    logic: json!({"compare": {"fact": "unit_price_benchmark", "op": "lte", "value": 150.0}}),
                    description: None,
                }],
            }],
        }
    }

    fn seed_confirmed_case(store: &mut SqliteStore) -> Result<(CaseId, DocumentId)> {
        let case = mk_case();
        store.insert_case(&case)?;

        let document = mk_document("V-001", ReadinessLevel::L5);
        store.insert_document(&document)?;
        for price in [118.0, 120.0, 124.0] {
            store.insert_price_item(&mk_price_item(
                document.document_id,
                "unit_price_benchmark",
                price,
            ))?;
        }

        store.store_policy(&mk_bundle(), true)?;

        let proposed =
            store.discover_links(case.case_id, &LinkerConfig::default(), None, "system")?;
        assert_eq!(proposed.len(), 1);
        store.confirm_link(proposed[0].link_id, "reviewer-1")?;

        Ok((case.case_id, document.document_id))
    }

    #[test]
    fn schema_checks_reject_invalid_enums() -> Result<()> {
        let store = open_store()?;
        let result = store.conn.execute(
            "INSERT INTO documents(document_id, doc_type, vendor_id, readiness, source_uri)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![DocumentId::new().to_string(), "contract", "V-001", "l9", "file:///x.pdf"],
        );
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn case_round_trips_with_lines_and_signals() -> Result<()> {
        let mut store = open_store()?;
        let case = mk_case();
        store.insert_case(&case)?;

        let loaded = store.get_case(case.case_id)?.ok_or_else(|| anyhow!("case missing"))?;
        assert_eq!(loaded.vendor_id, case.vendor_id);
        assert_eq!(loaded.lines.len(), 1);
        assert_eq!(loaded.signals, case.signals);
        Ok(())
    }

    #[test]
    fn discovery_is_idempotent_and_audited() -> Result<()> {
        let mut store = open_store()?;
        let case = mk_case();
        store.insert_case(&case)?;
        store.insert_document(&mk_document("V-001", ReadinessLevel::L5))?;
        store.insert_document(&mk_document("V-999", ReadinessLevel::L5))?;
        store.insert_document(&mk_document("V-001", ReadinessLevel::L2))?;

        let first = store.discover_links(case.case_id, &LinkerConfig::default(), None, "system")?;
        assert_eq!(first.len(), 1, "only the readiness-qualified vendor match links");
        assert_eq!(first[0].state, LinkState::Inferred);

        let second =
            store.discover_links(case.case_id, &LinkerConfig::default(), None, "system")?;
        assert!(second.is_empty(), "re-running discovery proposes nothing new");

        let trail = store.audit_trail(case.case_id)?;
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].event_type, AuditEventType::LinkInferred);
        Ok(())
    }

    #[test]
    fn discovery_from_a_second_handle_proposes_nothing_new() -> Result<()> {
        let db_path =
            std::env::temp_dir().join(format!("decisionkernel-store-{}.sqlite3", Ulid::new()));
        let mut first = SqliteStore::open(&db_path)?;
        first.migrate()?;
        let mut second = SqliteStore::open(&db_path)?;
        second.migrate()?;

        let case = mk_case();
        first.insert_case(&case)?;
        first.insert_document(&mk_document("V-001", ReadinessLevel::L5))?;

        let proposed =
            first.discover_links(case.case_id, &LinkerConfig::default(), None, "system")?;
        assert_eq!(proposed.len(), 1);

        let repeat =
            second.discover_links(case.case_id, &LinkerConfig::default(), None, "system")?;
        assert!(repeat.is_empty(), "the second handle sees the committed link");
        assert_eq!(first.links_for_case(case.case_id)?.len(), 1);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn extraction_confidence_round_trips_without_precision_loss() -> Result<()> {
        let mut store = open_store()?;
        let document = mk_document("V-001", ReadinessLevel::L5);
        store.insert_document(&document)?;

        let mut item = mk_price_item(document.document_id, "unit_price_benchmark", 118.0);
        item.extraction_confidence = 0.73;
        store.insert_price_item(&item)?;
        store.insert_clause(&Clause {
            clause_id: ClauseId::new(),
            document_id: document.document_id,
            text: "Pricing fixed per PO-2024-0042 appendix B.".to_string(),
            page_anchor: Some(12),
            extraction_confidence: 0.61,
        })?;

        let items = store.price_items(document.document_id)?;
        assert_eq!(items[0].extraction_confidence, 0.73);
        let clauses = store.clauses(document.document_id)?;
        assert_eq!(clauses[0].extraction_confidence, 0.61);
        Ok(())
    }

    #[test]
    fn vector_discovery_respects_threshold() -> Result<()> {
        let mut store = open_store()?;
        let case = mk_case();
        store.insert_case(&case)?;

        let near = mk_document("V-XXX", ReadinessLevel::L5);
        let far = mk_document("V-YYY", ReadinessLevel::L5);
        store.insert_document(&near)?;
        store.insert_document(&far)?;
        store.insert_chunk(ChunkId::new(), near.document_id, &[1.0, 0.0, 0.0])?;
        store.insert_chunk(ChunkId::new(), far.document_id, &[0.0, 1.0, 0.0])?;

        let proposed = store.discover_links(
            case.case_id,
            &LinkerConfig::default(),
            Some(&[0.99, 0.05, 0.0]),
            "system",
        )?;

        assert_eq!(proposed.len(), 1);
        assert_eq!(proposed[0].document_id, near.document_id);
        assert_eq!(proposed[0].discovered_via, DiscoveredVia::Vector);
        Ok(())
    }

    #[test]
    fn confirmed_links_cannot_transition_again() -> Result<()> {
        let mut store = open_store()?;
        let case = mk_case();
        store.insert_case(&case)?;
        store.insert_document(&mk_document("V-001", ReadinessLevel::L5))?;

        let proposed =
            store.discover_links(case.case_id, &LinkerConfig::default(), None, "system")?;
        let confirmed = store.confirm_link(proposed[0].link_id, "reviewer-1")?;
        assert_eq!(confirmed.state, LinkState::Confirmed);

        let again = store.remove_link(proposed[0].link_id, "reviewer-1");
        assert!(again.is_err());
        Ok(())
    }

    #[test]
    fn full_run_persists_facts_verdicts_and_trail() -> Result<()> {
        let mut store = open_store()?;
        let (case_id, _) = seed_confirmed_case(&mut store)?;

        let run = store.start_run(case_id, "reviewer-1")?;
        assert_eq!(run.status, RunStatus::PendingReview);
        assert_eq!(run.verdicts[0].outcome, VerdictOutcome::Pass);
        assert!(!run.input_hash.is_empty());

        let loaded = store.get_run(run.run_id)?.ok_or_else(|| anyhow!("run missing"))?;
        assert_eq!(loaded, run);

        let trail = store.audit_trail(case_id)?;
        let types: Vec<AuditEventType> = trail.iter().map(|event| event.event_type).collect();
        assert_eq!(
            types,
            vec![
                AuditEventType::LinkInferred,
                AuditEventType::LinkConfirmed,
                AuditEventType::RunStarted,
                AuditEventType::PolicyResolved,
                AuditEventType::FactsDerived,
                AuditEventType::RulesEvaluated,
                AuditEventType::PackBuilt,
                AuditEventType::RunPendingReview,
            ]
        );

        // Causal chain: one head, each event points at its predecessor.
        assert_eq!(trail[0].predecessor, None);
        for pair in trail.windows(2) {
            assert_eq!(pair[1].predecessor, Some(pair[0].event_id));
        }
        Ok(())
    }

    #[test]
    fn second_run_is_blocked_while_one_is_pending() -> Result<()> {
        let mut store = open_store()?;
        let (case_id, _) = seed_confirmed_case(&mut store)?;

        let run = store.start_run(case_id, "reviewer-1")?;
        let blocked = store.start_run(case_id, "reviewer-2");
        let err = match blocked {
            Ok(_) => panic!("second run should be blocked"),
            Err(err) => err,
        };
        assert!(matches!(
            err.downcast_ref::<DecisionError>(),
            Some(DecisionError::RunAlreadyActive(_))
        ));

        store.record_decision(run.run_id, DecisionAction::Approve, None, "reviewer-1")?;
        let next = store.start_run(case_id, "reviewer-2")?;
        assert_eq!(next.status, RunStatus::PendingReview);
        Ok(())
    }

    #[test]
    fn abandoned_run_leaves_only_audit_events() -> Result<()> {
        let mut store = open_store()?;
        let case = mk_case();
        store.insert_case(&case)?;
        store.store_policy(&mk_bundle(), true)?;

        // Inferred link only: no confirmed evidence, so the run must abandon.
        store.insert_document(&mk_document("V-001", ReadinessLevel::L5))?;
        store.discover_links(case.case_id, &LinkerConfig::default(), None, "system")?;

        let result = store.start_run(case.case_id, "reviewer-1");
        let err = match result {
            Ok(_) => panic!("run without confirmed links should abandon"),
            Err(err) => err,
        };
        assert!(matches!(
            err.downcast_ref::<DecisionError>(),
            Some(DecisionError::InsufficientEvidence(_))
        ));

        assert!(store.latest_run(case.case_id)?.is_none(), "no run row persists");
        let trail = store.audit_trail(case.case_id)?;
        let types: Vec<AuditEventType> = trail.iter().map(|event| event.event_type).collect();
        assert_eq!(
            types,
            vec![
                AuditEventType::LinkInferred,
                AuditEventType::RunStarted,
                AuditEventType::RunAbandoned,
            ]
        );
        Ok(())
    }

    #[test]
    fn decisions_update_the_run_and_append_events() -> Result<()> {
        let mut store = open_store()?;
        let (case_id, _) = seed_confirmed_case(&mut store)?;
        let run = store.start_run(case_id, "reviewer-1")?;

        let missing_rationale =
            store.record_decision(run.run_id, DecisionAction::Override, None, "reviewer-1");
        assert!(missing_rationale.is_err());

        let decided = store.record_decision(
            run.run_id,
            DecisionAction::Override,
            Some("vendor holds a signed exception"),
            "reviewer-1",
        )?;
        assert_eq!(decided.status, RunStatus::Overridden);

        let trail = store.audit_trail(case_id)?;
        let last = trail.last().ok_or_else(|| anyhow!("trail is empty"))?;
        assert_eq!(last.event_type, AuditEventType::RunOverridden);
        assert_eq!(last.run_id, Some(run.run_id));
        Ok(())
    }

    #[test]
    fn identical_snapshots_hash_identically() -> Result<()> {
        let mut store = open_store()?;
        let (case_id, _) = seed_confirmed_case(&mut store)?;

        let first = store.start_run(case_id, "reviewer-1")?;
        store.record_decision(first.run_id, DecisionAction::Approve, None, "reviewer-1")?;
        let second = store.start_run(case_id, "reviewer-1")?;

        assert_eq!(first.input_hash, second.input_hash);
        assert_eq!(first.facts, second.facts);
        Ok(())
    }

    #[test]
    fn case_summary_reports_links_and_latest_run() -> Result<()> {
        let mut store = open_store()?;
        let (case_id, _) = seed_confirmed_case(&mut store)?;
        let run = store.start_run(case_id, "reviewer-1")?;

        let summary = store.case_summary(case_id)?;
        assert_eq!(summary.link_counts.get("confirmed"), Some(&1));
        let header = summary.latest_run.ok_or_else(|| anyhow!("latest run missing"))?;
        assert_eq!(header.run_id, run.run_id.to_string());
        assert_eq!(header.status, "pending_review");
        Ok(())
    }
}
