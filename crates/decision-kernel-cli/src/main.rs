use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use decision_kernel_api::{
    AddDocumentRequest, ClauseInput, CreateCaseRequest, DecisionKernelApi, DiscoverLinksRequest,
    PriceItemInput, RecordDecisionRequest,
};
use decision_kernel_core::{
    CaseId, CaseLine, CaseSignals, DecisionAction, LinkId, ReadinessLevel, RunId, SignalValue,
};
use serde::Deserialize;
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "dk")]
#[command(about = "Decision Kernel CLI")]
struct Cli {
    #[arg(long, default_value = "./decision_kernel.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Case {
        #[command(subcommand)]
        command: Box<CaseCommand>,
    },
    Document {
        #[command(subcommand)]
        command: Box<DocumentCommand>,
    },
    Policy {
        #[command(subcommand)]
        command: Box<PolicyCommand>,
    },
    Link {
        #[command(subcommand)]
        command: Box<LinkCommand>,
    },
    Run {
        #[command(subcommand)]
        command: Box<RunCommand>,
    },
    Audit {
        #[command(subcommand)]
        command: Box<AuditCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum CaseCommand {
    Create(CaseCreateArgs),
    Show(CaseRefArgs),
    Summary(CaseRefArgs),
}

#[derive(Debug, Args)]
struct CaseCreateArgs {
    #[arg(long)]
    vendor_id: String,
    #[arg(long)]
    po_reference: String,
    #[arg(long)]
    currency: String,
    /// Case signals as `name=value` pairs; numeric values become numbers.
    #[arg(long = "signal")]
    signals: Vec<String>,
    /// JSON file holding an array of case lines.
    #[arg(long)]
    lines_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct CaseRefArgs {
    #[arg(long)]
    case_id: String,
}

#[derive(Debug, Subcommand)]
enum DocumentCommand {
    Add(DocumentAddArgs),
}

#[derive(Debug, Args)]
struct DocumentAddArgs {
    #[arg(long)]
    doc_type: String,
    #[arg(long)]
    vendor_id: Option<String>,
    #[arg(long, value_enum)]
    readiness: ReadinessArg,
    #[arg(long)]
    source_uri: String,
    /// JSON file holding the extracted rows: price items, clauses, and
    /// chunk embeddings.
    #[arg(long)]
    extract_file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum PolicyCommand {
    Load(PolicyLoadArgs),
    Show,
}

#[derive(Debug, Args)]
struct PolicyLoadArgs {
    #[arg(long)]
    file: PathBuf,
    #[arg(long, default_value_t = true)]
    activate: bool,
}

#[derive(Debug, Subcommand)]
enum LinkCommand {
    Discover(LinkDiscoverArgs),
    Confirm(LinkRefArgs),
    Remove(LinkRefArgs),
    List(CaseRefArgs),
}

#[derive(Debug, Args)]
struct LinkDiscoverArgs {
    #[arg(long)]
    case_id: String,
    #[arg(long)]
    vector_threshold: Option<f64>,
    #[arg(long, value_enum)]
    min_readiness: Option<ReadinessArg>,
    #[arg(long)]
    actor: String,
}

#[derive(Debug, Args)]
struct LinkRefArgs {
    #[arg(long)]
    link_id: String,
    #[arg(long)]
    actor: String,
}

#[derive(Debug, Subcommand)]
enum RunCommand {
    Start(RunStartArgs),
    Show(RunRefArgs),
    Latest(CaseRefArgs),
    Pack(CaseRefArgs),
    Decide(RunDecideArgs),
}

#[derive(Debug, Args)]
struct RunStartArgs {
    #[arg(long)]
    case_id: String,
    #[arg(long)]
    actor: String,
}

#[derive(Debug, Args)]
struct RunRefArgs {
    #[arg(long)]
    run_id: String,
}

#[derive(Debug, Args)]
struct RunDecideArgs {
    #[arg(long)]
    run_id: String,
    #[arg(long, value_enum)]
    action: ActionArg,
    #[arg(long)]
    rationale: Option<String>,
    #[arg(long)]
    actor: String,
}

#[derive(Debug, Subcommand)]
enum AuditCommand {
    Trail(CaseRefArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ReadinessArg {
    L0,
    L1,
    L2,
    L3,
    L4,
    L5,
    L6,
}

impl From<ReadinessArg> for ReadinessLevel {
    fn from(arg: ReadinessArg) -> Self {
        match arg {
            ReadinessArg::L0 => Self::L0,
            ReadinessArg::L1 => Self::L1,
            ReadinessArg::L2 => Self::L2,
            ReadinessArg::L3 => Self::L3,
            ReadinessArg::L4 => Self::L4,
            ReadinessArg::L5 => Self::L5,
            ReadinessArg::L6 => Self::L6,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ActionArg {
    Approve,
    Escalate,
    Override,
}

impl From<ActionArg> for DecisionAction {
    fn from(arg: ActionArg) -> Self {
        match arg {
            ActionArg::Approve => Self::Approve,
            ActionArg::Escalate => Self::Escalate,
            ActionArg::Override => Self::Override,
        }
    }
}

/// Extracted rows delivered alongside a document registration.
#[derive(Debug, Default, Deserialize)]
struct ExtractFile {
    #[serde(default)]
    price_items: Vec<PriceItemInput>,
    #[serde(default)]
    clauses: Vec<ClauseInput>,
    #[serde(default)]
    chunk_embeddings: Vec<Vec<f32>>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn parse_case_id(raw: &str) -> Result<CaseId> {
    CaseId::from_str(raw).map_err(|_| anyhow!("invalid case id: {raw}"))
}

fn parse_link_id(raw: &str) -> Result<LinkId> {
    LinkId::from_str(raw).map_err(|_| anyhow!("invalid link id: {raw}"))
}

fn parse_run_id(raw: &str) -> Result<RunId> {
    RunId::from_str(raw).map_err(|_| anyhow!("invalid run id: {raw}"))
}

fn parse_signals(pairs: &[String]) -> Result<CaseSignals> {
    let mut signals = CaseSignals::new();
    for pair in pairs {
        let Some((name, value)) = pair.split_once('=') else {
            return Err(anyhow!("signal must be name=value, got: {pair}"));
        };
        let value = value
            .parse::<f64>()
            .map_or_else(|_| SignalValue::Text(value.to_string()), SignalValue::Number);
        signals.insert(name.to_string(), value);
    }
    Ok(signals)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let api = DecisionKernelApi::new(cli.db);
    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Case { command } => run_case(*command, &api),
        Command::Document { command } => run_document(*command, &api),
        Command::Policy { command } => run_policy(*command, &api),
        Command::Link { command } => run_link(*command, &api),
        Command::Run { command } => run_run(*command, &api),
        Command::Audit { command } => run_audit(*command, &api),
    }
}

fn run_db(command: DbCommand, api: &DecisionKernelApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
        }
    }
}

fn run_case(command: CaseCommand, api: &DecisionKernelApi) -> Result<()> {
    match command {
        CaseCommand::Create(args) => {
            let lines: Vec<CaseLine> = match &args.lines_file {
                Some(path) => {
                    let raw = fs::read_to_string(path).with_context(|| {
                        format!("failed to read lines file {}", path.display())
                    })?;
                    serde_json::from_str(&raw).context("failed to parse case lines JSON")?
                }
                None => Vec::new(),
            };
            let case = api.create_case(CreateCaseRequest {
                case_id: None,
                vendor_id: args.vendor_id,
                po_reference: args.po_reference,
                currency: args.currency,
                lines,
                signals: parse_signals(&args.signals)?,
                created_at: None,
            })?;
            emit_json(serde_json::to_value(&case).context("failed to serialize case")?)
        }
        CaseCommand::Show(args) => {
            let case = api.get_case(parse_case_id(&args.case_id)?)?;
            emit_json(serde_json::to_value(&case).context("failed to serialize case")?)
        }
        CaseCommand::Summary(args) => {
            let summary = api.case_summary(parse_case_id(&args.case_id)?)?;
            emit_json(serde_json::to_value(&summary).context("failed to serialize summary")?)
        }
    }
}

fn run_document(command: DocumentCommand, api: &DecisionKernelApi) -> Result<()> {
    match command {
        DocumentCommand::Add(args) => {
            let extract: ExtractFile = match &args.extract_file {
                Some(path) => {
                    let raw = fs::read_to_string(path).with_context(|| {
                        format!("failed to read extract file {}", path.display())
                    })?;
                    serde_json::from_str(&raw).context("failed to parse extract JSON")?
                }
                None => ExtractFile::default(),
            };
            let document = api.add_document(AddDocumentRequest {
                document_id: None,
                doc_type: args.doc_type,
                vendor_id: args.vendor_id,
                readiness: args.readiness.into(),
                source_uri: args.source_uri,
                price_items: extract.price_items,
                clauses: extract.clauses,
                chunk_embeddings: extract.chunk_embeddings,
            })?;
            emit_json(serde_json::to_value(&document).context("failed to serialize document")?)
        }
    }
}

fn run_policy(command: PolicyCommand, api: &DecisionKernelApi) -> Result<()> {
    match command {
        PolicyCommand::Load(args) => {
            let yaml = fs::read_to_string(&args.file)
                .with_context(|| format!("failed to read policy file {}", args.file.display()))?;
            let bundle = api.load_policy(&yaml, args.activate)?;
            emit_json(serde_json::json!({
                "policy_id": bundle.meta.policy_id,
                "version": bundle.meta.version,
                "selectors": bundle.selectors.len(),
                "rule_sets": bundle.rule_sets.len(),
                "activated": args.activate,
            }))
        }
        PolicyCommand::Show => {
            let bundle = api.active_policy()?;
            emit_json(serde_json::to_value(&bundle).context("failed to serialize policy")?)
        }
    }
}

fn run_link(command: LinkCommand, api: &DecisionKernelApi) -> Result<()> {
    match command {
        LinkCommand::Discover(args) => {
            let links = api.discover_links(DiscoverLinksRequest {
                case_id: parse_case_id(&args.case_id)?,
                vector_threshold: args.vector_threshold,
                min_readiness: args.min_readiness.map(ReadinessLevel::from),
                query_embedding: None,
                actor: args.actor,
            })?;
            let count = links.len();
            emit_json(serde_json::json!({
                "proposed": links,
                "count": count,
            }))
        }
        LinkCommand::Confirm(args) => {
            let link = api.confirm_link(parse_link_id(&args.link_id)?, &args.actor)?;
            emit_json(serde_json::to_value(&link).context("failed to serialize link")?)
        }
        LinkCommand::Remove(args) => {
            let link = api.remove_link(parse_link_id(&args.link_id)?, &args.actor)?;
            emit_json(serde_json::to_value(&link).context("failed to serialize link")?)
        }
        LinkCommand::List(args) => {
            let links = api.list_links(parse_case_id(&args.case_id)?)?;
            let count = links.len();
            emit_json(serde_json::json!({
                "links": links,
                "count": count,
            }))
        }
    }
}

fn run_run(command: RunCommand, api: &DecisionKernelApi) -> Result<()> {
    match command {
        RunCommand::Start(args) => {
            let run = api.start_run(parse_case_id(&args.case_id)?, &args.actor)?;
            emit_json(serde_json::to_value(&run).context("failed to serialize run")?)
        }
        RunCommand::Show(args) => {
            let run = api.get_run(parse_run_id(&args.run_id)?)?;
            emit_json(serde_json::to_value(&run).context("failed to serialize run")?)
        }
        RunCommand::Latest(args) => {
            let run = api.latest_run(parse_case_id(&args.case_id)?)?;
            emit_json(serde_json::to_value(&run).context("failed to serialize run")?)
        }
        RunCommand::Pack(args) => {
            let pack = api.evidence_pack(parse_case_id(&args.case_id)?)?;
            emit_json(serde_json::to_value(&pack).context("failed to serialize pack")?)
        }
        RunCommand::Decide(args) => {
            let run = api.record_decision(RecordDecisionRequest {
                run_id: parse_run_id(&args.run_id)?,
                action: args.action.into(),
                rationale: args.rationale,
                actor: args.actor,
            })?;
            emit_json(serde_json::to_value(&run).context("failed to serialize run")?)
        }
    }
}

fn run_audit(command: AuditCommand, api: &DecisionKernelApi) -> Result<()> {
    match command {
        AuditCommand::Trail(args) => {
            let events = api.audit_trail(parse_case_id(&args.case_id)?)?;
            let count = events.len();
            emit_json(serde_json::json!({
                "events": events,
                "count": count,
            }))
        }
    }
}
