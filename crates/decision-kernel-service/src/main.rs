use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use decision_kernel_api::{
    AddDocumentRequest, CreateCaseRequest, DecisionKernelApi, DiscoverLinksRequest,
    RecordDecisionRequest, API_CONTRACT_VERSION,
};
use decision_kernel_core::{CaseId, LinkId, RunId};
use serde::{Deserialize, Serialize};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: DecisionKernelApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct LoadPolicyRequest {
    yaml: String,
    #[serde(default = "default_activate")]
    activate: bool,
}

fn default_activate() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
struct LinkActionRequest {
    link_id: String,
    actor: String,
}

#[derive(Debug, Clone, Deserialize)]
struct StartRunRequest {
    case_id: String,
    actor: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "decision-kernel-service")]
#[command(about = "Local HTTP service for Decision Kernel")]
struct Args {
    #[arg(long, default_value = "./decision_kernel.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = StatusCode::BAD_REQUEST;
        (status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(message: impl Into<String>) -> ServiceError {
        ServiceError { service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn parse_case_id(raw: &str) -> Result<CaseId, ServiceError> {
    CaseId::from_str(raw).map_err(|_| ServiceState::error(format!("invalid case id: {raw}")))
}

fn parse_link_id(raw: &str) -> Result<LinkId, ServiceError> {
    LinkId::from_str(raw).map_err(|_| ServiceState::error(format!("invalid link id: {raw}")))
}

fn parse_run_id(raw: &str) -> Result<RunId, ServiceError> {
    RunId::from_str(raw).map_err(|_| ServiceState::error(format!("invalid run id: {raw}")))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/case", post(case_create))
        .route("/v1/case/:case_id", get(case_show))
        .route("/v1/case/:case_id/summary", get(case_summary))
        .route("/v1/case/:case_id/links", get(link_list))
        .route("/v1/case/:case_id/audit", get(audit_trail))
        .route("/v1/case/:case_id/runs/latest", get(run_latest))
        .route("/v1/case/:case_id/pack", get(run_pack))
        .route("/v1/document", post(document_add))
        .route("/v1/policy", post(policy_load))
        .route("/v1/policy/active", get(policy_active))
        .route("/v1/link/discover", post(link_discover))
        .route("/v1/link/confirm", post(link_confirm))
        .route("/v1/link/remove", post(link_remove))
        .route("/v1/run/start", post(run_start))
        .route("/v1/run/decide", post(run_decide))
        .route("/v1/run/:run_id", get(run_show))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let state = ServiceState { api: DecisionKernelApi::new(args.db) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<decision_kernel_store_sqlite::SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<decision_kernel_api::MigrateResult>>, ServiceError> {
    let result =
        state.api.migrate(request.dry_run).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(result)))
}

async fn case_create(
    State(state): State<ServiceState>,
    Json(request): Json<CreateCaseRequest>,
) -> Result<Json<ServiceEnvelope<decision_kernel_core::Case>>, ServiceError> {
    let case =
        state.api.create_case(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(case)))
}

async fn case_show(
    State(state): State<ServiceState>,
    Path(case_id): Path<String>,
) -> Result<Json<ServiceEnvelope<decision_kernel_core::Case>>, ServiceError> {
    let case = state
        .api
        .get_case(parse_case_id(&case_id)?)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(case)))
}

async fn case_summary(
    State(state): State<ServiceState>,
    Path(case_id): Path<String>,
) -> Result<Json<ServiceEnvelope<decision_kernel_store_sqlite::CaseSummary>>, ServiceError> {
    let summary = state
        .api
        .case_summary(parse_case_id(&case_id)?)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(summary)))
}

async fn document_add(
    State(state): State<ServiceState>,
    Json(request): Json<AddDocumentRequest>,
) -> Result<Json<ServiceEnvelope<decision_kernel_core::DocumentRef>>, ServiceError> {
    let document =
        state.api.add_document(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(document)))
}

async fn policy_load(
    State(state): State<ServiceState>,
    Json(request): Json<LoadPolicyRequest>,
) -> Result<Json<ServiceEnvelope<decision_kernel_core::PolicyBundle>>, ServiceError> {
    let bundle = state
        .api
        .load_policy(&request.yaml, request.activate)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(bundle)))
}

async fn policy_active(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<decision_kernel_core::PolicyBundle>>, ServiceError> {
    let bundle = state.api.active_policy().map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(bundle)))
}

async fn link_discover(
    State(state): State<ServiceState>,
    Json(request): Json<DiscoverLinksRequest>,
) -> Result<Json<ServiceEnvelope<Vec<decision_kernel_core::CaseDocumentLink>>>, ServiceError> {
    let links =
        state.api.discover_links(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(links)))
}

async fn link_confirm(
    State(state): State<ServiceState>,
    Json(request): Json<LinkActionRequest>,
) -> Result<Json<ServiceEnvelope<decision_kernel_core::CaseDocumentLink>>, ServiceError> {
    let link = state
        .api
        .confirm_link(parse_link_id(&request.link_id)?, &request.actor)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(link)))
}

async fn link_remove(
    State(state): State<ServiceState>,
    Json(request): Json<LinkActionRequest>,
) -> Result<Json<ServiceEnvelope<decision_kernel_core::CaseDocumentLink>>, ServiceError> {
    let link = state
        .api
        .remove_link(parse_link_id(&request.link_id)?, &request.actor)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(link)))
}

async fn link_list(
    State(state): State<ServiceState>,
    Path(case_id): Path<String>,
) -> Result<Json<ServiceEnvelope<Vec<decision_kernel_core::CaseDocumentLink>>>, ServiceError> {
    let links = state
        .api
        .list_links(parse_case_id(&case_id)?)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(links)))
}

async fn run_start(
    State(state): State<ServiceState>,
    Json(request): Json<StartRunRequest>,
) -> Result<Json<ServiceEnvelope<decision_kernel_core::DecisionRun>>, ServiceError> {
    let run = state
        .api
        .start_run(parse_case_id(&request.case_id)?, &request.actor)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(run)))
}

async fn run_decide(
    State(state): State<ServiceState>,
    Json(request): Json<RecordDecisionRequest>,
) -> Result<Json<ServiceEnvelope<decision_kernel_core::DecisionRun>>, ServiceError> {
    let run =
        state.api.record_decision(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(run)))
}

async fn run_show(
    State(state): State<ServiceState>,
    Path(run_id): Path<String>,
) -> Result<Json<ServiceEnvelope<decision_kernel_core::DecisionRun>>, ServiceError> {
    let run = state
        .api
        .get_run(parse_run_id(&run_id)?)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(run)))
}

async fn audit_trail(
    State(state): State<ServiceState>,
    Path(case_id): Path<String>,
) -> Result<Json<ServiceEnvelope<Vec<decision_kernel_core::AuditEvent>>>, ServiceError> {
    let events = state
        .api
        .audit_trail(parse_case_id(&case_id)?)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(events)))
}

async fn run_latest(
    State(state): State<ServiceState>,
    Path(case_id): Path<String>,
) -> Result<Json<ServiceEnvelope<decision_kernel_core::DecisionRun>>, ServiceError> {
    let run = state
        .api
        .latest_run(parse_case_id(&case_id)?)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(run)))
}

async fn run_pack(
    State(state): State<ServiceState>,
    Path(case_id): Path<String>,
) -> Result<Json<ServiceEnvelope<decision_kernel_core::EvidencePack>>, ServiceError> {
    let pack = state
        .api
        .evidence_pack(parse_case_id(&case_id)?)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(pack)))
}
