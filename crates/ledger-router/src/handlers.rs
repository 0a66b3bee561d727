//! HTTP request handlers for the Router service.
//!
//! Each handler translates one request into one facade call on the shared
//! [`Ledger`] and wraps the result in the wire envelope.

use crate::envelope::{ApiJson, ApiPath, ApiQuery, ApiResponse, ApiResult, AppError};
use axum::{
    body::Bytes,
    extract::State,
    routing::{get, post},
    Router as AxumRouter,
};
use ledger_domain::traits::{ClaimFilter, ConflictFilter};
use ledger_domain::{
    ChangeRequest, Claim, ClaimId, Conflict, ConflictId, ConflictSeverity, ConflictStatus, ConflictType, Constraint,
    Lens, LensKey, Mutation, MutationId, Organism, OrganismId, Projection, ProjectionKind, Tradeoff,
};
use ledger_engine::{
    ConstraintDraft, DiffResult, DiffSide, EvaluateInclude, Evaluation, Explanation, Ledger, LensDraft,
    ResolveRequest, SimulationResult, ValidationResult,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Upper bound on `limit` for paginated listings
pub const MAX_PAGE_SIZE: usize = 500;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// The ledger every handler works against
    pub ledger: Arc<Ledger>,
    /// Page size when a listing request gives none
    pub default_page_size: usize,
}

impl AppState {
    /// State over `ledger`
    pub fn new(ledger: Arc<Ledger>, default_page_size: usize) -> Self {
        Self {
            ledger,
            default_page_size: default_page_size.clamp(1, MAX_PAGE_SIZE),
        }
    }
}

/// Organism creation request
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrganismRequest {
    /// Human-readable name
    pub name: String,
    /// Category tag
    pub organism_type: String,
    /// Free-form tags
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Mutation proposal request
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposeRequest {
    /// Target organism
    pub organism_id: OrganismId,
    /// Proposing actor
    pub actor: String,
    /// Requested changes
    pub changes: Vec<ChangeRequest>,
    /// Stated intent
    #[serde(default)]
    pub intent: Option<String>,
}

/// Validation request; the body may be empty
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateRequest {
    /// Evaluate without recording the outcome
    #[serde(default)]
    pub dry_run: bool,
}

/// Commit request; the body may be empty
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRequest {
    /// Tradeoffs covering soft failures
    #[serde(default)]
    pub tradeoffs: Vec<Tradeoff>,
    /// Commit comment
    #[serde(default)]
    pub comment: Option<String>,
}

/// Rollback request
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRequest {
    /// Why the mutation is undone
    pub reason: String,
    /// Who undoes it
    pub actor: String,
}

/// Rejection request
#[derive(Debug, Serialize, Deserialize)]
pub struct RejectRequest {
    /// Why the proposal is refused
    pub reason: String,
}

/// Suppression request
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuppressRequest {
    /// Why the conflict is tolerated
    pub reason: String,
    /// When the suppression lapses (Unix ms); open-ended when absent
    #[serde(default)]
    pub expires_at: Option<u64>,
    /// Who signed off
    pub approved_by: String,
}

/// Evaluation query
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateRequest {
    /// Organism to evaluate
    pub organism_id: OrganismId,
    /// Sections to include
    #[serde(default)]
    pub include: EvaluateInclude,
}

/// Diff query
#[derive(Debug, Serialize, Deserialize)]
pub struct DiffRequest {
    /// Older or reference side
    pub left: DiffSide,
    /// Newer or compared side
    pub right: DiffSide,
}

/// Explain query
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplainRequest {
    /// Organism holding the claim
    pub organism_id: OrganismId,
    /// Lens to explain
    pub lens: LensKey,
}

/// Simulation query
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulateRequest {
    /// Organism to simulate against
    pub organism_id: OrganismId,
    /// Hypothetical changes
    pub changes: Vec<ChangeRequest>,
}

/// `GET /conflicts` query string
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictQuery {
    /// Status filter
    pub status: Option<ConflictStatus>,
    /// Severity filter
    pub severity: Option<ConflictSeverity>,
    /// Trigger type filter
    #[serde(rename = "type")]
    pub conflict_type: Option<ConflictType>,
    /// Organism filter
    pub organism_id: Option<OrganismId>,
    /// Involved-claim filter
    pub claim_id: Option<ClaimId>,
    /// Last conflict id of the previous page
    pub cursor: Option<ConflictId>,
    /// Page size
    pub limit: Option<usize>,
}

/// `GET /claims` query string
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimQuery {
    /// Owning organism
    pub organism_id: OrganismId,
    /// Lens cluster filter
    #[serde(default)]
    pub cluster: Option<String>,
    /// Include soft-deleted claims
    #[serde(default)]
    pub include_deleted: bool,
}

/// `GET /projections/{organismId}/{kind}` query string
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionQuery {
    /// Historical instant (Unix ms); current state when absent
    #[serde(default)]
    pub as_of: Option<u64>,
}

/// One page of a cursor-paginated listing
#[derive(Debug, Serialize, Deserialize)]
pub struct Page<T> {
    /// Items on this page
    pub items: Vec<T>,
    /// Cursor for the next page; absent on the last page
    pub cursor: Option<String>,
    /// Page size used
    pub limit: usize,
    /// Items matching the filters across all pages
    pub total: usize,
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall health status
    pub status: String,
    /// Crate version
    pub version: String,
    /// Registered organisms
    pub organisms: usize,
}

/// Decode an optional JSON body, falling back to the default when empty
fn optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| AppError::BadRequest(format!("Failed to parse the request body: {}", e)))
}

/// Conflicts after `cursor` in id order (ids are time-ordered)
fn paginate(mut conflicts: Vec<Conflict>, cursor: Option<ConflictId>, limit: usize) -> Page<Conflict> {
    conflicts.sort_by_key(|c| c.id);
    let total = conflicts.len();

    let mut items: Vec<Conflict> = conflicts
        .into_iter()
        .filter(|c| cursor.is_none_or(|after| c.id > after))
        .take(limit + 1)
        .collect();
    let more = items.len() > limit;
    items.truncate(limit);

    let cursor = if more { items.last().map(|c| c.id.to_string()) } else { None };
    Page {
        items,
        cursor,
        limit,
        total,
    }
}

/// GET /health
async fn health_check(State(state): State<AppState>) -> ApiResult<HealthResponse> {
    let organisms = state.ledger.list_organisms()?.len();
    Ok(ApiResponse(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        organisms,
    }))
}

/// POST /organisms
async fn create_organism(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<CreateOrganismRequest>,
) -> ApiResult<Organism> {
    let organism = state
        .ledger
        .create_organism(&request.name, &request.organism_type, request.tags)?;
    info!(organism = %organism.id, "Organism created");
    Ok(ApiResponse(organism))
}

/// GET /organisms
async fn list_organisms(State(state): State<AppState>) -> ApiResult<Vec<Organism>> {
    Ok(ApiResponse(state.ledger.list_organisms()?))
}

/// GET /organisms/{id}
async fn get_organism(State(state): State<AppState>, ApiPath(id): ApiPath<OrganismId>) -> ApiResult<Organism> {
    Ok(ApiResponse(state.ledger.get_organism(id)?))
}

/// POST /lenses
async fn register_lens(State(state): State<AppState>, ApiJson(draft): ApiJson<LensDraft>) -> ApiResult<Lens> {
    Ok(ApiResponse(state.ledger.register_lens(draft)?))
}

/// POST /constraints
async fn register_constraint(
    State(state): State<AppState>,
    ApiJson(draft): ApiJson<ConstraintDraft>,
) -> ApiResult<Constraint> {
    Ok(ApiResponse(state.ledger.register_constraint(draft)?))
}

/// GET /claims?organismId
async fn list_claims(State(state): State<AppState>, ApiQuery(query): ApiQuery<ClaimQuery>) -> ApiResult<Vec<Claim>> {
    let filter = ClaimFilter {
        cluster: query.cluster,
        include_deleted: query.include_deleted,
    };
    Ok(ApiResponse(state.ledger.list_claims(query.organism_id, &filter)?))
}

/// POST /mutations
async fn propose(State(state): State<AppState>, ApiJson(request): ApiJson<ProposeRequest>) -> ApiResult<Mutation> {
    let mutation = state
        .ledger
        .propose(request.organism_id, &request.actor, request.changes, request.intent)?;
    Ok(ApiResponse(mutation))
}

/// GET /mutations/{id}
async fn get_mutation(State(state): State<AppState>, ApiPath(id): ApiPath<MutationId>) -> ApiResult<Mutation> {
    Ok(ApiResponse(state.ledger.get_mutation(id)?))
}

/// POST /mutations/{id}/validate
async fn validate(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<MutationId>,
    body: Bytes,
) -> ApiResult<ValidationResult> {
    let request: ValidateRequest = optional_body(&body)?;
    Ok(ApiResponse(state.ledger.validate(id, request.dry_run)?))
}

/// POST /mutations/{id}/commit
async fn commit(State(state): State<AppState>, ApiPath(id): ApiPath<MutationId>, body: Bytes) -> ApiResult<Mutation> {
    let request: CommitRequest = optional_body(&body)?;
    Ok(ApiResponse(state.ledger.commit(id, request.tradeoffs, request.comment)?))
}

/// POST /mutations/{id}/rollback
async fn rollback(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<MutationId>,
    ApiJson(request): ApiJson<RollbackRequest>,
) -> ApiResult<Mutation> {
    Ok(ApiResponse(state.ledger.rollback(id, &request.reason, &request.actor)?))
}

/// POST /mutations/{id}/reject
async fn reject(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<MutationId>,
    ApiJson(request): ApiJson<RejectRequest>,
) -> ApiResult<Mutation> {
    Ok(ApiResponse(state.ledger.reject(id, &request.reason)?))
}

/// GET /conflicts?status&severity&type&organismId&cursor&limit
async fn list_conflicts(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<ConflictQuery>,
) -> ApiResult<Page<Conflict>> {
    let filter = ConflictFilter {
        organism_id: query.organism_id,
        status: query.status,
        severity: query.severity,
        conflict_type: query.conflict_type,
        claim_id: query.claim_id,
    };
    let limit = query.limit.unwrap_or(state.default_page_size).clamp(1, MAX_PAGE_SIZE);
    let conflicts = state.ledger.list_conflicts(&filter)?;
    Ok(ApiResponse(paginate(conflicts, query.cursor, limit)))
}

/// GET /conflicts/{id}
async fn get_conflict(State(state): State<AppState>, ApiPath(id): ApiPath<ConflictId>) -> ApiResult<Conflict> {
    Ok(ApiResponse(state.ledger.get_conflict(id)?))
}

/// POST /conflicts/{id}/resolve
async fn resolve(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<ConflictId>,
    ApiJson(request): ApiJson<ResolveRequest>,
) -> ApiResult<Conflict> {
    Ok(ApiResponse(state.ledger.resolve(id, request)?))
}

/// POST /conflicts/{id}/suppress
async fn suppress(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<ConflictId>,
    ApiJson(request): ApiJson<SuppressRequest>,
) -> ApiResult<Conflict> {
    let conflict = state
        .ledger
        .suppress(id, &request.reason, request.expires_at, &request.approved_by)?;
    Ok(ApiResponse(conflict))
}

/// POST /query/evaluate
async fn evaluate(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<EvaluateRequest>,
) -> ApiResult<Evaluation> {
    Ok(ApiResponse(state.ledger.evaluate(request.organism_id, request.include)?))
}

/// POST /query/diff
async fn diff(State(state): State<AppState>, ApiJson(request): ApiJson<DiffRequest>) -> ApiResult<DiffResult> {
    Ok(ApiResponse(state.ledger.diff(request.left, request.right)?))
}

/// POST /query/explain
async fn explain(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<ExplainRequest>,
) -> ApiResult<Explanation> {
    Ok(ApiResponse(state.ledger.explain(request.organism_id, &request.lens)?))
}

/// POST /query/simulate
async fn simulate(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<SimulateRequest>,
) -> ApiResult<SimulationResult> {
    Ok(ApiResponse(state.ledger.simulate(request.organism_id, request.changes)?))
}

/// GET /projections/{organismId}/{kind}?asOf
async fn projection(
    State(state): State<AppState>,
    ApiPath((organism_id, kind)): ApiPath<(OrganismId, ProjectionKind)>,
    ApiQuery(query): ApiQuery<ProjectionQuery>,
) -> ApiResult<Projection> {
    Ok(ApiResponse(state.ledger.projection(organism_id, kind, query.as_of)?))
}

/// Create the axum router with all routes
pub fn create_router(state: AppState) -> AxumRouter {
    AxumRouter::new()
        .route("/health", get(health_check))
        .route("/organisms", post(create_organism).get(list_organisms))
        .route("/organisms/:id", get(get_organism))
        .route("/lenses", post(register_lens))
        .route("/constraints", post(register_constraint))
        .route("/claims", get(list_claims))
        .route("/mutations", post(propose))
        .route("/mutations/:id", get(get_mutation))
        .route("/mutations/:id/validate", post(validate))
        .route("/mutations/:id/commit", post(commit))
        .route("/mutations/:id/rollback", post(rollback))
        .route("/mutations/:id/reject", post(reject))
        .route("/conflicts", get(list_conflicts))
        .route("/conflicts/:id", get(get_conflict))
        .route("/conflicts/:id/resolve", post(resolve))
        .route("/conflicts/:id/suppress", post(suppress))
        .route("/query/evaluate", post(evaluate))
        .route("/query/diff", post(diff))
        .route("/query/explain", post(explain))
        .route("/query/simulate", post(simulate))
        .route("/projections/:organism_id/:kind", get(projection))
        .with_state(state)
}
