use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tradeloop_core::{
    engine::{LoopFilter, StatsReport, UsageReport, WantTarget},
    types::{
        CanonicalId, CollectionId, EngineError, EventOutcome, NftId, NftMetadata, SequencedEvent,
        TradeCycle, WalletId,
    },
    TenantRegistry, TenantSettings,
};

/// HTTP binding of the engine's admin, event and query surfaces
pub struct TradeloopApi {
    pub registry: Arc<TenantRegistry>,
}

/// Handlers return the payload directly; failures become an [`ApiError`]
/// response with the status encoding the error class.
pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// An engine error rendered over HTTP: status from the error class, a JSON
/// body with the message, and a retry hint when the engine provided one.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    retry_after_ms: Option<u64>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_ms: Option<u64>,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            retry_after_ms: None,
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        let status = match &error {
            EngineError::UnknownTenant(_) | EngineError::UnknownNft(_) => StatusCode::NOT_FOUND,
            EngineError::DuplicateOwnership { .. }
            | EngineError::SelfWant { .. }
            | EngineError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            EngineError::Busy | EngineError::RateLimited { .. } | EngineError::QuotaExceeded(_) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            EngineError::Unavailable
            | EngineError::DependencyUnavailable(_)
            | EngineError::Quarantined(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let retry_after_ms = match &error {
            EngineError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        };
        Self {
            status,
            message: error.to_string(),
            retry_after_ms,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
            retry_after_ms: self.retry_after_ms,
        };
        (self.status, Json(body)).into_response()
    }
}

// ---- request / response DTOs ----

#[derive(Deserialize)]
pub struct CreateTenantRequest {
    pub tenant_id: String,
    #[serde(default)]
    pub settings: Option<TenantSettings>,
}

#[derive(Serialize)]
pub struct CreateTenantResponse {
    pub tenant_id: String,
}

#[derive(Deserialize)]
pub struct NftUpload {
    pub id: NftId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub collection: Option<CollectionId>,
    #[serde(default)]
    pub estimated_value: Option<f64>,
}

#[derive(Deserialize)]
pub struct SubmitInventoryRequest {
    pub wallet: WalletId,
    pub nfts: Vec<NftUpload>,
}

#[derive(Deserialize)]
pub struct SubmitWantsRequest {
    pub wallet: WalletId,
    #[serde(default)]
    pub wanted_nfts: Vec<NftId>,
    #[serde(default)]
    pub wanted_collections: Vec<CollectionId>,
}

#[derive(Deserialize)]
pub struct RemoveWantRequest {
    pub wallet: WalletId,
    #[serde(default)]
    pub nft: Option<NftId>,
    #[serde(default)]
    pub collection: Option<CollectionId>,
}

#[derive(Deserialize)]
pub struct NotifyTransferRequest {
    pub nft: NftId,
    pub new_owner: WalletId,
}

#[derive(Deserialize)]
pub struct CollectionMembershipRequest {
    pub collection: CollectionId,
    #[serde(default)]
    pub added: Vec<NftId>,
    #[serde(default)]
    pub removed: Vec<NftId>,
}

#[derive(Deserialize)]
pub struct LoopsQuery {
    #[serde(default)]
    pub wallet: Option<WalletId>,
    #[serde(default)]
    pub nft: Option<NftId>,
    #[serde(default)]
    pub collection: Option<CollectionId>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub cursor: Option<usize>,
}

#[derive(Serialize)]
pub struct LoopsResponse {
    pub loops: Vec<TradeCycle>,
    pub next_cursor: Option<usize>,
    pub partial: bool,
}

#[derive(Serialize)]
pub struct LoopDetailResponse {
    pub canonical_id: CanonicalId,
    pub cycle: TradeCycle,
    pub state: String,
    pub age_ms: u64,
    pub expires_in_ms: u64,
}

#[derive(Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub since: u64,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl TradeloopApi {
    pub fn new(registry: TenantRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    /// Create the Axum router binding every surface
    pub fn router(self) -> Router {
        let shared = self.registry;

        Router::new()
            // Admin surface
            .route("/tenants", post(create_tenant))
            .route("/tenants/:tenant", delete(delete_tenant))
            .route("/tenants/:tenant/usage", get(tenant_usage))
            .route("/tenants/:tenant/settings", put(update_settings))
            // Event surface
            .route("/tenants/:tenant/inventory", post(submit_inventory))
            .route("/tenants/:tenant/wants", post(submit_wants))
            .route("/tenants/:tenant/wants", delete(remove_want))
            .route("/tenants/:tenant/transfers", post(notify_transfer))
            .route(
                "/tenants/:tenant/collections/membership",
                post(collection_membership),
            )
            // Query surface
            .route("/tenants/:tenant/loops", get(get_loops))
            .route("/tenants/:tenant/loops/:canonical_id", get(get_loop_detail))
            .route("/tenants/:tenant/stats", get(get_stats))
            .route("/tenants/:tenant/events", get(get_events))
            .with_state(shared)
    }
}

// ---- admin handlers ----

async fn create_tenant(
    State(registry): State<Arc<TenantRegistry>>,
    Json(request): Json<CreateTenantRequest>,
) -> ApiResult<CreateTenantResponse> {
    let settings = request.settings.unwrap_or_default();
    registry.create_tenant(&request.tenant_id, settings)?;
    Ok(Json(CreateTenantResponse {
        tenant_id: request.tenant_id,
    }))
}

async fn delete_tenant(
    State(registry): State<Arc<TenantRegistry>>,
    Path(tenant): Path<String>,
) -> ApiResult<()> {
    registry.delete_tenant(&tenant)?;
    Ok(Json(()))
}

async fn tenant_usage(
    State(registry): State<Arc<TenantRegistry>>,
    Path(tenant): Path<String>,
) -> ApiResult<UsageReport> {
    Ok(Json(registry.get_tenant_usage(&tenant)?))
}

async fn update_settings(
    State(registry): State<Arc<TenantRegistry>>,
    Path(tenant): Path<String>,
    Json(settings): Json<TenantSettings>,
) -> ApiResult<()> {
    registry.update_tenant_settings(&tenant, settings)?;
    Ok(Json(()))
}

// ---- event handlers ----

async fn submit_inventory(
    State(registry): State<Arc<TenantRegistry>>,
    Path(tenant): Path<String>,
    Json(request): Json<SubmitInventoryRequest>,
) -> ApiResult<EventOutcome> {
    let engine = registry.engine(&tenant)?;
    let nfts = request
        .nfts
        .into_iter()
        .map(|n| {
            (
                n.id,
                NftMetadata {
                    name: n.name,
                    symbol: n.symbol,
                    collection: n.collection,
                    estimated_value: n.estimated_value,
                },
            )
        })
        .collect();
    Ok(Json(engine.submit_inventory(&request.wallet, nfts)?))
}

async fn submit_wants(
    State(registry): State<Arc<TenantRegistry>>,
    Path(tenant): Path<String>,
    Json(request): Json<SubmitWantsRequest>,
) -> ApiResult<EventOutcome> {
    let engine = registry.engine(&tenant)?;
    let outcome = engine.submit_wants(
        &request.wallet,
        request.wanted_nfts,
        request.wanted_collections,
    )?;
    Ok(Json(outcome))
}

async fn remove_want(
    State(registry): State<Arc<TenantRegistry>>,
    Path(tenant): Path<String>,
    Json(request): Json<RemoveWantRequest>,
) -> ApiResult<EventOutcome> {
    let target = match (request.nft, request.collection) {
        (Some(nft), None) => WantTarget::Nft(nft),
        (None, Some(collection)) => WantTarget::Collection(collection),
        _ => {
            return Err(ApiError::bad_request(
                "exactly one of nft or collection must be given",
            ))
        }
    };
    let engine = registry.engine(&tenant)?;
    Ok(Json(engine.remove_want(&request.wallet, target)?))
}

async fn notify_transfer(
    State(registry): State<Arc<TenantRegistry>>,
    Path(tenant): Path<String>,
    Json(request): Json<NotifyTransferRequest>,
) -> ApiResult<EventOutcome> {
    let engine = registry.engine(&tenant)?;
    Ok(Json(engine.notify_transfer(&request.nft, &request.new_owner)?))
}

async fn collection_membership(
    State(registry): State<Arc<TenantRegistry>>,
    Path(tenant): Path<String>,
    Json(request): Json<CollectionMembershipRequest>,
) -> ApiResult<EventOutcome> {
    let engine = registry.engine(&tenant)?;
    let outcome =
        engine.notify_collection_membership(&request.collection, request.added, request.removed)?;
    Ok(Json(outcome))
}

// ---- query handlers ----

async fn get_loops(
    State(registry): State<Arc<TenantRegistry>>,
    Path(tenant): Path<String>,
    Query(query): Query<LoopsQuery>,
) -> ApiResult<LoopsResponse> {
    let filter = match (&query.wallet, &query.nft, &query.collection) {
        (Some(wallet), None, None) => LoopFilter::ByWallet(wallet.clone()),
        (None, Some(nft), None) => LoopFilter::ByNft(nft.clone()),
        (None, None, Some(collection)) => LoopFilter::ByCollection(collection.clone()),
        (None, None, None) => LoopFilter::All,
        _ => {
            return Err(ApiError::bad_request(
                "at most one of wallet, nft, collection may be given",
            ))
        }
    };
    let engine = registry.engine(&tenant)?;
    let (loops, next_cursor, partial) = engine.get_active_loops(
        &filter,
        query.limit.unwrap_or(50),
        query.cursor.unwrap_or(0),
    );
    Ok(Json(LoopsResponse {
        loops,
        next_cursor,
        partial,
    }))
}

async fn get_loop_detail(
    State(registry): State<Arc<TenantRegistry>>,
    Path((tenant, canonical_id)): Path<(String, String)>,
) -> ApiResult<LoopDetailResponse> {
    let engine = registry.engine(&tenant)?;
    let detail = engine
        .get_loop_detail(&canonical_id)
        .ok_or_else(|| ApiError::not_found(format!("unknown loop {canonical_id}")))?;
    Ok(Json(LoopDetailResponse {
        canonical_id: detail.cycle.canonical_id.clone(),
        state: format!("{:?}", detail.state),
        age_ms: detail.age.as_millis() as u64,
        expires_in_ms: detail.expires_in.as_millis() as u64,
        cycle: detail.cycle,
    }))
}

async fn get_stats(
    State(registry): State<Arc<TenantRegistry>>,
    Path(tenant): Path<String>,
) -> ApiResult<StatsReport> {
    Ok(Json(registry.engine(&tenant)?.stats()))
}

async fn get_events(
    State(registry): State<Arc<TenantRegistry>>,
    Path(tenant): Path<String>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Vec<SequencedEvent>> {
    let engine = registry.engine(&tenant)?;
    Ok(Json(engine.poll_events(query.since, query.limit.unwrap_or(100))))
}
