//! REST API handlers for blocks and addresses.

use std::net::IpAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::{BulkAddressRequest, BulkReport, Ipam, IpamError};
use crate::ipblock::{
    AddressDraft, AddressId, AddressRecord, BlockDraft, BlockId, BlockNode, BlockRecord,
    ValidationError,
};
use crate::ping::Pinger;
use crate::scope::AccessScope;

/// Application state shared across handlers.
pub struct AppState {
    pub config: Config,
    pub ipam: Arc<Mutex<Ipam>>,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Next free address of a block, if any.
#[derive(Debug, Serialize)]
pub struct NextAddressResponse {
    pub block_id: BlockId,
    pub address: Option<IpAddr>,
}

/// Reachability of a registered address.
#[derive(Debug, Serialize)]
pub struct PingResponse {
    pub address: IpAddr,
    pub reachable: bool,
}

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<T, ApiError>;

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

impl From<IpamError> for ErrorResponse {
    fn from(e: IpamError) -> Self {
        Self {
            error: e.to_string(),
        }
    }
}

fn status_of(e: &IpamError) -> StatusCode {
    match e {
        IpamError::Validation(ValidationError::BlockNotFound(_)) | IpamError::NotFound(_) => {
            StatusCode::NOT_FOUND
        }
        IpamError::Validation(ValidationError::OutOfScope(_)) => StatusCode::FORBIDDEN,
        IpamError::Validation(_) | IpamError::SelfConnection | IpamError::InvalidInput(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        IpamError::Database(_) | IpamError::InvalidRecord(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn store_error(e: IpamError) -> ApiError {
    let status = status_of(&e);
    if status.is_server_error() {
        error!(error = %e, "Store operation failed");
    }
    (status, Json(e.into()))
}

/// Create the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/blocks", get(list_blocks).post(create_block))
        .route(
            "/v1/blocks/{id}",
            get(get_block).put(update_block).delete(delete_block),
        )
        .route("/v1/blocks/{id}/children", get(list_children))
        .route("/v1/blocks/{id}/tree", get(block_tree))
        .route("/v1/blocks/{id}/subdivide", post(subdivide_block))
        .route(
            "/v1/blocks/{id}/addresses",
            get(list_addresses).post(create_address),
        )
        .route("/v1/blocks/{id}/addresses/bulk", post(create_addresses_bulk))
        .route("/v1/blocks/{id}/next-address", get(next_address))
        .route(
            "/v1/addresses/{id}",
            get(get_address).put(update_address).delete(delete_address),
        )
        .route("/v1/addresses/{id}/ping", get(ping_address))
        .with_state(Arc::new(state))
}

/// Resolve the caller's scope from an `Authorization: Token <t>` header.
async fn authorize(state: &AppState, headers: &HeaderMap) -> ApiResult<AccessScope> {
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Token "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "Missing API token"))?;

    let ipam = state.ipam.lock().await;
    let token = ipam.validate_token(presented).await.map_err(store_error)?;

    match token.and_then(|t| t.scope()) {
        Some(scope) => Ok(scope),
        None => {
            warn!("Rejected invalid API token");
            Err(api_error(StatusCode::UNAUTHORIZED, "Invalid API token"))
        }
    }
}

/// Health check endpoint (no auth required).
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn list_blocks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<BlockRecord>>> {
    let scope = authorize(&state, &headers).await?;
    let ipam = state.ipam.lock().await;
    let blocks = ipam.list_blocks(&scope).await.map_err(store_error)?;
    Ok(Json(blocks))
}

async fn create_block(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(draft): Json<BlockDraft>,
) -> ApiResult<(StatusCode, Json<BlockRecord>)> {
    let scope = authorize(&state, &headers).await?;
    let ipam = state.ipam.lock().await;
    let block = ipam.create_block(&scope, draft).await.map_err(store_error)?;

    info!(block = %block.network, id = block.id, "Created block via API");
    Ok((StatusCode::CREATED, Json(block)))
}

async fn get_block(
    State(state): State<Arc<AppState>>,
    Path(id): Path<BlockId>,
    headers: HeaderMap,
) -> ApiResult<Json<BlockRecord>> {
    let scope = authorize(&state, &headers).await?;
    let ipam = state.ipam.lock().await;
    let block = ipam.get_block(&scope, id).await.map_err(store_error)?;
    Ok(Json(block))
}

async fn update_block(
    State(state): State<Arc<AppState>>,
    Path(id): Path<BlockId>,
    headers: HeaderMap,
    Json(draft): Json<BlockDraft>,
) -> ApiResult<Json<BlockRecord>> {
    let scope = authorize(&state, &headers).await?;
    let ipam = state.ipam.lock().await;
    let block = ipam.update_block(&scope, id, draft).await.map_err(store_error)?;
    Ok(Json(block))
}

/// Delete a block with everything below it.
async fn delete_block(
    State(state): State<Arc<AppState>>,
    Path(id): Path<BlockId>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let scope = authorize(&state, &headers).await?;
    let ipam = state.ipam.lock().await;
    ipam.delete_block(&scope, id).await.map_err(store_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_children(
    State(state): State<Arc<AppState>>,
    Path(id): Path<BlockId>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<BlockRecord>>> {
    let scope = authorize(&state, &headers).await?;
    let ipam = state.ipam.lock().await;
    let children = ipam.list_children(&scope, id).await.map_err(store_error)?;
    Ok(Json(children))
}

/// Nested view of a block, its sub-blocks and their addresses.
async fn block_tree(
    State(state): State<Arc<AppState>>,
    Path(id): Path<BlockId>,
    headers: HeaderMap,
) -> ApiResult<Json<BlockNode>> {
    let scope = authorize(&state, &headers).await?;
    let ipam = state.ipam.lock().await;
    let node = ipam.block_hierarchy(&scope, id).await.map_err(store_error)?;
    Ok(Json(node))
}

async fn subdivide_block(
    State(state): State<Arc<AppState>>,
    Path(id): Path<BlockId>,
    headers: HeaderMap,
) -> ApiResult<(StatusCode, Json<Vec<BlockRecord>>)> {
    let scope = authorize(&state, &headers).await?;
    let ipam = state.ipam.lock().await;
    let (lower, upper) = ipam.subdivide_block(&scope, id).await.map_err(store_error)?;
    Ok((StatusCode::CREATED, Json(vec![lower, upper])))
}

async fn list_addresses(
    State(state): State<Arc<AppState>>,
    Path(id): Path<BlockId>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<AddressRecord>>> {
    let scope = authorize(&state, &headers).await?;
    let ipam = state.ipam.lock().await;
    let addresses = ipam.list_addresses(&scope, id).await.map_err(store_error)?;
    Ok(Json(addresses))
}

/// Register an address in a block. Without an `ip` the next free address
/// is taken.
async fn create_address(
    State(state): State<Arc<AppState>>,
    Path(id): Path<BlockId>,
    headers: HeaderMap,
    Json(mut draft): Json<AddressDraft>,
) -> ApiResult<(StatusCode, Json<AddressRecord>)> {
    let scope = authorize(&state, &headers).await?;
    draft.block_id = Some(id);
    let ipam = state.ipam.lock().await;
    let address = ipam.create_address(&scope, draft).await.map_err(store_error)?;
    Ok((StatusCode::CREATED, Json(address)))
}

async fn create_addresses_bulk(
    State(state): State<Arc<AppState>>,
    Path(id): Path<BlockId>,
    headers: HeaderMap,
    Json(request): Json<BulkAddressRequest>,
) -> ApiResult<Json<BulkReport>> {
    let scope = authorize(&state, &headers).await?;
    let ipam = state.ipam.lock().await;
    let report = ipam
        .create_addresses_bulk(&scope, id, request)
        .await
        .map_err(store_error)?;
    Ok(Json(report))
}

async fn next_address(
    State(state): State<Arc<AppState>>,
    Path(id): Path<BlockId>,
    headers: HeaderMap,
) -> ApiResult<Json<NextAddressResponse>> {
    let scope = authorize(&state, &headers).await?;
    let ipam = state.ipam.lock().await;
    let address = ipam
        .suggest_next_address(&scope, id)
        .await
        .map_err(store_error)?;
    Ok(Json(NextAddressResponse {
        block_id: id,
        address,
    }))
}

async fn get_address(
    State(state): State<Arc<AppState>>,
    Path(id): Path<AddressId>,
    headers: HeaderMap,
) -> ApiResult<Json<AddressRecord>> {
    let scope = authorize(&state, &headers).await?;
    let ipam = state.ipam.lock().await;
    let address = ipam.get_address(&scope, id).await.map_err(store_error)?;
    Ok(Json(address))
}

async fn update_address(
    State(state): State<Arc<AppState>>,
    Path(id): Path<AddressId>,
    headers: HeaderMap,
    Json(draft): Json<AddressDraft>,
) -> ApiResult<Json<AddressRecord>> {
    let scope = authorize(&state, &headers).await?;
    let ipam = state.ipam.lock().await;
    let address = ipam
        .update_address(&scope, id, draft)
        .await
        .map_err(store_error)?;
    Ok(Json(address))
}

async fn delete_address(
    State(state): State<Arc<AppState>>,
    Path(id): Path<AddressId>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let scope = authorize(&state, &headers).await?;
    let ipam = state.ipam.lock().await;
    ipam.delete_address(&scope, id).await.map_err(store_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Ping a registered address. The store lock is released before probing.
async fn ping_address(
    State(state): State<Arc<AppState>>,
    Path(id): Path<AddressId>,
    headers: HeaderMap,
) -> ApiResult<Json<PingResponse>> {
    let scope = authorize(&state, &headers).await?;
    let address = {
        let ipam = state.ipam.lock().await;
        ipam.get_address(&scope, id).await.map_err(store_error)?.ip
    };

    let pinger = Pinger::new(state.config.ping.clone());
    let reachable = tokio::task::spawn_blocking(move || pinger.ping(address))
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(|e| {
            error!(address = %address, error = %e, "Ping failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;

    Ok(Json(PingResponse { address, reachable }))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::config::IpamConfig;

    struct TestApp {
        router: Router,
        token: String,
        other_token: String,
        device: i64,
        port: i64,
        tenant: i64,
    }

    async fn app() -> TestApp {
        let ipam = Ipam::in_memory(IpamConfig::default()).await.unwrap();
        let all = AccessScope::Unrestricted;
        let tenant = ipam.create_tenant("Acme Telecom").await.unwrap().id;
        let other = ipam.create_tenant("Other ISP").await.unwrap().id;
        let device = ipam.create_device(&all, tenant, "bng-01", None).await.unwrap().id;
        let port = ipam.create_port(&all, device, "ge-0/0/1").await.unwrap().id;
        let (token, _) = ipam.create_token(Some("noc"), Some(tenant), false).await.unwrap();
        let (other_token, _) = ipam.create_token(None, Some(other), false).await.unwrap();

        let mut config = Config::default();
        config.ping.command = "true".to_string();
        let router = create_router(AppState {
            config,
            ipam: Arc::new(Mutex::new(ipam)),
        });

        TestApp {
            router,
            token,
            other_token,
            device,
            port,
            tenant,
        }
    }

    async fn call(
        app: &TestApp,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            request = request.header("Authorization", format!("Token {}", token));
        }
        let body = match body {
            Some(v) => {
                request = request.header("Content-Type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };

        let response = app
            .router
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn create_root(app: &TestApp, cidr: &str) -> i64 {
        let (status, body) = call(
            app,
            "POST",
            "/v1/blocks",
            Some(&app.token),
            Some(json!({"tenant_id": app.tenant, "family": "IPv4", "cidr": cidr})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        body["id"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn test_health_needs_no_token() {
        let app = app().await;
        let (status, body) = call(&app, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_token_required() {
        let app = app().await;
        let (status, _) = call(&app, "GET", "/v1/blocks", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, body) = call(&app, "GET", "/v1/blocks", Some("nope"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Invalid API token");
    }

    #[tokio::test]
    async fn test_overlap_is_unprocessable() {
        let app = app().await;
        create_root(&app, "10.0.0.0/24").await;
        let (status, body) = call(
            &app,
            "POST",
            "/v1/blocks",
            Some(&app.token),
            Some(json!({"tenant_id": app.tenant, "family": "IPv4", "cidr": "10.0.0.128/25"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("10.0.0.0/24"));
    }

    #[tokio::test]
    async fn test_subdivide_and_tree() {
        let app = app().await;
        let id = create_root(&app, "10.0.0.0/24").await;

        let uri = format!("/v1/blocks/{}/subdivide", id);
        let (status, body) = call(&app, "POST", &uri, Some(&app.token), None).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body[0]["network"], "10.0.0.0/25");
        assert_eq!(body[1]["network"], "10.0.0.128/25");

        let (status, _) = call(&app, "POST", &uri, Some(&app.token), None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, body) = call(&app, "GET", &format!("/v1/blocks/{}/tree", id), Some(&app.token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["children"].as_array().unwrap().len(), 2);

        let (_, body) = call(&app, "GET", &format!("/v1/blocks/{}/children", id), Some(&app.token), None).await;
        assert_eq!(body.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_address_allocation_flow() {
        let app = app().await;
        let id = create_root(&app, "10.0.0.0/30").await;
        let uri = format!("/v1/blocks/{}/addresses", id);
        let draft = json!({"device_id": app.device, "port_id": app.port, "purpose": "p2p"});

        let (status, first) = call(&app, "POST", &uri, Some(&app.token), Some(draft.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(first["ip"], "10.0.0.1");

        let (_, next) = call(&app, "GET", &format!("/v1/blocks/{}/next-address", id), Some(&app.token), None).await;
        assert_eq!(next["address"], "10.0.0.2");

        call(&app, "POST", &uri, Some(&app.token), Some(draft.clone())).await;
        let (status, body) = call(&app, "POST", &uri, Some(&app.token), Some(draft)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("10.0.0.0/30"));

        let (_, next) = call(&app, "GET", &format!("/v1/blocks/{}/next-address", id), Some(&app.token), None).await;
        assert!(next["address"].is_null());

        let address_uri = format!("/v1/addresses/{}", first["id"]);
        let (status, body) = call(&app, "GET", &format!("{}/ping", address_uri), Some(&app.token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reachable"], true);

        let (status, _) = call(&app, "DELETE", &address_uri, Some(&app.token), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, "GET", &address_uri, Some(&app.token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bulk_reports_failures() {
        let app = app().await;
        let id = create_root(&app, "10.0.0.0/29").await;
        let (status, body) = call(
            &app,
            "POST",
            &format!("/v1/blocks/{}/addresses/bulk", id),
            Some(&app.token),
            Some(json!({
                "device_id": app.device,
                "port_id": app.port,
                "ips": ["10.0.0.2", "10.0.0.0"],
                "count": 1
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["created"].as_array().unwrap().len(), 2);
        assert_eq!(body["failed"], 1);
    }

    #[tokio::test]
    async fn test_other_tenant_sees_nothing() {
        let app = app().await;
        let id = create_root(&app, "10.0.0.0/24").await;

        let (status, _) = call(&app, "GET", &format!("/v1/blocks/{}", id), Some(&app.other_token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (_, body) = call(&app, "GET", "/v1/blocks", Some(&app.other_token), None).await;
        assert!(body.as_array().unwrap().is_empty());

        let (status, _) = call(
            &app,
            "POST",
            "/v1/blocks",
            Some(&app.other_token),
            Some(json!({"tenant_id": app.tenant, "family": "IPv4", "cidr": "172.16.0.0/12"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_update_and_delete_block() {
        let app = app().await;
        let id = create_root(&app, "10.0.0.0/24").await;
        let uri = format!("/v1/blocks/{}", id);

        let (status, body) = call(
            &app,
            "PUT",
            &uri,
            Some(&app.token),
            Some(json!({"tenant_id": app.tenant, "family": "IPv4", "cidr": "10.0.0.0/23", "description": "grown"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["network"], "10.0.0.0/23");
        assert_eq!(body["description"], "grown");

        let (status, _) = call(&app, "DELETE", &uri, Some(&app.token), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, "GET", &uri, Some(&app.token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
