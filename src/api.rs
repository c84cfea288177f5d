/// HTTP surface.
///
/// Thin read-only layer over `Resolver`, mirroring the teacher's `api.rs`
/// handler shape (axum extractors, `Extension<Arc<_>>` shared state, `Json`
/// responses, blocking store calls wrapped in `spawn_blocking`) but serving
/// resolve/search/address-history/status instead of the teacher's block
/// explorer endpoints.
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Extension, Query};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::resolver::{OrderBy, Resolver, SearchFilters};

#[derive(Clone)]
pub struct ApiState {
    pub resolver: Arc<Resolver>,
    pub query_timeout: Duration,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);
    Router::new()
        .route("/api/v1/resolve", get(resolve))
        .route("/api/v1/search", get(search))
        .route("/api/v1/address_history", get(address_history))
        .route("/api/v1/status", get(status))
        .route("/metrics", get(metrics))
        .layer(cors)
        .layer(Extension(state))
}

#[derive(Debug, Serialize)]
struct ResolvedClaimResponse {
    claim_hash: String,
    name: String,
    tx_num: u32,
    nout: u16,
    amount: u64,
    effective_amount: u64,
    sig_valid: bool,
}

#[derive(Debug, Deserialize)]
struct ResolveQuery {
    url: String,
}

async fn resolve(Query(q): Query<ResolveQuery>, Extension(state): Extension<ApiState>) -> Result<Json<ResolvedClaimResponse>, StatusCode> {
    let resolver = Arc::clone(&state.resolver);
    let timeout = state.query_timeout;
    let result = tokio::task::spawn_blocking(move || resolver.resolve_url(&q.url, timeout))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    match result {
        Ok(claim) => Ok(Json(ResolvedClaimResponse {
            claim_hash: hex::encode(claim.claim_hash),
            name: String::from_utf8_lossy(&claim.name).into_owned(),
            tx_num: claim.tx_num,
            nout: claim.nout,
            amount: claim.amount,
            effective_amount: claim.effective_amount,
            sig_valid: claim.sig_valid,
        })),
        Err(crate::error::ReadError::NotFound(_)) => Err(StatusCode::NOT_FOUND),
        Err(crate::error::ReadError::Censored { .. }) => Err(StatusCode::FORBIDDEN),
        Err(crate::error::ReadError::QueryTimeout) => Err(StatusCode::GATEWAY_TIMEOUT),
    }
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    claim_name: Option<String>,
    channel_hash: Option<String>,
    reposted_claim_hash: Option<String>,
    order_by: Option<String>,
    limit: Option<usize>,
    include_total: Option<bool>,
}

#[derive(Debug, Serialize)]
struct SearchResponse {
    rows: Vec<ResolvedClaimResponse>,
    total: Option<usize>,
}

fn decode_hash20(s: &str) -> Option<[u8; 20]> {
    hex::decode(s).ok().and_then(|b| b.try_into().ok())
}

async fn search(Query(q): Query<SearchQuery>, Extension(state): Extension<ApiState>) -> Result<Json<SearchResponse>, StatusCode> {
    let filters = SearchFilters {
        claim_name: q.claim_name.map(|s| s.into_bytes()),
        channel_hash: q.channel_hash.as_deref().and_then(decode_hash20),
        reposted_claim_hash: q.reposted_claim_hash.as_deref().and_then(decode_hash20),
        order_by: match q.order_by.as_deref() {
            Some("height") => Some(OrderBy::Height),
            Some("effective_amount") => Some(OrderBy::EffectiveAmount),
            _ => None,
        },
        limit: q.limit.unwrap_or(20).min(500),
        include_total: q.include_total.unwrap_or(false),
    };

    let resolver = Arc::clone(&state.resolver);
    let timeout = state.query_timeout;
    let result = tokio::task::spawn_blocking(move || resolver.search(&filters, timeout))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    match result {
        Ok(res) => Ok(Json(SearchResponse {
            rows: res
                .rows
                .into_iter()
                .map(|claim| ResolvedClaimResponse {
                    claim_hash: hex::encode(claim.claim_hash),
                    name: String::from_utf8_lossy(&claim.name).into_owned(),
                    tx_num: claim.tx_num,
                    nout: claim.nout,
                    amount: claim.amount,
                    effective_amount: claim.effective_amount,
                    sig_valid: claim.sig_valid,
                })
                .collect(),
            total: res.total,
        })),
        Err(crate::error::ReadError::QueryTimeout) => Err(StatusCode::GATEWAY_TIMEOUT),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

#[derive(Debug, Deserialize)]
struct AddressHistoryQuery {
    hash_x: String,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct AddressHistoryEntry {
    tx_hash: String,
    height: u32,
}

async fn address_history(Query(q): Query<AddressHistoryQuery>, Extension(state): Extension<ApiState>) -> Result<Json<Vec<AddressHistoryEntry>>, StatusCode> {
    let hash_bytes = hex::decode(&q.hash_x).map_err(|_| StatusCode::BAD_REQUEST)?;
    let hash_x: [u8; 11] = hash_bytes.try_into().map_err(|_| StatusCode::BAD_REQUEST)?;
    let limit = q.limit.unwrap_or(100).min(1000);

    let resolver = Arc::clone(&state.resolver);
    let result = tokio::task::spawn_blocking(move || resolver.address_history(&hash_x, limit))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    match result {
        Ok(entries) => Ok(Json(entries.into_iter().map(|(hash, height)| AddressHistoryEntry { tx_hash: hex::encode(hash), height }).collect())),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    height: u32,
    tip_hash: String,
}

async fn status(Extension(state): Extension<ApiState>) -> Result<Json<StatusResponse>, StatusCode> {
    let resolver = Arc::clone(&state.resolver);
    let result = tokio::task::spawn_blocking(move || resolver.status())
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    match result {
        Some((height, tip_hash)) => Ok(Json(StatusResponse { height, tip_hash: hex::encode(tip_hash) })),
        None => Ok(Json(StatusResponse { height: 0, tip_hash: hex::encode([0u8; 32]) })),
    }
}

async fn metrics() -> String {
    crate::metrics::gather()
}
