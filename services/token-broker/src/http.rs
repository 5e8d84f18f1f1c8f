//! HTTP surface: router, handlers, internal-key auth
//!
//! All `/internal/*` endpoints require the `X-Internal-Key` header, compared
//! in constant time. `/healthz` and `/metrics` are open.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use common::Secret;
use meli_store::BrokerStore;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use subtle::ConstantTimeEq;

use crate::broker::Broker;
use crate::error::BrokerError;

/// Shared application state accessible from all handlers
pub struct AppState<S> {
    pub broker: Arc<Broker<S>>,
    pub internal_key: Arc<Secret<String>>,
    pub prometheus: PrometheusHandle,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            broker: self.broker.clone(),
            internal_key: self.internal_key.clone(),
            prometheus: self.prometheus.clone(),
        }
    }
}

/// Build the axum router with all routes and shared state.
///
/// A concurrency limit layer caps simultaneous in-flight requests.
pub fn build_router<S: BrokerStore + 'static>(
    state: AppState<S>,
    max_connections: usize,
) -> Router {
    Router::new()
        .route("/internal/meli/oauth/init", post(init_handler::<S>))
        .route("/internal/meli/oauth/consume", post(consume_handler::<S>))
        .route("/internal/meli/token", get(token_handler::<S>))
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler::<S>))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

fn require_key(headers: &HeaderMap, expected: &Secret<String>) -> Result<(), BrokerError> {
    let provided = headers
        .get("x-internal-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let matches: bool = provided
        .as_bytes()
        .ct_eq(expected.expose().as_bytes())
        .into();
    if matches { Ok(()) } else { Err(BrokerError::Unauthorized) }
}

async fn init_handler<S: BrokerStore>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, BrokerError> {
    require_key(&headers, &state.internal_key)?;

    // internal callers sit behind a reverse proxy, so the peer address is
    // only meaningful through the forwarding header
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_owned()
    };
    let requester = format!("{} {}", header("x-forwarded-for"), header("user-agent"));

    let authorization_url = state.broker.init(Some(requester)).await?;
    Ok(Json(json!({ "authorization_url": authorization_url })))
}

#[derive(Debug, Deserialize)]
struct ConsumeRequest {
    #[serde(default)]
    code: String,
    #[serde(default)]
    state: String,
}

async fn consume_handler<S: BrokerStore>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    Json(body): Json<ConsumeRequest>,
) -> Result<impl IntoResponse, BrokerError> {
    require_key(&headers, &state.internal_key)?;
    let outcome = state.broker.consume(&body.code, &body.state).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    #[serde(default)]
    seller_id: String,
}

async fn token_handler<S: BrokerStore>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Result<impl IntoResponse, BrokerError> {
    require_key(&headers, &state.internal_key)?;
    let bundle = state.broker.token(&query.seller_id).await?;
    Ok(Json(bundle))
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

async fn metrics_handler<S: BrokerStore>(State(state): State<AppState<S>>) -> impl IntoResponse {
    state.prometheus.render()
}
