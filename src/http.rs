//! HTTP surface: health check, the access decision endpoint, and the gate
//! layer for page routes.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::access::{gate_middleware, GateState, RoutingDecision};

#[derive(Debug, Deserialize)]
pub struct DecisionQuery {
    pub path: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionBody {
    pub path: String,
    pub routing: RoutingDecision,
    pub reason: &'static str,
    pub required_permissions: Vec<String>,
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "gitSha": option_env!("BUILD_GIT_SHA").unwrap_or("unknown"),
    }))
}

/// What the gate would do for `path` with the caller's credentials.
async fn access_decision(
    State(state): State<GateState>,
    headers: HeaderMap,
    Query(query): Query<DecisionQuery>,
) -> Json<DecisionBody> {
    let decision = state.decide(&query.path, &headers);
    let required_permissions = state
        .gate()
        .table()
        .required_for(&query.path)
        .map(<[String]>::to_vec)
        .unwrap_or_default();
    Json(DecisionBody {
        path: query.path,
        routing: decision.routing,
        reason: decision.reason.as_str(),
        required_permissions,
    })
}

/// Wrap page routes in the access gate.
pub fn protect(pages: Router, state: GateState) -> Router {
    pages.layer(axum::middleware::from_fn_with_state(state, gate_middleware))
}

/// Service routes. They are not gated; the decision endpoint reports on the
/// caller's own token only.
pub fn router(state: GateState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/access/decision", get(access_decision))
        .with_state(state)
}
