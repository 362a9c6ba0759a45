//! Admin dashboard API client.
//!
//! Bearer-authenticated REST calls for the order data the realtime bridge
//! announces. The backend stays the source of truth; this client only
//! persists and reads.

use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::ApiError;

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight connectivity test.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the admin dashboard URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes and a trailing `/api` segment
pub fn normalize_admin_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn friendly_error(url: &str, err: &reqwest::Error) -> ApiError {
    let message = if err.is_connect() {
        format!("Cannot reach admin dashboard at {url}")
    } else if err.is_timeout() {
        format!("Connection to {url} timed out")
    } else if err.is_builder() {
        format!("Invalid admin dashboard URL: {url}")
    } else {
        format!("Network error communicating with {url}: {err}")
    };
    ApiError::Transport(message)
}

fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "Access token is invalid or expired".to_string(),
        403 => "Not authorized for this action".to_string(),
        404 => "Admin dashboard endpoint not found".to_string(),
        s if s >= 500 => "Admin dashboard server error".to_string(),
        _ => "Unexpected response from admin dashboard".to_string(),
    }
}

/// Build the error for a non-success response, keeping the backend's own
/// message and validation details when it sent JSON.
fn status_error(status: StatusCode, body_text: &str) -> ApiError {
    let body_text = body_text.trim();
    let message = match serde_json::from_str::<Value>(body_text) {
        Ok(body) => {
            let message = crate::value_str(&body, &["error", "message"])
                .unwrap_or_else(|| status_message(status));
            match body.get("details").or_else(|| body.get("errors")) {
                Some(details) => format!("{message}: {details}"),
                None => message,
            }
        }
        Err(_) if !body_text.is_empty() => format!("{}: {body_text}", status_message(status)),
        Err(_) => status_message(status),
    };
    ApiError::Status {
        status: status.as_u16(),
        message,
    }
}

/// Orders come back as a bare array or wrapped in `orders` / `data`.
fn orders_from_body(body: Value) -> Result<Vec<Value>, ApiError> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => {
            for key in ["orders", "data"] {
                match map.remove(key) {
                    Some(Value::Array(items)) => return Ok(items),
                    Some(nested @ Value::Object(_)) => return orders_from_body(nested),
                    _ => {}
                }
            }
            Err(ApiError::UnexpectedShape(
                "expected an orders array".to_string(),
            ))
        }
        Value::Null => Ok(Vec::new()),
        other => Err(ApiError::UnexpectedShape(format!(
            "expected an orders array, got {other}"
        ))),
    }
}

/// Single order responses may be wrapped in `order` or `data`.
fn order_from_body(body: Value) -> Value {
    match body {
        Value::Object(mut map) => {
            for key in ["order", "data"] {
                if let Some(inner @ Value::Object(_)) = map.remove(key) {
                    return inner;
                }
            }
            Value::Object(map)
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Result of a connectivity test.
#[derive(Debug, Serialize)]
pub struct ConnectivityResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct OrderQuery {
    pub branch_id: Option<String>,
    pub status: Option<String>,
}

#[derive(Clone)]
pub struct DashboardApi {
    client: Client,
    base: String,
    token: String,
}

impl DashboardApi {
    pub fn new(admin_url: &str, token: impl Into<String>) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Transport(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base: normalize_admin_url(admin_url),
            token: token.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// Base URL plus `segments`, each percent-encoded as one path segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let invalid = || ApiError::Transport(format!("Invalid admin dashboard URL: {}", self.base));
        let mut url = Url::parse(&self.base).map_err(|_| invalid())?;
        url.path_segments_mut()
            .map_err(|()| invalid())?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// An empty token sends no `Authorization` header.
    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        if self.token.is_empty() {
            req
        } else {
            req.bearer_auth(&self.token)
        }
    }

    /// Hit `/api/health` and report latency instead of failing.
    pub async fn test_connectivity(&self) -> ConnectivityResult {
        let url = match self.endpoint(&["api", "health"]) {
            Ok(url) => url,
            Err(e) => {
                return ConnectivityResult {
                    success: false,
                    latency_ms: None,
                    error: Some(e.to_string()),
                };
            }
        };
        let start = Instant::now();
        let resp = self
            .authorized(self.client.get(url).timeout(CONNECTIVITY_TIMEOUT))
            .send()
            .await;

        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                return ConnectivityResult {
                    success: false,
                    latency_ms: None,
                    error: Some(friendly_error(&self.base, &e).to_string()),
                };
            }
        };

        let latency = start.elapsed().as_millis() as u64;
        let status = resp.status();
        if status.is_success() {
            info!(latency_ms = latency, "connectivity test passed");
            ConnectivityResult {
                success: true,
                latency_ms: Some(latency),
                error: None,
            }
        } else {
            ConnectivityResult {
                success: false,
                latency_ms: Some(latency),
                error: Some(status_error(status, "").to_string()),
            }
        }
    }

    async fn request(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        let url = self.endpoint(segments)?;
        let path = url.path().to_string();
        let mut req = self.authorized(self.client.request(method.clone(), url));
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req.send().await.map_err(|e| friendly_error(&self.base, &e))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();
        debug!(method = %method, path = %path, status = status.as_u16(), "admin dashboard request");

        if !status.is_success() {
            return Err(status_error(status, &body_text));
        }
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text).map_err(|e| ApiError::InvalidJson(e.to_string()))
    }

    pub async fn fetch_orders(&self, query: &OrderQuery) -> Result<Vec<Value>, ApiError> {
        let mut params = Vec::new();
        if let Some(branch_id) = query.branch_id.as_deref() {
            params.push(("branchId", branch_id));
        }
        if let Some(status) = query.status.as_deref() {
            params.push(("status", status));
        }
        let body = self.request(Method::GET, &["api", "orders"], &params, None).await?;
        orders_from_body(body)
    }

    pub async fn fetch_order_stats(&self, branch_id: Option<&str>) -> Result<Value, ApiError> {
        let params: Vec<(&str, &str)> = branch_id.map(|b| ("branchId", b)).into_iter().collect();
        let body = self
            .request(Method::GET, &["api", "orders", "stats"], &params, None)
            .await?;
        Ok(match body {
            Value::Object(mut map) if map.get("stats").is_some_and(Value::is_object) => {
                map.remove("stats").unwrap_or(Value::Null)
            }
            other => other,
        })
    }

    pub async fn create_order(&self, order: &Value) -> Result<Value, ApiError> {
        let body = self
            .request(Method::POST, &["api", "orders"], &[], Some(order))
            .await?;
        Ok(order_from_body(body))
    }

    pub async fn update_order_status(&self, order_id: &str, status: &str) -> Result<Value, ApiError> {
        let id = order_id.trim();
        if id.is_empty() {
            return Err(ApiError::Transport("Order id is required".to_string()));
        }
        let body = self
            .request(
                Method::PATCH,
                &["api", "orders", id, "status"],
                &[],
                Some(&json!({ "status": status })),
            )
            .await?;
        Ok(order_from_body(body))
    }
}

impl std::fmt::Debug for DashboardApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DashboardApi")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test_backend {
    //! In-process stand-in for the admin dashboard.

    use axum::extract::{Path, Query};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, patch};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::net::SocketAddr;

    pub const TOKEN: &str = "backend-token";

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == format!("Bearer {TOKEN}"))
    }

    pub async fn start() -> SocketAddr {
        let app = Router::new()
            .route("/api/health", get(|| async { "ok" }))
            .route(
                "/api/orders",
                get(
                    |headers: HeaderMap, Query(q): Query<HashMap<String, String>>| async move {
                        if !authorized(&headers) {
                            return (StatusCode::UNAUTHORIZED, Json(json!({})));
                        }
                        let branch = q.get("branchId").cloned().unwrap_or_default();
                        let status = q.get("status").cloned();
                        let orders = json!([
                            { "id": "o-1", "branchId": branch, "status": status.clone().unwrap_or("pending".into()) },
                            { "id": "o-2", "branchId": branch, "status": status.unwrap_or("ready".into()) },
                        ]);
                        (StatusCode::OK, Json(json!({ "success": true, "orders": orders })))
                    },
                )
                .post(|headers: HeaderMap, Json(order): Json<Value>| async move {
                    if !authorized(&headers) {
                        return (StatusCode::UNAUTHORIZED, Json(json!({})));
                    }
                    if order.get("items").and_then(Value::as_array).map_or(true, Vec::is_empty) {
                        return (
                            StatusCode::UNPROCESSABLE_ENTITY,
                            Json(json!({ "error": "Order has no items", "details": { "items": "required" } })),
                        );
                    }
                    let mut created = order;
                    created["id"] = json!("o-new");
                    created["status"] = json!("pending");
                    (StatusCode::CREATED, Json(json!({ "success": true, "order": created })))
                }),
            )
            .route(
                "/api/orders/stats",
                get(|| async { Json(json!({ "stats": { "total": 2, "pending": 1 } })) }),
            )
            .route(
                "/api/orders/{id}/status",
                patch(|Path(id): Path<String>, Json(body): Json<Value>| async move {
                    if id == "missing" {
                        return (StatusCode::NOT_FOUND, Json(json!({})));
                    }
                    (
                        StatusCode::OK,
                        Json(json!({ "data": { "id": id, "status": body["status"] } })),
                    )
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }
}

#[cfg(test)]
mod tests {
    use super::test_backend::{self, TOKEN};
    use super::*;

    #[test]
    fn normalizes_admin_urls() {
        assert_eq!(normalize_admin_url("admin.thesmall.app/api/"), "https://admin.thesmall.app");
        assert_eq!(normalize_admin_url(" localhost:3000/ "), "http://localhost:3000");
        assert_eq!(normalize_admin_url("http://10.0.0.5:3000/api"), "http://10.0.0.5:3000");
    }

    #[test]
    fn orders_body_shapes() {
        let bare = orders_from_body(json!([{ "id": 1 }])).unwrap();
        assert_eq!(bare.len(), 1);
        let wrapped = orders_from_body(json!({ "orders": [{ "id": 1 }, { "id": 2 }] })).unwrap();
        assert_eq!(wrapped.len(), 2);
        let nested = orders_from_body(json!({ "data": { "orders": [] } })).unwrap();
        assert!(nested.is_empty());
        assert!(matches!(
            orders_from_body(json!({ "total": 3 })),
            Err(ApiError::UnexpectedShape(_))
        ));
    }

    #[test]
    fn status_errors_keep_backend_details() {
        let err = status_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"error":"Order has no items","details":{"items":"required"}}"#,
        );
        assert_eq!(
            err.to_string(),
            r#"Order has no items: {"items":"required"} (HTTP 422)"#
        );
        let err = status_error(StatusCode::UNAUTHORIZED, "");
        assert_eq!(err.to_string(), "Access token is invalid or expired (HTTP 401)");
        let err = status_error(StatusCode::BAD_GATEWAY, "upstream down");
        assert_eq!(err.to_string(), "Admin dashboard server error: upstream down (HTTP 502)");
    }

    #[tokio::test]
    async fn fetches_orders_with_filters() {
        let addr = test_backend::start().await;
        let api = DashboardApi::new(&format!("127.0.0.1:{}", addr.port()), TOKEN).unwrap();
        let orders = api
            .fetch_orders(&OrderQuery {
                branch_id: Some("branch-1".into()),
                status: Some("ready".into()),
            })
            .await
            .unwrap();
        assert_eq!(orders.len(), 2);
        assert!(orders.iter().all(|o| o["branchId"] == "branch-1" && o["status"] == "ready"));

        let stats = api.fetch_order_stats(Some("branch-1")).await.unwrap();
        assert_eq!(stats["total"], 2);
    }

    #[tokio::test]
    async fn wrong_token_maps_to_friendly_status() {
        let addr = test_backend::start().await;
        let api = DashboardApi::new(&format!("http://{addr}/api"), "stale").unwrap();
        let err = api.fetch_orders(&OrderQuery::default()).await.unwrap_err();
        match err {
            ApiError::Status { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "Access token is invalid or expired");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_and_update_unwrap_the_order() {
        let addr = test_backend::start().await;
        let api = DashboardApi::new(&format!("http://{addr}"), TOKEN).unwrap();

        let created = api
            .create_order(&json!({ "items": [{ "name": "Frappe", "qty": 1 }] }))
            .await
            .unwrap();
        assert_eq!(created["id"], "o-new");
        assert_eq!(created["items"][0]["name"], "Frappe");

        let updated = api.update_order_status("o-new", "ready").await.unwrap();
        assert_eq!(updated, json!({ "id": "o-new", "status": "ready" }));

        let err = api.update_order_status("missing", "ready").await.unwrap_err();
        assert!(matches!(err, ApiError::Status { status: 404, .. }));
        let err = api.create_order(&json!({ "items": [] })).await.unwrap_err();
        assert!(err.to_string().starts_with("Order has no items"));
    }

    #[tokio::test]
    async fn order_id_stays_one_path_segment() {
        let addr = test_backend::start().await;
        let api = DashboardApi::new(&format!("http://{addr}"), TOKEN).unwrap();
        for id in ["a/b", "o-1?status=void", "o#2", "table 4"] {
            let updated = api.update_order_status(id, "ready").await.unwrap();
            assert_eq!(updated["id"], id);
        }
    }

    #[test]
    fn endpoint_keeps_base_path() {
        let api = DashboardApi::new("https://admin.thesmall.app/tenant/", TOKEN).unwrap();
        assert_eq!(api.base_url(), "https://admin.thesmall.app/tenant");
        let url = api.endpoint(&["api", "orders", "x/y", "status"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://admin.thesmall.app/tenant/api/orders/x%2Fy/status"
        );
    }

    #[tokio::test]
    async fn anonymous_client_sends_no_bearer() {
        let addr = test_backend::start().await;
        let api = DashboardApi::new(&format!("http://{addr}"), "").unwrap();
        assert!(api.test_connectivity().await.success);
        let err = api.fetch_orders(&OrderQuery::default()).await.unwrap_err();
        assert!(matches!(err, ApiError::Status { status: 401, .. }));
    }

    #[tokio::test]
    async fn unreachable_backend_reports_connectivity_failure() {
        let addr = {
            let vacant = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            vacant.local_addr().unwrap()
        };
        let api = DashboardApi::new(&format!("http://{addr}"), TOKEN).unwrap();
        let result = api.test_connectivity().await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Cannot reach admin dashboard"));

        let live = test_backend::start().await;
        let api = DashboardApi::new(&format!("http://{live}"), TOKEN).unwrap();
        assert!(api.test_connectivity().await.success);
    }
}
