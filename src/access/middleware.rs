//! axum adapter for the access gate.
//!
//! Reads the access token from the request, asks the gate, and either
//! forwards to the inner service or answers with a redirect. Denials are
//! redirects too, to the unauthorized page, so navigation always completes.

use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use std::sync::Arc;
use tracing::warn;

use super::gate::{AccessGate, Decision, DecisionReason, RoutingDecision};

pub const DEFAULT_TOKEN_COOKIE: &str = "accessToken";

/// Shared state for [`gate_middleware`] and the decision endpoint.
#[derive(Clone)]
pub struct GateState {
    gate: Arc<AccessGate>,
    cookie_name: Arc<str>,
}

impl GateState {
    pub fn new(gate: AccessGate, cookie_name: &str) -> Self {
        Self {
            gate: Arc::new(gate),
            cookie_name: Arc::from(cookie_name),
        }
    }

    pub fn gate(&self) -> &AccessGate {
        &self.gate
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Evaluate the gate for `path` using the token carried by `headers`.
    pub fn decide(&self, path: &str, headers: &HeaderMap) -> Decision {
        let token = extract_token(headers, &self.cookie_name);
        self.gate.evaluate(path, token.as_deref())
    }
}

// ---------------------------------------------------------------------------
// Token extraction
// ---------------------------------------------------------------------------

fn cookie_token(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| name.trim() == cookie_name && !value.trim().is_empty())
        .map(|(_, value)| value.trim().to_string())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// Token from the named cookie, falling back to `Authorization: Bearer`.
/// The cookie wins when both are present.
pub fn extract_token(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    cookie_token(headers, cookie_name).or_else(|| bearer_token(headers))
}

fn clear_cookie(cookie_name: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(&format!(
        "{cookie_name}=; Path=/; Max-Age=0; HttpOnly; SameSite=Lax"
    ))
    .ok()
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Redirect response for a non-allow decision.
pub fn decision_response(decision: &Decision) -> Option<Response> {
    match &decision.routing {
        RoutingDecision::Allow => None,
        RoutingDecision::RedirectTo(location) | RoutingDecision::Deny(location) => {
            Some(Redirect::temporary(location).into_response())
        }
    }
}

pub async fn gate_middleware(
    State(state): State<GateState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let decision = state.decide(&path, request.headers());

    let mut response = match decision_response(&decision) {
        Some(redirect) => redirect,
        None => next.run(request).await,
    };

    if decision.reason == DecisionReason::InvalidToken {
        match clear_cookie(state.cookie_name()) {
            Some(value) => {
                response.headers_mut().append(SET_COOKIE, value);
            }
            None => warn!(cookie = state.cookie_name(), "cannot build cookie-clearing header"),
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::claims::test_tokens::{mint, SECRET};
    use crate::access::{RoutePermissionTable, TokenDecoder};
    use axum::body::Body;
    use axum::http::{header::LOCATION, Request as HttpRequest, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use serde_json::json;
    use tower::ServiceExt;

    fn state() -> GateState {
        GateState::new(
            AccessGate::new(TokenDecoder::hs256(SECRET), RoutePermissionTable::default()),
            DEFAULT_TOKEN_COOKIE,
        )
    }

    fn app() -> Router {
        Router::new()
            .route("/dashboard/orders", get(|| async { "orders" }))
            .route("/login", get(|| async { "login" }))
            .fallback(|| async { "page" })
            .layer(axum::middleware::from_fn_with_state(state(), gate_middleware))
    }

    async fn send(request: HttpRequest<Body>) -> Response {
        app().oneshot(request).await.expect("router response")
    }

    fn location(response: &Response) -> &str {
        response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    #[test]
    fn cookie_token_wins_over_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer header-token"));
        assert_eq!(
            extract_token(&headers, DEFAULT_TOKEN_COOKIE).as_deref(),
            Some("header-token")
        );
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; accessToken=cookie-token; lang=el"),
        );
        assert_eq!(
            extract_token(&headers, DEFAULT_TOKEN_COOKIE).as_deref(),
            Some("cookie-token")
        );
    }

    #[test]
    fn empty_or_foreign_credentials_are_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("accessToken=; other=x"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwYXNz"));
        assert_eq!(extract_token(&headers, DEFAULT_TOKEN_COOKIE), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer   lower"));
        assert_eq!(
            extract_token(&headers, DEFAULT_TOKEN_COOKIE).as_deref(),
            Some("lower")
        );
    }

    #[tokio::test]
    async fn unauthenticated_dashboard_request_redirects_to_login() {
        let response = send(
            HttpRequest::get("/dashboard/orders")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(location(&response), "/login");
    }

    #[tokio::test]
    async fn allowed_request_reaches_the_page() {
        let token = mint(json!({ "role": "CASHIER", "permissions": ["ORDER_READ"] }));
        let response = send(
            HttpRequest::get("/dashboard/orders")
                .header(AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"orders");
    }

    #[tokio::test]
    async fn missing_permission_redirects_to_unauthorized() {
        let token = mint(json!({ "role": "CASHIER", "permissions": ["ORDER_READ"] }));
        let response = send(
            HttpRequest::get("/dashboard/managers/create")
                .header(COOKIE, format!("accessToken={token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(location(&response), "/unauthorized");
    }

    #[tokio::test]
    async fn invalid_cookie_is_cleared() {
        let response = send(
            HttpRequest::get("/pos")
                .header(COOKIE, "accessToken=broken")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(location(&response), "/login");
        let cookie = response
            .headers()
            .get(SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        assert!(cookie.starts_with("accessToken=;"), "{cookie}");
        assert!(cookie.contains("Max-Age=0"));

        let response = send(
            HttpRequest::get("/login")
                .header(COOKIE, "accessToken=broken")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(SET_COOKIE).is_some());
    }

    #[tokio::test]
    async fn public_pages_pass_through() {
        let response = send(HttpRequest::get("/about").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
