//! Request-time access gate.
//!
//! Evaluation happens in two phases. The envelope (protected-path check,
//! token presence, decode) turns every credential failure into a login
//! redirect. Once claims exist, [`ROLE_RULES`] is walked top to bottom and
//! the first rule that returns a decision wins, which keeps the precedence
//! between role short-circuits and permission checks in one place.

use serde::Serialize;
use tracing::debug;

use super::claims::{AccessClaims, TokenDecoder};
use super::permissions::{Role, DASHBOARD_READ, POS_PERMISSIONS};
use super::routes::{
    is_login, is_protected, is_under, same_path, RoutePermissionTable, DASHBOARD_ROOT,
    KITCHEN_ORDERS_PATH, LOGIN_PATH, POS_ROOT, UNAUTHORIZED_PATH,
};
use crate::error::TokenError;

/// Query parameter carrying the originally requested path to the login page.
pub const REDIRECT_PARAM: &str = "redirect";

/// Dashboard pages tried, in order, when a user may not see the root.
const FIRST_PAGE_PRIORITY: &[&str] = &[
    DASHBOARD_ROOT,
    "/dashboard/orders",
    "/dashboard/menu",
    "/dashboard/managers",
    "/dashboard/users",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "location", rename_all = "snake_case")]
pub enum RoutingDecision {
    Allow,
    #[serde(rename = "redirect")]
    RedirectTo(String),
    Deny(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    Unprotected,
    MissingToken,
    InvalidToken,
    MissingRole,
    KitchenRedirect,
    KitchenOrders,
    Admin,
    LoginRedirect,
    DashboardRead,
    FirstAccessiblePage,
    PermissionGranted,
    PermissionMissing,
    NoRequirement,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::Unprotected => "unprotected",
            DecisionReason::MissingToken => "missing_token",
            DecisionReason::InvalidToken => "invalid_token",
            DecisionReason::MissingRole => "missing_role",
            DecisionReason::KitchenRedirect => "kitchen_redirect",
            DecisionReason::KitchenOrders => "kitchen_orders",
            DecisionReason::Admin => "admin",
            DecisionReason::LoginRedirect => "login_redirect",
            DecisionReason::DashboardRead => "dashboard_read",
            DecisionReason::FirstAccessiblePage => "first_accessible_page",
            DecisionReason::PermissionGranted => "permission_granted",
            DecisionReason::PermissionMissing => "permission_missing",
            DecisionReason::NoRequirement => "no_requirement",
        }
    }
}

/// A routing decision plus the reason it was reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub routing: RoutingDecision,
    pub reason: DecisionReason,
}

impl Decision {
    fn allow(reason: DecisionReason) -> Self {
        Self {
            routing: RoutingDecision::Allow,
            reason,
        }
    }

    fn redirect(path: impl Into<String>, reason: DecisionReason) -> Self {
        Self {
            routing: RoutingDecision::RedirectTo(path.into()),
            reason,
        }
    }

    fn deny(reason: DecisionReason) -> Self {
        Self {
            routing: RoutingDecision::Deny(UNAUTHORIZED_PATH.to_string()),
            reason,
        }
    }

    pub fn is_allow(&self) -> bool {
        self.routing == RoutingDecision::Allow
    }

    /// Redirect target for redirects and denials.
    pub fn location(&self) -> Option<&str> {
        match &self.routing {
            RoutingDecision::Allow => None,
            RoutingDecision::RedirectTo(path) | RoutingDecision::Deny(path) => Some(path),
        }
    }
}

// ---------------------------------------------------------------------------
// Role rules
// ---------------------------------------------------------------------------

struct RuleContext<'a> {
    path: &'a str,
    claims: &'a AccessClaims,
    table: &'a RoutePermissionTable,
}

type Rule = fn(&RuleContext<'_>) -> Option<Decision>;

/// Evaluated in order; the first `Some` is final.
const ROLE_RULES: &[(&str, Rule)] = &[
    ("kitchen_staff", kitchen_staff_rule),
    ("admin", admin_rule),
    ("login", login_rule),
    ("dashboard_root", dashboard_root_rule),
    ("dashboard_subpath", dashboard_subpath_rule),
    ("pos", pos_rule),
    ("protected_area", permission_rule),
];

fn kitchen_staff_rule(ctx: &RuleContext<'_>) -> Option<Decision> {
    if ctx.claims.role != Role::KitchenStaff {
        return None;
    }
    if is_login(ctx.path) {
        return Some(Decision::redirect(
            KITCHEN_ORDERS_PATH,
            DecisionReason::KitchenRedirect,
        ));
    }
    if !is_under(ctx.path, DASHBOARD_ROOT) {
        return None;
    }
    if is_under(ctx.path, KITCHEN_ORDERS_PATH) {
        // Fixed destination; the table's ORDER_READ requirement is not applied.
        Some(Decision::allow(DecisionReason::KitchenOrders))
    } else {
        Some(Decision::redirect(
            KITCHEN_ORDERS_PATH,
            DecisionReason::KitchenRedirect,
        ))
    }
}

fn admin_rule(ctx: &RuleContext<'_>) -> Option<Decision> {
    if ctx.claims.role != Role::Admin {
        return None;
    }
    if is_login(ctx.path) {
        return Some(Decision::redirect(DASHBOARD_ROOT, DecisionReason::Admin));
    }
    Some(Decision::allow(DecisionReason::Admin))
}

fn login_rule(ctx: &RuleContext<'_>) -> Option<Decision> {
    if !is_login(ctx.path) {
        return None;
    }
    let target = if is_pos_manager(ctx.claims) {
        POS_ROOT
    } else {
        DASHBOARD_ROOT
    };
    Some(Decision::redirect(target, DecisionReason::LoginRedirect))
}

fn dashboard_root_rule(ctx: &RuleContext<'_>) -> Option<Decision> {
    if !same_path(ctx.path, DASHBOARD_ROOT) {
        return None;
    }
    if ctx.claims.permissions.has(DASHBOARD_READ) {
        return Some(Decision::allow(DecisionReason::DashboardRead));
    }
    match first_accessible_page(ctx.claims, ctx.table) {
        Some(page) if !same_path(page, DASHBOARD_ROOT) => Some(Decision::redirect(
            page,
            DecisionReason::FirstAccessiblePage,
        )),
        // Nothing better to offer: let the root render rather than loop.
        _ => Some(Decision::allow(DecisionReason::FirstAccessiblePage)),
    }
}

fn dashboard_subpath_rule(ctx: &RuleContext<'_>) -> Option<Decision> {
    if !is_under(ctx.path, DASHBOARD_ROOT) {
        return None;
    }
    permission_rule(ctx)
}

fn pos_rule(ctx: &RuleContext<'_>) -> Option<Decision> {
    if !is_under(ctx.path, POS_ROOT) {
        return None;
    }
    permission_rule(ctx)
}

fn permission_rule(ctx: &RuleContext<'_>) -> Option<Decision> {
    let Some(required) = ctx.table.required_for(ctx.path) else {
        return Some(Decision::allow(DecisionReason::NoRequirement));
    };
    let missing = ctx.claims.permissions.missing(required);
    if missing.is_empty() {
        return Some(Decision::allow(DecisionReason::PermissionGranted));
    }
    debug!(
        path = ctx.path,
        role = %ctx.claims.role,
        missing = ?missing,
        "missing permissions for route"
    );
    Some(Decision::deny(DecisionReason::PermissionMissing))
}

fn is_pos_manager(claims: &AccessClaims) -> bool {
    claims.role == Role::Manager && claims.permissions.has_any(POS_PERMISSIONS)
}

/// First dashboard page the claims may open, or `None` when there is none.
pub fn first_accessible_page(
    claims: &AccessClaims,
    table: &RoutePermissionTable,
) -> Option<&'static str> {
    if claims.role == Role::KitchenStaff {
        return Some(KITCHEN_ORDERS_PATH);
    }
    if is_pos_manager(claims) {
        return Some(POS_ROOT);
    }
    FIRST_PAGE_PRIORITY.iter().copied().find(|page| {
        if same_path(page, DASHBOARD_ROOT) {
            claims.permissions.has(DASHBOARD_READ)
        } else {
            table
                .required_for(page)
                .map_or(true, |required| claims.permissions.has_all(required))
        }
    })
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// Stateless gate shared by every request handler.
#[derive(Debug, Clone)]
pub struct AccessGate {
    decoder: TokenDecoder,
    table: RoutePermissionTable,
}

impl AccessGate {
    pub fn new(decoder: TokenDecoder, table: RoutePermissionTable) -> Self {
        Self { decoder, table }
    }

    pub fn table(&self) -> &RoutePermissionTable {
        &self.table
    }

    /// Decide what happens to a request for `path` carrying `token`.
    /// Never fails: every error path ends in a redirect.
    pub fn evaluate(&self, path: &str, token: Option<&str>) -> Decision {
        let login = is_login(path);
        if !login && !is_protected(path) {
            return Decision::allow(DecisionReason::Unprotected);
        }

        let token = token.map(str::trim).filter(|t| !t.is_empty());
        let Some(token) = token else {
            if login {
                return Decision::allow(DecisionReason::Unprotected);
            }
            return missing_token_redirect(path);
        };

        let claims = match self.decoder.decode(token) {
            Ok(claims) => claims,
            Err(err) => {
                let reason = match err {
                    TokenError::MissingRole => DecisionReason::MissingRole,
                    _ => DecisionReason::InvalidToken,
                };
                debug!(path, error = %err, "access token rejected");
                // The login form stays reachable; everything else fails closed.
                if login {
                    return Decision::allow(reason);
                }
                return Decision::redirect(LOGIN_PATH, reason);
            }
        };

        self.decide_for_claims(path, &claims)
    }

    /// Apply the role rules to already-decoded claims.
    pub fn decide_for_claims(&self, path: &str, claims: &AccessClaims) -> Decision {
        let ctx = RuleContext {
            path,
            claims,
            table: &self.table,
        };
        let (rule, decision) = ROLE_RULES
            .iter()
            .find_map(|(name, rule)| rule(&ctx).map(|d| (*name, d)))
            .unwrap_or(("fallthrough", Decision::allow(DecisionReason::NoRequirement)));
        debug!(
            path,
            role = %claims.role,
            rule,
            reason = decision.reason.as_str(),
            location = decision.location().unwrap_or(""),
            "gate decision"
        );
        decision
    }

    pub fn first_accessible_page(&self, claims: &AccessClaims) -> Option<&'static str> {
        first_accessible_page(claims, &self.table)
    }
}

/// Dashboard requests go to a bare login page; other areas remember where
/// the user was headed.
fn missing_token_redirect(path: &str) -> Decision {
    if is_under(path, DASHBOARD_ROOT) {
        return Decision::redirect(LOGIN_PATH, DecisionReason::MissingToken);
    }
    Decision::redirect(login_with_return_to(path), DecisionReason::MissingToken)
}

pub fn login_with_return_to(path: &str) -> String {
    match reqwest::Url::parse(&format!("http://localhost{LOGIN_PATH}")) {
        Ok(mut url) => {
            url.query_pairs_mut().append_pair(REDIRECT_PARAM, path);
            match url.query() {
                Some(query) => format!("{}?{}", url.path(), query),
                None => url.path().to_string(),
            }
        }
        Err(_) => LOGIN_PATH.to_string(),
    }
}
