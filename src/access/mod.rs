//! Access control gate for the dashboard, POS and admin areas.
//!
//! Leaves first: token decoding ([`claims`]), permission predicates
//! ([`permissions`]), the route table ([`routes`]), the decision function
//! ([`gate`]) and its HTTP adapter ([`middleware`]).

pub mod claims;
pub mod gate;
pub mod middleware;
pub mod permissions;
pub mod routes;

pub use claims::{normalize_claims, AccessClaims, TokenDecoder};
pub use gate::{first_accessible_page, AccessGate, Decision, DecisionReason, RoutingDecision};
pub use middleware::{extract_token, gate_middleware, GateState, DEFAULT_TOKEN_COOKIE};
pub use permissions::{PermissionSet, Role};
pub use routes::{RoutePermissionRule, RoutePermissionTable};
