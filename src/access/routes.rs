//! Well-known dashboard paths and the route → permission table.
//!
//! Patterns are matched segment by segment against a path prefix: the
//! pattern `/dashboard/managers` covers `/dashboard/managers/42/history`,
//! and `[id]` stands for exactly one segment. When several patterns cover
//! the same path the most specific one wins, so
//! `/dashboard/managers/edit/7` resolves against
//! `/dashboard/managers/edit/[id]` rather than the list route.

use super::permissions::*;
use crate::error::RouteTableError;

pub const LOGIN_PATH: &str = "/login";
pub const DASHBOARD_ROOT: &str = "/dashboard";
pub const KITCHEN_ORDERS_PATH: &str = "/dashboard/orders";
pub const POS_ROOT: &str = "/pos";
pub const UNAUTHORIZED_PATH: &str = "/unauthorized";
pub const ADMIN_AREA: &str = "/admin";
pub const PROFILE_AREA: &str = "/profile";
pub const MANAGERS_AREA: &str = "/managers";

/// Path prefixes whose requests must pass through the gate.
pub const PROTECTED_PREFIXES: &[&str] = &[
    DASHBOARD_ROOT,
    ADMIN_AREA,
    POS_ROOT,
    PROFILE_AREA,
    MANAGERS_AREA,
];

/// Built-in pattern → required permissions (ALL required).
const DEFAULT_RULES: &[(&str, &[&str])] = &[
    ("/dashboard/orders", &[ORDER_READ]),
    ("/dashboard/menu", &[MENU_READ]),
    ("/dashboard/managers", &[MANAGER_READ]),
    ("/dashboard/managers/create", &[MANAGER_CREATE]),
    ("/dashboard/managers/edit/[id]", &[MANAGER_UPDATE]),
    ("/dashboard/users", &[USER_READ]),
    ("/dashboard/users/create", &[USER_CREATE]),
    ("/dashboard/users/edit/[id]", &[USER_UPDATE]),
    ("/dashboard/inventory", &[INVENTORY_READ]),
    ("/dashboard/analytics", &[ANALYTICS_READ]),
    ("/dashboard/staff", &[STAFF_READ]),
    ("/dashboard/printers", &[PRINTER_READ]),
    ("/pos", &[POS_READ]),
];

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// Non-empty path segments, ignoring any query string or fragment.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    let end = path.find(|c: char| c == '?' || c == '#').unwrap_or(path.len());
    path[..end].split('/').filter(|s| !s.is_empty())
}

/// Whether `path` is `prefix` itself or lies below it, compared by segment.
pub fn is_under(path: &str, prefix: &str) -> bool {
    let mut path_segments = segments(path);
    segments(prefix).all(|p| path_segments.next() == Some(p))
}

/// Whether two paths name the same location (trailing slashes ignored).
pub fn same_path(a: &str, b: &str) -> bool {
    segments(a).eq(segments(b))
}

pub fn is_protected(path: &str) -> bool {
    PROTECTED_PREFIXES
        .iter()
        .any(|prefix| is_under(path, prefix))
}

pub fn is_login(path: &str) -> bool {
    same_path(path, LOGIN_PATH)
}

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternSegment {
    Literal(String),
    Wildcard,
}

/// One entry of the route table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePermissionRule {
    pattern: String,
    segments: Vec<PatternSegment>,
    required: Vec<String>,
}

impl RoutePermissionRule {
    pub fn new<S: Into<String>>(
        pattern: &str,
        required: impl IntoIterator<Item = S>,
    ) -> Result<Self, RouteTableError> {
        if !pattern.starts_with('/') {
            return Err(RouteTableError::InvalidPattern(pattern.to_string()));
        }
        let segments = segments(pattern)
            .map(|s| {
                if s.starts_with('[') && s.ends_with(']') && s.len() > 2 {
                    PatternSegment::Wildcard
                } else {
                    PatternSegment::Literal(s.to_string())
                }
            })
            .collect();
        Ok(Self {
            pattern: pattern.to_string(),
            segments,
            required: required.into_iter().map(Into::into).collect(),
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn required(&self) -> &[String] {
        &self.required
    }

    fn matches(&self, path: &str) -> bool {
        let mut path_segments = segments(path);
        self.segments.iter().all(|pattern| match path_segments.next() {
            Some(actual) => match pattern {
                PatternSegment::Literal(lit) => lit == actual,
                PatternSegment::Wildcard => true,
            },
            None => false,
        })
    }

    /// (segment count, literal segment count); larger is more specific.
    fn specificity(&self) -> (usize, usize) {
        let literals = self
            .segments
            .iter()
            .filter(|s| matches!(s, PatternSegment::Literal(_)))
            .count();
        (self.segments.len(), literals)
    }

    fn shape(&self) -> Vec<Option<&str>> {
        self.segments
            .iter()
            .map(|s| match s {
                PatternSegment::Literal(lit) => Some(lit.as_str()),
                PatternSegment::Wildcard => None,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// Immutable route → permission lookup table, built once at startup.
#[derive(Debug, Clone)]
pub struct RoutePermissionTable {
    rules: Vec<RoutePermissionRule>,
}

impl RoutePermissionTable {
    /// Build a table, rejecting patterns that match exactly the same paths
    /// (`/a/[id]` and `/a/[slug]` count as duplicates).
    pub fn new(rules: Vec<RoutePermissionRule>) -> Result<Self, RouteTableError> {
        for (i, rule) in rules.iter().enumerate() {
            if rules[..i].iter().any(|other| other.shape() == rule.shape()) {
                return Err(RouteTableError::DuplicatePattern(rule.pattern.clone()));
            }
        }
        Ok(Self { rules })
    }

    /// The most specific rule covering `path`, if any.
    pub fn lookup(&self, path: &str) -> Option<&RoutePermissionRule> {
        self.rules
            .iter()
            .filter(|rule| rule.matches(path))
            .max_by_key(|rule| rule.specificity())
    }

    /// Required permissions for `path`; `None` when no rule covers it.
    pub fn required_for(&self, path: &str) -> Option<&[String]> {
        self.lookup(path).map(RoutePermissionRule::required)
    }

    pub fn rules(&self) -> &[RoutePermissionRule] {
        &self.rules
    }
}

impl Default for RoutePermissionTable {
    fn default() -> Self {
        let rules = DEFAULT_RULES
            .iter()
            .filter_map(|(pattern, required)| {
                RoutePermissionRule::new(pattern, required.iter().copied()).ok()
            })
            .collect();
        Self { rules }
    }
}
