//! Roles and permission-set predicates.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub const DASHBOARD_READ: &str = "DASHBOARD_READ";
pub const ORDER_READ: &str = "ORDER_READ";
pub const MENU_READ: &str = "MENU_READ";
pub const MANAGER_READ: &str = "MANAGER_READ";
pub const MANAGER_CREATE: &str = "MANAGER_CREATE";
pub const MANAGER_UPDATE: &str = "MANAGER_UPDATE";
pub const USER_READ: &str = "USER_READ";
pub const USER_CREATE: &str = "USER_CREATE";
pub const USER_UPDATE: &str = "USER_UPDATE";
pub const INVENTORY_READ: &str = "INVENTORY_READ";
pub const ANALYTICS_READ: &str = "ANALYTICS_READ";
pub const STAFF_READ: &str = "STAFF_READ";
pub const PRINTER_READ: &str = "PRINTER_READ";
pub const POS_READ: &str = "POS_READ";
pub const POS_CREATE: &str = "POS_CREATE";

/// Permissions that mark a manager as a POS operator.
pub const POS_PERMISSIONS: &[&str] = &[POS_READ, POS_CREATE];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    Manager,
    KitchenStaff,
    Cashier,
    Waiter,
    User,
    Customer,
}

impl Role {
    /// Parse a role claim. Comparison is case-insensitive and ignores
    /// surrounding whitespace; unknown roles yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "ADMIN" => Some(Role::Admin),
            "MANAGER" => Some(Role::Manager),
            "KITCHEN_STAFF" => Some(Role::KitchenStaff),
            "CASHIER" => Some(Role::Cashier),
            "WAITER" => Some(Role::Waiter),
            "USER" => Some(Role::User),
            "CUSTOMER" => Some(Role::Customer),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "ADMIN",
            Role::Manager => "MANAGER",
            Role::KitchenStaff => "KITCHEN_STAFF",
            Role::Cashier => "CASHIER",
            Role::Waiter => "WAITER",
            Role::User => "USER",
            Role::Customer => "CUSTOMER",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of `<RESOURCE>_<ACTION>` permission strings granted by a token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet(BTreeSet<String>);

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, permission: &str) -> bool {
        self.0.contains(permission)
    }

    /// AND semantics: every listed permission must be granted. An empty
    /// requirement list is always satisfied.
    pub fn has_all<S: AsRef<str>>(&self, required: &[S]) -> bool {
        required.iter().all(|p| self.has(p.as_ref()))
    }

    /// OR semantics: at least one listed permission must be granted.
    pub fn has_any<S: AsRef<str>>(&self, candidates: &[S]) -> bool {
        candidates.iter().any(|p| self.has(p.as_ref()))
    }

    /// Required permissions not present in this set, in requirement order.
    pub fn missing<'a, S: AsRef<str>>(&self, required: &'a [S]) -> Vec<&'a str> {
        required
            .iter()
            .map(AsRef::as_ref)
            .filter(|p| !self.has(p))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parse_is_case_insensitive() {
        assert_eq!(Role::parse("kitchen_staff"), Some(Role::KitchenStaff));
        assert_eq!(Role::parse(" Admin "), Some(Role::Admin));
        assert_eq!(Role::parse("MANAGER"), Some(Role::Manager));
        assert_eq!(Role::parse("owner"), None);
        assert_eq!(Role::parse(""), None);
    }

    #[test]
    fn role_serializes_uppercase() {
        let json = serde_json::to_string(&Role::KitchenStaff).unwrap();
        assert_eq!(json, "\"KITCHEN_STAFF\"");
        assert_eq!(Role::Cashier.to_string(), "CASHIER");
    }

    #[test]
    fn has_all_requires_every_permission() {
        let set: PermissionSet = [ORDER_READ, MENU_READ].into_iter().collect();
        assert!(set.has_all(&[ORDER_READ]));
        assert!(set.has_all(&[ORDER_READ, MENU_READ]));
        assert!(!set.has_all(&[ORDER_READ, MANAGER_CREATE]));
        assert!(set.has_all::<&str>(&[]));
    }

    #[test]
    fn has_any_and_missing() {
        let set: PermissionSet = [POS_CREATE].into_iter().collect();
        assert!(set.has_any(POS_PERMISSIONS));
        assert!(!set.has_any(&[ORDER_READ]));
        assert_eq!(
            set.missing(&[POS_READ, POS_CREATE, ORDER_READ]),
            vec![POS_READ, ORDER_READ]
        );
    }
}
