use chrono::{DateTime, Utc};
use postgres_types::{FromSql, ToSql};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Access level of a user account.
///
/// Stored in Postgres as the `user_role` enum; serialized in JSON as the
/// lowercase variant name.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSql, FromSql)]
#[postgres(name = "user_role")]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[postgres(name = "registered")]
    Registered,
    #[postgres(name = "employee")]
    Employee,
    #[postgres(name = "admin")]
    Admin,
}

impl Default for Role {
    fn default() -> Self {
        Role::Registered
    }
}

/// One catalog row, scoped to a branch.
///
/// Keyed by (branch_id, product_id). Retired products are flagged inactive,
/// never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Product {
    pub branch_id: i32,
    pub product_id: String,
    pub name: String,
    pub category: String,
    pub description: Option<String>,
    pub unit_price: f64,
    pub quantity_available: i32,
    pub is_active: bool,
}

/// Cross-branch catalog projection of a product.
///
/// Stock is omitted on purpose: the catalog aggregates over branches, so a
/// single count would be meaningless.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogEntry {
    pub product_id: String,
    pub name: String,
    pub category: String,
    pub description: Option<String>,
    pub unit_price: f64,
}

/// One placed order, append-only.
///
/// Keyed by (branch_id, order_id) where order_id is a UUIDv7, unique and
/// sortable by creation time within a branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderLine {
    pub branch_id: i32,
    pub order_id: Uuid,
    pub placed_at: DateTime<Utc>,
    pub product_name: String,
    pub category: String,
    pub quantity: i32,
    pub unit_price: f64,
    pub total: f64,
    pub username: String,
}

/// Public view of an account. The credential hash lives in
/// [`StoredUser`] and never leaves the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserAccount {
    pub username: String,
    pub full_name: Option<String>,
    pub role: Role,
    pub assigned_branch: Option<i32>,
}

/// An account plus its bcrypt credential hash, as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUser {
    pub account: UserAccount,
    pub password_hash: String,
}

/// Payload of POST /api/orders.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaceOrderRequest {
    pub branch_id: i32,
    pub product_id: String,
    pub product_name: String,
    pub category: String,
    pub quantity: i32,
    pub unit_price: f64,
    pub username: String,
    /// Optional caller-supplied timestamp; the current time is used when absent.
    #[serde(default)]
    pub placed_at: Option<DateTime<Utc>>,
}

/// Payload of POST /api/auth/login.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Payload of POST /api/auth/register.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    pub full_name: String,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub assigned_branch: Option<i32>,
}

/// Payload of the admin product creation operation.
/// The row is always created active.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewProduct {
    pub branch_id: i32,
    pub product_id: String,
    pub name: String,
    pub category: String,
    pub description: Option<String>,
    pub unit_price: f64,
    pub initial_quantity: i32,
}

/// Admin detail update of a product. Stock and the active flag are changed
/// through their own operations, not here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProductUpdate {
    pub name: String,
    pub category: String,
    pub description: Option<String>,
    pub unit_price: f64,
}

/// Admin account update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserUpdate {
    pub full_name: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub assigned_branch: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_deserialize_place_order_request() {
        let json = r#"
        {
            "branch_id": 1,
            "product_id": "P1",
            "product_name": "Latte",
            "category": "drinks",
            "quantity": 3,
            "unit_price": 2.5,
            "username": "alice",
            "placed_at": "2024-03-01T10:15:00Z"
        }
        "#;
        let req: PlaceOrderRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.branch_id, 1);
        assert_eq!(req.product_id, "P1");
        assert_eq!(req.quantity, 3);
        assert_eq!(req.unit_price, 2.5);

        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 0).unwrap();
        assert_eq!(req.placed_at, Some(expected));
    }

    #[test]
    fn test_place_order_timestamp_is_optional() {
        let json = r#"
        {
            "branch_id": 2,
            "product_id": "P9",
            "product_name": "Espresso",
            "category": "drinks",
            "quantity": 1,
            "unit_price": 1.8,
            "username": "bob"
        }
        "#;
        let req: PlaceOrderRequest = serde_json::from_str(json).unwrap();
        assert!(req.placed_at.is_none());
    }

    #[test]
    fn test_role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Admin).unwrap(), "\"admin\"");
        let role: Role = serde_json::from_str("\"employee\"").unwrap();
        assert_eq!(role, Role::Employee);
    }

    #[test]
    fn test_register_request_defaults() {
        let json = r#"{"username": "carol", "password": "secret1", "full_name": "Carol"}"#;
        let req: RegisterRequest = serde_json::from_str(json).unwrap();
        assert!(req.role.is_none());
        assert!(req.assigned_branch.is_none());
    }

    #[test]
    fn test_user_account_json_shape() {
        let account = UserAccount {
            username: "alice".into(),
            full_name: Some("Alice A".into()),
            role: Role::Employee,
            assigned_branch: Some(3),
        };
        let json = serde_json::to_value(&account).unwrap();
        assert_eq!(json["role"], "employee");
        assert_eq!(json["assigned_branch"], 3);
    }
}
