//! Payer model: tuition-paying students and salaried staff.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Which side of the ledger a payer belongs to. Students owe tuition;
/// staff are owed salary. Each kind has its own obligation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayerKind {
    Student,
    Staff,
}

impl PayerKind {
    pub const ALL: [PayerKind; 2] = [PayerKind::Student, PayerKind::Staff];

    pub fn as_str(&self) -> &'static str {
        match self {
            PayerKind::Student => "student",
            PayerKind::Staff => "staff",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "student" => Some(PayerKind::Student),
            "staff" => Some(PayerKind::Staff),
            _ => None,
        }
    }

    /// Table holding this kind's per-period obligations.
    pub fn obligations_table(&self) -> &'static str {
        match self {
            PayerKind::Student => "fee_obligations",
            PayerKind::Staff => "salary_obligations",
        }
    }
}

impl std::fmt::Display for PayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A student or staff member with a fixed per-period fee or salary.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Payer {
    pub payer_id: Uuid,
    pub kind: String,
    pub full_name: String,
    pub base_amount: Decimal,
    pub is_suspended: bool,
    pub metadata: Option<serde_json::Value>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Payer {
    /// Get parsed payer kind. The schema only admits known kinds.
    pub fn parsed_kind(&self) -> PayerKind {
        PayerKind::from_string(&self.kind).unwrap_or(PayerKind::Student)
    }
}

/// Input for registering a payer.
#[derive(Debug, Clone)]
pub struct CreatePayer {
    pub kind: PayerKind,
    pub full_name: String,
    pub base_amount: Decimal,
    pub metadata: Option<serde_json::Value>,
}

/// Partial update of a payer. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default)]
pub struct UpdatePayer {
    pub full_name: Option<String>,
    pub base_amount: Option<Decimal>,
    pub is_suspended: Option<bool>,
}

/// Filter parameters for listing payers.
#[derive(Debug, Clone, Default)]
pub struct ListPayersFilter {
    pub kind: Option<PayerKind>,
    pub include_suspended: bool,
    pub page_size: i32,
    pub page_token: Option<Uuid>,
}
