//! Payment and payment line item models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// How an incoming payment is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    /// Settles up to the full outstanding amount.
    Normal,
    /// Must leave a residual balance.
    Partial,
    /// Buys coverage for future periods.
    Advance,
}

impl PaymentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentKind::Normal => "normal",
            PaymentKind::Partial => "partial",
            PaymentKind::Advance => "advance",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(PaymentKind::Normal),
            "partial" => Some(PaymentKind::Partial),
            "advance" => Some(PaymentKind::Advance),
            _ => None,
        }
    }
}

impl std::fmt::Display for PaymentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reporting breakdown of a payment. Never affects obligation math.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineItemType {
    BaseFee,
    CarriedForward,
    Advance,
}

impl LineItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineItemType::BaseFee => "base_fee",
            LineItemType::CarriedForward => "carried_forward",
            LineItemType::Advance => "advance",
        }
    }
}

/// Immutable record of one collection (or disbursement) event.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Payment {
    pub payment_id: Uuid,
    pub payer_id: Uuid,
    pub period_id: Uuid,
    pub obligation_id: Uuid,
    pub payer_kind: String,
    pub amount: Decimal,
    pub kind: String,
    pub advance_periods: Option<i32>,
    pub collected_by: Option<String>,
    pub note: Option<String>,
    pub notice_text: String,
    pub created_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PaymentLineItem {
    pub line_item_id: Uuid,
    pub payment_id: Uuid,
    pub item_type: String,
    pub amount: Decimal,
    pub periods: Option<i32>,
    pub created_utc: DateTime<Utc>,
}

/// Line item computed before insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLineItem {
    pub item_type: LineItemType,
    pub amount: Decimal,
    pub periods: Option<i32>,
}

/// Payment with its line items, for payer history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentWithItems {
    #[serde(flatten)]
    pub payment: Payment,
    pub line_items: Vec<PaymentLineItem>,
}
