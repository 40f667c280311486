//! Advance credit model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Pre-purchased coverage for future periods. One row per payer; repeat
/// purchases add to the remaining count.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AdvanceCredit {
    pub credit_id: Uuid,
    pub payer_id: Uuid,
    pub amount_per_period: Decimal,
    pub periods_paid: i32,
    pub periods_remaining: i32,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}
