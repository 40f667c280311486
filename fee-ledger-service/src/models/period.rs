//! Billing period model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Earliest and latest years accepted for a billing period.
pub const MIN_PERIOD_YEAR: i32 = 1970;
pub const MAX_PERIOD_YEAR: i32 = 9999;

/// A (year, month) billing bucket. At most one period is active.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub period_id: Uuid,
    pub year: i32,
    pub month: i32,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
}

impl BillingPeriod {
    pub fn label(&self) -> String {
        period_label(self.year, self.month)
    }
}

/// Human-readable `YYYY-MM` label.
pub fn period_label(year: i32, month: i32) -> String {
    format!("{:04}-{:02}", year, month)
}

/// Per-kind totals for one period.
#[derive(Debug, Clone, Default, FromRow, Serialize, Deserialize)]
pub struct KindTotals {
    pub obligations: i64,
    pub total_due: Decimal,
    pub amount_paid: Decimal,
    pub outstanding: Decimal,
    pub settled_count: i64,
    pub partial_count: i64,
    pub unpaid_count: i64,
    pub advance_covered_count: i64,
}

/// Collection summary for a period across both ledgers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodSummary {
    pub period: BillingPeriod,
    pub tuition: KindTotals,
    pub salary: KindTotals,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_is_zero_padded() {
        assert_eq!(period_label(2026, 3), "2026-03");
        assert_eq!(period_label(2026, 12), "2026-12");
    }
}
