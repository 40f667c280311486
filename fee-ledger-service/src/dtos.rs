//! Request and response bodies for the HTTP API.

use crate::models::{
    BillingPeriod, ListPayersFilter, ObligationFilter, ObligationStatus, PayerKind, PaymentKind,
};
use crate::services::{KindRolloverSummary, RolloverOutcome};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// Money amounts are non-negative with at most two decimal places.
fn validate_money(value: &Decimal) -> Result<(), ValidationError> {
    if *value < Decimal::ZERO {
        return Err(money_error("amount must not be negative"));
    }
    if value.normalize().scale() > 2 {
        return Err(money_error("amount must have at most 2 decimal places"));
    }
    Ok(())
}

fn money_error(message: &'static str) -> ValidationError {
    let mut err = ValidationError::new("money");
    err.message = Some(Cow::Borrowed(message));
    err
}

// =============================================================================
// Payers
// =============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct CreatePayerRequest {
    pub kind: PayerKind,
    #[validate(length(min = 1, max = 255, message = "full_name must be 1-255 characters"))]
    pub full_name: String,
    #[validate(custom(function = "validate_money"))]
    pub base_amount: Decimal,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdatePayerRequest {
    #[validate(length(min = 1, max = 255, message = "full_name must be 1-255 characters"))]
    pub full_name: Option<String>,
    #[validate(custom(function = "validate_money"))]
    pub base_amount: Option<Decimal>,
    pub is_suspended: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListPayersQuery {
    pub kind: Option<PayerKind>,
    #[serde(default)]
    pub include_suspended: bool,
    pub page_size: Option<i32>,
    pub page_token: Option<Uuid>,
}

impl From<ListPayersQuery> for ListPayersFilter {
    fn from(q: ListPayersQuery) -> Self {
        Self {
            kind: q.kind,
            include_suspended: q.include_suspended,
            page_size: q.page_size.unwrap_or(50),
            page_token: q.page_token,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

// =============================================================================
// Periods
// =============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct OpenPeriodRequest {
    #[validate(range(min = 1970, max = 9999, message = "year must be between 1970 and 9999"))]
    pub year: i32,
    #[validate(range(min = 1, max = 12, message = "month must be between 1 and 12"))]
    pub month: i32,
}

#[derive(Debug, Serialize)]
pub struct RolloverSummary {
    pub deactivated_period_ids: Vec<Uuid>,
    pub tuition: KindRolloverSummary,
    pub salary: KindRolloverSummary,
}

#[derive(Debug, Serialize)]
pub struct OpenPeriodResponse {
    pub period: BillingPeriod,
    pub message: String,
    pub summary: RolloverSummary,
}

impl From<RolloverOutcome> for OpenPeriodResponse {
    fn from(outcome: RolloverOutcome) -> Self {
        Self {
            period: outcome.period,
            message: outcome.message,
            summary: RolloverSummary {
                deactivated_period_ids: outcome.deactivated_period_ids,
                tuition: outcome.tuition,
                salary: outcome.salary,
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DeletePeriodQuery {
    #[serde(default)]
    pub confirm_payment_history: bool,
}

#[derive(Debug, Serialize)]
pub struct DeletePeriodResponse {
    pub period: BillingPeriod,
    pub payments_deleted: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListObligationsQuery {
    pub kind: Option<PayerKind>,
    pub status: Option<ObligationStatus>,
    pub search: Option<String>,
    #[serde(default)]
    pub only_outstanding: bool,
    pub page_size: Option<i32>,
    pub page_token: Option<Uuid>,
}

impl From<ListObligationsQuery> for ObligationFilter {
    fn from(q: ListObligationsQuery) -> Self {
        let defaults = ObligationFilter::default();
        Self {
            kind: q.kind.unwrap_or(defaults.kind),
            status: q.status,
            search: q.search,
            only_outstanding: q.only_outstanding,
            page_size: q.page_size.unwrap_or(defaults.page_size),
            page_token: q.page_token,
        }
    }
}

// =============================================================================
// Payments
// =============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct ApplyPaymentRequest {
    pub payer_id: Uuid,
    /// Defaults to the active period when omitted.
    pub period_id: Option<Uuid>,
    #[validate(custom(function = "validate_money"))]
    pub amount: Decimal,
    pub kind: PaymentKind,
    #[validate(range(min = 1, message = "advance_periods must be at least 1"))]
    pub advance_periods: Option<i32>,
    #[validate(length(max = 255))]
    pub collected_by: Option<String>,
    #[validate(length(max = 2000))]
    pub note: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn money_accepts_cents_and_rejects_fractions_of_cents() {
        assert!(validate_money(&dec!(100.25)).is_ok());
        assert!(validate_money(&dec!(0)).is_ok());
        assert!(validate_money(&dec!(1.005)).is_err());
        assert!(validate_money(&dec!(-1)).is_err());
    }

    #[test]
    fn open_period_rejects_month_13() {
        let req = OpenPeriodRequest {
            year: 2026,
            month: 13,
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn create_payer_requires_name() {
        let req = CreatePayerRequest {
            kind: PayerKind::Student,
            full_name: String::new(),
            base_amount: dec!(100),
            metadata: None,
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn payment_request_parses_string_amounts() {
        let req: ApplyPaymentRequest = serde_json::from_value(serde_json::json!({
            "payer_id": Uuid::new_v4(),
            "amount": "40.00",
            "kind": "partial"
        }))
        .unwrap();
        assert_eq!(req.amount, dec!(40));
        assert_eq!(req.kind, PaymentKind::Partial);
        assert!(req.period_id.is_none());
        assert!(req.validate().is_ok());
    }

    #[test]
    fn obligation_query_defaults_to_tuition() {
        let filter = ObligationFilter::from(ListObligationsQuery::default());
        assert_eq!(filter.kind, PayerKind::Student);
        assert_eq!(filter.page_size, 50);
    }
}
