//! Per-payer, per-period obligation model.

use super::payer::PayerKind;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Obligation status.
///
/// Tuition obligations use `unpaid`, `partial`, `paid` and `advanced`.
/// Salary obligations add `outstanding`, `advance_applied` and
/// `advance_covered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObligationStatus {
    Unpaid,
    Partial,
    Paid,
    Advanced,
    Outstanding,
    AdvanceApplied,
    AdvanceCovered,
}

impl ObligationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObligationStatus::Unpaid => "unpaid",
            ObligationStatus::Partial => "partial",
            ObligationStatus::Paid => "paid",
            ObligationStatus::Advanced => "advanced",
            ObligationStatus::Outstanding => "outstanding",
            ObligationStatus::AdvanceApplied => "advance_applied",
            ObligationStatus::AdvanceCovered => "advance_covered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unpaid" => Some(ObligationStatus::Unpaid),
            "partial" => Some(ObligationStatus::Partial),
            "paid" => Some(ObligationStatus::Paid),
            "advanced" => Some(ObligationStatus::Advanced),
            "outstanding" => Some(ObligationStatus::Outstanding),
            "advance_applied" => Some(ObligationStatus::AdvanceApplied),
            "advance_covered" => Some(ObligationStatus::AdvanceCovered),
            _ => None,
        }
    }

    /// Nothing left to collect: fully paid or waived by advance credit.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ObligationStatus::Paid | ObligationStatus::AdvanceCovered
        )
    }

    /// Whether this status may appear on the given payer kind's ledger.
    pub fn allowed_for(&self, kind: PayerKind) -> bool {
        match kind {
            PayerKind::Student => matches!(
                self,
                ObligationStatus::Unpaid
                    | ObligationStatus::Partial
                    | ObligationStatus::Paid
                    | ObligationStatus::Advanced
            ),
            PayerKind::Staff => !matches!(self, ObligationStatus::Advanced),
        }
    }
}

impl std::fmt::Display for ObligationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a payer owes (or is owed) for one period and what has been settled.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Obligation {
    pub obligation_id: Uuid,
    pub payer_id: Uuid,
    pub period_id: Uuid,
    pub base_amount: Decimal,
    pub carried_forward_amount: Decimal,
    pub advance_applied_amount: Decimal,
    pub total_due: Decimal,
    pub amount_paid: Decimal,
    pub outstanding: Decimal,
    pub status: String,
    pub advance_periods_remaining: i32,
    pub carried_forward_to: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Obligation {
    /// `None` when the stored status is not one this ledger writes.
    pub fn parsed_status(&self) -> Option<ObligationStatus> {
        ObligationStatus::parse(&self.status)
    }

    /// Portion of `total_due` that is this period's own charge rather than
    /// inherited debt.
    pub fn base_charge(&self) -> Decimal {
        (self.total_due - self.carried_forward_amount).max(Decimal::ZERO)
    }

    /// Check the balance invariants for an obligation on `kind`'s ledger.
    pub fn check_invariants(&self, kind: PayerKind) -> Result<(), String> {
        check_balance_invariants(
            kind,
            self.total_due,
            self.amount_paid,
            self.outstanding,
            &self.status,
            self.advance_periods_remaining,
        )
    }
}

/// `outstanding = max(0, total_due - amount_paid)`, no negative amounts,
/// and a settled status iff nothing is outstanding.
pub fn check_balance_invariants(
    kind: PayerKind,
    total_due: Decimal,
    amount_paid: Decimal,
    outstanding: Decimal,
    status: &str,
    advance_periods_remaining: i32,
) -> Result<(), String> {
    let parsed = ObligationStatus::parse(status)
        .ok_or_else(|| format!("unknown obligation status '{}'", status))?;

    if !parsed.allowed_for(kind) {
        return Err(format!("status '{}' is not valid for {} ledger", status, kind));
    }
    if total_due < Decimal::ZERO || amount_paid < Decimal::ZERO || outstanding < Decimal::ZERO {
        return Err(format!(
            "negative amount: total_due={}, amount_paid={}, outstanding={}",
            total_due, amount_paid, outstanding
        ));
    }
    if advance_periods_remaining < 0 {
        return Err(format!(
            "negative advance_periods_remaining={}",
            advance_periods_remaining
        ));
    }

    let expected = (total_due - amount_paid).max(Decimal::ZERO);
    if outstanding != expected {
        return Err(format!(
            "outstanding {} != max(0, total_due {} - amount_paid {})",
            outstanding, total_due, amount_paid
        ));
    }
    if parsed.is_settled() != outstanding.is_zero() {
        return Err(format!(
            "status '{}' inconsistent with outstanding {}",
            status, outstanding
        ));
    }

    Ok(())
}

/// Obligation joined with the payer's display fields, for listings.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ObligationView {
    pub obligation_id: Uuid,
    pub payer_id: Uuid,
    pub period_id: Uuid,
    pub full_name: String,
    pub base_amount: Decimal,
    pub carried_forward_amount: Decimal,
    pub advance_applied_amount: Decimal,
    pub total_due: Decimal,
    pub amount_paid: Decimal,
    pub outstanding: Decimal,
    pub status: String,
    pub advance_periods_remaining: i32,
    pub carried_forward_to: Option<Uuid>,
    pub updated_utc: DateTime<Utc>,
}

/// Filter parameters for listing a period's obligations.
#[derive(Debug, Clone)]
pub struct ObligationFilter {
    pub kind: PayerKind,
    pub status: Option<ObligationStatus>,
    pub search: Option<String>,
    pub only_outstanding: bool,
    pub page_size: i32,
    pub page_token: Option<Uuid>,
}

impl Default for ObligationFilter {
    fn default() -> Self {
        Self {
            kind: PayerKind::Student,
            status: None,
            search: None,
            only_outstanding: false,
            page_size: 50,
            page_token: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn settled_statuses() {
        assert!(ObligationStatus::Paid.is_settled());
        assert!(ObligationStatus::AdvanceCovered.is_settled());
        assert!(!ObligationStatus::Advanced.is_settled());
        assert!(!ObligationStatus::Partial.is_settled());
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            ObligationStatus::Unpaid,
            ObligationStatus::Partial,
            ObligationStatus::Paid,
            ObligationStatus::Advanced,
            ObligationStatus::Outstanding,
            ObligationStatus::AdvanceApplied,
            ObligationStatus::AdvanceCovered,
        ] {
            assert_eq!(ObligationStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ObligationStatus::parse("bogus"), None);
    }

    #[test]
    fn invariants_accept_consistent_partial() {
        assert!(check_balance_invariants(
            PayerKind::Student,
            dec!(100),
            dec!(40),
            dec!(60),
            "partial",
            0
        )
        .is_ok());
    }

    #[test]
    fn invariants_reject_paid_with_balance() {
        let err = check_balance_invariants(
            PayerKind::Student,
            dec!(100),
            dec!(40),
            dec!(60),
            "paid",
            0,
        )
        .unwrap_err();
        assert!(err.contains("inconsistent"));
    }

    #[test]
    fn invariants_reject_wrong_outstanding() {
        let err = check_balance_invariants(
            PayerKind::Student,
            dec!(100),
            dec!(40),
            dec!(50),
            "partial",
            0,
        )
        .unwrap_err();
        assert!(err.contains("outstanding"));
    }

    #[test]
    fn invariants_reject_salary_status_on_tuition() {
        assert!(check_balance_invariants(
            PayerKind::Student,
            dec!(0),
            dec!(100),
            dec!(0),
            "advance_covered",
            2
        )
        .is_err());
        assert!(check_balance_invariants(
            PayerKind::Staff,
            dec!(0),
            dec!(100),
            dec!(0),
            "advance_covered",
            2
        )
        .is_ok());
    }

    #[test]
    fn overpaid_clamps_outstanding_to_zero() {
        assert!(check_balance_invariants(
            PayerKind::Student,
            dec!(0),
            dec!(100),
            dec!(0),
            "paid",
            1
        )
        .is_ok());
    }
}
