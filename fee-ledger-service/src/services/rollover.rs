//! Period rollover engine.
//!
//! Opens a billing period and seeds one obligation per billable payer,
//! carrying unpaid balances forward and consuming advance credit. The whole
//! rollover is one transaction: readers see either no new period or the
//! period with every obligation in place.

use crate::config::LedgerPolicyConfig;
use crate::models::{
    check_balance_invariants, period_label, AdvanceCredit, BillingPeriod, Obligation,
    ObligationStatus, PayerKind, MAX_PERIOD_YEAR, MIN_PERIOD_YEAR,
};
use crate::services::database::Database;
use crate::services::invariant_violation;
use crate::services::metrics::{
    record_error, record_obligations_generated, record_operation_duration, record_rollover,
};
use crate::services::notifications::{EventPublisher, LedgerEvent, LedgerEventName};
use crate::services::store::{self, NewObligation};
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use sqlx::PgConnection;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// What a payer still owed on its latest prior obligation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorBalance {
    pub obligation_id: Uuid,
    pub outstanding: Decimal,
    pub advance_periods_remaining: i32,
}

impl From<&Obligation> for PriorBalance {
    /// A balance already inherited by another period is not carried again.
    fn from(o: &Obligation) -> Self {
        let outstanding = if o.carried_forward_to.is_some() {
            Decimal::ZERO
        } else {
            o.outstanding
        };
        Self {
            obligation_id: o.obligation_id,
            outstanding,
            advance_periods_remaining: o.advance_periods_remaining,
        }
    }
}

/// The payer's advance credit as seen by a rollover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenCredit {
    pub credit_id: Uuid,
    pub amount_per_period: Decimal,
    pub periods_remaining: i32,
}

impl From<&AdvanceCredit> for OpenCredit {
    fn from(c: &AdvanceCredit) -> Self {
        Self {
            credit_id: c.credit_id,
            amount_per_period: c.amount_per_period,
            periods_remaining: c.periods_remaining,
        }
    }
}

/// How much of the period's base charge advance credit paid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Coverage {
    None,
    Partial,
    Full,
}

impl Coverage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Coverage::None => "none",
            Coverage::Partial => "partial",
            Coverage::Full => "full",
        }
    }
}

/// A computed obligation plus the side effects its insertion implies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedObligation {
    pub row: NewObligation,
    pub coverage: Coverage,
    /// Credit row to decrement by one period.
    pub consumed_credit: Option<Uuid>,
    /// Prior obligation whose balance this one inherited.
    pub carried_from: Option<Uuid>,
}

/// Compute a payer's obligation for a new period.
///
/// Full advance coverage waives the base charge and does not inherit prior
/// debt; that debt stays payable on the obligation that incurred it.
/// Salary credits smaller than the base salary reduce the amount due
/// instead of waiving it.
pub fn plan_obligation(
    kind: PayerKind,
    payer_id: Uuid,
    base_amount: Decimal,
    prior: Option<&PriorBalance>,
    credit: Option<&OpenCredit>,
) -> PlannedObligation {
    let carried = prior.map(|p| p.outstanding).unwrap_or(Decimal::ZERO);
    let usable_credit = credit.filter(|c| c.periods_remaining > 0);

    let coverage = match (kind, usable_credit) {
        (PayerKind::Student, Some(_)) => Coverage::Full,
        (PayerKind::Staff, Some(c)) if c.amount_per_period >= base_amount
            && c.amount_per_period > Decimal::ZERO =>
        {
            Coverage::Full
        }
        (PayerKind::Staff, Some(c)) if c.amount_per_period > Decimal::ZERO => Coverage::Partial,
        _ => Coverage::None,
    };

    let obligation_id = Uuid::new_v4();

    match coverage {
        Coverage::Full => {
            let status = match kind {
                PayerKind::Student => ObligationStatus::Paid,
                PayerKind::Staff => ObligationStatus::AdvanceCovered,
            };
            let remaining = usable_credit
                .map(|c| c.periods_remaining - 1)
                .unwrap_or(0);
            PlannedObligation {
                row: NewObligation {
                    obligation_id,
                    payer_id,
                    base_amount,
                    carried_forward_amount: Decimal::ZERO,
                    advance_applied_amount: base_amount,
                    total_due: Decimal::ZERO,
                    amount_paid: base_amount,
                    outstanding: Decimal::ZERO,
                    status: status.as_str().to_string(),
                    advance_periods_remaining: remaining,
                },
                coverage,
                consumed_credit: usable_credit.map(|c| c.credit_id),
                carried_from: None,
            }
        }
        Coverage::Partial => {
            // Only reachable for staff with 0 < amount_per_period < base.
            let (applied, remaining, credit_id) = usable_credit
                .map(|c| (c.amount_per_period, c.periods_remaining - 1, Some(c.credit_id)))
                .unwrap_or((Decimal::ZERO, 0, None));
            let total_due = base_amount - applied + carried;
            let status = if carried > Decimal::ZERO {
                ObligationStatus::Partial
            } else {
                ObligationStatus::AdvanceApplied
            };
            PlannedObligation {
                row: NewObligation {
                    obligation_id,
                    payer_id,
                    base_amount,
                    carried_forward_amount: carried,
                    advance_applied_amount: applied,
                    total_due,
                    amount_paid: Decimal::ZERO,
                    outstanding: total_due,
                    status: status.as_str().to_string(),
                    advance_periods_remaining: remaining,
                },
                coverage,
                consumed_credit: credit_id,
                carried_from: carried_from(prior, carried),
            }
        }
        Coverage::None => {
            let total_due = base_amount + carried;
            let status = if total_due.is_zero() {
                ObligationStatus::Paid
            } else if kind == PayerKind::Staff && carried > Decimal::ZERO {
                ObligationStatus::Outstanding
            } else {
                ObligationStatus::Unpaid
            };
            let remaining = match credit {
                Some(c) => c.periods_remaining.max(0),
                None => prior.map(|p| p.advance_periods_remaining).unwrap_or(0),
            };
            PlannedObligation {
                row: NewObligation {
                    obligation_id,
                    payer_id,
                    base_amount,
                    carried_forward_amount: carried,
                    advance_applied_amount: Decimal::ZERO,
                    total_due,
                    amount_paid: Decimal::ZERO,
                    outstanding: total_due,
                    status: status.as_str().to_string(),
                    advance_periods_remaining: remaining,
                },
                coverage,
                consumed_credit: None,
                carried_from: carried_from(prior, carried),
            }
        }
    }
}

fn carried_from(prior: Option<&PriorBalance>, carried: Decimal) -> Option<Uuid> {
    prior
        .filter(|_| carried > Decimal::ZERO)
        .map(|p| p.obligation_id)
}

/// Reject (year, month) pairs outside the supported calendar.
pub fn validate_year_month(year: i32, month: i32) -> Result<(), AppError> {
    if !(1..=12).contains(&month) {
        return Err(AppError::bad_request(format!(
            "month must be between 1 and 12, got {}",
            month
        )));
    }
    if !(MIN_PERIOD_YEAR..=MAX_PERIOD_YEAR).contains(&year) {
        return Err(AppError::bad_request(format!(
            "year must be between {} and {}, got {}",
            MIN_PERIOD_YEAR, MAX_PERIOD_YEAR, year
        )));
    }
    Ok(())
}

/// Per-kind counts for one rollover.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct KindRolloverSummary {
    pub payer_kind: PayerKind,
    pub obligations_generated: u64,
    pub advance_covered: u64,
    pub advance_partial: u64,
    pub carried_forward: u64,
    pub credits_consumed: u64,
}

impl KindRolloverSummary {
    fn new(payer_kind: PayerKind) -> Self {
        Self {
            payer_kind,
            obligations_generated: 0,
            advance_covered: 0,
            advance_partial: 0,
            carried_forward: 0,
            credits_consumed: 0,
        }
    }

    fn add(&mut self, plan: &PlannedObligation) {
        self.obligations_generated += 1;
        match plan.coverage {
            Coverage::Full => self.advance_covered += 1,
            Coverage::Partial => self.advance_partial += 1,
            Coverage::None => {}
        }
        if plan.carried_from.is_some() {
            self.carried_forward += 1;
        }
        if plan.consumed_credit.is_some() {
            self.credits_consumed += 1;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RolloverOutcome {
    pub period: BillingPeriod,
    pub deactivated_period_ids: Vec<Uuid>,
    pub tuition: KindRolloverSummary,
    pub salary: KindRolloverSummary,
    pub message: String,
}

#[derive(Clone)]
pub struct RolloverEngine {
    db: Database,
    policy: LedgerPolicyConfig,
    events: EventPublisher,
}

impl RolloverEngine {
    pub fn new(db: Database, policy: LedgerPolicyConfig, events: EventPublisher) -> Self {
        Self { db, policy, events }
    }

    /// Open the (year, month) period, deactivating any active one, and
    /// generate every billable payer's obligation for it.
    #[instrument(skip(self), fields(period = %period_label(year, month)))]
    pub async fn open_period(&self, year: i32, month: i32) -> Result<RolloverOutcome, AppError> {
        let start = Instant::now();

        let result = match validate_year_month(year, month) {
            Ok(()) => match tokio::time::timeout(
                self.policy.transaction_timeout(),
                self.open_period_tx(year, month),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(AppError::TransientStore(anyhow::anyhow!(
                    "Rollover to {} did not finish within {}ms",
                    period_label(year, month),
                    self.policy.transaction_timeout_ms
                ))),
            },
            Err(e) => Err(e),
        };

        record_operation_duration("open_period", start.elapsed().as_secs_f64());

        match &result {
            Ok(outcome) => {
                record_rollover("created");
                for summary in [&outcome.tuition, &outcome.salary] {
                    let kind = summary.payer_kind.as_str();
                    let uncovered = summary.obligations_generated
                        - summary.advance_covered
                        - summary.advance_partial;
                    record_obligations_generated(kind, Coverage::Full.as_str(), summary.advance_covered);
                    record_obligations_generated(kind, Coverage::Partial.as_str(), summary.advance_partial);
                    record_obligations_generated(kind, Coverage::None.as_str(), uncovered);
                }
                self.events.publish(vec![LedgerEvent::new(
                    LedgerEventName::PeriodCreated,
                    outcome,
                )]);
            }
            Err(e) => {
                record_rollover(e.kind().as_str());
                record_error(e.kind().as_str(), "open_period");
            }
        }

        result
    }

    async fn open_period_tx(&self, year: i32, month: i32) -> Result<RolloverOutcome, AppError> {
        let mut tx = self
            .db
            .begin_ledger_tx(
                self.policy.lock_timeout_ms,
                self.policy.transaction_timeout_ms,
            )
            .await?;

        store::acquire_rollover_lock(&mut *tx).await?;

        if store::find_period_by_year_month(&mut *tx, year, month)
            .await?
            .is_some()
        {
            return Err(AppError::conflict(format!(
                "Billing period {} already exists",
                period_label(year, month)
            )));
        }

        let deactivated_period_ids = store::deactivate_active_periods(&mut *tx).await?;
        let period = store::insert_active_period(&mut *tx, year, month).await?;

        let tuition = self
            .generate_obligations(&mut *tx, PayerKind::Student, &period)
            .await?;
        let salary = self
            .generate_obligations(&mut *tx, PayerKind::Staff, &period)
            .await?;

        tx.commit()
            .await
            .map_err(|e| crate::services::database::store_error("Failed to commit rollover", e))?;

        let message = format!(
            "Billing period {} opened: {} tuition and {} salary obligations generated",
            period.label(),
            tuition.obligations_generated,
            salary.obligations_generated
        );

        info!(
            period_id = %period.period_id,
            period = %period.label(),
            deactivated = deactivated_period_ids.len(),
            tuition_obligations = tuition.obligations_generated,
            salary_obligations = salary.obligations_generated,
            credits_consumed = tuition.credits_consumed + salary.credits_consumed,
            "Billing period opened"
        );

        Ok(RolloverOutcome {
            period,
            deactivated_period_ids,
            tuition,
            salary,
            message,
        })
    }

    /// Plan and write one payer kind's obligations in bounded batches.
    #[instrument(skip(self, conn, period), fields(kind = %kind, period_id = %period.period_id))]
    async fn generate_obligations(
        &self,
        conn: &mut PgConnection,
        kind: PayerKind,
        period: &BillingPeriod,
    ) -> Result<KindRolloverSummary, AppError> {
        let payers = store::list_billable_payers(conn, kind).await?;
        let mut summary = KindRolloverSummary::new(kind);

        for chunk in payers.chunks(self.policy.rollover_batch_size) {
            let payer_ids: Vec<Uuid> = chunk.iter().map(|p| p.payer_id).collect();

            let priors: HashMap<Uuid, PriorBalance> = store::lock_latest_obligations_before(
                conn,
                kind,
                &payer_ids,
                period.year,
                period.month,
            )
            .await?
            .iter()
            .map(|o| (o.payer_id, PriorBalance::from(o)))
            .collect();

            let credits: HashMap<Uuid, OpenCredit> = store::lock_advance_credits(conn, &payer_ids)
                .await?
                .iter()
                .map(|c| (c.payer_id, OpenCredit::from(c)))
                .collect();

            let plans: Vec<PlannedObligation> = chunk
                .iter()
                .map(|payer| {
                    plan_obligation(
                        kind,
                        payer.payer_id,
                        payer.base_amount,
                        priors.get(&payer.payer_id),
                        credits.get(&payer.payer_id),
                    )
                })
                .collect();

            for plan in &plans {
                let row = &plan.row;
                check_balance_invariants(
                    kind,
                    row.total_due,
                    row.amount_paid,
                    row.outstanding,
                    &row.status,
                    row.advance_periods_remaining,
                )
                .map_err(|violation| invariant_violation(kind, row.obligation_id, &violation))?;
            }

            let rows: Vec<NewObligation> = plans.iter().map(|p| p.row.clone()).collect();
            let inserted = store::insert_obligations(conn, kind, period.period_id, &rows).await?;
            if inserted != rows.len() as u64 {
                error!(
                    kind = %kind,
                    expected = rows.len(),
                    inserted = inserted,
                    "Obligation batch insert count mismatch"
                );
                return Err(AppError::InternalError(anyhow::anyhow!(
                    "Obligation batch insert count mismatch"
                )));
            }

            let consumed: Vec<Uuid> = plans.iter().filter_map(|p| p.consumed_credit).collect();
            let decremented = store::decrement_advance_credits(conn, &consumed).await?;
            if decremented != consumed.len() as u64 {
                error!(
                    kind = %kind,
                    expected = consumed.len(),
                    decremented = decremented,
                    "Advance credit decrement count mismatch"
                );
                return Err(AppError::InternalError(anyhow::anyhow!(
                    "Advance credit decrement count mismatch"
                )));
            }

            let links: Vec<(Uuid, Uuid)> = plans
                .iter()
                .filter_map(|p| p.carried_from.map(|prior| (prior, p.row.obligation_id)))
                .collect();
            store::mark_carried_forward(conn, kind, &links).await?;

            for plan in &plans {
                summary.add(plan);
            }
        }

        Ok(summary)
    }
}
