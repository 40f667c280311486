//! Payment application engine.
//!
//! Applies one collection (tuition) or disbursement (salary) against a
//! payer's obligation for an explicit period. Validation runs before any
//! write; the obligation row is locked for the whole transaction so
//! concurrent payments against it serialise.

use crate::config::LedgerPolicyConfig;
use crate::models::{
    check_balance_invariants, AdvanceCredit, LineItemType, NewLineItem, Obligation,
    ObligationStatus, PayerKind, Payment, PaymentKind, PaymentLineItem,
};
use crate::services::database::{store_error, Database};
use crate::services::invariant_violation;
use crate::services::metrics::{
    record_error, record_operation_duration, record_payment, record_payment_amount,
};
use crate::services::notifications::{EventPublisher, LedgerEvent, LedgerEventName};
use crate::services::store::{self, NewObligation, NewPayment, ObligationUpdate};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use std::time::Instant;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Maximum number of fractional digits accepted in a payment amount.
pub const MAX_AMOUNT_SCALE: u32 = 2;

/// A payment to apply.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub payer_id: Uuid,
    pub period_id: Uuid,
    pub amount: Decimal,
    pub kind: PaymentKind,
    pub advance_periods: Option<i32>,
    pub collected_by: Option<String>,
    pub note: Option<String>,
}

/// Everything the caller learns from a successful payment.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentReceipt {
    pub payment: Payment,
    pub line_items: Vec<PaymentLineItem>,
    pub notice_text: String,
    pub remaining_balance: Decimal,
    pub obligation: Obligation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advance_credit: Option<AdvanceCredit>,
}

/// Shape checks that need no stored state.
pub fn validate_request(req: &PaymentRequest, max_advance_periods: i32) -> Result<(), AppError> {
    if req.amount <= Decimal::ZERO {
        return Err(AppError::bad_request("amount must be greater than zero"));
    }
    if req.amount.normalize().scale() > MAX_AMOUNT_SCALE {
        return Err(AppError::bad_request(format!(
            "amount must have at most {} decimal places",
            MAX_AMOUNT_SCALE
        )));
    }

    match (req.kind, req.advance_periods) {
        (PaymentKind::Advance, None) => Err(AppError::bad_request(
            "advance_periods is required for advance payments",
        )),
        (PaymentKind::Advance, Some(periods)) if !(1..=max_advance_periods).contains(&periods) => {
            Err(AppError::bad_request(format!(
                "advance_periods must be between 1 and {}",
                max_advance_periods
            )))
        }
        (PaymentKind::Normal | PaymentKind::Partial, Some(_)) => Err(AppError::bad_request(
            "advance_periods is only valid for advance payments",
        )),
        _ => Ok(()),
    }
}

/// Trim optional free text, mapping blank input to `None`.
pub fn clean_text(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Policy checks against the locked obligation. Advance payments bypass
/// the balance rules.
pub fn check_payment_allowed(
    obligation: &Obligation,
    kind: PaymentKind,
    amount: Decimal,
) -> Result<(), AppError> {
    if kind == PaymentKind::Advance {
        return Ok(());
    }

    if let Some(successor) = obligation.carried_forward_to {
        return Err(AppError::conflict(format!(
            "balance was carried forward to obligation {}; collect it there",
            successor
        )));
    }
    match obligation.parsed_status() {
        None => {
            return Err(AppError::InternalError(anyhow::anyhow!(
                "obligation {} has unknown status '{}'",
                obligation.obligation_id,
                obligation.status
            )))
        }
        Some(status) if status.is_settled() => {
            return Err(AppError::conflict("obligation is already paid"));
        }
        Some(_) => {}
    }

    match kind {
        PaymentKind::Normal if amount > obligation.outstanding => Err(AppError::conflict(format!(
            "amount {} exceeds outstanding balance {}",
            amount, obligation.outstanding
        ))),
        PaymentKind::Partial if amount >= obligation.outstanding => {
            Err(AppError::conflict(format!(
                "partial payment of {} must leave a balance on outstanding {}; use a normal payment to settle",
                amount, obligation.outstanding
            )))
        }
        _ => Ok(()),
    }
}

/// Balance after a normal or partial payment.
pub fn settle(obligation: &Obligation, amount: Decimal) -> ObligationUpdate {
    let amount_paid = obligation.amount_paid + amount;
    let outstanding = (obligation.total_due - amount_paid).max(Decimal::ZERO);
    let status = if outstanding.is_zero() {
        ObligationStatus::Paid
    } else {
        ObligationStatus::Partial
    };
    ObligationUpdate {
        amount_paid,
        outstanding,
        status: status.as_str().to_string(),
        advance_periods_remaining: obligation.advance_periods_remaining,
    }
}

/// Obligation state after an advance purchase. Amounts are untouched.
/// `advanced` only marks unsettled tuition; salary and settled obligations
/// keep their status.
pub fn mark_advanced(obligation: &Obligation, payer_kind: PayerKind, periods: i32) -> ObligationUpdate {
    let status = match obligation.parsed_status() {
        Some(current) if payer_kind == PayerKind::Student && !current.is_settled() => {
            ObligationStatus::Advanced.as_str().to_string()
        }
        _ => obligation.status.clone(),
    };
    ObligationUpdate {
        amount_paid: obligation.amount_paid,
        outstanding: obligation.outstanding,
        status,
        advance_periods_remaining: periods,
    }
}

/// Reporting breakdown of a payment. The base portion is paid first.
pub fn split_line_items(
    obligation: &Obligation,
    kind: PaymentKind,
    amount: Decimal,
    advance_periods: Option<i32>,
) -> Vec<NewLineItem> {
    if kind == PaymentKind::Advance {
        return vec![NewLineItem {
            item_type: LineItemType::Advance,
            amount,
            periods: advance_periods,
        }];
    }

    let base_due = (obligation.base_charge() - obligation.amount_paid).max(Decimal::ZERO);
    let base_portion = amount.min(base_due);
    let carried_portion = amount - base_portion;

    let mut items = Vec::with_capacity(2);
    if base_portion > Decimal::ZERO {
        items.push(NewLineItem {
            item_type: LineItemType::BaseFee,
            amount: base_portion,
            periods: None,
        });
    }
    if carried_portion > Decimal::ZERO {
        items.push(NewLineItem {
            item_type: LineItemType::CarriedForward,
            amount: carried_portion,
            periods: None,
        });
    }
    items
}

/// Human-readable summary stored with the payment.
pub fn notice_text(
    payer_kind: PayerKind,
    payer_name: &str,
    period_label: &str,
    kind: PaymentKind,
    amount: Decimal,
    remaining_balance: Decimal,
    advance_periods: Option<i32>,
) -> String {
    match (payer_kind, kind) {
        (PayerKind::Student, PaymentKind::Advance) => format!(
            "Advance tuition payment of {} received from {} covering {} upcoming period(s) from {}.",
            amount,
            payer_name,
            advance_periods.unwrap_or(0),
            period_label
        ),
        (PayerKind::Staff, PaymentKind::Advance) => format!(
            "Salary advance of {} paid to {} covering {} upcoming period(s) from {}.",
            amount,
            payer_name,
            advance_periods.unwrap_or(0),
            period_label
        ),
        (PayerKind::Student, _) => format!(
            "Tuition payment of {} received from {} for {}. Remaining balance: {}.",
            amount, payer_name, period_label, remaining_balance
        ),
        (PayerKind::Staff, _) => format!(
            "Salary payment of {} disbursed to {} for {}. Remaining balance: {}.",
            amount, payer_name, period_label, remaining_balance
        ),
    }
}

/// Obligation created on the fly when an advance targets a period the
/// payer has no obligation in yet.
fn lazy_obligation(payer_id: Uuid, base_amount: Decimal) -> NewObligation {
    let status = if base_amount.is_zero() {
        ObligationStatus::Paid
    } else {
        ObligationStatus::Unpaid
    };
    NewObligation {
        obligation_id: Uuid::new_v4(),
        payer_id,
        base_amount,
        carried_forward_amount: Decimal::ZERO,
        advance_applied_amount: Decimal::ZERO,
        total_due: base_amount,
        amount_paid: Decimal::ZERO,
        outstanding: base_amount,
        status: status.as_str().to_string(),
        advance_periods_remaining: 0,
    }
}

#[derive(Clone)]
pub struct PaymentEngine {
    db: Database,
    policy: LedgerPolicyConfig,
    events: EventPublisher,
}

impl PaymentEngine {
    pub fn new(db: Database, policy: LedgerPolicyConfig, events: EventPublisher) -> Self {
        Self { db, policy, events }
    }

    /// Validate and apply a payment in one transaction.
    #[instrument(
        skip(self, req),
        fields(
            payer_id = %req.payer_id,
            period_id = %req.period_id,
            kind = %req.kind,
            amount = %req.amount
        )
    )]
    pub async fn apply_payment(&self, req: PaymentRequest) -> Result<PaymentReceipt, AppError> {
        let start = Instant::now();
        let payment_kind = req.kind;

        let result = match validate_request(&req, self.policy.max_advance_periods) {
            Ok(()) => {
                match tokio::time::timeout(self.policy.transaction_timeout(), self.apply_tx(req))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(AppError::TransientStore(anyhow::anyhow!(
                        "Payment did not finish within {}ms",
                        self.policy.transaction_timeout_ms
                    ))),
                }
            }
            Err(e) => Err(e),
        };

        record_operation_duration("apply_payment", start.elapsed().as_secs_f64());

        match &result {
            Ok(receipt) => {
                let payer_kind = receipt.payment.payer_kind.as_str();
                record_payment(payer_kind, payment_kind.as_str(), "applied");
                record_payment_amount(
                    payer_kind,
                    payment_kind.as_str(),
                    receipt.payment.amount.to_f64().unwrap_or(0.0),
                );

                let mut events = vec![
                    LedgerEvent::new(LedgerEventName::PaymentCreated, &receipt.payment),
                    LedgerEvent::new(LedgerEventName::ObligationUpdated, &receipt.obligation),
                ];
                if let Some(credit) = &receipt.advance_credit {
                    events.push(LedgerEvent::new(
                        LedgerEventName::AdvanceCreditUpdated,
                        credit,
                    ));
                }
                self.events.publish(events);
            }
            Err(e) => {
                record_payment("unknown", payment_kind.as_str(), e.kind().as_str());
                record_error(e.kind().as_str(), "apply_payment");
            }
        }

        result
    }

    async fn apply_tx(&self, req: PaymentRequest) -> Result<PaymentReceipt, AppError> {
        let mut tx = self
            .db
            .begin_ledger_tx(
                self.policy.lock_timeout_ms,
                self.policy.transaction_timeout_ms,
            )
            .await?;

        let payer = store::lock_payer(&mut *tx, req.payer_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Payer {} not found", req.payer_id)))?;
        let payer_kind = payer.parsed_kind();

        if payer_kind == PayerKind::Student && payer.is_suspended {
            return Err(AppError::conflict(format!(
                "Payer {} is suspended",
                payer.payer_id
            )));
        }

        let period = store::lock_period(&mut *tx, req.period_id)
            .await?
            .ok_or_else(|| {
                AppError::not_found(format!("Billing period {} not found", req.period_id))
            })?;

        let mut obligation =
            store::lock_obligation(&mut *tx, payer_kind, payer.payer_id, period.period_id).await?;

        if obligation.is_none() && req.kind == PaymentKind::Advance {
            let row = lazy_obligation(payer.payer_id, payer.base_amount);
            let created =
                store::insert_obligation_if_absent(&mut *tx, payer_kind, period.period_id, &row)
                    .await?;
            if created {
                info!(
                    obligation_id = %row.obligation_id,
                    "Created obligation for advance payment"
                );
            }
            obligation =
                store::lock_obligation(&mut *tx, payer_kind, payer.payer_id, period.period_id)
                    .await?;
        }

        let obligation = obligation.ok_or_else(|| {
            AppError::not_found(format!(
                "No obligation for payer {} in period {}",
                payer.payer_id,
                period.label()
            ))
        })?;

        if let Err(violation) = obligation.check_invariants(payer_kind) {
            error!(
                obligation_id = %obligation.obligation_id,
                status = %obligation.status,
                total_due = %obligation.total_due,
                amount_paid = %obligation.amount_paid,
                outstanding = %obligation.outstanding,
                "Stored obligation is inconsistent"
            );
            return Err(invariant_violation(
                payer_kind,
                obligation.obligation_id,
                &violation,
            ));
        }

        check_payment_allowed(&obligation, req.kind, req.amount)?;

        let periods = req.advance_periods.unwrap_or(0);
        let update = match req.kind {
            PaymentKind::Advance => mark_advanced(&obligation, payer_kind, periods),
            PaymentKind::Normal | PaymentKind::Partial => settle(&obligation, req.amount),
        };

        if let Err(violation) = check_balance_invariants(
            payer_kind,
            obligation.total_due,
            update.amount_paid,
            update.outstanding,
            &update.status,
            update.advance_periods_remaining,
        ) {
            error!(
                obligation_id = %obligation.obligation_id,
                total_due = %obligation.total_due,
                amount_paid_before = %obligation.amount_paid,
                amount_paid_after = %update.amount_paid,
                outstanding_after = %update.outstanding,
                status_after = %update.status,
                "Payment would break obligation balance"
            );
            return Err(invariant_violation(
                payer_kind,
                obligation.obligation_id,
                &violation,
            ));
        }

        let line_items = split_line_items(&obligation, req.kind, req.amount, req.advance_periods);

        let updated =
            store::update_obligation_balance(&mut *tx, payer_kind, obligation.obligation_id, &update)
                .await?;

        let advance_credit = match req.kind {
            PaymentKind::Advance => Some(
                store::upsert_advance_credit(&mut *tx, payer.payer_id, payer.base_amount, periods)
                    .await?,
            ),
            _ => None,
        };

        let remaining_balance = match req.kind {
            PaymentKind::Advance => Decimal::ZERO,
            _ => updated.outstanding,
        };

        let notice = notice_text(
            payer_kind,
            &payer.full_name,
            &period.label(),
            req.kind,
            req.amount,
            remaining_balance,
            req.advance_periods,
        );

        let payment = store::insert_payment(
            &mut *tx,
            &NewPayment {
                payer_id: payer.payer_id,
                period_id: period.period_id,
                obligation_id: updated.obligation_id,
                payer_kind,
                amount: req.amount,
                kind: req.kind.as_str().to_string(),
                advance_periods: req.advance_periods,
                collected_by: clean_text(req.collected_by),
                note: clean_text(req.note),
                notice_text: notice.clone(),
            },
        )
        .await?;

        let line_items = store::insert_line_items(&mut *tx, payment.payment_id, &line_items).await?;

        tx.commit()
            .await
            .map_err(|e| store_error("Failed to commit payment", e))?;

        info!(
            payment_id = %payment.payment_id,
            obligation_id = %updated.obligation_id,
            status = %updated.status,
            remaining_balance = %remaining_balance,
            "Payment applied"
        );

        Ok(PaymentReceipt {
            payment,
            line_items,
            notice_text: notice,
            remaining_balance,
            obligation: updated,
            advance_credit,
        })
    }
}
