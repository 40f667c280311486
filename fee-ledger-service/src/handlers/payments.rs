//! Payment application handler.

use axum::{extract::State, http::StatusCode, Json};
use service_core::error::AppError;
use service_core::extract::ValidatedJson;

use crate::{
    dtos::ApplyPaymentRequest,
    services::{PaymentReceipt, PaymentRequest},
    startup::AppState,
};

/// Apply a payment. Without an explicit `period_id` the payment targets the
/// period that is active when the request arrives.
pub async fn apply_payment(
    State(state): State<AppState>,
    ValidatedJson(payload): ValidatedJson<ApplyPaymentRequest>,
) -> Result<(StatusCode, Json<PaymentReceipt>), AppError> {
    let period_id = match payload.period_id {
        Some(id) => id,
        None => {
            state
                .db
                .get_active_period()
                .await?
                .ok_or_else(|| AppError::not_found("No active billing period"))?
                .period_id
        }
    };

    tracing::info!(
        payer_id = %payload.payer_id,
        period_id = %period_id,
        kind = %payload.kind,
        amount = %payload.amount,
        "Applying payment"
    );

    let receipt = state
        .payments
        .apply_payment(PaymentRequest {
            payer_id: payload.payer_id,
            period_id,
            amount: payload.amount,
            kind: payload.kind,
            advance_periods: payload.advance_periods,
            collected_by: payload.collected_by,
            note: payload.note,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(receipt)))
}
