//! Payer registry handlers.

use axum::{
    extract::State,
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use service_core::extract::{AppPath, AppQuery, ValidatedJson};
use uuid::Uuid;

use crate::{
    dtos::{CreatePayerRequest, LimitQuery, ListPayersQuery, UpdatePayerRequest},
    models::{AdvanceCredit, CreatePayer, Payer, PaymentWithItems, UpdatePayer},
    startup::AppState,
};

pub async fn create_payer(
    State(state): State<AppState>,
    ValidatedJson(payload): ValidatedJson<CreatePayerRequest>,
) -> Result<(StatusCode, Json<Payer>), AppError> {
    let input = CreatePayer {
        kind: payload.kind,
        full_name: payload.full_name.trim().to_string(),
        base_amount: payload.base_amount,
        metadata: payload.metadata,
    };
    let payer = state.db.create_payer(&input).await?;

    Ok((StatusCode::CREATED, Json(payer)))
}

pub async fn get_payer(
    State(state): State<AppState>,
    AppPath(payer_id): AppPath<Uuid>,
) -> Result<Json<Payer>, AppError> {
    let payer = state
        .db
        .get_payer(payer_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("Payer {} not found", payer_id)))?;

    Ok(Json(payer))
}

pub async fn list_payers(
    State(state): State<AppState>,
    AppQuery(query): AppQuery<ListPayersQuery>,
) -> Result<Json<Vec<Payer>>, AppError> {
    let payers = state.db.list_payers(&query.into()).await?;
    Ok(Json(payers))
}

/// Changes to `base_amount` apply from the next rollover onward.
pub async fn update_payer(
    State(state): State<AppState>,
    AppPath(payer_id): AppPath<Uuid>,
    ValidatedJson(payload): ValidatedJson<UpdatePayerRequest>,
) -> Result<Json<Payer>, AppError> {
    let input = UpdatePayer {
        full_name: payload.full_name.map(|n| n.trim().to_string()),
        base_amount: payload.base_amount,
        is_suspended: payload.is_suspended,
    };
    let payer = state
        .db
        .update_payer(payer_id, &input)
        .await?
        .ok_or_else(|| AppError::not_found(format!("Payer {} not found", payer_id)))?;

    Ok(Json(payer))
}

pub async fn list_payments(
    State(state): State<AppState>,
    AppPath(payer_id): AppPath<Uuid>,
    AppQuery(query): AppQuery<LimitQuery>,
) -> Result<Json<Vec<PaymentWithItems>>, AppError> {
    ensure_payer_exists(&state, payer_id).await?;
    let payments = state
        .db
        .list_payments(payer_id, query.limit.unwrap_or(100))
        .await?;
    Ok(Json(payments))
}

pub async fn get_advance_credit(
    State(state): State<AppState>,
    AppPath(payer_id): AppPath<Uuid>,
) -> Result<Json<AdvanceCredit>, AppError> {
    ensure_payer_exists(&state, payer_id).await?;
    let credit = state
        .db
        .get_advance_credit(payer_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("Payer {} has no advance credit", payer_id)))?;
    Ok(Json(credit))
}

async fn ensure_payer_exists(state: &AppState, payer_id: Uuid) -> Result<(), AppError> {
    state
        .db
        .get_payer(payer_id)
        .await?
        .map(|_| ())
        .ok_or_else(|| AppError::not_found(format!("Payer {} not found", payer_id)))
}
