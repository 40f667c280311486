//! Billing period handlers: rollover, queries and deletion.

use axum::{
    extract::State,
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use service_core::extract::{AppPath, AppQuery, ValidatedJson};
use uuid::Uuid;

use crate::{
    dtos::{
        DeletePeriodQuery, DeletePeriodResponse, LimitQuery, ListObligationsQuery,
        OpenPeriodRequest, OpenPeriodResponse,
    },
    models::{BillingPeriod, ObligationView, PeriodSummary},
    services::{LedgerEvent, LedgerEventName},
    startup::AppState,
};

pub async fn open_period(
    State(state): State<AppState>,
    ValidatedJson(payload): ValidatedJson<OpenPeriodRequest>,
) -> Result<(StatusCode, Json<OpenPeriodResponse>), AppError> {
    tracing::info!(year = payload.year, month = payload.month, "Opening billing period");

    let outcome = state
        .rollover
        .open_period(payload.year, payload.month)
        .await?;

    Ok((StatusCode::CREATED, Json(OpenPeriodResponse::from(outcome))))
}

pub async fn list_periods(
    State(state): State<AppState>,
    AppQuery(query): AppQuery<LimitQuery>,
) -> Result<Json<Vec<BillingPeriod>>, AppError> {
    let periods = state.db.list_periods(query.limit.unwrap_or(24)).await?;
    Ok(Json(periods))
}

pub async fn get_active_period(
    State(state): State<AppState>,
) -> Result<Json<BillingPeriod>, AppError> {
    let period = state
        .db
        .get_active_period()
        .await?
        .ok_or_else(|| AppError::not_found("No active billing period"))?;
    Ok(Json(period))
}

pub async fn delete_period(
    State(state): State<AppState>,
    AppPath(period_id): AppPath<Uuid>,
    AppQuery(query): AppQuery<DeletePeriodQuery>,
) -> Result<Json<DeletePeriodResponse>, AppError> {
    tracing::info!(
        period_id = %period_id,
        confirm_payment_history = query.confirm_payment_history,
        "Deleting billing period"
    );

    let (period, payments_deleted) = state
        .db
        .delete_period(period_id, query.confirm_payment_history)
        .await?;

    let response = DeletePeriodResponse {
        period,
        payments_deleted,
    };
    state
        .events
        .publish(vec![LedgerEvent::new(LedgerEventName::PeriodDeleted, &response)]);

    Ok(Json(response))
}

pub async fn list_obligations(
    State(state): State<AppState>,
    AppPath(period_id): AppPath<Uuid>,
    AppQuery(query): AppQuery<ListObligationsQuery>,
) -> Result<Json<Vec<ObligationView>>, AppError> {
    find_period(&state, period_id).await?;
    let obligations = state
        .db
        .list_obligations(period_id, &query.into())
        .await?;
    Ok(Json(obligations))
}

pub async fn get_period_summary(
    State(state): State<AppState>,
    AppPath(period_id): AppPath<Uuid>,
) -> Result<Json<PeriodSummary>, AppError> {
    let period = find_period(&state, period_id).await?;
    let summary = state.db.period_summary(period).await?;
    Ok(Json(summary))
}

async fn find_period(state: &AppState, period_id: Uuid) -> Result<BillingPeriod, AppError> {
    state
        .db
        .get_period(period_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("Billing period {} not found", period_id)))
}
