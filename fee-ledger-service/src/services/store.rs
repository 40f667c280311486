//! Transaction-scoped ledger store operations.
//!
//! Every function here runs on a connection borrowed from a caller-owned
//! transaction (`&mut *tx`). None of them commit; none of them apply
//! business rules.

use crate::models::{
    AdvanceCredit, BillingPeriod, NewLineItem, Obligation, Payer, PayerKind, Payment,
    PaymentLineItem,
};
use crate::services::database::store_error;
use crate::services::metrics::DB_QUERY_DURATION;
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::PgConnection;
use tracing::instrument;
use uuid::Uuid;

/// Advisory lock key serialising rollovers ("fee_roll" as ASCII).
pub const ROLLOVER_LOCK_KEY: i64 = 0x6665_655f_726f_6c6c;

const OBLIGATION_COLUMNS: &str = "obligation_id, payer_id, period_id, base_amount, \
    carried_forward_amount, advance_applied_amount, total_due, amount_paid, outstanding, \
    status, advance_periods_remaining, carried_forward_to, created_utc, updated_utc";

/// Obligation row to be inserted by a rollover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewObligation {
    pub obligation_id: Uuid,
    pub payer_id: Uuid,
    pub base_amount: Decimal,
    pub carried_forward_amount: Decimal,
    pub advance_applied_amount: Decimal,
    pub total_due: Decimal,
    pub amount_paid: Decimal,
    pub outstanding: Decimal,
    pub status: String,
    pub advance_periods_remaining: i32,
}

/// Balance columns rewritten by a payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObligationUpdate {
    pub amount_paid: Decimal,
    pub outstanding: Decimal,
    pub status: String,
    pub advance_periods_remaining: i32,
}

/// Payment row to be inserted.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub payer_id: Uuid,
    pub period_id: Uuid,
    pub obligation_id: Uuid,
    pub payer_kind: PayerKind,
    pub amount: Decimal,
    pub kind: String,
    pub advance_periods: Option<i32>,
    pub collected_by: Option<String>,
    pub note: Option<String>,
    pub notice_text: String,
}

// =============================================================================
// Rollover
// =============================================================================

/// Block until no other rollover holds the lock. Released at commit or
/// rollback.
#[instrument(skip(conn))]
pub async fn acquire_rollover_lock(conn: &mut PgConnection) -> Result<(), AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["acquire_rollover_lock"])
        .start_timer();

    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(ROLLOVER_LOCK_KEY)
        .execute(&mut *conn)
        .await
        .map_err(|e| store_error("Failed to acquire rollover lock", e))?;

    timer.observe_duration();
    Ok(())
}

#[instrument(skip(conn))]
pub async fn find_period_by_year_month(
    conn: &mut PgConnection,
    year: i32,
    month: i32,
) -> Result<Option<BillingPeriod>, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["find_period_by_year_month"])
        .start_timer();

    let period = sqlx::query_as::<_, BillingPeriod>(
        r#"
        SELECT period_id, year, month, is_active, created_utc
        FROM billing_periods
        WHERE year = $1 AND month = $2
        "#,
    )
    .bind(year)
    .bind(month)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| store_error("Failed to find period", e))?;

    timer.observe_duration();
    Ok(period)
}

/// Clear the active flag on every period, returning the ids that changed.
#[instrument(skip(conn))]
pub async fn deactivate_active_periods(conn: &mut PgConnection) -> Result<Vec<Uuid>, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["deactivate_active_periods"])
        .start_timer();

    let ids = sqlx::query_scalar::<_, Uuid>(
        "UPDATE billing_periods SET is_active = FALSE WHERE is_active = TRUE RETURNING period_id",
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| store_error("Failed to deactivate periods", e))?;

    timer.observe_duration();
    Ok(ids)
}

/// Insert a new active period. A duplicate (year, month) is a conflict.
#[instrument(skip(conn))]
pub async fn insert_active_period(
    conn: &mut PgConnection,
    year: i32,
    month: i32,
) -> Result<BillingPeriod, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["insert_active_period"])
        .start_timer();

    let period = sqlx::query_as::<_, BillingPeriod>(
        r#"
        INSERT INTO billing_periods (period_id, year, month, is_active)
        VALUES ($1, $2, $3, TRUE)
        RETURNING period_id, year, month, is_active, created_utc
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(year)
    .bind(month)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| match &e {
        sqlx::Error::Database(db_err)
            if db_err.is_unique_violation()
                && db_err.constraint() == Some("uq_billing_periods_year_month") =>
        {
            AppError::conflict(format!(
                "Billing period {:04}-{:02} already exists",
                year, month
            ))
        }
        _ => store_error("Failed to insert period", e),
    })?;

    timer.observe_duration();
    Ok(period)
}

/// Payers of one kind that rollovers bill, in stable id order.
#[instrument(skip(conn), fields(kind = %kind))]
pub async fn list_billable_payers(
    conn: &mut PgConnection,
    kind: PayerKind,
) -> Result<Vec<Payer>, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["list_billable_payers"])
        .start_timer();

    let payers = sqlx::query_as::<_, Payer>(
        r#"
        SELECT payer_id, kind, full_name, base_amount, is_suspended, metadata, created_utc, updated_utc
        FROM payers
        WHERE kind = $1 AND is_suspended = FALSE
        ORDER BY payer_id
        "#,
    )
    .bind(kind.as_str())
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| store_error("Failed to list billable payers", e))?;

    timer.observe_duration();
    Ok(payers)
}

/// Lock and return each payer's obligation in the latest period ordered
/// before `(year, month)`.
#[instrument(skip(conn, payer_ids), fields(kind = %kind, payers = payer_ids.len()))]
pub async fn lock_latest_obligations_before(
    conn: &mut PgConnection,
    kind: PayerKind,
    payer_ids: &[Uuid],
    year: i32,
    month: i32,
) -> Result<Vec<Obligation>, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["lock_latest_obligations_before"])
        .start_timer();

    // FOR UPDATE cannot be combined with DISTINCT ON, so the latest row per
    // payer is picked in a subquery and locked by the outer select.
    let table = kind.obligations_table();
    let sql = format!(
        r#"
        SELECT {columns}
        FROM {table}
        WHERE obligation_id IN (
            SELECT DISTINCT ON (o.payer_id) o.obligation_id
            FROM {table} o
            JOIN billing_periods p ON p.period_id = o.period_id
            WHERE o.payer_id = ANY($1)
              AND (p.year, p.month) < ($2, $3)
            ORDER BY o.payer_id, p.year DESC, p.month DESC
        )
        ORDER BY payer_id
        FOR UPDATE
        "#,
        columns = OBLIGATION_COLUMNS,
        table = table
    );

    let obligations = sqlx::query_as::<_, Obligation>(&sql)
        .bind(payer_ids)
        .bind(year)
        .bind(month)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| store_error("Failed to lock prior obligations", e))?;

    timer.observe_duration();
    Ok(obligations)
}

/// Lock and return the advance credit rows of the given payers.
#[instrument(skip(conn, payer_ids), fields(payers = payer_ids.len()))]
pub async fn lock_advance_credits(
    conn: &mut PgConnection,
    payer_ids: &[Uuid],
) -> Result<Vec<AdvanceCredit>, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["lock_advance_credits"])
        .start_timer();

    let credits = sqlx::query_as::<_, AdvanceCredit>(
        r#"
        SELECT credit_id, payer_id, amount_per_period, periods_paid, periods_remaining, created_utc, updated_utc
        FROM advance_credits
        WHERE payer_id = ANY($1)
        ORDER BY payer_id
        FOR UPDATE
        "#,
    )
    .bind(payer_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| store_error("Failed to lock advance credits", e))?;

    timer.observe_duration();
    Ok(credits)
}

/// Batch-insert obligations for a period in one statement.
#[instrument(skip(conn, rows), fields(kind = %kind, period_id = %period_id, rows = rows.len()))]
pub async fn insert_obligations(
    conn: &mut PgConnection,
    kind: PayerKind,
    period_id: Uuid,
    rows: &[NewObligation],
) -> Result<u64, AppError> {
    if rows.is_empty() {
        return Ok(0);
    }

    let timer = DB_QUERY_DURATION
        .with_label_values(&["insert_obligations"])
        .start_timer();

    let mut obligation_ids = Vec::with_capacity(rows.len());
    let mut payer_ids = Vec::with_capacity(rows.len());
    let mut base_amounts = Vec::with_capacity(rows.len());
    let mut carried = Vec::with_capacity(rows.len());
    let mut applied = Vec::with_capacity(rows.len());
    let mut total_due = Vec::with_capacity(rows.len());
    let mut amount_paid = Vec::with_capacity(rows.len());
    let mut outstanding = Vec::with_capacity(rows.len());
    let mut statuses = Vec::with_capacity(rows.len());
    let mut remaining = Vec::with_capacity(rows.len());

    for row in rows {
        obligation_ids.push(row.obligation_id);
        payer_ids.push(row.payer_id);
        base_amounts.push(row.base_amount);
        carried.push(row.carried_forward_amount);
        applied.push(row.advance_applied_amount);
        total_due.push(row.total_due);
        amount_paid.push(row.amount_paid);
        outstanding.push(row.outstanding);
        statuses.push(row.status.clone());
        remaining.push(row.advance_periods_remaining);
    }

    let sql = format!(
        r#"
        INSERT INTO {} (
            obligation_id, payer_id, period_id, base_amount, carried_forward_amount,
            advance_applied_amount, total_due, amount_paid, outstanding, status,
            advance_periods_remaining
        )
        SELECT r.obligation_id, r.payer_id, $1, r.base_amount, r.carried_forward_amount,
               r.advance_applied_amount, r.total_due, r.amount_paid, r.outstanding, r.status,
               r.advance_periods_remaining
        FROM UNNEST(
            $2::uuid[], $3::uuid[], $4::numeric[], $5::numeric[], $6::numeric[],
            $7::numeric[], $8::numeric[], $9::numeric[], $10::varchar[], $11::int4[]
        ) AS r(
            obligation_id, payer_id, base_amount, carried_forward_amount,
            advance_applied_amount, total_due, amount_paid, outstanding, status,
            advance_periods_remaining
        )
        "#,
        kind.obligations_table()
    );

    let result = sqlx::query(&sql)
        .bind(period_id)
        .bind(&obligation_ids)
        .bind(&payer_ids)
        .bind(&base_amounts)
        .bind(&carried)
        .bind(&applied)
        .bind(&total_due)
        .bind(&amount_paid)
        .bind(&outstanding)
        .bind(&statuses)
        .bind(&remaining)
        .execute(&mut *conn)
        .await
        .map_err(|e| store_error("Failed to insert obligations", e))?;

    timer.observe_duration();
    Ok(result.rows_affected())
}

/// Consume one period from each credit. Returns the number of rows
/// decremented; a credit already at zero is left untouched.
#[instrument(skip(conn, credit_ids), fields(credits = credit_ids.len()))]
pub async fn decrement_advance_credits(
    conn: &mut PgConnection,
    credit_ids: &[Uuid],
) -> Result<u64, AppError> {
    if credit_ids.is_empty() {
        return Ok(0);
    }

    let timer = DB_QUERY_DURATION
        .with_label_values(&["decrement_advance_credits"])
        .start_timer();

    let result = sqlx::query(
        r#"
        UPDATE advance_credits
        SET periods_remaining = periods_remaining - 1,
            updated_utc = NOW()
        WHERE credit_id = ANY($1) AND periods_remaining > 0
        "#,
    )
    .bind(credit_ids)
    .execute(&mut *conn)
    .await
    .map_err(|e| store_error("Failed to decrement advance credits", e))?;

    timer.observe_duration();
    Ok(result.rows_affected())
}

/// Point each prior obligation at the successor that inherited its balance.
/// An existing link is never overwritten.
#[instrument(skip(conn, links), fields(kind = %kind, links = links.len()))]
pub async fn mark_carried_forward(
    conn: &mut PgConnection,
    kind: PayerKind,
    links: &[(Uuid, Uuid)],
) -> Result<u64, AppError> {
    if links.is_empty() {
        return Ok(0);
    }

    let timer = DB_QUERY_DURATION
        .with_label_values(&["mark_carried_forward"])
        .start_timer();

    let (prior_ids, successor_ids): (Vec<Uuid>, Vec<Uuid>) = links.iter().copied().unzip();

    let sql = format!(
        r#"
        UPDATE {} o
        SET carried_forward_to = l.successor_id,
            updated_utc = NOW()
        FROM UNNEST($1::uuid[], $2::uuid[]) AS l(prior_id, successor_id)
        WHERE o.obligation_id = l.prior_id
          AND o.carried_forward_to IS NULL
        "#,
        kind.obligations_table()
    );

    let result = sqlx::query(&sql)
        .bind(&prior_ids)
        .bind(&successor_ids)
        .execute(&mut *conn)
        .await
        .map_err(|e| store_error("Failed to mark carried-forward obligations", e))?;

    timer.observe_duration();
    Ok(result.rows_affected())
}

// =============================================================================
// Payment application
// =============================================================================

/// Read a payer, holding a share lock so it cannot be suspended or
/// repriced mid-payment.
#[instrument(skip(conn), fields(payer_id = %payer_id))]
pub async fn lock_payer(
    conn: &mut PgConnection,
    payer_id: Uuid,
) -> Result<Option<Payer>, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["lock_payer"])
        .start_timer();

    let payer = sqlx::query_as::<_, Payer>(
        r#"
        SELECT payer_id, kind, full_name, base_amount, is_suspended, metadata, created_utc, updated_utc
        FROM payers
        WHERE payer_id = $1
        FOR SHARE
        "#,
    )
    .bind(payer_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| store_error("Failed to lock payer", e))?;

    timer.observe_duration();
    Ok(payer)
}

/// Read a period, holding a key-share lock so it cannot be deleted
/// mid-payment. A concurrent rollover may still deactivate it.
#[instrument(skip(conn), fields(period_id = %period_id))]
pub async fn lock_period(
    conn: &mut PgConnection,
    period_id: Uuid,
) -> Result<Option<BillingPeriod>, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["lock_period"])
        .start_timer();

    let period = sqlx::query_as::<_, BillingPeriod>(
        r#"
        SELECT period_id, year, month, is_active, created_utc
        FROM billing_periods
        WHERE period_id = $1
        FOR KEY SHARE
        "#,
    )
    .bind(period_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| store_error("Failed to lock period", e))?;

    timer.observe_duration();
    Ok(period)
}

/// Lock a payer's obligation for one period for the rest of the transaction.
#[instrument(skip(conn), fields(kind = %kind, payer_id = %payer_id, period_id = %period_id))]
pub async fn lock_obligation(
    conn: &mut PgConnection,
    kind: PayerKind,
    payer_id: Uuid,
    period_id: Uuid,
) -> Result<Option<Obligation>, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["lock_obligation"])
        .start_timer();

    let sql = format!(
        "SELECT {} FROM {} WHERE payer_id = $1 AND period_id = $2 FOR UPDATE",
        OBLIGATION_COLUMNS,
        kind.obligations_table()
    );

    let obligation = sqlx::query_as::<_, Obligation>(&sql)
        .bind(payer_id)
        .bind(period_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| store_error("Failed to lock obligation", e))?;

    timer.observe_duration();
    Ok(obligation)
}

/// Create an obligation unless one already exists for (payer, period).
/// Concurrent creators converge on a single row.
#[instrument(skip(conn, row), fields(kind = %kind, period_id = %period_id, payer_id = %row.payer_id))]
pub async fn insert_obligation_if_absent(
    conn: &mut PgConnection,
    kind: PayerKind,
    period_id: Uuid,
    row: &NewObligation,
) -> Result<bool, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["insert_obligation_if_absent"])
        .start_timer();

    let sql = format!(
        r#"
        INSERT INTO {} (
            obligation_id, payer_id, period_id, base_amount, carried_forward_amount,
            advance_applied_amount, total_due, amount_paid, outstanding, status,
            advance_periods_remaining
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (payer_id, period_id) DO NOTHING
        "#,
        kind.obligations_table()
    );

    let result = sqlx::query(&sql)
        .bind(row.obligation_id)
        .bind(row.payer_id)
        .bind(period_id)
        .bind(row.base_amount)
        .bind(row.carried_forward_amount)
        .bind(row.advance_applied_amount)
        .bind(row.total_due)
        .bind(row.amount_paid)
        .bind(row.outstanding)
        .bind(&row.status)
        .bind(row.advance_periods_remaining)
        .execute(&mut *conn)
        .await
        .map_err(|e| store_error("Failed to create obligation", e))?;

    timer.observe_duration();
    Ok(result.rows_affected() == 1)
}

#[instrument(skip(conn, update), fields(kind = %kind, obligation_id = %obligation_id))]
pub async fn update_obligation_balance(
    conn: &mut PgConnection,
    kind: PayerKind,
    obligation_id: Uuid,
    update: &ObligationUpdate,
) -> Result<Obligation, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["update_obligation_balance"])
        .start_timer();

    let sql = format!(
        r#"
        UPDATE {}
        SET amount_paid = $2,
            outstanding = $3,
            status = $4,
            advance_periods_remaining = $5,
            updated_utc = NOW()
        WHERE obligation_id = $1
        RETURNING {}
        "#,
        kind.obligations_table(),
        OBLIGATION_COLUMNS
    );

    let obligation = sqlx::query_as::<_, Obligation>(&sql)
        .bind(obligation_id)
        .bind(update.amount_paid)
        .bind(update.outstanding)
        .bind(&update.status)
        .bind(update.advance_periods_remaining)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| store_error("Failed to update obligation", e))?;

    timer.observe_duration();
    Ok(obligation)
}

/// Create the payer's credit row or add `periods` to the existing one,
/// overwriting `amount_per_period`.
#[instrument(skip(conn), fields(payer_id = %payer_id))]
pub async fn upsert_advance_credit(
    conn: &mut PgConnection,
    payer_id: Uuid,
    amount_per_period: Decimal,
    periods: i32,
) -> Result<AdvanceCredit, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["upsert_advance_credit"])
        .start_timer();

    let credit = sqlx::query_as::<_, AdvanceCredit>(
        r#"
        INSERT INTO advance_credits (credit_id, payer_id, amount_per_period, periods_paid, periods_remaining)
        VALUES ($1, $2, $3, $4, $4)
        ON CONFLICT (payer_id) DO UPDATE
        SET amount_per_period = EXCLUDED.amount_per_period,
            periods_paid = advance_credits.periods_paid + EXCLUDED.periods_paid,
            periods_remaining = advance_credits.periods_remaining + EXCLUDED.periods_remaining,
            updated_utc = NOW()
        RETURNING credit_id, payer_id, amount_per_period, periods_paid, periods_remaining, created_utc, updated_utc
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(payer_id)
    .bind(amount_per_period)
    .bind(periods)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| store_error("Failed to upsert advance credit", e))?;

    timer.observe_duration();
    Ok(credit)
}

#[instrument(skip(conn, payment), fields(payer_id = %payment.payer_id, period_id = %payment.period_id))]
pub async fn insert_payment(
    conn: &mut PgConnection,
    payment: &NewPayment,
) -> Result<Payment, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["insert_payment"])
        .start_timer();

    let row = sqlx::query_as::<_, Payment>(
        r#"
        INSERT INTO payments (
            payment_id, payer_id, period_id, obligation_id, payer_kind, amount, kind,
            advance_periods, collected_by, note, notice_text
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        RETURNING payment_id, payer_id, period_id, obligation_id, payer_kind, amount, kind,
                  advance_periods, collected_by, note, notice_text, created_utc
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(payment.payer_id)
    .bind(payment.period_id)
    .bind(payment.obligation_id)
    .bind(payment.payer_kind.as_str())
    .bind(payment.amount)
    .bind(&payment.kind)
    .bind(payment.advance_periods)
    .bind(&payment.collected_by)
    .bind(&payment.note)
    .bind(&payment.notice_text)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| store_error("Failed to insert payment", e))?;

    timer.observe_duration();
    Ok(row)
}

#[instrument(skip(conn, items), fields(payment_id = %payment_id, items = items.len()))]
pub async fn insert_line_items(
    conn: &mut PgConnection,
    payment_id: Uuid,
    items: &[NewLineItem],
) -> Result<Vec<PaymentLineItem>, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["insert_line_items"])
        .start_timer();

    let mut inserted = Vec::with_capacity(items.len());
    for item in items {
        let row = sqlx::query_as::<_, PaymentLineItem>(
            r#"
            INSERT INTO payment_line_items (line_item_id, payment_id, item_type, amount, periods)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING line_item_id, payment_id, item_type, amount, periods, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(payment_id)
        .bind(item.item_type.as_str())
        .bind(item.amount)
        .bind(item.periods)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| store_error("Failed to insert payment line item", e))?;
        inserted.push(row);
    }

    timer.observe_duration();
    Ok(inserted)
}
