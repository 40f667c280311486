//! Database service for fee-ledger-service.

use crate::models::{
    AdvanceCredit, BillingPeriod, CreatePayer, KindTotals, ListPayersFilter, ObligationFilter,
    ObligationView, Payer, PayerKind, PaymentLineItem, PaymentWithItems, Payment, PeriodSummary,
    UpdatePayer,
};
use crate::services::metrics::DB_QUERY_DURATION;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Transaction};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// SQLSTATE codes that indicate the operation may succeed if retried:
/// serialization_failure, deadlock_detected, lock_not_available and
/// query_canceled (statement_timeout).
const TRANSIENT_SQLSTATES: [&str; 4] = ["40001", "40P01", "55P03", "57014"];

/// Whether a store error is worth retrying from scratch.
pub fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err
            .code()
            .map(|code| TRANSIENT_SQLSTATES.contains(&code.as_ref()))
            .unwrap_or(false),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => true,
        _ => false,
    }
}

/// Classify a store error into a transient or opaque database failure.
pub fn store_error(context: &str, err: sqlx::Error) -> AppError {
    if is_transient(&err) {
        AppError::TransientStore(anyhow::anyhow!("{}: {}", context, err))
    } else {
        AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, err))
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "fee-ledger-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| store_error("Health check failed", e))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Begin a ledger transaction with bounded lock waits and statement
    /// time. Dropping the transaction without commit rolls it back.
    pub async fn begin_ledger_tx(
        &self,
        lock_timeout_ms: u64,
        statement_timeout_ms: u64,
    ) -> Result<Transaction<'static, Postgres>, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| store_error("Failed to begin transaction", e))?;

        // SET LOCAL does not accept bind parameters; both values are integers.
        let lock_timeout = format!("SET LOCAL lock_timeout = '{}ms'", lock_timeout_ms);
        sqlx::query(&lock_timeout)
            .execute(&mut *tx)
            .await
            .map_err(|e| store_error("Failed to set lock timeout", e))?;

        let statement_timeout =
            format!("SET LOCAL statement_timeout = '{}ms'", statement_timeout_ms);
        sqlx::query(&statement_timeout)
            .execute(&mut *tx)
            .await
            .map_err(|e| store_error("Failed to set statement timeout", e))?;

        Ok(tx)
    }

    // =========================================================================
    // Payer Operations
    // =========================================================================

    /// Register a payer.
    #[instrument(skip(self, input), fields(kind = %input.kind))]
    pub async fn create_payer(&self, input: &CreatePayer) -> Result<Payer, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_payer"])
            .start_timer();

        let payer = sqlx::query_as::<_, Payer>(
            r#"
            INSERT INTO payers (payer_id, kind, full_name, base_amount, metadata)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING payer_id, kind, full_name, base_amount, is_suspended, metadata, created_utc, updated_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.kind.as_str())
        .bind(&input.full_name)
        .bind(input.base_amount)
        .bind(&input.metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| store_error("Failed to create payer", e))?;

        timer.observe_duration();
        info!(payer_id = %payer.payer_id, kind = %payer.kind, "Payer created");

        Ok(payer)
    }

    /// Get a payer by ID.
    #[instrument(skip(self), fields(payer_id = %payer_id))]
    pub async fn get_payer(&self, payer_id: Uuid) -> Result<Option<Payer>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_payer"])
            .start_timer();

        let payer = sqlx::query_as::<_, Payer>(
            r#"
            SELECT payer_id, kind, full_name, base_amount, is_suspended, metadata, created_utc, updated_utc
            FROM payers
            WHERE payer_id = $1
            "#,
        )
        .bind(payer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error("Failed to get payer", e))?;

        timer.observe_duration();

        Ok(payer)
    }

    /// List payers, optionally restricted to one kind.
    #[instrument(skip(self, filter))]
    pub async fn list_payers(&self, filter: &ListPayersFilter) -> Result<Vec<Payer>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_payers"])
            .start_timer();

        let limit = filter.page_size.clamp(1, 200) as i64;

        let mut query = QueryBuilder::<Postgres>::new(
            "SELECT payer_id, kind, full_name, base_amount, is_suspended, metadata, created_utc, updated_utc FROM payers WHERE TRUE",
        );
        if let Some(kind) = filter.kind {
            query.push(" AND kind = ").push_bind(kind.as_str());
        }
        if !filter.include_suspended {
            query.push(" AND is_suspended = FALSE");
        }
        if let Some(cursor) = filter.page_token {
            query.push(" AND payer_id > ").push_bind(cursor);
        }
        query.push(" ORDER BY payer_id LIMIT ").push_bind(limit);

        let payers = query
            .build_query_as::<Payer>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| store_error("Failed to list payers", e))?;

        timer.observe_duration();

        Ok(payers)
    }

    /// Update a payer's name, base amount or suspension flag.
    #[instrument(skip(self, input), fields(payer_id = %payer_id))]
    pub async fn update_payer(
        &self,
        payer_id: Uuid,
        input: &UpdatePayer,
    ) -> Result<Option<Payer>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_payer"])
            .start_timer();

        let payer = sqlx::query_as::<_, Payer>(
            r#"
            UPDATE payers
            SET full_name = COALESCE($2, full_name),
                base_amount = COALESCE($3, base_amount),
                is_suspended = COALESCE($4, is_suspended),
                updated_utc = NOW()
            WHERE payer_id = $1
            RETURNING payer_id, kind, full_name, base_amount, is_suspended, metadata, created_utc, updated_utc
            "#,
        )
        .bind(payer_id)
        .bind(&input.full_name)
        .bind(input.base_amount)
        .bind(input.is_suspended)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error("Failed to update payer", e))?;

        timer.observe_duration();

        if let Some(ref p) = payer {
            info!(
                payer_id = %p.payer_id,
                is_suspended = p.is_suspended,
                base_amount = %p.base_amount,
                "Payer updated"
            );
        }

        Ok(payer)
    }

    // =========================================================================
    // Period Operations
    // =========================================================================

    /// Get a billing period by ID.
    #[instrument(skip(self), fields(period_id = %period_id))]
    pub async fn get_period(&self, period_id: Uuid) -> Result<Option<BillingPeriod>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_period"])
            .start_timer();

        let period = sqlx::query_as::<_, BillingPeriod>(
            r#"
            SELECT period_id, year, month, is_active, created_utc
            FROM billing_periods
            WHERE period_id = $1
            "#,
        )
        .bind(period_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error("Failed to get period", e))?;

        timer.observe_duration();

        Ok(period)
    }

    /// Get the currently active period. Only the API boundary should need
    /// this; ledger operations take an explicit period id.
    #[instrument(skip(self))]
    pub async fn get_active_period(&self) -> Result<Option<BillingPeriod>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_active_period"])
            .start_timer();

        let period = sqlx::query_as::<_, BillingPeriod>(
            r#"
            SELECT period_id, year, month, is_active, created_utc
            FROM billing_periods
            WHERE is_active = TRUE
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error("Failed to get active period", e))?;

        timer.observe_duration();

        Ok(period)
    }

    /// List periods, newest first.
    #[instrument(skip(self))]
    pub async fn list_periods(&self, limit: i64) -> Result<Vec<BillingPeriod>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_periods"])
            .start_timer();

        let periods = sqlx::query_as::<_, BillingPeriod>(
            r#"
            SELECT period_id, year, month, is_active, created_utc
            FROM billing_periods
            ORDER BY year DESC, month DESC
            LIMIT $1
            "#,
        )
        .bind(limit.clamp(1, 240))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_error("Failed to list periods", e))?;

        timer.observe_duration();

        Ok(periods)
    }

    /// Delete an inactive period, cascading to its obligations, payments and
    /// line items. Refuses to drop payment history unless confirmed.
    #[instrument(skip(self), fields(period_id = %period_id))]
    pub async fn delete_period(
        &self,
        period_id: Uuid,
        confirm_payment_history: bool,
    ) -> Result<(BillingPeriod, i64), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_period"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| store_error("Failed to begin transaction", e))?;

        let period = sqlx::query_as::<_, BillingPeriod>(
            r#"
            SELECT period_id, year, month, is_active, created_utc
            FROM billing_periods
            WHERE period_id = $1
            FOR UPDATE
            "#,
        )
        .bind(period_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| store_error("Failed to lock period", e))?
        .ok_or_else(|| AppError::not_found("Billing period not found"))?;

        if period.is_active {
            return Err(AppError::conflict(format!(
                "Billing period {} is active and cannot be deleted",
                period.label()
            )));
        }

        let payment_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM payments WHERE period_id = $1")
                .bind(period_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| store_error("Failed to count payments", e))?;

        if payment_count > 0 && !confirm_payment_history {
            return Err(AppError::conflict(format!(
                "Billing period {} has {} recorded payments; confirm_payment_history is required to delete it",
                period.label(),
                payment_count
            )));
        }

        sqlx::query("DELETE FROM billing_periods WHERE period_id = $1")
            .bind(period_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| store_error("Failed to delete period", e))?;

        tx.commit()
            .await
            .map_err(|e| store_error("Failed to commit transaction", e))?;

        timer.observe_duration();
        info!(period = %period.label(), payments_deleted = payment_count, "Billing period deleted");

        Ok((period, payment_count))
    }

    // =========================================================================
    // Query Operations
    // =========================================================================

    /// List a period's obligations for one payer kind.
    #[instrument(skip(self, filter), fields(period_id = %period_id, kind = %filter.kind))]
    pub async fn list_obligations(
        &self,
        period_id: Uuid,
        filter: &ObligationFilter,
    ) -> Result<Vec<ObligationView>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_obligations"])
            .start_timer();

        let limit = filter.page_size.clamp(1, 500) as i64;

        let mut query = QueryBuilder::<Postgres>::new(format!(
            r#"SELECT o.obligation_id, o.payer_id, o.period_id, p.full_name, o.base_amount,
                o.carried_forward_amount, o.advance_applied_amount, o.total_due, o.amount_paid,
                o.outstanding, o.status, o.advance_periods_remaining, o.carried_forward_to,
                o.updated_utc
            FROM {} o
            JOIN payers p ON p.payer_id = o.payer_id
            WHERE o.period_id = "#,
            filter.kind.obligations_table()
        ));
        query.push_bind(period_id);

        if let Some(status) = filter.status {
            query.push(" AND o.status = ").push_bind(status.as_str());
        }
        if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            query
                .push(" AND p.full_name ILIKE ")
                .push_bind(format!("%{}%", escape_like(search)));
        }
        if filter.only_outstanding {
            query.push(" AND o.outstanding > 0");
        }
        if let Some(cursor) = filter.page_token {
            query.push(" AND o.obligation_id > ").push_bind(cursor);
        }
        query.push(" ORDER BY o.obligation_id LIMIT ").push_bind(limit);

        let obligations = query
            .build_query_as::<ObligationView>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| store_error("Failed to list obligations", e))?;

        timer.observe_duration();

        Ok(obligations)
    }

    /// Totals per payer kind for one period.
    #[instrument(skip(self), fields(period_id = %period.period_id))]
    pub async fn period_summary(&self, period: BillingPeriod) -> Result<PeriodSummary, AppError> {
        let tuition = self.kind_totals(period.period_id, PayerKind::Student).await?;
        let salary = self.kind_totals(period.period_id, PayerKind::Staff).await?;

        Ok(PeriodSummary {
            period,
            tuition,
            salary,
        })
    }

    async fn kind_totals(&self, period_id: Uuid, kind: PayerKind) -> Result<KindTotals, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["kind_totals"])
            .start_timer();

        let totals = sqlx::query_as::<_, KindTotals>(&format!(
            r#"
            SELECT
                COUNT(*) AS obligations,
                COALESCE(SUM(total_due), 0) AS total_due,
                COALESCE(SUM(amount_paid), 0) AS amount_paid,
                COALESCE(SUM(outstanding), 0) AS outstanding,
                COUNT(*) FILTER (WHERE outstanding = 0) AS settled_count,
                COUNT(*) FILTER (WHERE outstanding > 0 AND amount_paid > 0) AS partial_count,
                COUNT(*) FILTER (WHERE outstanding > 0 AND amount_paid = 0) AS unpaid_count,
                COUNT(*) FILTER (WHERE total_due = 0 AND amount_paid > 0) AS advance_covered_count
            FROM {}
            WHERE period_id = $1
            "#,
            kind.obligations_table()
        ))
        .bind(period_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| store_error("Failed to compute period totals", e))?;

        timer.observe_duration();

        Ok(totals)
    }

    /// A payer's payments with line items, newest first.
    #[instrument(skip(self), fields(payer_id = %payer_id))]
    pub async fn list_payments(
        &self,
        payer_id: Uuid,
        limit: i64,
    ) -> Result<Vec<PaymentWithItems>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_payments"])
            .start_timer();

        let payments = sqlx::query_as::<_, Payment>(
            r#"
            SELECT payment_id, payer_id, period_id, obligation_id, payer_kind, amount, kind,
                   advance_periods, collected_by, note, notice_text, created_utc
            FROM payments
            WHERE payer_id = $1
            ORDER BY created_utc DESC, payment_id
            LIMIT $2
            "#,
        )
        .bind(payer_id)
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_error("Failed to list payments", e))?;

        let payment_ids: Vec<Uuid> = payments.iter().map(|p| p.payment_id).collect();

        let items = sqlx::query_as::<_, PaymentLineItem>(
            r#"
            SELECT line_item_id, payment_id, item_type, amount, periods, created_utc
            FROM payment_line_items
            WHERE payment_id = ANY($1)
            ORDER BY created_utc, line_item_id
            "#,
        )
        .bind(&payment_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_error("Failed to list payment line items", e))?;

        timer.observe_duration();

        let mut by_payment: HashMap<Uuid, Vec<PaymentLineItem>> = HashMap::new();
        for item in items {
            by_payment.entry(item.payment_id).or_default().push(item);
        }

        Ok(payments
            .into_iter()
            .map(|payment| {
                let line_items = by_payment.remove(&payment.payment_id).unwrap_or_default();
                PaymentWithItems {
                    payment,
                    line_items,
                }
            })
            .collect())
    }

    /// A payer's advance credit balance, if any was ever purchased.
    #[instrument(skip(self), fields(payer_id = %payer_id))]
    pub async fn get_advance_credit(
        &self,
        payer_id: Uuid,
    ) -> Result<Option<AdvanceCredit>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_advance_credit"])
            .start_timer();

        let credit = sqlx::query_as::<_, AdvanceCredit>(
            r#"
            SELECT credit_id, payer_id, amount_per_period, periods_paid, periods_remaining, created_utc, updated_utc
            FROM advance_credits
            WHERE payer_id = $1
            "#,
        )
        .bind(payer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error("Failed to get advance credit", e))?;

        timer.observe_duration();

        Ok(credit)
    }
}

/// Escape LIKE wildcards in user-supplied search text.
fn escape_like(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeouts_are_transient() {
        assert!(is_transient(&sqlx::Error::PoolTimedOut));
        assert!(is_transient(&sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset"
        ))));
    }

    #[test]
    fn missing_rows_are_not_transient() {
        assert!(!is_transient(&sqlx::Error::RowNotFound));
        let err = store_error("Failed to get payer", sqlx::Error::RowNotFound);
        assert!(matches!(err, AppError::DatabaseError(_)));
    }

    #[test]
    fn transient_errors_map_to_transient_store() {
        let err = store_error("Failed to lock obligation", sqlx::Error::PoolTimedOut);
        assert!(matches!(err, AppError::TransientStore(_)));
        assert!(err.to_string().contains("Failed to lock obligation"));
    }

    #[test]
    fn like_wildcards_are_escaped() {
        assert_eq!(escape_like("50%_off"), "50\\%\\_off");
        assert_eq!(escape_like("plain"), "plain");
    }
}
