//! Metrics module for fee-ledger-service.
//! Provides Prometheus metrics for rollovers, payment application and
//! notification delivery.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_counter_vec, register_histogram_vec, register_int_counter_vec,
    CounterVec, Encoder, HistogramVec, IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "fee_ledger_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Rollovers by outcome
pub static ROLLOVERS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Obligations generated by rollover, by payer kind and coverage
pub static OBLIGATIONS_GENERATED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Payments applied, by payer kind, payment kind and outcome
pub static PAYMENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Collected or disbursed amount by payer kind (monetary tracking)
pub static PAYMENT_AMOUNT_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Engine operation duration
pub static OPERATION_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Notification sink delivery failures
pub static NOTIFICATION_FAILURES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    ROLLOVERS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("fee_ledger_rollovers_total", "Total period rollovers by outcome"),
            &["outcome"]
        )
        .expect("Failed to register ROLLOVERS_TOTAL")
    });

    OBLIGATIONS_GENERATED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "fee_ledger_obligations_generated_total",
                "Obligations generated by rollover, by payer kind and coverage"
            ),
            &["payer_kind", "coverage"]
        )
        .expect("Failed to register OBLIGATIONS_GENERATED_TOTAL")
    });

    PAYMENTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "fee_ledger_payments_total",
                "Payments by payer kind, payment kind and outcome"
            ),
            &["payer_kind", "payment_kind", "outcome"]
        )
        .expect("Failed to register PAYMENTS_TOTAL")
    });

    PAYMENT_AMOUNT_TOTAL.get_or_init(|| {
        register_counter_vec!(
            opts!(
                "fee_ledger_payment_amount_total",
                "Total amount applied by payer kind and payment kind"
            ),
            &["payer_kind", "payment_kind"]
        )
        .expect("Failed to register PAYMENT_AMOUNT_TOTAL")
    });

    OPERATION_DURATION.get_or_init(|| {
        register_histogram_vec!(
            histogram_opts!(
                "fee_ledger_operation_duration_seconds",
                "Ledger engine operation duration",
                vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
            ),
            &["operation"]
        )
        .expect("Failed to register OPERATION_DURATION")
    });

    NOTIFICATION_FAILURES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "fee_ledger_notification_failures_total",
                "Notification deliveries that failed, by event"
            ),
            &["event"]
        )
        .expect("Failed to register NOTIFICATION_FAILURES_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("fee_ledger_errors_total", "Total errors by kind for alerting"),
            &["error_kind", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record a rollover outcome.
pub fn record_rollover(outcome: &str) {
    if let Some(counter) = ROLLOVERS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

/// Record obligations generated by a rollover.
pub fn record_obligations_generated(payer_kind: &str, coverage: &str, count: u64) {
    if let Some(counter) = OBLIGATIONS_GENERATED_TOTAL.get() {
        counter.with_label_values(&[payer_kind, coverage]).inc_by(count);
    }
}

/// Record a payment attempt outcome.
pub fn record_payment(payer_kind: &str, payment_kind: &str, outcome: &str) {
    if let Some(counter) = PAYMENTS_TOTAL.get() {
        counter
            .with_label_values(&[payer_kind, payment_kind, outcome])
            .inc();
    }
}

/// Record an applied payment amount for financial tracking.
pub fn record_payment_amount(payer_kind: &str, payment_kind: &str, amount: f64) {
    if let Some(counter) = PAYMENT_AMOUNT_TOTAL.get() {
        counter
            .with_label_values(&[payer_kind, payment_kind])
            .inc_by(amount.abs());
    }
}

/// Record engine operation duration.
pub fn record_operation_duration(operation: &str, duration_secs: f64) {
    if let Some(histogram) = OPERATION_DURATION.get() {
        histogram
            .with_label_values(&[operation])
            .observe(duration_secs);
    }
}

/// Record a failed notification delivery.
pub fn record_notification_failure(event: &str) {
    if let Some(counter) = NOTIFICATION_FAILURES_TOTAL.get() {
        counter.with_label_values(&[event]).inc();
    }
}

/// Record an error for alerting.
pub fn record_error(error_kind: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_kind, operation]).inc();
    }
}
