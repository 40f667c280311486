pub mod database;
pub mod metrics;
pub mod notifications;
pub mod payments;
pub mod rollover;
pub mod store;

pub use database::Database;
pub use notifications::{
    EventPublisher, LedgerEvent, LedgerEventName, LogSink, NotificationSink, WebhookSink,
};
pub use payments::{PaymentEngine, PaymentReceipt, PaymentRequest};
pub use rollover::{KindRolloverSummary, RolloverEngine, RolloverOutcome};

use crate::models::PayerKind;
use service_core::error::AppError;
use uuid::Uuid;

/// Log a broken ledger invariant and return an opaque internal error.
pub(crate) fn invariant_violation(kind: PayerKind, obligation_id: Uuid, violation: &str) -> AppError {
    tracing::error!(
        payer_kind = %kind,
        obligation_id = %obligation_id,
        violation = violation,
        "Ledger invariant violated"
    );
    crate::services::metrics::record_error("invariant", "ledger");
    AppError::InternalError(anyhow::anyhow!("Ledger invariant violated"))
}
