//! Domain models for fee-ledger-service.

mod credit;
mod obligation;
mod payer;
mod payment;
mod period;

pub use credit::AdvanceCredit;
pub use obligation::{
    check_balance_invariants, Obligation, ObligationFilter, ObligationStatus, ObligationView,
};
pub use payer::{CreatePayer, ListPayersFilter, Payer, PayerKind, UpdatePayer};
pub use payment::{
    LineItemType, NewLineItem, Payment, PaymentKind, PaymentLineItem, PaymentWithItems,
};
pub use period::{
    period_label, BillingPeriod, KindTotals, PeriodSummary, MAX_PERIOD_YEAR, MIN_PERIOD_YEAR,
};
