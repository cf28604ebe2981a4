//! Ledger core of a personal portfolio tracker.
//!
//! Replays transaction ledgers with weighted-average cost, accumulates
//! per-portfolio cash, and solves money-weighted returns over dated cash
//! flows. Storage is SQLite; exchange rates are injected through
//! [`currency::RateSource`].

pub mod cash;
pub mod cashflow;
pub mod config;
pub mod currency;
pub mod db;
pub mod error;
pub mod holdings;
pub mod models;
pub mod performance;
pub mod position;
pub mod recalc;

pub use error::{CoreError, CoreResult};
pub use models::{
    CashDeposit, DepositDirection, DerivedFields, Diagnostic, DiagnosticKind, Transaction,
    TransactionKind,
};
pub use performance::{calculate_xirr, CashFlow, XirrOutcome};
pub use position::{replay, Position, ReplayResult};
