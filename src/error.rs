//! Typed failures raised by the ledger core.
//!
//! Only conditions that must stop the caller live here. Data-quality
//! problems found while replaying a ledger are reported as
//! [`Diagnostic`](crate::models::Diagnostic) values instead, and an
//! unsolvable return is an explicit [`XirrOutcome::Undefined`](crate::performance::XirrOutcome).

use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// A `txn_type` string that does not map onto
    /// [`TransactionKind`](crate::models::TransactionKind)
    #[error("unknown transaction kind {0:?}")]
    UnknownKind(String),

    /// A magnitude field carried a negative number at ingestion
    #[error("negative {field} ({value}) on {context}")]
    NegativeAmount {
        field: &'static str,
        value: f64,
        context: String,
    },

    /// Foreign-currency amount with no rate available; never assumed 1:1
    #[error("no exchange rate for {from}/{to} on or before {date}")]
    MissingRate {
        from: String,
        to: String,
        date: NaiveDate,
    },

    #[error("invalid date {0:?}")]
    InvalidDate(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
