//! Cash-flow aggregation for money-weighted returns
//!
//! Collects deposits, withdrawals and dividends from any number of sources,
//! normalizes them to non-negative magnitudes in the base currency, and
//! produces the signed, dated series the XIRR solver consumes:
//!
//! - Deposit → negative (capital leaves the investor)
//! - Withdrawal, Dividend → positive (capital returned)
//! - Terminal valuation → positive, dated "now"
//!
//! Direction always comes from the row kind. The sign of a stored amount is
//! never trusted.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::currency::{convert, RateSource};
use crate::error::CoreResult;
use crate::models::{CashDeposit, DepositDirection, Transaction, TransactionKind};
use crate::performance::CashFlow;

/// Rows dated on or before this are treated as placeholders and dropped
pub fn default_min_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1971, 1, 1).unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    Deposit,
    Withdrawal,
    Dividend,
    TerminalValue,
}

impl FlowKind {
    pub fn direction(&self) -> Direction {
        match self {
            FlowKind::Deposit => Direction::Outflow,
            FlowKind::Withdrawal | FlowKind::Dividend | FlowKind::TerminalValue => {
                Direction::Inflow
            }
        }
    }
}

/// Seen from the investor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Capital contributed to the portfolio
    Outflow,
    /// Capital returned: dividend, withdrawal, terminal valuation
    Inflow,
}

/// A raw row from any source, before normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRow {
    pub date: NaiveDate,
    /// As stored; may be negative in legacy withdrawal rows
    pub amount: f64,
    pub currency: String,
    pub kind: FlowKind,
    pub include_in_analysis: bool,
    pub is_deleted: bool,
}

impl SourceRow {
    pub fn new(date: NaiveDate, amount: f64, currency: &str, kind: FlowKind) -> Self {
        Self {
            date,
            amount,
            currency: currency.to_string(),
            kind,
            include_in_analysis: true,
            is_deleted: false,
        }
    }

    pub fn from_deposit(deposit: &CashDeposit) -> Self {
        let kind = match deposit.direction {
            DepositDirection::Deposit => FlowKind::Deposit,
            DepositDirection::Withdrawal => FlowKind::Withdrawal,
        };
        Self {
            date: deposit.date,
            amount: deposit.amount,
            currency: deposit.currency.clone(),
            kind,
            include_in_analysis: deposit.include_in_analysis,
            is_deleted: deposit.is_deleted,
        }
    }

    /// Flows carried by a ledger row: its cash dividend, and the amount of a
    /// Deposit/Withdrawal (including transfers). Trades themselves are internal.
    pub fn from_transaction(txn: &Transaction) -> Vec<Self> {
        let mut rows = Vec::new();

        let mut push = |amount: f64, kind: FlowKind| {
            if amount != 0.0 {
                rows.push(Self {
                    date: txn.date,
                    amount,
                    currency: txn.currency.clone(),
                    kind,
                    include_in_analysis: txn.include_in_analysis,
                    is_deleted: txn.is_deleted,
                });
            }
        };

        match txn.kind {
            TransactionKind::Deposit => push(txn.flow_amount(), FlowKind::Deposit),
            TransactionKind::Withdrawal => push(txn.flow_amount(), FlowKind::Withdrawal),
            _ => {}
        }
        push(txn.cash_dividend, FlowKind::Dividend);

        rows
    }

    fn qualifies(&self, min_date: NaiveDate) -> bool {
        self.include_in_analysis
            && !self.is_deleted
            && self.date > min_date
            && self.amount.is_finite()
    }
}

/// A normalized flow: magnitude in base currency plus direction
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashFlowEvent {
    pub date: NaiveDate,
    /// Always ≥ 0
    pub amount: f64,
    pub direction: Direction,
    pub kind: FlowKind,
}

impl CashFlowEvent {
    pub fn signed(&self) -> CashFlow {
        let amount = match self.direction {
            Direction::Outflow => -self.amount,
            Direction::Inflow => self.amount,
        };
        CashFlow::new(self.date, amount)
    }
}

pub struct CashFlowAggregator<'a> {
    base_currency: String,
    rates: &'a dyn RateSource,
    min_date: NaiveDate,
    rows: Vec<SourceRow>,
}

impl<'a> CashFlowAggregator<'a> {
    pub fn new(base_currency: &str, rates: &'a dyn RateSource) -> Self {
        Self {
            base_currency: base_currency.to_string(),
            rates,
            min_date: default_min_date(),
            rows: Vec::new(),
        }
    }

    pub fn with_min_date(mut self, min_date: NaiveDate) -> Self {
        self.min_date = min_date;
        self
    }

    pub fn add_source<I>(&mut self, rows: I) -> &mut Self
    where
        I: IntoIterator<Item = SourceRow>,
    {
        self.rows.extend(rows);
        self
    }

    pub fn add_deposits(&mut self, deposits: &[CashDeposit]) -> &mut Self {
        self.add_source(deposits.iter().map(SourceRow::from_deposit))
    }

    pub fn add_transactions(&mut self, transactions: &[Transaction]) -> &mut Self {
        self.add_source(transactions.iter().flat_map(SourceRow::from_transaction))
    }

    /// Qualifying rows as base-currency magnitudes, sorted by date.
    ///
    /// Fails on the first foreign row without a rate.
    pub fn events(&self) -> CoreResult<Vec<CashFlowEvent>> {
        let mut events = Vec::with_capacity(self.rows.len());

        for row in self.rows.iter().filter(|r| r.qualifies(self.min_date)) {
            let magnitude = convert(
                self.rates,
                row.amount.abs(),
                &row.currency,
                &self.base_currency,
                row.date,
            )?;
            events.push(CashFlowEvent {
                date: row.date,
                amount: magnitude,
                direction: row.kind.direction(),
                kind: row.kind,
            });
        }

        // Stable: same-day rows keep source order
        events.sort_by_key(|e| e.date);

        log::debug!(
            "Aggregated {} of {} cash-flow rows into {}",
            events.len(),
            self.rows.len(),
            self.base_currency
        );

        Ok(events)
    }

    /// Signed series with the terminal valuation appended at `as_of`.
    ///
    /// A non-positive terminal value is left out; an emptied portfolio is
    /// fully described by its withdrawals.
    pub fn signed_flows(&self, terminal_value: f64, as_of: NaiveDate) -> CoreResult<Vec<CashFlow>> {
        let mut flows: Vec<CashFlow> = self.events()?.iter().map(CashFlowEvent::signed).collect();

        if terminal_value > 0.0 {
            flows.push(CashFlow::new(as_of, terminal_value));
        }

        Ok(flows)
    }
}
