//! Weighted-average cost position replay
//!
//! Replays the ledger of one (symbol, portfolio) pair in chronological order
//! and derives, for every row, what an average-cost accountant knew right
//! after it:
//! - BUY: cost += purchase_cost + fees, shares += quantity (+ bonus on the row)
//! - SELL: realized = (proceeds - fees) - avg_before * quantity
//! - BONUS SHARES: shares += bonus quantity, cost unchanged
//! - DIVIDEND ONLY: bonus component only; cash goes to the cash balance
//!
//! Shares and cost never go below zero. Bad rows are clamped and reported
//! as [`Diagnostic`]s so one typo does not stop a whole portfolio.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::{DerivedFields, Diagnostic, DiagnosticKind, Transaction, TransactionKind};

/// Quantities below this are float residue from full closes
const SHARE_EPSILON: f64 = 1e-9;

/// Running state for one (symbol, portfolio) pair
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub symbol: String,
    pub portfolio: String,
    pub currency: String,
    pub shares_held: f64,
    pub total_cost: f64,
    pub realized_pnl_cumulative: f64,
    pub cash_dividends: f64,
    pub reinvested_dividends: f64,
}

impl Position {
    fn for_row(txn: &Transaction) -> Self {
        Self {
            symbol: txn.symbol.clone(),
            portfolio: txn.portfolio.clone(),
            currency: txn.currency.clone(),
            ..Default::default()
        }
    }

    /// Average cost per held share, 0 when flat
    pub fn avg_cost(&self) -> f64 {
        average(self.total_cost, self.shares_held)
    }

    pub fn is_open(&self) -> bool {
        self.shares_held > SHARE_EPSILON
    }
}

/// Derived fields for one replayed row
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayedTransaction {
    pub transaction_id: i64,
    pub derived: DerivedFields,
}

/// Outcome of replaying one ledger: per-row fields, final state, warnings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayResult {
    pub position: Position,
    pub rows: Vec<ReplayedTransaction>,
    pub diagnostics: Vec<Diagnostic>,
}

fn average(cost: f64, shares: f64) -> f64 {
    if shares > SHARE_EPSILON {
        cost / shares
    } else {
        0.0
    }
}

/// Replay one (symbol, portfolio) ledger.
///
/// The key is taken from the first active row; rows for another key are
/// skipped with a [`DiagnosticKind::ForeignRow`]. Deleted and excluded rows
/// produce no output. Input order does not matter, rows are ordered by
/// date then id before the fold.
pub fn replay(transactions: &[Transaction]) -> ReplayResult {
    let mut ordered: Vec<&Transaction> = transactions.iter().filter(|t| t.is_active()).collect();
    ordered.sort_by(|a, b| a.date.cmp(&b.date).then(a.id.cmp(&b.id)));

    let Some(first) = ordered.first() else {
        return ReplayResult::default();
    };

    let mut position = Position::for_row(first);
    let mut rows = Vec::with_capacity(ordered.len());
    let mut diagnostics = Vec::new();

    for txn in ordered {
        if txn.position_key() != (position.symbol.as_str(), position.portfolio.as_str()) {
            diagnostics.push(Diagnostic::for_transaction(
                txn,
                DiagnosticKind::ForeignRow {
                    symbol: txn.symbol.clone(),
                    portfolio: txn.portfolio.clone(),
                },
            ));
            continue;
        }

        let derived = apply(&mut position, txn, &mut diagnostics);
        rows.push(ReplayedTransaction {
            transaction_id: txn.id,
            derived,
        });
    }

    log::debug!(
        "Replayed {}/{}: {} rows, shares={:.3}, cost={:.3}, realized={:.3}",
        position.symbol,
        position.portfolio,
        rows.len(),
        position.shares_held,
        position.total_cost,
        position.realized_pnl_cumulative
    );

    ReplayResult {
        position,
        rows,
        diagnostics,
    }
}

/// Replay every (symbol, portfolio) pair found in a mixed ledger
pub fn replay_all(transactions: &[Transaction]) -> Vec<ReplayResult> {
    let mut by_position: BTreeMap<(String, String), Vec<Transaction>> = BTreeMap::new();

    for txn in transactions.iter().filter(|t| t.is_active()) {
        by_position
            .entry((txn.symbol.clone(), txn.portfolio.clone()))
            .or_default()
            .push(txn.clone());
    }

    by_position.values().map(|ledger| replay(ledger)).collect()
}

/// Fold one row into the position and return the row's derived fields
fn apply(
    position: &mut Position,
    txn: &Transaction,
    diagnostics: &mut Vec<Diagnostic>,
) -> DerivedFields {
    let mut realized = 0.0;

    let avg_cost = match txn.kind {
        TransactionKind::Buy => {
            if txn.shares <= 0.0 {
                diagnostics.push(Diagnostic::for_transaction(txn, DiagnosticKind::MissingShares));
            }
            if txn.purchase_cost <= 0.0 {
                diagnostics.push(Diagnostic::for_transaction(txn, DiagnosticKind::NonPositiveCost));
            }

            position.total_cost += txn.purchase_cost + txn.fees;
            position.shares_held += txn.shares + txn.bonus_shares;
            position.avg_cost()
        }

        TransactionKind::Sell => {
            // Bonus shares on a sell row were held when the sale happened
            position.shares_held += txn.bonus_shares;

            if txn.shares <= 0.0 {
                diagnostics.push(Diagnostic::for_transaction(txn, DiagnosticKind::MissingShares));
            }
            if txn.sell_value <= 0.0 {
                diagnostics.push(Diagnostic::for_transaction(txn, DiagnosticKind::MissingAmount));
            }

            let avg_cost_before = position.avg_cost();
            let quantity = txn.shares;

            if quantity > position.shares_held + SHARE_EPSILON {
                log::warn!(
                    "Sell of {} {} in {} on {} exceeds {} held, clamping",
                    quantity,
                    txn.symbol,
                    txn.portfolio,
                    txn.date,
                    position.shares_held
                );
                diagnostics.push(Diagnostic::for_transaction(
                    txn,
                    DiagnosticKind::Oversold {
                        requested: quantity,
                        held: position.shares_held,
                    },
                ));
            }

            let cost_of_sold = avg_cost_before * quantity;
            let proceeds_net = txn.sell_value - txn.fees;
            realized = proceeds_net - cost_of_sold;

            position.total_cost -= cost_of_sold;
            position.shares_held -= quantity;

            // Sale-time basis, not the post-sale average
            avg_cost_before
        }

        TransactionKind::BonusShares => {
            let granted = if txn.bonus_shares > 0.0 {
                txn.bonus_shares
            } else {
                txn.shares
            };
            if granted <= 0.0 {
                diagnostics.push(Diagnostic::for_transaction(txn, DiagnosticKind::MissingShares));
            }

            position.shares_held += granted;
            position.avg_cost()
        }

        TransactionKind::DividendOnly => {
            let nothing_received = txn.cash_dividend <= 0.0
                && txn.reinvested_dividend <= 0.0
                && txn.bonus_shares <= 0.0;
            if nothing_received {
                diagnostics.push(Diagnostic::for_transaction(txn, DiagnosticKind::MissingAmount));
            }
            position.shares_held += txn.bonus_shares;
            position.avg_cost()
        }

        TransactionKind::Deposit | TransactionKind::Withdrawal => position.avg_cost(),
    };

    position.shares_held = position.shares_held.max(0.0);
    position.total_cost = position.total_cost.max(0.0);
    if position.shares_held <= SHARE_EPSILON {
        position.shares_held = 0.0;
        position.total_cost = 0.0;
    }

    position.realized_pnl_cumulative += realized;
    position.cash_dividends += txn.cash_dividend;
    position.reinvested_dividends += txn.reinvested_dividend;

    DerivedFields {
        avg_cost,
        realized_pnl: realized,
        realized_pnl_cumulative: position.realized_pnl_cumulative,
        cost_basis: position.total_cost,
        shares_held: position.shares_held,
    }
}
