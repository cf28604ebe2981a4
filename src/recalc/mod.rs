//! Recalculation service
//!
//! Every derived number (per-row average cost and P&L, portfolio cash) is a
//! projection of the ledger. Any fix is a re-run: clear the cache, replay,
//! write back. Edits and deletes go through here so the affected position is
//! replayed inside the same SQLite transaction as the change.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::cash::{self, CashBalance};
use crate::cashflow::{CashFlowAggregator, CashFlowEvent, FlowKind};
use crate::config::Settings;
use crate::currency::SqliteRates;
use crate::db::{self, Loaded, Snapshot};
use crate::holdings::{self, Holding, PortfolioValue};
use crate::models::{Diagnostic, Transaction};
use crate::performance::{self, CashFlow, RoiResult, TwrResult, XirrOutcome};
use crate::position::{self, Position, ReplayResult};

/// Outcome of a full ledger recalculation for one user
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecalcReport {
    pub positions: Vec<Position>,
    pub transactions_updated: usize,
    pub balances: Vec<CashBalance>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Valuation and returns of one user as of a date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnsReport {
    pub as_of: NaiveDate,
    pub base_currency: String,
    pub holdings: Vec<Holding>,
    pub value: PortfolioValue,
    pub mwrr: XirrOutcome,
    pub roi: Option<RoiResult>,
    /// Chained over stored daily snapshots; `None` until two days exist
    pub twr: Option<TwrResult>,
    /// Stored rows that could not be read and were left out
    pub diagnostics: Vec<Diagnostic>,
}

fn push_unique(diagnostics: &mut Vec<Diagnostic>, found: impl IntoIterator<Item = Diagnostic>) {
    for diagnostic in found {
        if !diagnostics.contains(&diagnostic) {
            diagnostics.push(diagnostic);
        }
    }
}

/// Clear, replay and write back one (symbol, portfolio) ledger.
/// Unreadable rows are left out of the replay and reported first.
pub fn replay_position(
    conn: &Connection,
    user_id: i64,
    symbol: &str,
    portfolio: &str,
) -> Result<ReplayResult> {
    db::clear_derived_fields(conn, user_id, symbol, portfolio)?;

    let ledger = db::load_ledger(conn, user_id, symbol, portfolio)
        .with_context(|| format!("Failed to load ledger {}/{}", symbol, portfolio))?;
    let mut result = position::replay(&ledger.rows);
    let mut diagnostics = ledger.rejected;
    diagnostics.append(&mut result.diagnostics);
    result.diagnostics = diagnostics;
    let updated = db::write_derived_fields(conn, &result.rows)?;

    for diagnostic in &result.diagnostics {
        log::warn!("{}", diagnostic);
    }
    log::debug!("Wrote derived fields for {} rows of {}/{}", updated, symbol, portfolio);

    Ok(result)
}

/// Recompute and store every portfolio balance of a user. The returned
/// `rejected` lists the transaction and deposit rows that were skipped.
pub fn recalc_cash(conn: &Connection, user_id: i64) -> Result<Loaded<CashBalance>> {
    let transactions = db::load_transactions(conn, user_id)?;
    let deposits = db::load_cash_deposits(conn, user_id)?;

    let balances = cash::accumulate_all(&transactions.rows, &deposits.rows);
    db::save_cash_balances(conn, user_id, &balances)?;

    for balance in &balances {
        log::info!(
            "Cash {} ({}): {:.3} {}",
            balance.portfolio,
            user_id,
            balance.balance,
            balance.currency
        );
    }

    let mut rejected = transactions.rejected;
    rejected.extend(deposits.rejected);

    Ok(Loaded {
        rows: balances,
        rejected,
    })
}

/// Replay every position of a user and rebuild the cash balances, atomically
pub fn recalc_user(conn: &mut Connection, user_id: i64) -> Result<RecalcReport> {
    let tx = conn.transaction()?;

    let keys = db::position_keys(&tx, user_id)?;
    log::info!("Recalculating {} positions for user {}", keys.len(), user_id);

    let mut report = RecalcReport::default();
    for (symbol, portfolio) in &keys {
        let result = replay_position(&tx, user_id, symbol, portfolio)?;
        report.transactions_updated += result.rows.len();
        push_unique(&mut report.diagnostics, result.diagnostics);
        report.positions.push(result.position);
    }

    let cash = recalc_cash(&tx, user_id)?;
    report.balances = cash.rows;
    push_unique(&mut report.diagnostics, cash.rejected);
    tx.commit()?;

    log::info!(
        "User {}: {} transactions updated, {} diagnostics",
        user_id,
        report.transactions_updated,
        report.diagnostics.len()
    );

    Ok(report)
}

/// Insert a transaction and replay its position
pub fn add_transaction(conn: &mut Connection, txn: &Transaction) -> Result<(i64, ReplayResult)> {
    let tx = conn.transaction()?;

    let id = db::insert_transaction(&tx, txn)?;
    let result = replay_position(&tx, txn.user_id, &txn.symbol, &txn.portfolio)?;
    recalc_cash(&tx, txn.user_id)?;

    tx.commit()?;
    Ok((id, result))
}

/// Apply a corrective edit. The old position is replayed too when the edit
/// moves the row to another symbol or portfolio.
pub fn edit_transaction(conn: &mut Connection, txn: &Transaction) -> Result<ReplayResult> {
    let tx = conn.transaction()?;

    // The stored row may be unreadable; the edit is how it gets repaired
    let (user_id, symbol, portfolio) = db::transaction_key(&tx, txn.id)?
        .with_context(|| format!("transaction {} not found", txn.id))?;
    db::update_transaction(&tx, txn)?;

    if (symbol.as_str(), portfolio.as_str()) != txn.position_key() {
        replay_position(&tx, user_id, &symbol, &portfolio)?;
    }
    let result = replay_position(&tx, txn.user_id, &txn.symbol, &txn.portfolio)?;
    recalc_cash(&tx, txn.user_id)?;

    tx.commit()?;
    Ok(result)
}

/// Soft-delete a transaction and replay what remains of its position.
/// `None` when the id does not exist.
pub fn delete_transaction(conn: &mut Connection, id: i64) -> Result<Option<ReplayResult>> {
    let tx = conn.transaction()?;

    let Some((user_id, symbol, portfolio)) = db::soft_delete_transaction(&tx, id)? else {
        return Ok(None);
    };
    let result = replay_position(&tx, user_id, &symbol, &portfolio)?;
    recalc_cash(&tx, user_id)?;

    tx.commit()?;
    Ok(Some(result))
}

/// Value a user's holdings and solve their returns as of `as_of`.
///
/// Positions and balances come from a fresh replay of the stored ledger. The
/// day's valuation is upserted into `portfolio_snapshots`, and the stored
/// snapshots up to `as_of` feed the time-weighted return.
pub fn evaluate_returns(
    conn: &Connection,
    user_id: i64,
    settings: &Settings,
    as_of: NaiveDate,
) -> Result<ReturnsReport> {
    let Loaded {
        rows: transactions,
        rejected: mut diagnostics,
    } = db::load_transactions(conn, user_id)?;
    let Loaded {
        rows: deposits,
        rejected,
    } = db::load_cash_deposits(conn, user_id)?;
    diagnostics.extend(rejected);

    let positions: Vec<Position> = position::replay_all(&transactions)
        .into_iter()
        .map(|r| r.position)
        .filter(|p| !p.symbol.is_empty())
        .collect();
    let balances = cash::accumulate_all(&transactions, &deposits);

    let prices = db::latest_prices(conn, as_of)?;
    let holdings = holdings::value_positions(&positions, &prices);

    let rates = SqliteRates::new(conn).with_fallback(settings.fallback_rates());
    let value =
        holdings::portfolio_value(&holdings, &balances, &rates, &settings.base_currency, as_of)
            .context("Failed to value portfolio")?;

    let mut aggregator = CashFlowAggregator::new(&settings.base_currency, &rates)
        .with_min_date(settings.min_flow_date);
    aggregator.add_deposits(&deposits).add_transactions(&transactions);

    let events = aggregator.events().context("Failed to aggregate cash flows")?;
    let flows = aggregator.signed_flows(value.total, as_of)?;
    let mwrr = performance::calculate_xirr(&flows);
    let roi = performance::calculate_roi(&events, value.total);

    match mwrr.rate() {
        Some(rate) => log::info!(
            "User {}: MWRR {:.2}% over {} flows",
            user_id,
            rate * 100.0,
            flows.len()
        ),
        None => log::info!("User {}: MWRR undefined ({:?})", user_id, mwrr),
    }

    db::upsert_snapshot(
        conn,
        user_id,
        &Snapshot {
            date: as_of,
            portfolio_value: value.total,
            accumulated_cash: value.cash_value,
            net_gain: roi.as_ref().map_or(0.0, |r| r.net_gain),
            roi_percent: roi.as_ref().map_or(0.0, |r| r.roi * 100.0),
        },
    )?;
    let valuations = db::load_snapshot_values(conn, user_id, as_of)?;
    let twr = performance::calculate_twr(&valuations, &external_flows(&events));

    Ok(ReturnsReport {
        as_of,
        base_currency: settings.base_currency.clone(),
        holdings,
        value,
        mwrr,
        roi,
        twr,
        diagnostics,
    })
}

/// Deposits and withdrawals as seen by the portfolio: money in is positive.
/// Dividends stay out; they are part of the portfolio's own return.
fn external_flows(events: &[CashFlowEvent]) -> Vec<CashFlow> {
    events
        .iter()
        .filter(|e| matches!(e.kind, FlowKind::Deposit | FlowKind::Withdrawal))
        .map(|e| {
            let investor = e.signed();
            CashFlow::new(investor.date, -investor.amount)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::currency::store_rate;
    use crate::models::{CashDeposit, DepositDirection, DiagnosticKind, TransactionKind};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        conn
    }

    fn seed(conn: &Connection) -> (i64, i64) {
        let buy = db::insert_transaction(
            conn,
            &Transaction::new(1, "KFH", "NBK", date(2023, 1, 2), TransactionKind::Buy)
                .with_shares(100.0)
                .with_purchase_cost(1000.0),
        )
        .unwrap();
        let sell = db::insert_transaction(
            conn,
            &Transaction::new(1, "KFH", "NBK", date(2023, 6, 1), TransactionKind::Sell)
                .with_shares(40.0)
                .with_sell_value(600.0),
        )
        .unwrap();
        db::insert_cash_deposit(
            conn,
            &CashDeposit::new(1, "KFH", date(2023, 1, 1), 1500.0, DepositDirection::Deposit),
        )
        .unwrap();
        (buy, sell)
    }

    #[test]
    fn test_recalc_user_writes_derived_fields_and_cash() {
        let mut conn = setup();
        let (_, sell) = seed(&conn);

        let report = recalc_user(&mut conn, 1).unwrap();

        assert_eq!(report.transactions_updated, 2);
        assert!(report.diagnostics.is_empty());
        assert_eq!(report.positions.len(), 1);
        assert_eq!(report.positions[0].shares_held, 60.0);

        let stored = db::get_transaction(&conn, sell).unwrap().unwrap();
        let derived = stored.derived.unwrap();
        assert_eq!(derived.avg_cost, 10.0);
        assert_eq!(derived.realized_pnl, 200.0);
        assert_eq!(derived.cost_basis, 600.0);
        assert_eq!(derived.shares_held, 60.0);

        // 1500 - 1000 + 600
        let balances = db::load_cash_balances(&conn, 1).unwrap();
        assert_eq!(balances.get("KFH").map(|(b, _)| *b), Some(1100.0));
    }

    #[test]
    fn test_recalc_is_idempotent() {
        let mut conn = setup();
        seed(&conn);

        let first = recalc_user(&mut conn, 1).unwrap();
        let stored_first = db::load_transactions(&conn, 1).unwrap().rows;
        let second = recalc_user(&mut conn, 1).unwrap();
        let stored_second = db::load_transactions(&conn, 1).unwrap().rows;

        assert_eq!(first, second);
        assert_eq!(stored_first, stored_second);
    }

    #[test]
    fn test_oversell_reported_not_fatal() {
        let mut conn = setup();
        seed(&conn);
        db::insert_transaction(
            &conn,
            &Transaction::new(1, "KFH", "NBK", date(2023, 7, 1), TransactionKind::Sell)
                .with_shares(100.0)
                .with_sell_value(1200.0),
        )
        .unwrap();

        let report = recalc_user(&mut conn, 1).unwrap();

        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(report.positions[0].shares_held, 0.0);
        assert_eq!(report.positions[0].total_cost, 0.0);
    }

    #[test]
    fn test_delete_replays_position() {
        let mut conn = setup();
        let (_, sell) = seed(&conn);
        recalc_user(&mut conn, 1).unwrap();

        let result = delete_transaction(&mut conn, sell).unwrap().unwrap();

        assert_eq!(result.position.shares_held, 100.0);
        assert_eq!(result.position.realized_pnl_cumulative, 0.0);
        assert!(db::get_transaction(&conn, sell).unwrap().unwrap().derived.is_none());

        let balances = db::load_cash_balances(&conn, 1).unwrap();
        assert_eq!(balances.get("KFH").map(|(b, _)| *b), Some(500.0));

        assert!(delete_transaction(&mut conn, 9999).unwrap().is_none());
    }

    #[test]
    fn test_edit_replays_position() {
        let mut conn = setup();
        let (buy, sell) = seed(&conn);
        recalc_user(&mut conn, 1).unwrap();

        let mut corrected = db::get_transaction(&conn, buy).unwrap().unwrap();
        corrected.purchase_cost = 800.0;
        let result = edit_transaction(&mut conn, &corrected).unwrap();

        // avg 8; realized = 600 - 8 * 40
        let derived = db::get_transaction(&conn, sell).unwrap().unwrap().derived.unwrap();
        assert_eq!(derived.avg_cost, 8.0);
        assert_eq!(derived.realized_pnl, 280.0);
        assert_eq!(result.position.total_cost, 480.0);
    }

    #[test]
    fn test_edit_repairs_unreadable_row() {
        let mut conn = setup();
        seed(&conn);
        conn.execute(
            "INSERT INTO transactions (user_id, portfolio, stock_symbol, txn_date, txn_type, shares)
             VALUES (1, 'KFH', 'NBK', '2023-03-01', 'Split', 20)",
            [],
        )
        .unwrap();
        let broken = conn.last_insert_rowid();
        assert_eq!(recalc_user(&mut conn, 1).unwrap().diagnostics.len(), 1);

        let repaired =
            Transaction::new(1, "KFH", "NBK", date(2023, 3, 1), TransactionKind::BonusShares)
                .with_id(broken)
                .with_bonus_shares(20.0);
        let result = edit_transaction(&mut conn, &repaired).unwrap();

        assert!(result.diagnostics.is_empty());
        assert_eq!(result.position.shares_held, 80.0);
        assert!(recalc_user(&mut conn, 1).unwrap().diagnostics.is_empty());
    }

    #[test]
    fn test_edit_moving_portfolio_replays_both() {
        let mut conn = setup();
        let (buy, sell) = seed(&conn);
        recalc_user(&mut conn, 1).unwrap();

        let mut moved = db::get_transaction(&conn, sell).unwrap().unwrap();
        moved.portfolio = "BBYN".to_string();
        edit_transaction(&mut conn, &moved).unwrap();

        let buy_row = db::get_transaction(&conn, buy).unwrap().unwrap().derived.unwrap();
        assert_eq!(buy_row.shares_held, 100.0);

        // Selling from an empty position
        let report = recalc_user(&mut conn, 1).unwrap();
        assert_eq!(report.diagnostics.len(), 1);
    }

    #[test]
    fn test_add_transaction() {
        let mut conn = setup();
        seed(&conn);

        let (id, result) = add_transaction(
            &mut conn,
            &Transaction::new(1, "KFH", "NBK", date(2023, 8, 1), TransactionKind::BonusShares)
                .with_bonus_shares(60.0),
        )
        .unwrap();

        assert!(id > 0);
        assert_eq!(result.position.shares_held, 120.0);
        assert_eq!(result.position.avg_cost(), 5.0);
    }

    #[test]
    fn test_evaluate_returns() {
        let conn = setup();
        // Deposit 1000, buy 100 @ 1000, one year later worth 1100
        db::insert_cash_deposit(
            &conn,
            &CashDeposit::new(1, "KFH", date(2020, 1, 1), 1000.0, DepositDirection::Deposit),
        )
        .unwrap();
        db::insert_transaction(
            &conn,
            &Transaction::new(1, "KFH", "NBK", date(2020, 1, 1), TransactionKind::Buy)
                .with_shares(100.0)
                .with_purchase_cost(1000.0),
        )
        .unwrap();
        db::upsert_price(&conn, "NBK", date(2020, 12, 30), 11.0, "KWD").unwrap();

        let report = evaluate_returns(&conn, 1, &Settings::default(), date(2021, 1, 1)).unwrap();

        assert_eq!(report.holdings.len(), 1);
        assert!((report.value.total - 1100.0).abs() < 1e-9);
        let rate = report.mwrr.rate().unwrap();
        assert!((rate - 0.10).abs() < 1e-3, "Expected ~10%, got {:.4}%", rate * 100.0);
        assert!((report.roi.unwrap().roi - 0.10).abs() < 1e-9);
    }

    #[test]
    fn test_evaluate_returns_converts_foreign_flows() {
        let conn = setup();
        store_rate(&conn, "USD", "KWD", date(2020, 1, 1), 0.3, "test").unwrap();
        db::insert_cash_deposit(
            &conn,
            &CashDeposit::new(1, "USA", date(2020, 1, 1), 1000.0, DepositDirection::Deposit)
                .with_currency("USD"),
        )
        .unwrap();

        let report = evaluate_returns(&conn, 1, &Settings::default(), date(2020, 6, 1)).unwrap();

        // 1000 USD of idle cash, worth 300 KWD
        assert!((report.value.cash_value - 300.0).abs() < 1e-9);
        assert_eq!(report.roi.unwrap().total_deposits, 300.0);
    }

    #[test]
    fn test_evaluate_returns_missing_rate_fails() {
        let conn = setup();
        db::insert_cash_deposit(
            &conn,
            &CashDeposit::new(1, "UK", date(2020, 1, 1), 1000.0, DepositDirection::Deposit)
                .with_currency("GBP"),
        )
        .unwrap();

        assert!(evaluate_returns(&conn, 1, &Settings::default(), date(2020, 6, 1)).is_err());
    }

    #[test]
    fn test_no_flows_gives_undefined_return() {
        let conn = setup();
        let report = evaluate_returns(&conn, 1, &Settings::default(), date(2024, 1, 1)).unwrap();

        assert!(!report.mwrr.is_defined());
        assert!(report.roi.is_none());
        assert!(report.twr.is_none());
    }

    #[test]
    fn test_unreadable_rows_do_not_block_recalc() {
        let mut conn = setup();
        seed(&conn);
        conn.execute_batch(
            "INSERT INTO transactions (user_id, portfolio, stock_symbol, txn_date, txn_type, shares)
                 VALUES (1, 'KFH', 'NBK', '2023-03-01', 'Split', 2);
             INSERT INTO cash_deposits (user_id, portfolio, deposit_date, amount, txn_type)
                 VALUES (1, 'KFH', 'not a date', 250, 'Deposit');",
        )
        .unwrap();

        let report = recalc_user(&mut conn, 1).unwrap();

        assert_eq!(report.transactions_updated, 2);
        assert_eq!(report.positions[0].shares_held, 60.0);
        let tables: Vec<&str> = report
            .diagnostics
            .iter()
            .filter_map(|d| match &d.kind {
                DiagnosticKind::RejectedRow { table, .. } => Some(table.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(tables, vec!["transactions", "cash_deposits"]);
        assert_eq!(report.balances[0].balance, 1100.0);

        let returns = evaluate_returns(&conn, 1, &Settings::default(), date(2024, 1, 1)).unwrap();
        assert_eq!(returns.diagnostics.len(), 2);
    }

    #[test]
    fn test_legacy_flow_rows_in_transactions() {
        let mut conn = setup();
        conn.execute_batch(
            "INSERT INTO transactions
                 (user_id, portfolio, stock_symbol, txn_date, txn_type, purchase_cost)
                 VALUES (1, 'KFH', '', '2020-01-01', 'Deposit', 1000);
             INSERT INTO transactions
                 (user_id, portfolio, stock_symbol, txn_date, txn_type, purchase_cost)
                 VALUES (1, 'KFH', 'NBK', '2020-01-01', 'Transfer In', 200);
             INSERT INTO transactions
                 (user_id, portfolio, stock_symbol, txn_date, txn_type, shares, purchase_cost)
                 VALUES (1, 'KFH', 'NBK', '2020-01-01', 'Buy', 100, 1000);",
        )
        .unwrap();
        db::upsert_price(&conn, "NBK", date(2020, 12, 31), 11.0, "KWD").unwrap();

        let report = recalc_user(&mut conn, 1).unwrap();

        assert!(report.diagnostics.is_empty());
        // 1000 + 200 - 1000
        assert_eq!(report.balances[0].balance, 200.0);

        let returns = evaluate_returns(&conn, 1, &Settings::default(), date(2021, 1, 1)).unwrap();
        let roi = returns.roi.unwrap();
        assert_eq!(roi.total_deposits, 1200.0);
        // 1100 of stock + 200 cash against 1200 in
        assert!((roi.net_gain - 100.0).abs() < 1e-9);
        assert!(returns.mwrr.is_defined());
    }

    #[test]
    fn test_evaluate_returns_writes_snapshot_and_chains_twr() {
        let conn = setup();
        db::insert_cash_deposit(
            &conn,
            &CashDeposit::new(1, "KFH", date(2020, 1, 1), 1000.0, DepositDirection::Deposit),
        )
        .unwrap();
        db::insert_transaction(
            &conn,
            &Transaction::new(1, "KFH", "NBK", date(2020, 1, 1), TransactionKind::Buy)
                .with_shares(100.0)
                .with_purchase_cost(1000.0),
        )
        .unwrap();
        db::upsert_price(&conn, "NBK", date(2020, 1, 1), 10.0, "KWD").unwrap();

        let first = evaluate_returns(&conn, 1, &Settings::default(), date(2020, 1, 1)).unwrap();
        assert!(first.twr.is_none());

        db::upsert_price(&conn, "NBK", date(2020, 12, 30), 11.0, "KWD").unwrap();
        let report = evaluate_returns(&conn, 1, &Settings::default(), date(2021, 1, 1)).unwrap();

        let twr = report.twr.unwrap();
        assert!(
            (twr.total_return - 0.10).abs() < 1e-9,
            "Expected 10%, got {:.4}%",
            twr.total_return * 100.0
        );
        assert_eq!(twr.days, 366);

        let (value, roi_percent): (f64, f64) = conn
            .query_row(
                "SELECT portfolio_value, roi_percent FROM portfolio_snapshots
                 WHERE user_id = 1 AND snapshot_date = '2021-01-01'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert!((value - 1100.0).abs() < 1e-9);
        assert!((roi_percent - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_twr_strips_deposit_on_valuation_day() {
        let conn = setup();
        db::upsert_snapshot(
            &conn,
            1,
            &Snapshot {
                date: date(2020, 1, 1),
                portfolio_value: 1000.0,
                accumulated_cash: 1000.0,
                net_gain: 0.0,
                roi_percent: 0.0,
            },
        )
        .unwrap();
        // Cash only: 1000 at the start, 500 more on the valuation day
        for (day, amount) in [(date(2019, 12, 31), 1000.0), (date(2020, 7, 1), 500.0)] {
            let deposit = CashDeposit::new(1, "KFH", day, amount, DepositDirection::Deposit);
            db::insert_cash_deposit(&conn, &deposit).unwrap();
        }

        let report = evaluate_returns(&conn, 1, &Settings::default(), date(2020, 7, 1)).unwrap();

        // 1500 at the end, 500 of it deposited that day: no growth
        let twr = report.twr.unwrap();
        assert!(twr.total_return.abs() < 1e-9, "Expected 0%, got {:.4}%", twr.total_return * 100.0);
    }
}
