//! SQLite storage for the ledger.
//!
//! Owns the schema, loads ledgers ordered for replay, and writes derived
//! fields and cash balances back. Text columns coming from legacy imports
//! are converted to typed values here, once: `txn_type` strings become
//! [`TransactionKind`], signed deposit amounts become magnitude + direction.
//! A stored row that cannot be converted is skipped and reported as a
//! [`Diagnostic`]; it never fails the load of the rows around it.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::cash::CashBalance;
use crate::error::CoreError;
use crate::models::{
    CashDeposit, DepositDirection, DerivedFields, Diagnostic, Transaction, TransactionKind,
};
use crate::position::ReplayedTransaction;

/// Category value marking a transaction as part of the analysed portfolio
const PORTFOLIO_CATEGORY: &str = "portfolio";
/// Categories the legacy importer used for external money movements
const FLOW_IN_CATEGORY: &str = "FLOW_IN";
const FLOW_OUT_CATEGORY: &str = "FLOW_OUT";

/// Rows read from one table, plus the ones that could not be read
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded<T> {
    pub rows: Vec<T>,
    pub rejected: Vec<Diagnostic>,
}

impl<T> Default for Loaded<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            rejected: Vec::new(),
        }
    }
}

/// Open (or create) a database file and make sure the schema is current
pub fn open_database(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }
    }

    let conn = Connection::open(path).with_context(|| format!("opening {}", path.display()))?;

    // Enable WAL mode for better concurrent access
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uuid TEXT UNIQUE,
            user_id INTEGER NOT NULL,
            portfolio TEXT NOT NULL DEFAULT 'KFH',
            stock_symbol TEXT NOT NULL DEFAULT '',
            txn_date TEXT NOT NULL,
            txn_type TEXT NOT NULL,
            shares REAL NOT NULL DEFAULT 0,
            bonus_shares REAL NOT NULL DEFAULT 0,
            purchase_cost REAL NOT NULL DEFAULT 0,
            sell_value REAL NOT NULL DEFAULT 0,
            cash_dividend REAL NOT NULL DEFAULT 0,
            reinvested_dividend REAL NOT NULL DEFAULT 0,
            fees REAL NOT NULL DEFAULT 0,
            currency TEXT NOT NULL DEFAULT 'KWD',
            category TEXT DEFAULT 'portfolio',
            is_deleted INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_transactions_position
            ON transactions(user_id, stock_symbol, portfolio, txn_date);

        CREATE TABLE IF NOT EXISTS cash_deposits (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            portfolio TEXT NOT NULL DEFAULT 'KFH',
            deposit_date TEXT NOT NULL,
            amount REAL NOT NULL,
            txn_type TEXT NOT NULL DEFAULT 'Deposit',
            currency TEXT NOT NULL DEFAULT 'KWD',
            bank_name TEXT,
            include_in_analysis INTEGER NOT NULL DEFAULT 1,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS portfolio_cash (
            user_id INTEGER NOT NULL,
            portfolio TEXT NOT NULL,
            balance REAL NOT NULL DEFAULT 0,
            currency TEXT NOT NULL DEFAULT 'KWD',
            last_updated TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (user_id, portfolio)
        );

        CREATE TABLE IF NOT EXISTS exchange_rates (
            base_currency TEXT NOT NULL,
            target_currency TEXT NOT NULL,
            date TEXT NOT NULL,
            rate REAL NOT NULL,
            source TEXT,
            PRIMARY KEY (base_currency, target_currency, date)
        );

        CREATE TABLE IF NOT EXISTS stock_prices (
            symbol TEXT NOT NULL,
            price_date TEXT NOT NULL,
            close REAL NOT NULL,
            currency TEXT NOT NULL DEFAULT 'KWD',
            PRIMARY KEY (symbol, price_date)
        );

        CREATE TABLE IF NOT EXISTS portfolio_snapshots (
            user_id INTEGER NOT NULL,
            snapshot_date TEXT NOT NULL,
            portfolio_value REAL NOT NULL,
            accumulated_cash REAL NOT NULL DEFAULT 0,
            net_gain REAL NOT NULL DEFAULT 0,
            roi_percent REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (user_id, snapshot_date)
        );
        "#,
    )?;

    run_migrations(conn)?;
    Ok(())
}

/// Bring databases created by older versions up to the current columns
fn run_migrations(conn: &Connection) -> Result<()> {
    fn column_exists(conn: &Connection, table: &str, column: &str) -> bool {
        let sql = format!("PRAGMA table_info({})", table);
        if let Ok(mut stmt) = conn.prepare(&sql) {
            if let Ok(rows) = stmt.query_map([], |row| row.get::<_, String>(1)) {
                for name in rows.flatten() {
                    if name == column {
                        return true;
                    }
                }
            }
        }
        false
    }

    let transaction_columns = [
        ("cash_amount", "REAL NOT NULL DEFAULT 0"),
        ("avg_cost_at_txn", "REAL"),
        ("realized_pnl_at_txn", "REAL"),
        ("realized_pnl_cum_at_txn", "REAL"),
        ("cost_basis_at_txn", "REAL"),
        ("shares_held_at_txn", "REAL"),
    ];

    for (column, definition) in transaction_columns {
        if !column_exists(conn, "transactions", column) {
            conn.execute(
                &format!("ALTER TABLE transactions ADD COLUMN {} {}", column, definition),
                [],
            )?;
            log::info!("Migration: Added {} column to transactions", column);
        }
    }

    Ok(())
}

/// Parse date string flexibly - handles both "YYYY-MM-DD" and "YYYY-MM-DD HH:MM:SS" formats
pub fn parse_date_flexible(date_str: &str) -> Option<NaiveDate> {
    let trimmed = date_str.trim();
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|dt| dt.date())
        })
        .or_else(|| {
            NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S")
                .ok()
                .map(|dt| dt.date())
        })
}

/// Raw `transactions` row before kind and date are checked
#[derive(Debug, Clone)]
struct TxnRow {
    id: i64,
    uuid: Option<String>,
    user_id: i64,
    portfolio: String,
    symbol: String,
    date: String,
    txn_type: String,
    shares: f64,
    bonus_shares: f64,
    purchase_cost: f64,
    sell_value: f64,
    cash_dividend: f64,
    reinvested_dividend: f64,
    fees: f64,
    cash_amount: f64,
    currency: String,
    category: Option<String>,
    is_deleted: bool,
    derived: Option<DerivedFields>,
}

impl TryFrom<TxnRow> for Transaction {
    type Error = CoreError;

    fn try_from(row: TxnRow) -> Result<Self, Self::Error> {
        let category = row.category.as_deref().map(str::trim);
        let kind: TransactionKind = match category {
            Some(c) if c.eq_ignore_ascii_case(FLOW_IN_CATEGORY) => TransactionKind::Deposit,
            Some(c) if c.eq_ignore_ascii_case(FLOW_OUT_CATEGORY) => TransactionKind::Withdrawal,
            _ => row.txn_type.parse()?,
        };
        let include_in_analysis = category.map_or(true, |c| {
            [PORTFOLIO_CATEGORY, FLOW_IN_CATEGORY, FLOW_OUT_CATEGORY]
                .iter()
                .any(|known| c.eq_ignore_ascii_case(known))
        });
        let date = parse_date_flexible(&row.date)
            .ok_or_else(|| CoreError::InvalidDate(row.date.clone()))?;

        let txn = Transaction {
            id: row.id,
            uuid: row.uuid.unwrap_or_default(),
            user_id: row.user_id,
            portfolio: row.portfolio,
            symbol: row.symbol,
            date,
            kind,
            shares: row.shares,
            bonus_shares: row.bonus_shares,
            purchase_cost: row.purchase_cost,
            sell_value: row.sell_value,
            cash_dividend: row.cash_dividend,
            reinvested_dividend: row.reinvested_dividend,
            fees: row.fees,
            cash_amount: row.cash_amount,
            currency: row.currency,
            include_in_analysis,
            is_deleted: row.is_deleted,
            derived: row.derived,
        };

        txn.validate()?;
        Ok(txn)
    }
}

const TXN_COLUMNS: &str = r#"
    id, uuid, user_id, COALESCE(portfolio, 'KFH'), COALESCE(stock_symbol, ''),
    COALESCE(txn_date, ''), COALESCE(txn_type, ''),
    COALESCE(shares, 0), COALESCE(bonus_shares, 0), COALESCE(purchase_cost, 0),
    COALESCE(sell_value, 0), COALESCE(cash_dividend, 0), COALESCE(reinvested_dividend, 0),
    COALESCE(fees, 0), COALESCE(cash_amount, 0), COALESCE(currency, 'KWD'), category,
    COALESCE(is_deleted, 0),
    avg_cost_at_txn, realized_pnl_at_txn, realized_pnl_cum_at_txn,
    cost_basis_at_txn, shares_held_at_txn
"#;

fn read_txn_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TxnRow> {
    let avg_cost: Option<f64> = row.get(18)?;
    let derived = match avg_cost {
        Some(avg_cost) => Some(DerivedFields {
            avg_cost,
            realized_pnl: row.get::<_, Option<f64>>(19)?.unwrap_or(0.0),
            realized_pnl_cumulative: row.get::<_, Option<f64>>(20)?.unwrap_or(0.0),
            cost_basis: row.get::<_, Option<f64>>(21)?.unwrap_or(0.0),
            shares_held: row.get::<_, Option<f64>>(22)?.unwrap_or(0.0),
        }),
        None => None,
    };

    Ok(TxnRow {
        id: row.get(0)?,
        uuid: row.get(1)?,
        user_id: row.get(2)?,
        portfolio: row.get(3)?,
        symbol: row.get(4)?,
        date: row.get(5)?,
        txn_type: row.get(6)?,
        shares: row.get(7)?,
        bonus_shares: row.get(8)?,
        purchase_cost: row.get(9)?,
        sell_value: row.get(10)?,
        cash_dividend: row.get(11)?,
        reinvested_dividend: row.get(12)?,
        fees: row.get(13)?,
        cash_amount: row.get(14)?,
        currency: row.get(15)?,
        category: row.get(16)?,
        is_deleted: row.get::<_, i64>(17)? != 0,
        derived,
    })
}

fn query_txn_rows<P: rusqlite::Params>(
    conn: &Connection,
    filter: &str,
    params: P,
) -> Result<Vec<TxnRow>> {
    let sql = format!(
        "SELECT {} FROM transactions WHERE {} ORDER BY date(txn_date), id",
        TXN_COLUMNS, filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params, read_txn_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn query_transactions<P: rusqlite::Params>(
    conn: &Connection,
    filter: &str,
    params: P,
) -> Result<Loaded<Transaction>> {
    let mut loaded = Loaded::default();

    for row in query_txn_rows(conn, filter, params)? {
        let (id, symbol, portfolio) = (row.id, row.symbol.clone(), row.portfolio.clone());
        let date = parse_date_flexible(&row.date);

        match Transaction::try_from(row) {
            Ok(txn) => loaded.rows.push(txn),
            Err(e) => {
                log::warn!("Skipping transaction {} ({}/{}): {}", id, symbol, portfolio, e);
                loaded.rejected.push(Diagnostic::rejected(
                    "transactions",
                    id,
                    &symbol,
                    &portfolio,
                    date,
                    e.to_string(),
                ));
            }
        }
    }

    Ok(loaded)
}

/// Insert a new transaction; returns the row id
pub fn insert_transaction(conn: &Connection, txn: &Transaction) -> Result<i64> {
    txn.validate()?;

    let uuid = if txn.uuid.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        txn.uuid.clone()
    };

    conn.execute(
        r#"INSERT INTO transactions
           (uuid, user_id, portfolio, stock_symbol, txn_date, txn_type,
            shares, bonus_shares, purchase_cost, sell_value, cash_dividend,
            reinvested_dividend, fees, cash_amount, currency, category, is_deleted)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"#,
        params![
            uuid,
            txn.user_id,
            txn.portfolio,
            txn.symbol,
            txn.date.to_string(),
            txn.kind.as_str(),
            txn.shares,
            txn.bonus_shares,
            txn.purchase_cost,
            txn.sell_value,
            txn.cash_dividend,
            txn.reinvested_dividend,
            txn.fees,
            txn.cash_amount,
            txn.currency,
            category_for(txn.include_in_analysis),
            txn.is_deleted,
        ],
    )?;

    Ok(conn.last_insert_rowid())
}

fn category_for(include_in_analysis: bool) -> &'static str {
    if include_in_analysis {
        PORTFOLIO_CATEGORY
    } else {
        "excluded"
    }
}

/// Overwrite the editable fields of a transaction and drop its cached derived fields
pub fn update_transaction(conn: &Connection, txn: &Transaction) -> Result<()> {
    txn.validate()?;

    let changed = conn.execute(
        r#"UPDATE transactions SET
            portfolio = ?2, stock_symbol = ?3, txn_date = ?4, txn_type = ?5,
            shares = ?6, bonus_shares = ?7, purchase_cost = ?8, sell_value = ?9,
            cash_dividend = ?10, reinvested_dividend = ?11, fees = ?12, cash_amount = ?13,
            currency = ?14, category = ?15,
            avg_cost_at_txn = NULL, realized_pnl_at_txn = NULL, realized_pnl_cum_at_txn = NULL,
            cost_basis_at_txn = NULL, shares_held_at_txn = NULL
           WHERE id = ?1"#,
        params![
            txn.id,
            txn.portfolio,
            txn.symbol,
            txn.date.to_string(),
            txn.kind.as_str(),
            txn.shares,
            txn.bonus_shares,
            txn.purchase_cost,
            txn.sell_value,
            txn.cash_dividend,
            txn.reinvested_dividend,
            txn.fees,
            txn.cash_amount,
            txn.currency,
            category_for(txn.include_in_analysis),
        ],
    )?;

    if changed == 0 {
        anyhow::bail!("transaction {} not found", txn.id);
    }
    Ok(())
}

/// Load one transaction by id, deleted or not. An unreadable row is an error here.
pub fn get_transaction(conn: &Connection, id: i64) -> Result<Option<Transaction>> {
    query_txn_rows(conn, "id = ?1", [id])?
        .into_iter()
        .next()
        .map(|row| Transaction::try_from(row).with_context(|| format!("transaction {}", id)))
        .transpose()
}

/// (user, symbol, portfolio) a stored row belongs to, readable or not
pub fn transaction_key(conn: &Connection, id: i64) -> Result<Option<(i64, String, String)>> {
    let key = conn
        .query_row(
            r#"SELECT user_id, COALESCE(stock_symbol, ''), COALESCE(portfolio, 'KFH')
               FROM transactions WHERE id = ?1"#,
            [id],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
        )
        .optional()?;
    Ok(key)
}

/// Flag a transaction as deleted. Returns its (user_id, symbol, portfolio) so
/// the caller can replay the affected position.
pub fn soft_delete_transaction(
    conn: &Connection,
    id: i64,
) -> Result<Option<(i64, String, String)>> {
    let key = transaction_key(conn, id)?;

    if key.is_some() {
        conn.execute(
            r#"UPDATE transactions SET is_deleted = 1,
                avg_cost_at_txn = NULL, realized_pnl_at_txn = NULL, realized_pnl_cum_at_txn = NULL,
                cost_basis_at_txn = NULL, shares_held_at_txn = NULL
               WHERE id = ?1"#,
            [id],
        )?;
    }

    Ok(key)
}

/// Active ledger of one (symbol, portfolio), ordered by date then insertion
pub fn load_ledger(
    conn: &Connection,
    user_id: i64,
    symbol: &str,
    portfolio: &str,
) -> Result<Loaded<Transaction>> {
    query_transactions(
        conn,
        "user_id = ?1 AND stock_symbol = ?2 AND portfolio = ?3 AND COALESCE(is_deleted, 0) = 0",
        params![user_id, symbol, portfolio],
    )
}

/// Every non-deleted transaction of a user
pub fn load_transactions(conn: &Connection, user_id: i64) -> Result<Loaded<Transaction>> {
    query_transactions(conn, "user_id = ?1 AND COALESCE(is_deleted, 0) = 0", [user_id])
}

/// Distinct (symbol, portfolio) pairs with active rows
pub fn position_keys(conn: &Connection, user_id: i64) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        r#"SELECT DISTINCT stock_symbol, COALESCE(portfolio, 'KFH')
           FROM transactions
           WHERE user_id = ?1 AND COALESCE(is_deleted, 0) = 0
             AND stock_symbol IS NOT NULL AND stock_symbol != ''
           ORDER BY stock_symbol, portfolio"#,
    )?;

    let keys = stmt
        .query_map([user_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(keys)
}

/// Persist replay output. Caller wraps this in a transaction.
pub fn write_derived_fields(conn: &Connection, rows: &[ReplayedTransaction]) -> Result<usize> {
    let mut stmt = conn.prepare(
        r#"UPDATE transactions
           SET avg_cost_at_txn = ?2, realized_pnl_at_txn = ?3, realized_pnl_cum_at_txn = ?4,
               cost_basis_at_txn = ?5, shares_held_at_txn = ?6
           WHERE id = ?1"#,
    )?;

    let mut updated = 0;
    for row in rows {
        let d = &row.derived;
        updated += stmt.execute(params![
            row.transaction_id,
            d.avg_cost,
            d.realized_pnl,
            d.realized_pnl_cumulative,
            d.cost_basis,
            d.shares_held
        ])?;
    }
    Ok(updated)
}

/// Invalidate every cached derived field of one position
pub fn clear_derived_fields(
    conn: &Connection,
    user_id: i64,
    symbol: &str,
    portfolio: &str,
) -> Result<usize> {
    let cleared = conn.execute(
        r#"UPDATE transactions
           SET avg_cost_at_txn = NULL, realized_pnl_at_txn = NULL, realized_pnl_cum_at_txn = NULL,
               cost_basis_at_txn = NULL, shares_held_at_txn = NULL
           WHERE user_id = ?1 AND stock_symbol = ?2 AND portfolio = ?3"#,
        params![user_id, symbol, portfolio],
    )?;
    Ok(cleared)
}

/// Insert a cash deposit or withdrawal; amount is stored as a magnitude
pub fn insert_cash_deposit(conn: &Connection, deposit: &CashDeposit) -> Result<i64> {
    if deposit.amount < 0.0 {
        return Err(CoreError::NegativeAmount {
            field: "amount",
            value: deposit.amount,
            context: format!("cash deposit on {}", deposit.date),
        }
        .into());
    }

    conn.execute(
        r#"INSERT INTO cash_deposits
           (user_id, portfolio, deposit_date, amount, txn_type, currency, bank_name,
            include_in_analysis, is_deleted)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
        params![
            deposit.user_id,
            deposit.portfolio,
            deposit.date.to_string(),
            deposit.amount,
            deposit.direction.as_str(),
            deposit.currency,
            deposit.bank_name,
            deposit.include_in_analysis,
            deposit.is_deleted,
        ],
    )?;

    Ok(conn.last_insert_rowid())
}

/// Non-deleted deposits of a user. Legacy rows that stored a withdrawal as a
/// negative amount are turned into a positive Withdrawal here.
pub fn load_cash_deposits(conn: &Connection, user_id: i64) -> Result<Loaded<CashDeposit>> {
    let mut stmt = conn.prepare(
        r#"SELECT id, user_id, COALESCE(portfolio, 'KFH'), deposit_date, COALESCE(amount, 0),
                  COALESCE(txn_type, 'Deposit'), COALESCE(currency, 'KWD'), bank_name,
                  COALESCE(include_in_analysis, 1), COALESCE(is_deleted, 0)
           FROM cash_deposits
           WHERE user_id = ?1 AND COALESCE(is_deleted, 0) = 0
           ORDER BY date(deposit_date), id"#,
    )?;

    #[allow(clippy::type_complexity)]
    let rows: Vec<(i64, i64, String, String, f64, String, String, Option<String>, i64, i64)> = stmt
        .query_map([user_id], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
                row.get(8)?,
                row.get(9)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut loaded = Loaded::default();
    for (
        id,
        user_id,
        portfolio,
        raw_date,
        amount,
        txn_type,
        currency,
        bank_name,
        include,
        deleted,
    ) in rows
    {
        let date = parse_date_flexible(&raw_date);
        let parsed = date
            .ok_or_else(|| CoreError::InvalidDate(raw_date.clone()))
            .and_then(|date| txn_type.parse::<DepositDirection>().map(|stated| (date, stated)));

        let (date, stated) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                log::warn!("Skipping cash deposit {} ({}): {}", id, portfolio, e);
                let reason = e.to_string();
                loaded
                    .rejected
                    .push(Diagnostic::rejected("cash_deposits", id, "", &portfolio, date, reason));
                continue;
            }
        };

        let direction = if amount < 0.0 {
            DepositDirection::Withdrawal
        } else {
            stated
        };

        loaded.rows.push(CashDeposit {
            id,
            user_id,
            portfolio,
            date,
            amount: amount.abs(),
            direction,
            currency,
            bank_name,
            include_in_analysis: include != 0,
            is_deleted: deleted != 0,
        });
    }

    Ok(loaded)
}

/// Replace every stored balance of a user with a fresh recomputation
pub fn save_cash_balances(conn: &Connection, user_id: i64, balances: &[CashBalance]) -> Result<()> {
    conn.execute(
        "UPDATE portfolio_cash SET balance = 0, last_updated = datetime('now') WHERE user_id = ?1",
        [user_id],
    )?;

    let mut stmt = conn.prepare(
        r#"INSERT INTO portfolio_cash (user_id, portfolio, balance, currency, last_updated)
           VALUES (?1, ?2, ?3, ?4, datetime('now'))
           ON CONFLICT(user_id, portfolio) DO UPDATE SET
               balance = excluded.balance,
               currency = excluded.currency,
               last_updated = excluded.last_updated"#,
    )?;

    for balance in balances.iter().filter(|b| b.user_id == user_id) {
        stmt.execute(params![user_id, balance.portfolio, balance.balance, balance.currency])?;
    }

    Ok(())
}

/// Stored balances of a user: portfolio -> (balance, currency)
pub fn load_cash_balances(
    conn: &Connection,
    user_id: i64,
) -> Result<HashMap<String, (f64, String)>> {
    let mut stmt =
        conn.prepare("SELECT portfolio, balance, currency FROM portfolio_cash WHERE user_id = ?1")?;

    let rows = stmt
        .query_map([user_id], |row| {
            Ok((row.get::<_, String>(0)?, (row.get::<_, f64>(1)?, row.get::<_, String>(2)?)))
        })?
        .collect::<rusqlite::Result<HashMap<_, _>>>()?;
    Ok(rows)
}

/// One day's valuation of a user's whole portfolio, in the base currency
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    pub date: NaiveDate,
    pub portfolio_value: f64,
    pub accumulated_cash: f64,
    pub net_gain: f64,
    pub roi_percent: f64,
}

/// Insert or overwrite the snapshot of `snapshot.date`
pub fn upsert_snapshot(conn: &Connection, user_id: i64, snapshot: &Snapshot) -> Result<()> {
    conn.execute(
        r#"INSERT INTO portfolio_snapshots
               (user_id, snapshot_date, portfolio_value, accumulated_cash, net_gain, roi_percent)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6)
           ON CONFLICT(user_id, snapshot_date) DO UPDATE SET
               portfolio_value = excluded.portfolio_value,
               accumulated_cash = excluded.accumulated_cash,
               net_gain = excluded.net_gain,
               roi_percent = excluded.roi_percent,
               created_at = datetime('now')"#,
        params![
            user_id,
            snapshot.date.to_string(),
            snapshot.portfolio_value,
            snapshot.accumulated_cash,
            snapshot.net_gain,
            snapshot.roi_percent
        ],
    )?;
    Ok(())
}

/// Snapshot values of a user up to and including `until`, oldest first.
/// Rows with an unreadable date are skipped.
pub fn load_snapshot_values(
    conn: &Connection,
    user_id: i64,
    until: NaiveDate,
) -> Result<Vec<(NaiveDate, f64)>> {
    let mut stmt = conn.prepare(
        r#"SELECT snapshot_date, portfolio_value FROM portfolio_snapshots
           WHERE user_id = ?1 AND date(snapshot_date) <= date(?2)
           ORDER BY date(snapshot_date)"#,
    )?;

    let rows = stmt
        .query_map(params![user_id, until.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(rows
        .into_iter()
        .filter_map(|(date, value)| match parse_date_flexible(&date) {
            Some(date) => Some((date, value)),
            None => {
                log::warn!("Skipping snapshot with unreadable date {:?}", date);
                None
            }
        })
        .collect())
}

pub fn upsert_price(
    conn: &Connection,
    symbol: &str,
    date: NaiveDate,
    close: f64,
    currency: &str,
) -> Result<()> {
    conn.execute(
        r#"INSERT OR REPLACE INTO stock_prices (symbol, price_date, close, currency)
           VALUES (?1, ?2, ?3, ?4)"#,
        params![symbol, date.to_string(), close, currency],
    )?;
    Ok(())
}

/// Latest close per symbol on or before `as_of`
pub fn latest_prices(conn: &Connection, as_of: NaiveDate) -> Result<HashMap<String, f64>> {
    let mut stmt = conn.prepare(
        r#"SELECT p.symbol, p.close
           FROM stock_prices p
           JOIN (
               SELECT symbol, MAX(price_date) AS price_date
               FROM stock_prices
               WHERE price_date <= ?1
               GROUP BY symbol
           ) latest ON latest.symbol = p.symbol AND latest.price_date = p.price_date"#,
    )?;

    let prices = stmt
        .query_map([as_of.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<rusqlite::Result<HashMap<_, _>>>()?;
    Ok(prices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DiagnosticKind;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn test_parse_date_flexible() {
        assert_eq!(parse_date_flexible("2024-01-15"), Some(date(2024, 1, 15)));
        assert_eq!(parse_date_flexible("2024-01-15 10:30:00"), Some(date(2024, 1, 15)));
        assert_eq!(parse_date_flexible("2024-01-15T10:30:00"), Some(date(2024, 1, 15)));
        assert_eq!(parse_date_flexible("15/01/2024"), None);
    }

    #[test]
    fn test_schema_is_idempotent() {
        let conn = test_db();
        init_schema(&conn).unwrap();
    }

    #[test]
    fn test_insert_and_load_ledger_order() {
        let conn = test_db();

        let later = Transaction::new(1, "KFH", "NBK", date(2024, 3, 1), TransactionKind::Sell)
            .with_shares(5.0)
            .with_sell_value(60.0);
        let earlier = Transaction::new(1, "KFH", "NBK", date(2024, 1, 1), TransactionKind::Buy)
            .with_shares(10.0)
            .with_purchase_cost(100.0);

        let later_id = insert_transaction(&conn, &later).unwrap();
        let earlier_id = insert_transaction(&conn, &earlier).unwrap();

        let ledger = load_ledger(&conn, 1, "NBK", "KFH").unwrap().rows;
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger[0].id, earlier_id);
        assert_eq!(ledger[1].id, later_id);
        assert_eq!(ledger[0].kind, TransactionKind::Buy);
        assert!(!ledger[0].uuid.is_empty());
        assert!(ledger[0].derived.is_none());
    }

    #[test]
    fn test_legacy_kind_spellings_load() {
        let conn = test_db();
        conn.execute(
            "INSERT INTO transactions
                 (user_id, portfolio, stock_symbol, txn_date, txn_type, bonus_shares)
             VALUES (1, 'KFH', 'NBK', '2024-02-01 00:00:00', 'Bonus', 10)",
            [],
        )
        .unwrap();

        let ledger = load_ledger(&conn, 1, "NBK", "KFH").unwrap().rows;
        assert_eq!(ledger[0].kind, TransactionKind::BonusShares);
        assert_eq!(ledger[0].date, date(2024, 2, 1));
    }

    #[test]
    fn test_unreadable_rows_skipped_and_reported() {
        let conn = test_db();
        insert_transaction(
            &conn,
            &Transaction::new(1, "KFH", "NBK", date(2024, 1, 1), TransactionKind::Buy)
                .with_shares(10.0)
                .with_purchase_cost(100.0),
        )
        .unwrap();
        conn.execute_batch(
            "INSERT INTO transactions (user_id, portfolio, stock_symbol, txn_date, txn_type)
                 VALUES (1, 'KFH', 'NBK', '2024-02-01', 'Split');
             INSERT INTO transactions (user_id, portfolio, stock_symbol, txn_date, txn_type, shares)
                 VALUES (1, 'KFH', 'NBK', 'someday', 'Buy', 1);
             INSERT INTO transactions (user_id, portfolio, stock_symbol, txn_date, txn_type, fees)
                 VALUES (1, 'KFH', 'NBK', '2024-03-01', 'Buy', -5);",
        )
        .unwrap();

        let loaded = load_ledger(&conn, 1, "NBK", "KFH").unwrap();

        assert_eq!(loaded.rows.len(), 1);
        assert_eq!(loaded.rejected.len(), 3);
        assert!(loaded
            .rejected
            .iter()
            .all(|d| matches!(
                &d.kind,
                DiagnosticKind::RejectedRow { table, .. } if table == "transactions"
            )));
        // Unparseable date is reported without one
        assert!(loaded.rejected.iter().any(|d| d.date.is_none()));

        let split_id: i64 = conn
            .query_row("SELECT id FROM transactions WHERE txn_type = 'Split'", [], |r| r.get(0))
            .unwrap();
        let err = get_transaction(&conn, split_id).unwrap_err();
        assert!(err
            .chain()
            .any(|cause| matches!(
                cause.downcast_ref::<CoreError>(),
                Some(CoreError::UnknownKind(_))
            )));
    }

    #[test]
    fn test_flow_categories_load_as_cash_flows() {
        let conn = test_db();
        conn.execute_batch(
            "INSERT INTO transactions
                 (user_id, portfolio, stock_symbol, txn_date, txn_type, purchase_cost, category)
                 VALUES (1, 'KFH', '', '2024-01-01', 'Deposit', 1000, 'FLOW_IN');
             INSERT INTO transactions
                 (user_id, portfolio, stock_symbol, txn_date, txn_type, sell_value, category)
                 VALUES (1, 'KFH', '', '2024-02-01', 'Withdrawal', 200, 'FLOW_OUT');
             INSERT INTO transactions
                 (user_id, portfolio, stock_symbol, txn_date, txn_type, purchase_cost)
                 VALUES (1, 'KFH', '', '2024-03-01', 'Transfer In', 50);",
        )
        .unwrap();

        let loaded = load_transactions(&conn, 1).unwrap();

        assert!(loaded.rejected.is_empty());
        let kinds: Vec<TransactionKind> = loaded.rows.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![TransactionKind::Deposit, TransactionKind::Withdrawal, TransactionKind::Deposit]
        );
        assert!(loaded.rows.iter().all(|t| t.include_in_analysis));
        let amounts: Vec<f64> = loaded.rows.iter().map(|t| t.flow_amount()).collect();
        assert_eq!(amounts, vec![1000.0, 200.0, 50.0]);
    }

    #[test]
    fn test_negative_magnitude_rejected_on_insert() {
        let conn = test_db();
        let txn = Transaction::new(1, "KFH", "NBK", date(2024, 1, 1), TransactionKind::Buy)
            .with_shares(-1.0);
        assert!(insert_transaction(&conn, &txn).is_err());
    }

    #[test]
    fn test_soft_delete_hides_row() {
        let conn = test_db();
        let txn = Transaction::new(1, "KFH", "NBK", date(2024, 1, 1), TransactionKind::Buy)
            .with_shares(1.0)
            .with_purchase_cost(1.0);
        let id = insert_transaction(&conn, &txn).unwrap();

        let key = soft_delete_transaction(&conn, id).unwrap();
        assert_eq!(key, Some((1, "NBK".to_string(), "KFH".to_string())));
        assert!(load_ledger(&conn, 1, "NBK", "KFH").unwrap().rows.is_empty());

        // Row is still there for audit
        let stored = get_transaction(&conn, id).unwrap().unwrap();
        assert!(stored.is_deleted);

        assert_eq!(soft_delete_transaction(&conn, 999).unwrap(), None);
    }

    #[test]
    fn test_derived_fields_round_trip_and_clear() {
        let conn = test_db();
        let txn = Transaction::new(1, "KFH", "NBK", date(2024, 1, 1), TransactionKind::Buy)
            .with_shares(10.0)
            .with_purchase_cost(100.0);
        let id = insert_transaction(&conn, &txn).unwrap();

        let derived = DerivedFields {
            avg_cost: 10.0,
            realized_pnl: 0.0,
            realized_pnl_cumulative: 0.0,
            cost_basis: 100.0,
            shares_held: 10.0,
        };
        let updated = write_derived_fields(
            &conn,
            &[ReplayedTransaction {
                transaction_id: id,
                derived,
            }],
        )
        .unwrap();
        assert_eq!(updated, 1);
        assert_eq!(get_transaction(&conn, id).unwrap().unwrap().derived, Some(derived));

        clear_derived_fields(&conn, 1, "NBK", "KFH").unwrap();
        assert_eq!(get_transaction(&conn, id).unwrap().unwrap().derived, None);
    }

    #[test]
    fn test_negative_legacy_deposit_becomes_withdrawal() {
        let conn = test_db();
        conn.execute(
            "INSERT INTO cash_deposits (user_id, portfolio, deposit_date, amount)
             VALUES (1, 'KFH', '2024-01-01', -300)",
            [],
        )
        .unwrap();
        insert_cash_deposit(
            &conn,
            &CashDeposit::new(1, "KFH", date(2024, 1, 2), 1000.0, DepositDirection::Deposit),
        )
        .unwrap();

        let deposits = load_cash_deposits(&conn, 1).unwrap().rows;
        assert_eq!(deposits.len(), 2);
        assert_eq!(deposits[0].direction, DepositDirection::Withdrawal);
        assert_eq!(deposits[0].amount, 300.0);
        assert_eq!(deposits[1].direction, DepositDirection::Deposit);
    }

    #[test]
    fn test_unreadable_deposit_skipped() {
        let conn = test_db();
        conn.execute_batch(
            "INSERT INTO cash_deposits (user_id, portfolio, deposit_date, amount, txn_type)
                 VALUES (1, 'KFH', '2024-01-01', 500, 'Deposit');
             INSERT INTO cash_deposits (user_id, portfolio, deposit_date, amount, txn_type)
                 VALUES (1, 'KFH', '2024-01-02', 500, 'Dividend');
             INSERT INTO cash_deposits (user_id, portfolio, deposit_date, amount, txn_type)
                 VALUES (1, 'KFH', 'n/a', 500, 'Deposit');",
        )
        .unwrap();

        let loaded = load_cash_deposits(&conn, 1).unwrap();

        assert_eq!(loaded.rows.len(), 1);
        assert_eq!(loaded.rejected.len(), 2);
    }

    #[test]
    fn test_snapshot_upsert_overwrites_same_day() {
        let conn = test_db();
        let mut snapshot = Snapshot {
            date: date(2024, 1, 31),
            portfolio_value: 1000.0,
            accumulated_cash: 100.0,
            net_gain: 0.0,
            roi_percent: 0.0,
        };
        upsert_snapshot(&conn, 1, &snapshot).unwrap();
        snapshot.portfolio_value = 1050.0;
        upsert_snapshot(&conn, 1, &snapshot).unwrap();
        upsert_snapshot(
            &conn,
            1,
            &Snapshot {
                date: date(2024, 3, 1),
                ..snapshot
            },
        )
        .unwrap();

        let values = load_snapshot_values(&conn, 1, date(2024, 2, 29)).unwrap();

        assert_eq!(values, vec![(date(2024, 1, 31), 1050.0)]);
        assert!(load_snapshot_values(&conn, 2, date(2024, 12, 31)).unwrap().is_empty());
    }

    #[test]
    fn test_latest_prices() {
        let conn = test_db();
        upsert_price(&conn, "NBK", date(2024, 1, 1), 1.0, "KWD").unwrap();
        upsert_price(&conn, "NBK", date(2024, 1, 5), 1.2, "KWD").unwrap();
        upsert_price(&conn, "NBK", date(2024, 2, 1), 9.9, "KWD").unwrap();

        let prices = latest_prices(&conn, date(2024, 1, 31)).unwrap();
        assert_eq!(prices.get("NBK"), Some(&1.2));
    }
}
