use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// Closed set of ledger transaction kinds.
///
/// Legacy spellings found in imported data (`"Bonus"`, `"BONUS_SHARES"`,
/// `"Dividend"`, ...) are folded into these variants by [`FromStr`];
/// anything else is rejected at ingestion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    Buy,
    Sell,
    BonusShares,
    DividendOnly,
    Deposit,
    Withdrawal,
}

impl TransactionKind {
    /// Canonical storage spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "Buy",
            Self::Sell => "Sell",
            Self::BonusShares => "Bonus Shares",
            Self::DividendOnly => "DIVIDEND_ONLY",
            Self::Deposit => "Deposit",
            Self::Withdrawal => "Withdrawal",
        }
    }
}

impl FromStr for TransactionKind {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, ' ' | '_' | '-'))
            .collect::<String>()
            .to_ascii_uppercase();

        match normalized.as_str() {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            "BONUS" | "BONUSSHARES" | "BONUSSHARE" => Ok(Self::BonusShares),
            "DIVIDEND" | "DIVIDENDONLY" => Ok(Self::DividendOnly),
            "DEPOSIT" | "CASHIN" | "FLOWIN" | "TRANSFERIN" => Ok(Self::Deposit),
            "WITHDRAWAL" | "WITHDRAW" | "CASHOUT" | "FLOWOUT" | "TRANSFEROUT" => {
                Ok(Self::Withdrawal)
            }
            _ => Err(CoreError::UnknownKind(s.to_string())),
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields derived by replaying a position's ledger. Cached on the
/// transaction row, never an input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedFields {
    /// Average cost per share; for a Sell this is the average used for the sale
    pub avg_cost: f64,
    /// Realized P&L recognized by this transaction alone
    pub realized_pnl: f64,
    /// Running sum of `realized_pnl` up to and including this transaction
    pub realized_pnl_cumulative: f64,
    /// Remaining cost basis after this transaction
    pub cost_basis: f64,
    /// Shares held after this transaction
    pub shares_held: f64,
}

/// One ledger row. Magnitudes are non-negative; direction comes from `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Storage row id; doubles as insertion order for same-day ties
    pub id: i64,
    pub uuid: String,
    pub user_id: i64,
    pub portfolio: String,
    pub symbol: String,
    pub date: NaiveDate,
    pub kind: TransactionKind,
    pub shares: f64,
    pub bonus_shares: f64,
    pub purchase_cost: f64,
    pub sell_value: f64,
    pub cash_dividend: f64,
    pub reinvested_dividend: f64,
    pub fees: f64,
    /// Cash moved by a Deposit/Withdrawal row
    pub cash_amount: f64,
    pub currency: String,
    pub include_in_analysis: bool,
    pub is_deleted: bool,
    pub derived: Option<DerivedFields>,
}

impl Transaction {
    pub fn new(
        user_id: i64,
        portfolio: &str,
        symbol: &str,
        date: NaiveDate,
        kind: TransactionKind,
    ) -> Self {
        Self {
            id: 0,
            uuid: Uuid::new_v4().to_string(),
            user_id,
            portfolio: portfolio.to_string(),
            symbol: symbol.to_string(),
            date,
            kind,
            shares: 0.0,
            bonus_shares: 0.0,
            purchase_cost: 0.0,
            sell_value: 0.0,
            cash_dividend: 0.0,
            reinvested_dividend: 0.0,
            fees: 0.0,
            cash_amount: 0.0,
            currency: "KWD".to_string(),
            include_in_analysis: true,
            is_deleted: false,
            derived: None,
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = id;
        self
    }

    pub fn with_shares(mut self, shares: f64) -> Self {
        self.shares = shares;
        self
    }

    pub fn with_bonus_shares(mut self, bonus_shares: f64) -> Self {
        self.bonus_shares = bonus_shares;
        self
    }

    pub fn with_purchase_cost(mut self, purchase_cost: f64) -> Self {
        self.purchase_cost = purchase_cost;
        self
    }

    pub fn with_sell_value(mut self, sell_value: f64) -> Self {
        self.sell_value = sell_value;
        self
    }

    pub fn with_cash_dividend(mut self, cash_dividend: f64) -> Self {
        self.cash_dividend = cash_dividend;
        self
    }

    pub fn with_reinvested_dividend(mut self, reinvested_dividend: f64) -> Self {
        self.reinvested_dividend = reinvested_dividend;
        self
    }

    pub fn with_fees(mut self, fees: f64) -> Self {
        self.fees = fees;
        self
    }

    pub fn with_cash_amount(mut self, cash_amount: f64) -> Self {
        self.cash_amount = cash_amount;
        self
    }

    pub fn with_currency(mut self, currency: &str) -> Self {
        self.currency = currency.to_string();
        self
    }

    /// Rows the replay and the cash accumulator look at
    pub fn is_active(&self) -> bool {
        !self.is_deleted && self.include_in_analysis
    }

    /// Cash moved by a Deposit or Withdrawal row, 0 for other kinds.
    ///
    /// Older rows carry the amount in `purchase_cost` (deposits) or
    /// `sell_value` (withdrawals) and leave `cash_amount` empty.
    pub fn flow_amount(&self) -> f64 {
        match self.kind {
            TransactionKind::Deposit if self.cash_amount == 0.0 => self.purchase_cost,
            TransactionKind::Withdrawal if self.cash_amount == 0.0 => self.sell_value,
            TransactionKind::Deposit | TransactionKind::Withdrawal => self.cash_amount,
            _ => 0.0,
        }
    }

    /// (symbol, portfolio) key the position is tracked under
    pub fn position_key(&self) -> (&str, &str) {
        (&self.symbol, &self.portfolio)
    }

    /// Reject negative magnitudes. Called once at the storage boundary.
    pub fn validate(&self) -> CoreResult<()> {
        let fields = [
            ("shares", self.shares),
            ("bonus_shares", self.bonus_shares),
            ("purchase_cost", self.purchase_cost),
            ("sell_value", self.sell_value),
            ("cash_dividend", self.cash_dividend),
            ("reinvested_dividend", self.reinvested_dividend),
            ("fees", self.fees),
            ("cash_amount", self.cash_amount),
        ];

        for (field, value) in fields {
            if value < 0.0 || value.is_nan() {
                return Err(CoreError::NegativeAmount {
                    field,
                    value,
                    context: format!("{} {} on {}", self.kind, self.symbol, self.date),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DepositDirection {
    Deposit,
    Withdrawal,
}

impl DepositDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deposit => "Deposit",
            Self::Withdrawal => "Withdrawal",
        }
    }
}

impl FromStr for DepositDirection {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s.parse::<TransactionKind>()? {
            TransactionKind::Deposit => Ok(Self::Deposit),
            TransactionKind::Withdrawal => Ok(Self::Withdrawal),
            _ => Err(CoreError::UnknownKind(s.to_string())),
        }
    }
}

/// A bank-side cash movement into or out of a portfolio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashDeposit {
    pub id: i64,
    pub user_id: i64,
    pub portfolio: String,
    pub date: NaiveDate,
    /// Magnitude, always >= 0
    pub amount: f64,
    pub direction: DepositDirection,
    pub currency: String,
    pub bank_name: Option<String>,
    pub include_in_analysis: bool,
    pub is_deleted: bool,
}

impl CashDeposit {
    pub fn new(
        user_id: i64,
        portfolio: &str,
        date: NaiveDate,
        amount: f64,
        direction: DepositDirection,
    ) -> Self {
        Self {
            id: 0,
            user_id,
            portfolio: portfolio.to_string(),
            date,
            amount,
            direction,
            currency: "KWD".to_string(),
            bank_name: None,
            include_in_analysis: true,
            is_deleted: false,
        }
    }

    /// Build from a legacy signed amount, where a negative number meant a withdrawal.
    pub fn from_signed(user_id: i64, portfolio: &str, date: NaiveDate, signed_amount: f64) -> Self {
        let direction = if signed_amount < 0.0 {
            DepositDirection::Withdrawal
        } else {
            DepositDirection::Deposit
        };
        Self::new(user_id, portfolio, date, signed_amount.abs(), direction)
    }

    pub fn with_currency(mut self, currency: &str) -> Self {
        self.currency = currency.to_string();
        self
    }

    pub fn is_active(&self) -> bool {
        !self.is_deleted && self.include_in_analysis
    }

    /// Contribution to the portfolio's cash: deposits add, withdrawals subtract
    pub fn net_change(&self) -> f64 {
        match self.direction {
            DepositDirection::Deposit => self.amount,
            DepositDirection::Withdrawal => -self.amount,
        }
    }
}

/// Non-fatal data problem found while replaying a ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum DiagnosticKind {
    /// Sell quantity above the shares held; the position was clamped at zero
    Oversold { requested: f64, held: f64 },
    /// Buy with zero purchase cost
    NonPositiveCost,
    /// Trade or bonus row without a share quantity
    MissingShares,
    /// Sell without proceeds, or dividend row carrying nothing
    MissingAmount,
    /// Row belongs to another (symbol, portfolio) than the ledger being replayed
    ForeignRow { symbol: String, portfolio: String },
    /// Stored row that could not be read; left out of every calculation
    RejectedRow { table: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub transaction_id: i64,
    pub symbol: String,
    pub portfolio: String,
    /// Absent when the stored date itself could not be parsed
    pub date: Option<NaiveDate>,
    pub kind: DiagnosticKind,
}

impl Diagnostic {
    pub fn for_transaction(txn: &Transaction, kind: DiagnosticKind) -> Self {
        Self {
            transaction_id: txn.id,
            symbol: txn.symbol.clone(),
            portfolio: txn.portfolio.clone(),
            date: Some(txn.date),
            kind,
        }
    }

    /// A stored row of `table` that could not be read
    pub fn rejected(
        table: &str,
        id: i64,
        symbol: &str,
        portfolio: &str,
        date: Option<NaiveDate>,
        reason: String,
    ) -> Self {
        Self {
            transaction_id: id,
            symbol: symbol.to_string(),
            portfolio: portfolio.to_string(),
            date,
            kind: DiagnosticKind::RejectedRow {
                table: table.to_string(),
                reason,
            },
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn {} {}/{}", self.transaction_id, self.symbol, self.portfolio)?;
        match self.date {
            Some(date) => write!(f, " {}: ", date)?,
            None => f.write_str(": ")?,
        }
        match &self.kind {
            DiagnosticKind::Oversold { requested, held } => {
                write!(f, "sold {} shares with only {} held", requested, held)
            }
            DiagnosticKind::NonPositiveCost => f.write_str("buy without purchase cost"),
            DiagnosticKind::MissingShares => f.write_str("no share quantity"),
            DiagnosticKind::MissingAmount => f.write_str("no amount"),
            DiagnosticKind::ForeignRow { symbol, portfolio } => {
                write!(f, "row belongs to {}/{}", symbol, portfolio)
            }
            DiagnosticKind::RejectedRow { table, reason } => {
                write!(f, "skipped unreadable {} row: {}", table, reason)
            }
        }
    }
}
