//! Portfolio cash balance
//!
//! ```text
//! balance = Σ deposits − Σ withdrawals − Σ buy costs + Σ sell proceeds
//!         + Σ cash dividends − Σ fees
//! ```
//!
//! Always a full recomputation over active rows; there is no incremental
//! path. Each (user, portfolio) is independent, nothing is netted across
//! portfolios. Amounts are taken in the portfolio's own currency.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::{CashDeposit, DepositDirection, Transaction, TransactionKind};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashBalance {
    pub user_id: i64,
    pub portfolio: String,
    pub currency: String,
    pub deposits: f64,
    pub withdrawals: f64,
    pub buys: f64,
    pub sells: f64,
    pub dividends: f64,
    pub fees: f64,
    pub balance: f64,
}

impl CashBalance {
    fn new(user_id: i64, portfolio: &str, currency: &str) -> Self {
        Self {
            user_id,
            portfolio: portfolio.to_string(),
            currency: currency.to_string(),
            ..Default::default()
        }
    }

    fn add_transaction(&mut self, txn: &Transaction) {
        match txn.kind {
            TransactionKind::Buy => self.buys += txn.purchase_cost,
            TransactionKind::Sell => self.sells += txn.sell_value,
            TransactionKind::Deposit => self.deposits += txn.flow_amount(),
            TransactionKind::Withdrawal => self.withdrawals += txn.flow_amount(),
            TransactionKind::BonusShares | TransactionKind::DividendOnly => {}
        }
        // Dividends and fees count on any row that carries them
        self.dividends += txn.cash_dividend;
        self.fees += txn.fees;
    }

    fn add_deposit(&mut self, deposit: &CashDeposit) {
        match deposit.direction {
            DepositDirection::Deposit => self.deposits += deposit.amount,
            DepositDirection::Withdrawal => self.withdrawals += deposit.amount,
        }
    }

    fn finish(mut self) -> Self {
        self.balance =
            self.deposits - self.withdrawals - self.buys + self.sells + self.dividends - self.fees;
        self
    }
}

/// Balance of one (user, portfolio)
pub fn accumulate(
    user_id: i64,
    portfolio: &str,
    transactions: &[Transaction],
    deposits: &[CashDeposit],
) -> CashBalance {
    let currency = transactions
        .iter()
        .find(|t| t.user_id == user_id && t.portfolio == portfolio)
        .map(|t| t.currency.as_str())
        .or_else(|| {
            deposits
                .iter()
                .find(|d| d.user_id == user_id && d.portfolio == portfolio)
                .map(|d| d.currency.as_str())
        })
        .unwrap_or("KWD");

    let mut balance = CashBalance::new(user_id, portfolio, currency);

    for txn in transactions
        .iter()
        .filter(|t| t.is_active() && t.user_id == user_id && t.portfolio == portfolio)
    {
        balance.add_transaction(txn);
    }

    for deposit in deposits
        .iter()
        .filter(|d| d.is_active() && d.user_id == user_id && d.portfolio == portfolio)
    {
        balance.add_deposit(deposit);
    }

    balance.finish()
}

/// Balances of every (user, portfolio) appearing in either source
pub fn accumulate_all(transactions: &[Transaction], deposits: &[CashDeposit]) -> Vec<CashBalance> {
    let mut balances: BTreeMap<(i64, String), CashBalance> = BTreeMap::new();

    for txn in transactions.iter().filter(|t| t.is_active()) {
        balances
            .entry((txn.user_id, txn.portfolio.clone()))
            .or_insert_with(|| CashBalance::new(txn.user_id, &txn.portfolio, &txn.currency))
            .add_transaction(txn);
    }

    for deposit in deposits.iter().filter(|d| d.is_active()) {
        balances
            .entry((deposit.user_id, deposit.portfolio.clone()))
            .or_insert_with(|| {
                CashBalance::new(deposit.user_id, &deposit.portfolio, &deposit.currency)
            })
            .add_deposit(deposit);
    }

    balances.into_values().map(CashBalance::finish).collect()
}
