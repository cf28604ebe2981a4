//! Valuation of open positions
//!
//! Holdings are read straight off replayed [`Position`]s; nothing here is
//! persisted. The portfolio total (holdings plus cash, in the base currency)
//! is the terminal value for money-weighted returns.

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::cash::CashBalance;
use crate::currency::{convert, RateSource};
use crate::error::CoreResult;
use crate::position::Position;

/// Current holding of one (symbol, portfolio), in the position's currency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Holding {
    pub symbol: String,
    pub portfolio: String,
    pub currency: String,
    pub shares: f64,
    pub avg_cost: f64,
    pub cost_basis: f64,
    pub current_price: Option<f64>,
    /// At cost when no price is known
    pub market_value: f64,
    pub unrealized_pnl: Option<f64>,
    pub unrealized_pnl_percent: Option<f64>,
    pub realized_pnl: f64,
}

impl Holding {
    pub fn is_priced(&self) -> bool {
        self.current_price.is_some()
    }
}

/// Value every open position against `prices` (symbol → latest close)
pub fn value_positions(positions: &[Position], prices: &HashMap<String, f64>) -> Vec<Holding> {
    positions
        .iter()
        .filter(|p| p.is_open())
        .map(|p| {
            let current_price = prices
                .get(&p.symbol)
                .copied()
                .filter(|px| px.is_finite() && *px > 0.0);

            let market_value = match current_price {
                Some(price) => price * p.shares_held,
                None => {
                    log::warn!("No price for {} ({}), valuing at cost", p.symbol, p.portfolio);
                    p.total_cost
                }
            };

            let unrealized_pnl = current_price.map(|_| market_value - p.total_cost);
            let unrealized_pnl_percent = unrealized_pnl
                .filter(|_| p.total_cost > 0.0)
                .map(|gain| gain / p.total_cost * 100.0);

            Holding {
                symbol: p.symbol.clone(),
                portfolio: p.portfolio.clone(),
                currency: p.currency.clone(),
                shares: p.shares_held,
                avg_cost: p.avg_cost(),
                cost_basis: p.total_cost,
                current_price,
                market_value,
                unrealized_pnl,
                unrealized_pnl_percent,
                realized_pnl: p.realized_pnl_cumulative,
            }
        })
        .collect()
}

/// Total portfolio value in the base currency
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioValue {
    pub holdings_value: f64,
    pub cash_value: f64,
    pub total: f64,
}

/// Sum holdings and cash balances in `base_currency` as of `date`.
///
/// A foreign holding or balance without a rate fails the whole valuation.
pub fn portfolio_value(
    holdings: &[Holding],
    balances: &[CashBalance],
    rates: &dyn RateSource,
    base_currency: &str,
    date: NaiveDate,
) -> CoreResult<PortfolioValue> {
    let mut holdings_value = 0.0;
    for holding in holdings {
        holdings_value += convert(
            rates,
            holding.market_value,
            &holding.currency,
            base_currency,
            date,
        )?;
    }

    let mut cash_value = 0.0;
    for balance in balances {
        cash_value += convert(rates, balance.balance, &balance.currency, base_currency, date)?;
    }

    Ok(PortfolioValue {
        holdings_value,
        cash_value,
        total: holdings_value + cash_value,
    })
}
