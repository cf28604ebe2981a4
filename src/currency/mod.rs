//! Currency conversion module
//!
//! The core never fetches rates. Callers inject a [`RateSource`]:
//! - [`FixedRates`]: a fixed table of "units of base per unit of currency"
//! - [`SqliteRates`]: stored history with forward-fill for missing dates
//!   (weekend/holiday) and inverse-pair lookup, optionally backed by a
//!   [`FixedRates`] fallback
//!
//! A missing rate is an error. Nothing is ever converted 1:1 by assumption.

use std::collections::HashMap;

use anyhow::Result;
use chrono::NaiveDate;
use rusqlite::{params, Connection};

use crate::error::{CoreError, CoreResult};

/// Source of conversion factors: `amount_in_to = amount_in_from * rate(from, to, date)`
pub trait RateSource {
    fn rate(&self, from: &str, to: &str, date: NaiveDate) -> CoreResult<f64>;
}

/// Convert an amount from one currency to another on a specific date
pub fn convert(
    rates: &dyn RateSource,
    amount: f64,
    from: &str,
    to: &str,
    date: NaiveDate,
) -> CoreResult<f64> {
    if same_currency(from, to) {
        return Ok(amount);
    }

    Ok(amount * rates.rate(from, to, date)?)
}

fn same_currency(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Fixed, point-in-time rates against a single base currency
#[derive(Debug, Clone, Default)]
pub struct FixedRates {
    base: String,
    /// currency -> units of base for one unit of currency
    to_base: HashMap<String, f64>,
}

impl FixedRates {
    pub fn new(base: &str) -> Self {
        Self {
            base: base.to_ascii_uppercase(),
            to_base: HashMap::new(),
        }
    }

    pub fn with_rate(mut self, currency: &str, units_of_base: f64) -> Self {
        self.insert(currency, units_of_base);
        self
    }

    pub fn insert(&mut self, currency: &str, units_of_base: f64) {
        self.to_base.insert(currency.to_ascii_uppercase(), units_of_base);
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn to_base_rate(&self, currency: &str) -> Option<f64> {
        if same_currency(currency, &self.base) {
            return Some(1.0);
        }
        self.to_base
            .get(&currency.to_ascii_uppercase())
            .copied()
            .filter(|r| *r > 0.0 && r.is_finite())
    }
}

impl RateSource for FixedRates {
    fn rate(&self, from: &str, to: &str, date: NaiveDate) -> CoreResult<f64> {
        if same_currency(from, to) {
            return Ok(1.0);
        }

        // Cross through the base: from -> base -> to
        match (self.to_base_rate(from), self.to_base_rate(to)) {
            (Some(from_base), Some(to_base)) => Ok(from_base / to_base),
            _ => Err(CoreError::MissingRate {
                from: from.to_string(),
                to: to.to_string(),
                date,
            }),
        }
    }
}

/// Rates stored in the `exchange_rates` table
pub struct SqliteRates<'a> {
    conn: &'a Connection,
    fallback: Option<FixedRates>,
}

impl<'a> SqliteRates<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn, fallback: None }
    }

    /// Use a fixed table when the history has no usable rate
    pub fn with_fallback(mut self, fallback: FixedRates) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Rate on or before the date (forward-fill)
    fn lookup(&self, base: &str, target: &str, date: NaiveDate) -> Option<f64> {
        let sql = r#"
            SELECT rate FROM exchange_rates
            WHERE base_currency = ?1 AND target_currency = ?2 AND date <= ?3
            ORDER BY date DESC
            LIMIT 1
        "#;

        self.conn
            .query_row(
                sql,
                params![base.to_ascii_uppercase(), target.to_ascii_uppercase(), date.to_string()],
                |row| row.get::<_, f64>(0),
            )
            .ok()
            .filter(|r| *r > 0.0 && r.is_finite())
    }
}

impl RateSource for SqliteRates<'_> {
    fn rate(&self, from: &str, to: &str, date: NaiveDate) -> CoreResult<f64> {
        if same_currency(from, to) {
            return Ok(1.0);
        }

        if let Some(rate) = self.lookup(from, to, date) {
            return Ok(rate);
        }

        if let Some(rate) = self.lookup(to, from, date) {
            return Ok(1.0 / rate);
        }

        match &self.fallback {
            Some(fixed) => {
                let rate = fixed.rate(from, to, date)?;
                log::warn!(
                    "No stored {}/{} rate on or before {}, using fallback {}",
                    from,
                    to,
                    date,
                    rate
                );
                Ok(rate)
            }
            None => Err(CoreError::MissingRate {
                from: from.to_string(),
                to: to.to_string(),
                date,
            }),
        }
    }
}

/// Store exchange rate in database
pub fn store_rate(
    conn: &Connection,
    base: &str,
    target: &str,
    date: NaiveDate,
    rate: f64,
    source: &str,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT OR REPLACE INTO exchange_rates (base_currency, target_currency, date, rate, source)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
        params![
            base.to_ascii_uppercase(),
            target.to_ascii_uppercase(),
            date.to_string(),
            rate,
            source
        ],
    )?;

    Ok(())
}
