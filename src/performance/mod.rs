//! Performance calculation module
//!
//! Implements the portfolio return metrics:
//! - XIRR (Money-Weighted Rate of Return over dated, signed cash flows)
//! - ROI (net gain over capital contributed)
//! - TWR (chain-linked Time-Weighted Return)
//!
//! ## XIRR Formula
//!
//! XIRR finds the annual discount rate where Net Present Value (NPV) equals zero:
//!
//! ```text
//! NPV(r)  = Σ CF_i / (1 + r)^t_i = 0
//! NPV'(r) = Σ -t_i × CF_i / (1 + r)^(t_i + 1)
//!
//! Where:
//!   CF_i = Cash flow (negative = contributed by investor, positive = returned)
//!   t_i  = Years from the first cash flow, ACT/365.25
//! ```
//!
//! Newton-Raphson from r = 10%, falling back to bisection over
//! [-0.9999, hi] with hi escalated through 10, 20, 50, 100. When neither
//! converges the result is [`XirrOutcome::Undefined`]; an unconverged guess
//! is never reported as a rate.
//!
//! ## TWR Formula
//!
//! ```text
//! For each sub-period i between external cash flows:
//!   r_i = (V_end - CF) / V_start - 1      (end-of-day flow convention)
//!
//! Total TWR  = ∏(1 + r_i) - 1
//! Annualized = (1 + TWR)^(365/days) - 1
//! ```

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::cashflow::{CashFlowEvent, FlowKind};

const DAYS_PER_YEAR: f64 = 365.25;

const NEWTON_GUESS: f64 = 0.10;
const NEWTON_MAX_ITERATIONS: u32 = 200;
const NEWTON_STEP_TOLERANCE: f64 = 1e-10;
const NEWTON_RESIDUAL_TOLERANCE: f64 = 0.01;

const RATE_FLOOR: f64 = -0.9999;
const RATE_CEILING: f64 = 100.0;

const BISECTION_UPPER_BOUNDS: [f64; 4] = [10.0, 20.0, 50.0, 100.0];
const BISECTION_MAX_ITERATIONS: u32 = 1000;
const BISECTION_RESIDUAL_TOLERANCE: f64 = 1e-8;
/// Bracket width at which the sign change is pinned to machine precision
const BISECTION_WIDTH_TOLERANCE: f64 = 1e-12;

/// A dated, signed cash flow from the investor's point of view
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashFlow {
    pub date: NaiveDate,
    /// Negative = contributed, positive = returned to the investor
    pub amount: f64,
}

impl CashFlow {
    pub fn new(date: NaiveDate, amount: f64) -> Self {
        Self { date, amount }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverMethod {
    NewtonRaphson,
    Bisection,
}

/// IRR calculation result
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrrResult {
    /// Annualized rate as decimal (0.1 = 10%)
    pub irr: f64,
    pub method: SolverMethod,
    pub iterations: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UndefinedReason {
    /// Fewer than two distinct dates after merging same-day flows
    InsufficientFlows,
    /// All flows on one side: nothing contributed or nothing returned
    NoSignChange,
    /// Newton failed and NPV keeps its sign up to the bisection ceiling
    NoBracket,
    /// Newton failed and bisection did not settle
    NotConverged,
}

/// Money-weighted return; `Undefined` is a distinct "N/A" outcome, not 0%
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum XirrOutcome {
    Rate(IrrResult),
    Undefined { reason: UndefinedReason },
}

impl XirrOutcome {
    fn undefined(reason: UndefinedReason) -> Self {
        Self::Undefined { reason }
    }

    pub fn rate(&self) -> Option<f64> {
        match self {
            Self::Rate(result) => Some(result.irr),
            Self::Undefined { .. } => None,
        }
    }

    pub fn is_defined(&self) -> bool {
        matches!(self, Self::Rate(_))
    }
}

/// Sort by date and sum flows sharing a calendar day
pub fn merge_same_day(cash_flows: &[CashFlow]) -> Vec<CashFlow> {
    let mut sorted = cash_flows.to_vec();
    sorted.sort_by_key(|cf| cf.date);

    let mut merged: Vec<CashFlow> = Vec::with_capacity(sorted.len());
    for cf in sorted {
        match merged.last_mut() {
            Some(last) if last.date == cf.date => last.amount += cf.amount,
            _ => merged.push(cf),
        }
    }
    merged
}

/// Calculate the annualized money-weighted return of a signed cash-flow series
pub fn calculate_xirr(cash_flows: &[CashFlow]) -> XirrOutcome {
    let merged = merge_same_day(cash_flows);

    if merged.len() < 2 {
        return XirrOutcome::undefined(UndefinedReason::InsufficientFlows);
    }

    let has_negative = merged.iter().any(|cf| cf.amount < 0.0);
    let has_positive = merged.iter().any(|cf| cf.amount > 0.0);
    if !(has_negative && has_positive) {
        return XirrOutcome::undefined(UndefinedReason::NoSignChange);
    }

    let first_date = merged[0].date;
    let series: Vec<(f64, f64)> = merged
        .iter()
        .map(|cf| {
            let years = (cf.date - first_date).num_days() as f64 / DAYS_PER_YEAR;
            (cf.amount, years)
        })
        .collect();

    if let Some(result) = newton_raphson(&series) {
        return XirrOutcome::Rate(result);
    }

    log::debug!(
        "XIRR: Newton-Raphson did not converge on {} flows, bisecting",
        series.len()
    );

    match bisection(&series) {
        Ok(result) => XirrOutcome::Rate(result),
        Err(reason) => {
            log::warn!("XIRR: no rate found for {} flows ({:?})", series.len(), reason);
            XirrOutcome::undefined(reason)
        }
    }
}

/// Calculate NPV and its derivative at `rate` over (amount, years) pairs
fn calculate_npv_and_derivative(cash_flows: &[(f64, f64)], rate: f64) -> (f64, f64) {
    let mut npv = 0.0;
    let mut dnpv = 0.0;

    for (cf, years) in cash_flows {
        let discount = (1.0 + rate).powf(*years);
        npv += cf / discount;
        // d/dr [cf / (1+r)^t] = -t * cf / (1+r)^(t+1)
        dnpv -= years * cf / (discount * (1.0 + rate));
    }

    (npv, dnpv)
}

fn npv(cash_flows: &[(f64, f64)], rate: f64) -> f64 {
    calculate_npv_and_derivative(cash_flows, rate).0
}

fn newton_raphson(cash_flows: &[(f64, f64)]) -> Option<IrrResult> {
    let mut rate = NEWTON_GUESS;

    for iteration in 1..=NEWTON_MAX_ITERATIONS {
        let (value, derivative) = calculate_npv_and_derivative(cash_flows, rate);

        if !value.is_finite() || !derivative.is_finite() || derivative == 0.0 {
            return None;
        }

        let new_rate = (rate - value / derivative).clamp(RATE_FLOOR, RATE_CEILING);
        let step = (new_rate - rate).abs();
        rate = new_rate;

        if step < NEWTON_STEP_TOLERANCE {
            // Pinned on a clamp bound: the root lies outside the search range
            if rate <= RATE_FLOOR || rate >= RATE_CEILING {
                return None;
            }
            let residual = npv(cash_flows, rate);
            if residual.is_finite() && residual.abs() < NEWTON_RESIDUAL_TOLERANCE {
                log::debug!(
                    "XIRR: Newton-Raphson converged to {:.6} after {} iterations",
                    rate,
                    iteration
                );
                return Some(IrrResult {
                    irr: rate,
                    method: SolverMethod::NewtonRaphson,
                    iterations: iteration,
                });
            }
            // Stalled in a flat region
            return None;
        }
    }

    None
}

fn bisection(cash_flows: &[(f64, f64)]) -> Result<IrrResult, UndefinedReason> {
    let mut lo = RATE_FLOOR;
    let mut f_lo = npv(cash_flows, lo);
    if f_lo.is_nan() {
        return Err(UndefinedReason::NoBracket);
    }

    let mut hi = BISECTION_UPPER_BOUNDS
        .iter()
        .copied()
        .find(|&hi| {
            let f_hi = npv(cash_flows, hi);
            !f_hi.is_nan() && f_lo.signum() != f_hi.signum()
        })
        .ok_or(UndefinedReason::NoBracket)?;

    for iteration in 1..=BISECTION_MAX_ITERATIONS {
        let mid = (lo + hi) / 2.0;
        let f_mid = npv(cash_flows, mid);

        if f_mid.is_nan() {
            return Err(UndefinedReason::NotConverged);
        }

        if f_mid.abs() < BISECTION_RESIDUAL_TOLERANCE || (hi - lo) < BISECTION_WIDTH_TOLERANCE {
            log::debug!("XIRR: bisection converged to {:.6} after {} iterations", mid, iteration);
            return Ok(IrrResult {
                irr: mid,
                method: SolverMethod::Bisection,
                iterations: iteration,
            });
        }

        if f_mid.signum() == f_lo.signum() {
            lo = mid;
            f_lo = f_mid;
        } else {
            hi = mid;
        }
    }

    Err(UndefinedReason::NotConverged)
}

/// Simple return on contributed capital
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoiResult {
    pub total_deposits: f64,
    pub total_withdrawals: f64,
    /// current value + withdrawals - deposits
    pub net_gain: f64,
    /// net_gain / total_deposits as decimal
    pub roi: f64,
}

/// ROI over external flows: `(current_value - (deposits - withdrawals)) / deposits`.
///
/// Dividends and terminal rows in `events` are ignored; dividends are already
/// part of the current value through the cash balance. `None` when nothing
/// was deposited.
pub fn calculate_roi(events: &[CashFlowEvent], current_value: f64) -> Option<RoiResult> {
    let total_deposits: f64 = events
        .iter()
        .filter(|e| e.kind == FlowKind::Deposit)
        .map(|e| e.amount)
        .sum();
    let total_withdrawals: f64 = events
        .iter()
        .filter(|e| e.kind == FlowKind::Withdrawal)
        .map(|e| e.amount)
        .sum();

    if total_deposits <= 0.0 {
        return None;
    }

    let net_gain = current_value + total_withdrawals - total_deposits;

    Some(RoiResult {
        total_deposits,
        total_withdrawals,
        net_gain,
        roi: net_gain / total_deposits,
    })
}

/// TWR calculation result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwrResult {
    /// Total return as decimal (0.1 = 10%)
    pub total_return: f64,
    /// Annualized return as decimal
    pub annualized_return: f64,
    /// Number of days in the period
    pub days: i64,
    /// Sub-period returns for detailed analysis
    pub periods: Vec<PeriodReturn>,
}

/// A sub-period return (between cash flows)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodReturn {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub start_value: f64,
    pub end_value: f64,
    pub cash_flow: f64,
    pub return_rate: f64,
}

/// Chain-linked time-weighted return.
///
/// `valuations` are portfolio values after each day's flows; `flows` are
/// external flows into the portfolio (deposit positive, withdrawal negative).
/// Returns `None` with fewer than two valuations.
pub fn calculate_twr(valuations: &[(NaiveDate, f64)], flows: &[CashFlow]) -> Option<TwrResult> {
    let mut valuations = valuations.to_vec();
    valuations.sort_by_key(|(date, _)| *date);

    let (first_date, _) = *valuations.first()?;
    let (last_date, _) = *valuations.last()?;
    if valuations.len() < 2 || last_date <= first_date {
        return None;
    }

    // Sub-periods: start → cf1 → cf2 → ... → end
    let mut boundaries = vec![first_date];
    let mut flow_dates: Vec<NaiveDate> = flows
        .iter()
        .map(|cf| cf.date)
        .filter(|d| *d > first_date && *d < last_date)
        .collect();
    flow_dates.sort();
    boundaries.extend(flow_dates);
    boundaries.push(last_date);
    boundaries.dedup();

    let mut periods = Vec::with_capacity(boundaries.len() - 1);
    let mut cumulative = 1.0;

    for window in boundaries.windows(2) {
        let (period_start, period_end) = (window[0], window[1]);
        let start_value = find_value_at_or_near(&valuations, period_start);
        let end_value = find_value_at_or_near(&valuations, period_end);

        // End-of-day convention: the flow is already in V_end
        let cash_flow: f64 = flows
            .iter()
            .filter(|cf| cf.date == period_end)
            .map(|cf| cf.amount)
            .sum();

        let return_rate = if start_value > 0.0 {
            (end_value - cash_flow) / start_value - 1.0
        } else {
            0.0
        };
        cumulative *= 1.0 + return_rate;

        log::debug!(
            "TWR period {}-{}: start={:.2}, end={:.2}, cf={:.2}, return={:.4}%",
            period_start,
            period_end,
            start_value,
            end_value,
            cash_flow,
            return_rate * 100.0
        );

        periods.push(PeriodReturn {
            start_date: period_start,
            end_date: period_end,
            start_value,
            end_value,
            cash_flow,
            return_rate,
        });
    }

    let total_return = cumulative - 1.0;
    let days = (last_date - first_date).num_days();
    let annualized_return = if cumulative > 0.0 {
        cumulative.powf(365.0 / days as f64) - 1.0
    } else {
        -1.0
    };

    Some(TwrResult {
        total_return,
        annualized_return,
        days,
        periods,
    })
}

/// Value on the date, else the closest earlier one, else the closest later one
fn find_value_at_or_near(valuations: &[(NaiveDate, f64)], target_date: NaiveDate) -> f64 {
    let before = valuations
        .iter()
        .filter(|(date, _)| *date <= target_date)
        .max_by_key(|(date, _)| *date);
    let after = valuations
        .iter()
        .filter(|(date, _)| *date > target_date)
        .min_by_key(|(date, _)| *date);

    before.or(after).map(|(_, v)| *v).unwrap_or(0.0)
}
