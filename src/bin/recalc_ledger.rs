//! Replay every position of a user, rebuild cash balances and report returns
//!
//! Usage: recalc_ledger <user_id> [settings.json]

use std::path::PathBuf;

use anyhow::{Context, Result};
use portfolio_tracker::{config, db, recalc};

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let user_id: i64 = args
        .next()
        .context("usage: recalc_ledger <user_id> [settings.json]")?
        .parse()
        .context("user_id must be an integer")?;
    let settings_path = args.next().map(PathBuf::from);

    let settings = config::load(settings_path.as_deref())?;

    println!("Opening database: {:?}", settings.database_path);
    let mut conn = db::open_database(&settings.database_path)?;

    println!("Recalculating ledger for user {}...", user_id);
    let report = recalc::recalc_user(&mut conn, user_id)?;
    println!("  {} transactions updated", report.transactions_updated);

    for position in report.positions.iter().filter(|p| p.is_open()) {
        println!(
            "  {:<10} {:<6} shares={:>12.3} avg={:>10.4} realized={:>12.3}",
            position.symbol,
            position.portfolio,
            position.shares_held,
            position.avg_cost(),
            position.realized_pnl_cumulative
        );
    }

    for balance in &report.balances {
        println!("  cash {:<6} {:>14.3} {}", balance.portfolio, balance.balance, balance.currency);
    }

    if !report.diagnostics.is_empty() {
        println!("{} integrity warnings:", report.diagnostics.len());
        for diagnostic in &report.diagnostics {
            println!("  {}", diagnostic);
        }
    }

    let today = chrono::Local::now().date_naive();
    let returns = recalc::evaluate_returns(&conn, user_id, &settings, today)?;

    println!(
        "Portfolio value: {:.3} {} (holdings {:.3}, cash {:.3})",
        returns.value.total,
        returns.base_currency,
        returns.value.holdings_value,
        returns.value.cash_value
    );
    match returns.mwrr.rate() {
        Some(rate) => println!("MWRR: {:.2}%", rate * 100.0),
        None => println!("MWRR: N/A"),
    }
    match returns.roi {
        Some(roi) => println!("ROI: {:.2}% (net gain {:.3})", roi.roi * 100.0, roi.net_gain),
        None => println!("ROI: N/A"),
    }
    match &returns.twr {
        Some(twr) => println!(
            "TWR: {:.2}% over {} days ({:.2}% annualized)",
            twr.total_return * 100.0,
            twr.days,
            twr.annualized_return * 100.0
        ),
        None => println!("TWR: N/A (needs two daily snapshots)"),
    }

    println!("Done!");
    Ok(())
}
