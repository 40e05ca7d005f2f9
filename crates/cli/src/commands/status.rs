//! Status CLI command.
//!
//! Reads the persisted ledger snapshot, open watchers, and the trade log from
//! a data directory without starting any engine.

use super::{open_existing_store, resolve_data_dir};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use rust_decimal::Decimal;
use serde::Serialize;
use std::path::PathBuf;
use tradegate_core::config::AppConfig;
use tradegate_core::events::TradeResult;
use tradegate_core::position::WatcherRecord;
use tradegate_core::traits::Persistence;

/// Arguments for the status command.
#[derive(Args, Debug, Clone, Default)]
pub struct StatusArgs {
    /// Data directory (overrides `persistence.data_dir`)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Number of recent trades to show
    #[arg(long, default_value_t = 10)]
    pub trades: usize,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineReport {
    pub engine: String,
    pub cash_usd: Decimal,
    pub gas_reserve: Decimal,
    pub book_equity_usd: Decimal,
    pub peak_equity_usd: Decimal,
    pub open_positions: usize,
    pub trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub failed_transactions: u32,
    pub realized_pnl_usd: Decimal,
    pub fees_paid_usd: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub snapshot_version: Option<u64>,
    pub saved_at: Option<DateTime<Utc>>,
    pub engines: Vec<EngineReport>,
    pub watchers: Vec<WatcherRecord>,
    pub trade_count: usize,
    pub recent_trades: Vec<TradeResult>,
}

/// Runs the status command.
///
/// # Errors
///
/// Returns an error if the data directory is missing or unreadable.
pub async fn run_status(config: &AppConfig, args: &StatusArgs) -> Result<StatusReport> {
    let store = open_existing_store(&resolve_data_dir(config, args.data_dir.as_deref()))?;

    let snapshot = store.load_ledger().await.context("reading the ledger snapshot")?;
    let mut watchers = store
        .load_all_positions()
        .await
        .context("reading watcher state")?;
    // Flat records only carry hibernation and trade-cap state.
    watchers.retain(|w| w.in_position);
    watchers.sort_by(|a, b| (&a.engine, &a.symbol).cmp(&(&b.engine, &b.symbol)));
    let trades = store.read_trades().context("reading the trade log")?;

    let mut engines: Vec<EngineReport> = snapshot
        .as_ref()
        .map(|snapshot| {
            snapshot
                .engines
                .iter()
                .map(|account| EngineReport {
                    engine: account.id.clone(),
                    cash_usd: account.cash_balance,
                    gas_reserve: account.gas_reserve,
                    book_equity_usd: account.book_equity().round_dp(2),
                    peak_equity_usd: account.peak_equity.round_dp(2),
                    open_positions: account.positions.len(),
                    trades: account.stats.trades,
                    wins: account.stats.wins,
                    losses: account.stats.losses,
                    failed_transactions: account.stats.failed_transactions,
                    realized_pnl_usd: account.stats.total_pnl_usd.round_dp(2),
                    fees_paid_usd: account.stats.fees_paid_usd,
                })
                .collect()
        })
        .unwrap_or_default();
    engines.sort_by(|a, b| a.engine.cmp(&b.engine));

    let skip = trades.len().saturating_sub(args.trades);
    let report = StatusReport {
        snapshot_version: snapshot.as_ref().map(|s| s.version),
        saved_at: snapshot.as_ref().map(|s| s.saved_at),
        engines,
        watchers,
        trade_count: trades.len(),
        recent_trades: trades.into_iter().skip(skip).collect(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(report)
}

fn print_report(report: &StatusReport) {
    println!();
    println!("{}", "=".repeat(100));
    match (report.snapshot_version, report.saved_at) {
        (Some(version), Some(saved_at)) => println!(
            "LEDGER STATUS  (snapshot v{version}, saved {})",
            saved_at.format("%Y-%m-%d %H:%M:%S")
        ),
        _ => println!("LEDGER STATUS  (no snapshot)"),
    }
    println!("{}", "=".repeat(100));

    if !report.engines.is_empty() {
        println!(
            "{:<12} {:>12} {:>10} {:>12} {:>12} {:>6} {:>7} {:>9} {:>7} {:>12}",
            "Engine", "Cash", "Gas", "Equity", "Peak", "Open", "Trades", "W/L", "Failed", "Realized"
        );
        println!("{}", "-".repeat(100));
        for engine in &report.engines {
            println!(
                "{:<12} {:>12.2} {:>10.4} {:>12.2} {:>12.2} {:>6} {:>7} {:>9} {:>7} {:>12.2}",
                engine.engine,
                engine.cash_usd,
                engine.gas_reserve,
                engine.book_equity_usd,
                engine.peak_equity_usd,
                engine.open_positions,
                engine.trades,
                format!("{}/{}", engine.wins, engine.losses),
                engine.failed_transactions,
                engine.realized_pnl_usd
            );
        }
    }

    println!();
    println!("Open watchers: {}", report.watchers.len());
    for watcher in &report.watchers {
        let stop = watcher
            .trailing_stop_price
            .map_or_else(|| "-".to_string(), |p| p.round_dp(6).to_string());
        println!(
            "  {:<10} {:<10} entry {:>12} max {:>12} trail {:>12}{}",
            watcher.engine,
            watcher.symbol,
            watcher.entry_price.round_dp(6),
            watcher.max_price_achieved.round_dp(6),
            stop,
            if watcher.orphan_recovered { "  (recovered)" } else { "" }
        );
    }

    println!();
    println!(
        "Trades logged: {} (showing last {})",
        report.trade_count,
        report.recent_trades.len()
    );
    for trade in &report.recent_trades {
        let pnl = trade
            .pnl_usd
            .map_or_else(String::new, |pnl| format!(" pnl {:.2}", pnl));
        println!(
            "  {} {:<8} {:<4} {:<8} {:>10} @ {:<12}{} {}",
            trade.timestamp.format("%H:%M:%S"),
            trade.engine,
            trade.action,
            trade.symbol,
            trade.quantity.round_dp(6),
            trade.fill_price.round_dp(6),
            pnl,
            if trade.success { "" } else { trade.reason.as_str() }
        );
    }
}
