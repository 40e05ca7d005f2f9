//! Paper-trading simulation over a seeded random walk.
//!
//! Each engine runs in its own task behind an [`EngineHandle`]; all engines
//! share one ledger and one watcher book. A simple momentum rule turns the
//! walk into buy and sell signals, and every tick is fed to the watchers so
//! trailing stops and take-profits fire on their own.

use super::{open_store, resolve_data_dir};
use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tradegate_calibration::{AdaptiveCalibrationLoop, DriftSource, ShadowAuditor};
use tradegate_core::backoff::Backoff;
use tradegate_core::config::AppConfig;
use tradegate_core::events::{ExecutionMode, Signal};
use tradegate_core::traits::Persistence;
use tradegate_execution::{
    spawn_engine, AdmissionGate, CapitalLedger, EngineHandle, ExecutionSimulator, ExecutorStats,
    JsonFilePersistence, PaperBackend, TracingNotifier, TradeExecutor, WatcherBook,
};

/// Arguments for the simulate command.
#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Number of price ticks to simulate
    #[arg(long, default_value_t = 200)]
    pub ticks: usize,

    /// Seed for the price walk and the fill sampler
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Engines to run (repeatable). Defaults to `engines.names` from the config.
    #[arg(long = "engine")]
    pub engines: Vec<String>,

    /// Symbols to trade (repeatable)
    #[arg(long = "symbol", default_values_t = vec!["SOL".to_string()])]
    pub symbols: Vec<String>,

    /// Starting price for every symbol
    #[arg(long, default_value = "150")]
    pub start_price: Decimal,

    /// Maximum fractional price move per tick
    #[arg(long, default_value_t = 0.01)]
    pub volatility: f64,

    /// Ticks of history the momentum rule looks back over
    #[arg(long, default_value_t = 5)]
    pub lookback: usize,

    /// Emit signals every N ticks
    #[arg(long, default_value_t = 3)]
    pub signal_every: usize,

    /// Real time between ticks in milliseconds
    #[arg(long, default_value_t = 0)]
    pub tick_ms: u64,

    /// Data directory (overrides `persistence.data_dir`)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Run without persisting anything
    #[arg(long)]
    pub no_persist: bool,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,
}

impl Default for SimulateArgs {
    fn default() -> Self {
        Self {
            ticks: 200,
            seed: 42,
            engines: Vec::new(),
            symbols: vec!["SOL".to_string()],
            start_price: Decimal::from(150),
            volatility: 0.01,
            lookback: 5,
            signal_every: 3,
            tick_ms: 0,
            data_dir: None,
            no_persist: false,
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineSummary {
    pub engine: String,
    pub executed: u64,
    pub rejected: u64,
    pub failed: u64,
    pub cash_usd: Decimal,
    pub equity_usd: Decimal,
    pub open_positions: usize,
    pub realized_pnl_usd: Decimal,
    pub win_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationSummary {
    pub ticks: usize,
    pub seed: u64,
    pub restored: bool,
    pub engines: Vec<EngineSummary>,
    pub final_prices: BTreeMap<String, Decimal>,
}

/// Price walk plus the short history the momentum rule needs.
struct Walk {
    price: Decimal,
    history: VecDeque<Decimal>,
}

/// Runs the simulate command.
///
/// # Errors
///
/// Returns an error if the persistence backend cannot be opened or its ledger
/// snapshot cannot be read, or if an engine task stops unexpectedly.
pub async fn run_simulate(config: &AppConfig, args: &SimulateArgs) -> Result<SimulationSummary> {
    let store = if args.no_persist || !config.persistence.enabled {
        None
    } else {
        Some(open_store(&resolve_data_dir(config, args.data_dir.as_deref()))?)
    };

    let mut ledger = CapitalLedger::new(config.ledger.clone(), config.slippage_model.clone());
    if let Some(store) = &store {
        ledger = ledger.with_persistence(store.clone(), Backoff::new("ledger-store", config.backoff.clone()));
    }
    let ledger = Arc::new(ledger);

    let restored = match &store {
        Some(store) => restore_state(store, &ledger).await?,
        None => false,
    };

    let mut watchers = WatcherBook::new(config.watcher.clone());
    if let Some(store) = &store {
        watchers = watchers.with_persistence(store.clone());
        let loaded = watchers
            .load_from(store.as_ref())
            .await
            .context("loading watcher state")?;
        let report = watchers.reconcile(&ledger);
        info!(
            loaded,
            matched = report.matched,
            orphans = report.orphans.len(),
            stale = report.stale_cleared.len(),
            "Watchers reconciled"
        );
    }
    let watchers = Arc::new(watchers);

    // Paper-only runs never audit, so calibration holds its configured starting point.
    let calibration = Arc::new(AdaptiveCalibrationLoop::new(
        Arc::new(ShadowAuditor::new(config.auditor.clone())) as Arc<dyn DriftSource>,
        config.slippage_controller.clone(),
        config.priority_fee.clone(),
    ));

    let engine_names = if args.engines.is_empty() {
        config.engines.names.clone()
    } else {
        args.engines.clone()
    };

    let mut engines: Vec<(EngineHandle, JoinHandle<ExecutorStats>)> = Vec::with_capacity(engine_names.len());
    for (index, name) in engine_names.iter().enumerate() {
        let executor = build_executor(
            name,
            args.seed.wrapping_add(index as u64),
            config,
            &ledger,
            &watchers,
            &calibration,
            store.as_ref(),
        );
        engines.push(spawn_engine(Arc::new(executor), 64, None));
    }

    info!(
        engines = engines.len(),
        symbols = args.symbols.len(),
        ticks = args.ticks,
        seed = args.seed,
        "Simulation started"
    );

    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut walks: BTreeMap<String, Walk> = args
        .symbols
        .iter()
        .map(|symbol| {
            (
                symbol.clone(),
                Walk {
                    price: args.start_price,
                    history: VecDeque::with_capacity(args.lookback + 1),
                },
            )
        })
        .collect();

    let signal_every = args.signal_every.max(1);
    for tick in 0..args.ticks {
        for (symbol, walk) in &mut walks {
            step(walk, &mut rng, args.volatility, args.lookback);

            for (handle, _) in &engines {
                handle.tick(symbol.as_str(), walk.price, Utc::now()).await?;
            }

            if tick % signal_every != 0 {
                continue;
            }
            for (handle, _) in &engines {
                let held = ledger.get_position(handle.engine(), symbol).is_some();
                if let Some(signal) = momentum_signal(symbol, walk, held, &mut rng) {
                    let result = handle.submit(signal).await?;
                    if !result.success {
                        tracing::debug!(engine = %handle.engine(), symbol = %symbol, reason = %result.reason, "Signal not filled");
                    }
                }
            }
        }

        if args.tick_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.tick_ms)).await;
        }
    }

    let final_prices: BTreeMap<String, Decimal> =
        walks.iter().map(|(symbol, walk)| (symbol.clone(), walk.price)).collect();
    let marks: HashMap<String, Decimal> = final_prices.clone().into_iter().collect();

    let mut summaries = Vec::with_capacity(engines.len());
    for (handle, task) in engines {
        handle.shutdown().await?;
        let stats = task
            .await
            .with_context(|| format!("engine {} task panicked", handle.engine()))?;
        let ledger_stats = ledger.get_stats(handle.engine());
        summaries.push(EngineSummary {
            engine: handle.engine().to_string(),
            executed: stats.executed,
            rejected: stats.rejected,
            failed: stats.failed,
            cash_usd: ledger.get_available_cash(handle.engine()),
            equity_usd: ledger.equity(handle.engine(), &marks).round_dp(2),
            open_positions: ledger.position_count(handle.engine()),
            realized_pnl_usd: ledger_stats.total_pnl_usd.round_dp(2),
            win_rate: ledger_stats.win_rate(),
        });
    }

    if let Some(store) = &store {
        if let Err(e) = store.save_ledger(&ledger.snapshot()).await {
            warn!(error = %e, "Final ledger snapshot not saved");
        }
    }

    let summary = SimulationSummary {
        ticks: args.ticks,
        seed: args.seed,
        restored,
        engines: summaries,
        final_prices,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    Ok(summary)
}

/// Restores the last ledger snapshot. Returns whether one was found.
async fn restore_state(store: &JsonFilePersistence, ledger: &CapitalLedger) -> Result<bool> {
    let snapshot = store
        .load_ledger()
        .await
        .context("reading the ledger snapshot")?;
    match snapshot {
        Some(snapshot) => {
            info!(version = snapshot.version, engines = snapshot.engines.len(), "Ledger restored");
            ledger.restore(snapshot);
            Ok(true)
        }
        None => Ok(false),
    }
}

fn build_executor(
    engine: &str,
    seed: u64,
    config: &AppConfig,
    ledger: &Arc<CapitalLedger>,
    watchers: &Arc<WatcherBook>,
    calibration: &Arc<AdaptiveCalibrationLoop>,
    store: Option<&Arc<JsonFilePersistence>>,
) -> TradeExecutor {
    let mut simulator_config = config.simulator.clone();
    simulator_config.random_seed = Some(seed);
    let simulator = ExecutionSimulator::new(simulator_config, Arc::clone(ledger));
    let gate = AdmissionGate::new(config.admission.clone(), ExecutionMode::Paper, Arc::clone(ledger))
        .with_backoff(config.backoff.clone());

    let mut executor = TradeExecutor::new(engine, Arc::clone(ledger), Arc::new(PaperBackend::new(simulator)), gate)
        .with_watchers(Arc::clone(watchers))
        .with_calibration(Arc::clone(calibration))
        .with_congestion_move_pct(config.simulator.congestion_move_pct)
        .with_notifier(Arc::new(TracingNotifier::new("simulate")));
    if let Some(store) = store {
        executor = executor.with_persistence(store.clone() as Arc<dyn Persistence>);
    }
    executor
}

fn step(walk: &mut Walk, rng: &mut StdRng, volatility: f64, lookback: usize) {
    if walk.history.len() > lookback {
        walk.history.pop_front();
    }
    walk.history.push_back(walk.price);

    let volatility = volatility.abs();
    let change = if volatility > 0.0 {
        rng.gen_range(-volatility..=volatility)
    } else {
        0.0
    };
    let factor = Decimal::from_f64(1.0 + change).unwrap_or(Decimal::ONE);
    walk.price = (walk.price * factor).round_dp(6).max(Decimal::new(1, 6));
}

/// Buys flat symbols that rose over the lookback and sells held ones that fell.
fn momentum_signal(symbol: &str, walk: &Walk, held: bool, rng: &mut StdRng) -> Option<Signal> {
    let oldest = *walk.history.front()?;
    if !held && walk.price > oldest {
        Some(
            Signal::buy(symbol, walk.price)
                .with_confidence(rng.gen_range(0.3..0.95))
                .with_reason("momentum up"),
        )
    } else if held && walk.price < oldest {
        Some(Signal::sell(symbol, walk.price).with_reason("momentum down"))
    } else {
        None
    }
}

fn print_summary(summary: &SimulationSummary) {
    println!();
    println!("{}", "=".repeat(96));
    println!(
        "SIMULATION SUMMARY  ({} ticks, seed {}{})",
        summary.ticks,
        summary.seed,
        if summary.restored { ", resumed" } else { "" }
    );
    println!("{}", "=".repeat(96));
    println!(
        "{:<12} {:>9} {:>9} {:>7} {:>12} {:>12} {:>6} {:>12} {:>8}",
        "Engine", "Executed", "Rejected", "Failed", "Cash", "Equity", "Open", "Realized", "Win %"
    );
    println!("{}", "-".repeat(96));
    for engine in &summary.engines {
        println!(
            "{:<12} {:>9} {:>9} {:>7} {:>12.2} {:>12.2} {:>6} {:>12.2} {:>8.1}",
            engine.engine,
            engine.executed,
            engine.rejected,
            engine.failed,
            engine.cash_usd,
            engine.equity_usd,
            engine.open_positions,
            engine.realized_pnl_usd,
            engine.win_rate * 100.0
        );
    }
    println!();
    for (symbol, price) in &summary.final_prices {
        println!("Final {symbol}: {price}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tradegate_core::events::TradeAction;

    fn walk(history: &[Decimal], price: Decimal) -> Walk {
        Walk {
            price,
            history: history.iter().copied().collect(),
        }
    }

    #[test]
    fn test_momentum_buys_rising_flat_symbol() {
        let mut rng = StdRng::seed_from_u64(1);
        let signal = momentum_signal("SOL", &walk(&[dec!(100), dec!(101)], dec!(102)), false, &mut rng).unwrap();
        assert_eq!(signal.action, TradeAction::Buy);
        assert!(signal.confidence >= 0.3 && signal.confidence < 0.95);
    }

    #[test]
    fn test_momentum_sells_falling_held_symbol() {
        let mut rng = StdRng::seed_from_u64(1);
        let rising = walk(&[dec!(100)], dec!(102));
        let falling = walk(&[dec!(100)], dec!(98));

        assert!(momentum_signal("SOL", &rising, true, &mut rng).is_none());
        assert!(momentum_signal("SOL", &falling, false, &mut rng).is_none());
        let signal = momentum_signal("SOL", &falling, true, &mut rng).unwrap();
        assert_eq!(signal.action, TradeAction::Sell);
    }

    #[test]
    fn test_no_signal_without_history() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(momentum_signal("SOL", &walk(&[], dec!(100)), false, &mut rng).is_none());
    }

    #[test]
    fn test_walk_is_reproducible_and_bounded() {
        let mut a = walk(&[], dec!(150));
        let mut b = walk(&[], dec!(150));
        let mut rng_a = StdRng::seed_from_u64(9);
        let mut rng_b = StdRng::seed_from_u64(9);

        for _ in 0..50 {
            step(&mut a, &mut rng_a, 0.02, 5);
            step(&mut b, &mut rng_b, 0.02, 5);
        }

        assert_eq!(a.price, b.price);
        assert!(a.price > Decimal::ZERO);
        assert_eq!(a.history.len(), 6);
    }
}
