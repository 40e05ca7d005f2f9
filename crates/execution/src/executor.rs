//! Signal-to-fill orchestration for one engine.
//!
//! [`TradeExecutor`] runs watcher gating, drawdown protection, and admission,
//! then hands the order to its [`ExecutionBackend`]. Every attempt produces a
//! [`TradeResult`]; rejections never surface as `Err`. Trade logging and
//! notifications are spawned and never awaited.

use crate::admission::AdmissionGate;
use crate::backend::{ExecutionBackend, ExecutionRequest};
use crate::ledger::CapitalLedger;
use crate::spawn_detached;
use crate::watcher::{ExitReason, WatcherBook};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tradegate_calibration::{AdaptiveCalibrationLoop, CalibrationOutcome, CalibrationSnapshot};
use tradegate_core::config::{PriorityFeeConfig, SimulatorConfig, SlippageControllerConfig, WatcherConfig};
use tradegate_core::events::{ExecutionMode, Rejection, Signal, TradeAction, TradeResult};
use tradegate_core::traits::{NotificationPriority, Notifier, Persistence};

/// Consecutive losing sells that raise a warning.
const LOSS_STREAK_WARNING: u32 = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub executed: u64,
    pub rejected: u64,
    /// Attempts that passed admission but did not fill.
    pub failed: u64,
    pub consecutive_losses: u32,
    pub max_consecutive_losses: u32,
}

/// Execution parameters read from the latest calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExecutionParams {
    slippage_bps: u32,
    tip_lamports: u64,
    congested: bool,
}

pub struct TradeExecutor {
    engine: String,
    ledger: Arc<CapitalLedger>,
    backend: Arc<dyn ExecutionBackend>,
    gate: AdmissionGate,
    watchers: Arc<WatcherBook>,
    calibration: Option<Arc<AdaptiveCalibrationLoop>>,
    calibration_rx: Option<watch::Receiver<CalibrationSnapshot>>,
    auto_calibrate: bool,
    persistence: Option<Arc<dyn Persistence>>,
    notifier: Option<Arc<dyn Notifier>>,
    congestion_move_pct: f64,
    stats: RwLock<ExecutorStats>,
}

impl std::fmt::Debug for TradeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeExecutor")
            .field("engine", &self.engine)
            .field("mode", &self.backend.mode())
            .field("gate", &self.gate)
            .field("calibrated", &self.calibration.is_some())
            .field("stats", &*self.stats.read())
            .finish_non_exhaustive()
    }
}

impl TradeExecutor {
    #[must_use]
    pub fn new(
        engine: impl Into<String>,
        ledger: Arc<CapitalLedger>,
        backend: Arc<dyn ExecutionBackend>,
        gate: AdmissionGate,
    ) -> Self {
        let engine = engine.into();
        ledger.register_engine(&engine);
        Self {
            engine,
            ledger,
            backend,
            gate,
            watchers: Arc::new(WatcherBook::new(WatcherConfig::default())),
            calibration: None,
            calibration_rx: None,
            auto_calibrate: false,
            persistence: None,
            notifier: None,
            congestion_move_pct: SimulatorConfig::default().congestion_move_pct,
            stats: RwLock::new(ExecutorStats::default()),
        }
    }

    /// Shares a watcher book, typically with other engines of the same process.
    #[must_use]
    pub fn with_watchers(mut self, watchers: Arc<WatcherBook>) -> Self {
        self.watchers = watchers;
        self
    }

    /// Reads slippage and tip from `calibration` on every order.
    #[must_use]
    pub fn with_calibration(mut self, calibration: Arc<AdaptiveCalibrationLoop>) -> Self {
        self.calibration_rx = Some(calibration.subscribe());
        self.calibration = Some(calibration);
        self
    }

    /// Steps the calibration loop after every sell. Off when a [`DualModeExecutor`]
    /// drives calibration instead.
    ///
    /// [`DualModeExecutor`]: crate::shadow::DualModeExecutor
    #[must_use]
    pub fn with_auto_calibration(mut self, enabled: bool) -> Self {
        self.auto_calibrate = enabled;
        self
    }

    /// Trade log destination.
    #[must_use]
    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    #[must_use]
    pub fn with_congestion_move_pct(mut self, move_pct: f64) -> Self {
        self.congestion_move_pct = move_pct;
        self
    }

    #[must_use]
    pub fn engine(&self) -> &str {
        &self.engine
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.backend.mode()
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<CapitalLedger> {
        &self.ledger
    }

    #[must_use]
    pub fn watchers(&self) -> &Arc<WatcherBook> {
        &self.watchers
    }

    #[must_use]
    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    #[must_use]
    pub fn stats(&self) -> ExecutorStats {
        self.stats.read().clone()
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Executes one signal. Always returns a result, successful or not.
    pub async fn execute(&self, signal: &Signal) -> TradeResult {
        let result = match signal.action {
            TradeAction::Hold => self.reject(signal, Rejection::NotActionable),
            TradeAction::Buy => self.execute_buy(signal).await,
            TradeAction::Sell => self.execute_sell(signal, None).await,
        };
        self.record(&result);
        result
    }

    /// Feeds a price to this engine's watcher for `symbol` and sells on an exit trigger.
    pub async fn on_price_tick(&self, symbol: &str, price: Decimal, now: DateTime<Utc>) -> Option<TradeResult> {
        let watcher = self.watchers.get_or_create(&self.engine, symbol, "");
        let (exit, mint) = {
            let mut w = watcher.lock();
            let exit = w.on_tick(price, now);
            (exit, w.mint().to_string())
        };
        let exit = exit?;

        let signal = Signal::sell(symbol, price)
            .with_mint(mint)
            .with_reason(exit.reason.to_string());
        let result = self.execute_sell(&signal, Some(exit.reason)).await;
        self.record(&result);
        Some(result)
    }

    async fn execute_buy(&self, signal: &Signal) -> TradeResult {
        let now = Utc::now();
        let watcher = self.watchers.get_or_create(&self.engine, &signal.symbol, &signal.mint);
        let watcher_congested = {
            let mut w = watcher.lock();
            w.observe_mint(&signal.mint);
            if let Err(rejection) = w.check_entry(now) {
                return self.reject(signal, rejection);
            }
            w.is_congested(self.congestion_move_pct)
        };

        // Open positions are marked at their last tick, or at cost before one arrives.
        let equity = self
            .ledger
            .account(&self.engine)
            .equity(&self.watchers.marks(&self.engine));
        let drawdown = self.ledger.check_drawdown_at(&self.engine, equity, now);
        if drawdown.breached {
            let detail = drawdown.detail.unwrap_or_else(|| "drawdown limit".to_string());
            return self.reject(signal, Rejection::DrawdownHalt { detail });
        }

        let admitted = match self.gate.admit_buy(&self.engine, signal).await {
            Ok(admitted) => admitted,
            Err(rejection) => return self.reject(signal, rejection),
        };

        if let Some(rejection) = self.tip_rejection(signal) {
            info!(engine = %self.engine, symbol = %signal.symbol, reason = %rejection, "Buy aborted");
            return self.reject(signal, rejection);
        }

        let params = self.execution_params();
        let request = ExecutionRequest::buy(&self.engine, signal.clone(), admitted.size_usd)
            .with_liquidity(admitted.liquidity_usd)
            .congested(signal.volatile || watcher_congested || params.congested)
            .with_calibration(params.slippage_bps, params.tip_lamports);

        let result = self.backend.execute(&request).await;
        if !result.success {
            return result;
        }

        if let Some(position) = self.ledger.get_position(&self.engine, &signal.symbol) {
            let mut w = watcher.lock();
            w.enter(position.avg_price, position.cost_basis_usd, Utc::now());
            self.watchers.persist(&w);
        }
        self.spawn_side_effects(&result);
        result
    }

    async fn execute_sell(&self, signal: &Signal, exit: Option<ExitReason>) -> TradeResult {
        let watcher = self.watchers.get(&self.engine, &signal.symbol);
        let rearm = || {
            if let Some(w) = &watcher {
                w.lock().exit_failed();
            }
        };

        let balance = match self.gate.admit_sell(&self.engine, &signal.symbol) {
            Ok(balance) => balance,
            Err(rejection) => {
                rearm();
                return self.reject(signal, rejection);
            }
        };

        let watcher_congested = watcher
            .as_ref()
            .is_some_and(|w| w.lock().is_congested(self.congestion_move_pct));
        let params = self.execution_params();
        let request = ExecutionRequest::sell(&self.engine, signal.clone())
            .with_quantity(balance)
            .congested(signal.volatile || watcher_congested || params.congested)
            .with_calibration(params.slippage_bps, params.tip_lamports);

        let result = self.backend.execute(&request).await;
        if !result.success {
            rearm();
            return result;
        }

        let now = Utc::now();
        if let Some(w) = &watcher {
            let mut w = w.lock();
            if self.ledger.get_position(&self.engine, &signal.symbol).is_none() {
                w.exit(exit, now);
            } else {
                w.exit_failed();
            }
            self.watchers.persist(&w);
        }

        self.track_losses(&result);
        self.after_sell(now).await;
        self.spawn_side_effects(&result);
        result
    }

    async fn after_sell(&self, now: DateTime<Utc>) {
        let report = self.ledger.perform_maintenance(&self.engine, now).await;
        let swept = report
            .zombies_sold
            .iter()
            .map(|(symbol, _)| symbol)
            .chain(report.dust_pruned.iter());
        for symbol in swept {
            if let Some(watcher) = self.watchers.get(&self.engine, symbol) {
                let mut w = watcher.lock();
                if w.is_in_position() {
                    w.exit(None, now);
                    self.watchers.persist(&w);
                    debug!(engine = %self.engine, symbol = %symbol, "Watcher cleared by maintenance");
                }
            }
        }

        if !self.auto_calibrate {
            return;
        }
        if let Some(calibration) = &self.calibration {
            match calibration.on_trade_executed() {
                CalibrationOutcome::Calibrated { action, congestion } => {
                    debug!(engine = %self.engine, ?action, ?congestion, "Calibration stepped");
                }
                outcome => debug!(engine = %self.engine, ?outcome, "Calibration not applied"),
            }
        }
    }

    fn tip_rejection(&self, signal: &Signal) -> Option<Rejection> {
        if self.mode() != ExecutionMode::Live {
            return None;
        }
        let calibration = self.calibration.as_ref()?;
        let expected = signal.expected_profit_usd?;
        let fees = calibration.fees();
        fees.should_abort(expected.try_into().unwrap_or(0.0))
            .then(|| Rejection::TipExceedsProfit {
                tip_usd: fees.tip_usd(),
                expected_profit_usd: expected,
            })
    }

    fn execution_params(&self) -> ExecutionParams {
        match &self.calibration_rx {
            Some(rx) => {
                let snapshot = rx.borrow();
                ExecutionParams {
                    slippage_bps: snapshot.slippage_bps,
                    tip_lamports: snapshot.tip_lamports,
                    congested: snapshot.congestion.is_congested(),
                }
            }
            None => ExecutionParams {
                slippage_bps: SlippageControllerConfig::default().initial_bps,
                tip_lamports: PriorityFeeConfig::default().base_tip_lamports,
                congested: false,
            },
        }
    }

    // =========================================================================
    // Bookkeeping
    // =========================================================================

    fn reject(&self, signal: &Signal, rejection: Rejection) -> TradeResult {
        TradeResult::rejected(&self.engine, &signal.symbol, signal.action, self.mode(), rejection)
    }

    fn record(&self, result: &TradeResult) {
        let mut stats = self.stats.write();
        if result.success {
            stats.executed += 1;
        } else if result.rejection.as_ref().is_some_and(|r| !matches!(r, Rejection::TransactionFailed { .. })) {
            stats.rejected += 1;
        } else {
            stats.failed += 1;
        }
    }

    fn track_losses(&self, result: &TradeResult) {
        let pnl = result.pnl_usd.unwrap_or(Decimal::ZERO);
        let mut stats = self.stats.write();
        if pnl > Decimal::ZERO {
            stats.consecutive_losses = 0;
            return;
        }
        stats.consecutive_losses += 1;
        stats.max_consecutive_losses = stats.max_consecutive_losses.max(stats.consecutive_losses);
        if stats.consecutive_losses >= LOSS_STREAK_WARNING {
            warn!(
                engine = %self.engine,
                streak = stats.consecutive_losses,
                last_pnl = %pnl,
                "Consecutive losing trades"
            );
        }
    }

    fn spawn_side_effects(&self, result: &TradeResult) {
        if let Some(store) = self.persistence.clone() {
            let entry = result.clone();
            spawn_detached(async move {
                if let Err(e) = store.append_trade(&entry).await {
                    warn!(symbol = %entry.symbol, error = %e, "Trade log append failed");
                }
            });
        }

        if let Some(notifier) = self.notifier.clone() {
            let message = trade_message(result);
            let priority = match result.pnl_usd {
                Some(pnl) if pnl < Decimal::ZERO => NotificationPriority::High,
                _ => NotificationPriority::Normal,
            };
            spawn_detached(async move {
                if let Err(e) = notifier.send(&message, priority).await {
                    debug!(error = %e, "Trade notification not delivered");
                }
            });
        }
    }
}

fn trade_message(result: &TradeResult) -> String {
    let mut message = format!(
        "[{}] {} {} {} {} @ {}",
        result.source,
        result.engine,
        result.action,
        result.quantity.round_dp(6),
        result.symbol,
        result.fill_price.round_dp(6),
    );
    if let Some(pnl) = result.pnl_usd {
        message.push_str(&format!(" | PnL ${pnl:.2}"));
    }
    if !result.reason.is_empty() {
        message.push_str(&format!(" | {}", result.reason));
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PaperBackend;
    use crate::persistence::MemoryPersistence;
    use crate::sampler::ScriptedFillSampler;
    use crate::simulator::ExecutionSimulator;
    use async_trait::async_trait;
    use chrono::Duration;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use tradegate_core::config::{AdmissionConfig, LedgerConfig, SlippageModelConfig};

    #[derive(Default)]
    struct RecordingNotifier {
        messages: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, message: &str, _priority: NotificationPriority) -> anyhow::Result<()> {
            self.messages.lock().push(message.to_string());
            Ok(())
        }
    }

    fn paper_executor(sampler: ScriptedFillSampler) -> TradeExecutor {
        let ledger = Arc::new(CapitalLedger::new(
            LedgerConfig::default(),
            SlippageModelConfig::frictionless(),
        ));
        let simulator = ExecutionSimulator::new(SimulatorConfig::deterministic(), Arc::clone(&ledger))
            .with_sampler(Arc::new(sampler));
        let gate = AdmissionGate::new(AdmissionConfig::default(), ExecutionMode::Paper, Arc::clone(&ledger));
        TradeExecutor::new("PRIMARY", ledger, Arc::new(PaperBackend::new(simulator)), gate)
    }

    fn buy(price: Decimal) -> Signal {
        Signal::buy("SOL", price)
            .with_mint("So11")
            .with_size(dec!(100))
            .with_confidence(0.9)
    }

    #[tokio::test]
    async fn test_hold_is_not_actionable() {
        let executor = paper_executor(ScriptedFillSampler::new());
        let mut signal = buy(dec!(100));
        signal.action = TradeAction::Hold;

        let result = executor.execute(&signal).await;
        assert_eq!(result.rejection, Some(Rejection::NotActionable));
        assert_eq!(executor.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_buy_enters_watcher_and_sell_flattens() {
        let executor = paper_executor(ScriptedFillSampler::new());

        let result = executor.execute(&buy(dec!(100))).await;
        assert!(result.success, "{}", result.reason);
        let watcher = executor.watchers().get("PRIMARY", "SOL").unwrap();
        assert!(watcher.lock().is_in_position());
        assert_eq!(watcher.lock().entry_price(), dec!(100));

        let sell = executor.execute(&Signal::sell("SOL", dec!(101))).await;
        assert!(sell.success);
        assert!(!watcher.lock().is_in_position());
        assert!(executor.ledger().get_position("PRIMARY", "SOL").is_none());
        assert_eq!(executor.stats().executed, 2);
        assert_eq!(executor.stats().consecutive_losses, 0);
    }

    #[tokio::test]
    async fn test_unrealized_loss_halts_buys() {
        let executor = paper_executor(ScriptedFillSampler::new());
        assert!(executor.execute(&buy(dec!(100))).await.success);

        // One unit held; a tick at 40 marks $60 of loss against $1000.
        let watcher = executor.watchers().get("PRIMARY", "SOL").unwrap();
        watcher.lock().on_tick(dec!(40), Utc::now());
        assert_eq!(executor.watchers().marks("PRIMARY").get("SOL"), Some(&dec!(40)));

        let other = Signal::buy("BONK", dec!(1)).with_size(dec!(50)).with_confidence(0.9);
        let result = executor.execute(&other).await;
        match result.rejection {
            Some(Rejection::DrawdownHalt { detail }) => assert!(detail.contains("DAILY DD"), "{detail}"),
            other => panic!("expected drawdown halt, got {other:?}"),
        }
        assert!(executor.ledger().get_position("PRIMARY", "BONK").is_none());
    }

    #[tokio::test]
    async fn test_second_buy_within_cooldown_rejected() {
        let executor = paper_executor(ScriptedFillSampler::new());
        assert!(executor.execute(&buy(dec!(100))).await.success);

        let result = executor.execute(&buy(dec!(100))).await;
        assert!(matches!(result.rejection, Some(Rejection::CooldownActive { .. })));
    }

    #[tokio::test]
    async fn test_sell_without_position_rejected() {
        let executor = paper_executor(ScriptedFillSampler::new());
        let result = executor.execute(&Signal::sell("SOL", dec!(100))).await;
        assert_eq!(
            result.rejection,
            Some(Rejection::NoPosition {
                symbol: "SOL".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_stop_loss_tick_sells_and_hibernates() {
        let executor = paper_executor(ScriptedFillSampler::new());
        assert!(executor.execute(&buy(dec!(100))).await.success);

        let now = Utc::now();
        assert!(executor.on_price_tick("SOL", dec!(99), now).await.is_none());

        let result = executor.on_price_tick("SOL", dec!(96), now).await.unwrap();
        assert!(result.success);
        assert_eq!(result.reason, "STOP_LOSS");
        assert_eq!(executor.stats().consecutive_losses, 1);

        let watcher = executor.watchers().get("PRIMARY", "SOL").unwrap();
        let w = watcher.lock();
        assert!(!w.is_in_position());
        assert!(w.hibernate_until().is_some_and(|t| t > now + Duration::minutes(29)));
    }

    #[tokio::test]
    async fn test_failed_exit_rearms_watcher() {
        let executor = paper_executor(ScriptedFillSampler::new().with_failures([false, true]));
        assert!(executor.execute(&buy(dec!(100))).await.success);

        let now = Utc::now();
        let failed = executor.on_price_tick("SOL", dec!(96), now).await.unwrap();
        assert!(!failed.success);
        assert_eq!(executor.stats().failed, 1);

        let retried = executor.on_price_tick("SOL", dec!(96), now).await.unwrap();
        assert!(retried.success);
    }

    #[tokio::test]
    async fn test_trade_log_and_notification_spawned() {
        let store = Arc::new(MemoryPersistence::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let executor = paper_executor(ScriptedFillSampler::new())
            .with_persistence(store.clone())
            .with_notifier(notifier.clone());

        assert!(executor.execute(&buy(dec!(100))).await.success);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(store.trades().len(), 1);
        let messages = notifier.messages.lock();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("BUY"));
        assert!(messages[0].contains("SOL"));
    }

    #[tokio::test]
    async fn test_drawdown_halts_buys() {
        let executor = paper_executor(ScriptedFillSampler::new());
        executor.ledger().check_drawdown("PRIMARY", dec!(2000));

        let result = executor.execute(&buy(dec!(100))).await;
        assert!(matches!(result.rejection, Some(Rejection::DrawdownHalt { .. })));
    }

    #[test]
    fn test_trade_message_format() {
        let result = TradeResult::filled("PRIMARY", "SOL", TradeAction::Sell, ExecutionMode::Paper, dec!(160), dec!(0.5))
            .with_pnl(dec!(-1.234));
        let message = trade_message(&result);
        assert!(message.starts_with("[PAPER] PRIMARY SELL 0.5 SOL @ 160"));
        assert!(message.contains("PnL $-1.23"));
    }
}
