//! Per-asset position lifecycle.
//!
//! A [`Watcher`] follows one `(engine, symbol)` through `FLAT -> IN_POSITION ->
//! FLAT`, tracks the trailing stop, and recommends exits. It never moves to
//! `FLAT` on its own: the executor calls [`Watcher::exit`] only after the ledger
//! confirms the sell. [`WatcherBook`] owns every watcher and keeps them in
//! step with persistence and the ledger.

use crate::ledger::CapitalLedger;
use crate::spawn_detached;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tradegate_core::config::WatcherConfig;
use tradegate_core::events::Rejection;
use tradegate_core::position::WatcherRecord;
use tradegate_core::traits::Persistence;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatcherPhase {
    Flat,
    InPosition,
}

impl fmt::Display for WatcherPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flat => write!(f, "FLAT"),
            Self::InPosition => write!(f, "IN_POSITION"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    TrailingStop,
    StopLoss,
    TakeProfit,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TrailingStop => write!(f, "TRAILING_STOP"),
            Self::StopLoss => write!(f, "STOP_LOSS"),
            Self::TakeProfit => write!(f, "TAKE_PROFIT"),
        }
    }
}

/// Sell recommendation emitted by a watcher.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExitSignal {
    pub reason: ExitReason,
    pub price: Decimal,
    pub entry_price: Decimal,
    pub pnl_pct: f64,
}

// =============================================================================
// Watcher
// =============================================================================

#[derive(Debug, Clone)]
pub struct Watcher {
    engine: String,
    symbol: String,
    mint: String,
    config: WatcherConfig,
    phase: WatcherPhase,
    entry_price: Decimal,
    cost_basis: Decimal,
    entry_time: Option<DateTime<Utc>>,
    max_price: Decimal,
    trailing_stop: Option<Decimal>,
    last_signal_time: Option<DateTime<Utc>>,
    hibernate_until: Option<DateTime<Utc>>,
    trade_times: VecDeque<DateTime<Utc>>,
    prices: VecDeque<(DateTime<Utc>, Decimal)>,
    orphan_recovered: bool,
    exit_pending: bool,
}

impl Watcher {
    #[must_use]
    pub fn new(
        engine: impl Into<String>,
        symbol: impl Into<String>,
        mint: impl Into<String>,
        config: WatcherConfig,
    ) -> Self {
        Self {
            engine: engine.into(),
            symbol: symbol.into(),
            mint: mint.into(),
            config,
            phase: WatcherPhase::Flat,
            entry_price: Decimal::ZERO,
            cost_basis: Decimal::ZERO,
            entry_time: None,
            max_price: Decimal::ZERO,
            trailing_stop: None,
            last_signal_time: None,
            hibernate_until: None,
            trade_times: VecDeque::new(),
            prices: VecDeque::new(),
            orphan_recovered: false,
            exit_pending: false,
        }
    }

    #[must_use]
    pub fn from_record(record: &WatcherRecord, config: WatcherConfig) -> Self {
        let mut watcher = Self::new(&record.engine, &record.symbol, &record.mint, config);
        watcher.phase = if record.in_position {
            WatcherPhase::InPosition
        } else {
            WatcherPhase::Flat
        };
        watcher.entry_price = record.entry_price;
        watcher.cost_basis = record.cost_basis;
        watcher.entry_time = record.entry_time;
        watcher.max_price = record.max_price_achieved;
        watcher.trailing_stop = record.trailing_stop_price;
        watcher.last_signal_time = record.last_signal_time;
        watcher.hibernate_until = record.hibernate_until;
        watcher.orphan_recovered = record.orphan_recovered;
        watcher.trade_times = record.recent_trades.iter().copied().collect();
        watcher
    }

    #[must_use]
    pub fn to_record(&self) -> WatcherRecord {
        WatcherRecord {
            engine: self.engine.clone(),
            symbol: self.symbol.clone(),
            mint: self.mint.clone(),
            in_position: self.is_in_position(),
            entry_price: self.entry_price,
            cost_basis: self.cost_basis,
            entry_time: self.entry_time,
            max_price_achieved: self.max_price,
            trailing_stop_price: self.trailing_stop,
            last_signal_time: self.last_signal_time,
            hibernate_until: self.hibernate_until,
            orphan_recovered: self.orphan_recovered,
            recent_trades: self.trade_times.iter().copied().collect(),
        }
    }

    /// Whether a restart would lose gating state if this watcher were not stored:
    /// an open position, an unexpired hibernation, or trades inside the hourly window.
    #[must_use]
    pub fn has_durable_state(&self, now: DateTime<Utc>) -> bool {
        self.is_in_position()
            || self.hibernate_until.is_some_and(|until| until > now)
            || self.trade_times.back().is_some_and(|t| *t > now - Duration::hours(1))
    }

    #[must_use]
    pub fn engine(&self) -> &str {
        &self.engine
    }

    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    #[must_use]
    pub fn mint(&self) -> &str {
        &self.mint
    }

    /// Fills in the mint for watchers first created from a price tick.
    pub fn observe_mint(&mut self, mint: &str) {
        if self.mint.is_empty() && !mint.is_empty() {
            self.mint = mint.to_string();
        }
    }

    #[must_use]
    pub fn phase(&self) -> WatcherPhase {
        self.phase
    }

    #[must_use]
    pub fn is_in_position(&self) -> bool {
        self.phase == WatcherPhase::InPosition
    }

    #[must_use]
    pub fn entry_price(&self) -> Decimal {
        self.entry_price
    }

    #[must_use]
    pub fn max_price(&self) -> Decimal {
        self.max_price
    }

    #[must_use]
    pub fn trailing_stop(&self) -> Option<Decimal> {
        self.trailing_stop
    }

    #[must_use]
    pub fn hibernate_until(&self) -> Option<DateTime<Utc>> {
        self.hibernate_until
    }

    /// Most recent tick, if any has been seen.
    #[must_use]
    pub fn last_price(&self) -> Option<Decimal> {
        self.prices.back().map(|(_, p)| *p)
    }

    #[must_use]
    pub fn is_orphan_recovered(&self) -> bool {
        self.orphan_recovered
    }

    /// Rejects a new buy while hibernating, cooling down, or over the hourly cap.
    ///
    /// # Errors
    ///
    /// `Hibernating`, `CooldownActive`, or `HourlyTradeLimit`.
    pub fn check_entry(&mut self, now: DateTime<Utc>) -> Result<(), Rejection> {
        if let Some(until) = self.hibernate_until {
            if now < until {
                return Err(Rejection::Hibernating {
                    remaining_secs: (until - now).num_seconds().max(1),
                });
            }
            self.hibernate_until = None;
        }

        if let Some(remaining) = self.cooldown_remaining(now) {
            return Err(Rejection::CooldownActive {
                remaining_secs: remaining,
            });
        }

        self.prune_trades(now);
        let count = u32::try_from(self.trade_times.len()).unwrap_or(u32::MAX);
        if count >= self.config.max_trades_per_hour {
            return Err(Rejection::HourlyTradeLimit {
                count,
                max: self.config.max_trades_per_hour,
            });
        }
        Ok(())
    }

    /// Seconds until a new signal may be evaluated, if still cooling down.
    #[must_use]
    pub fn cooldown_remaining(&self, now: DateTime<Utc>) -> Option<i64> {
        let last = self.last_signal_time?;
        let ready_at = last + Duration::seconds(self.config.signal_cooldown_secs);
        (now < ready_at).then(|| (ready_at - now).num_seconds().max(1))
    }

    /// Records a signal emission or consumption, restarting the cooldown.
    pub fn mark_signal(&mut self, now: DateTime<Utc>) {
        self.last_signal_time = Some(now);
    }

    /// Applies a confirmed buy. A buy while already in position re-anchors the entry.
    pub fn enter(&mut self, entry_price: Decimal, cost_basis: Decimal, now: DateTime<Utc>) {
        if self.is_in_position() {
            self.entry_price = entry_price;
            self.cost_basis = cost_basis;
            self.max_price = self.max_price.max(entry_price);
        } else {
            self.phase = WatcherPhase::InPosition;
            self.entry_price = entry_price;
            self.cost_basis = cost_basis;
            self.entry_time = Some(now);
            self.max_price = entry_price;
            self.trailing_stop = None;
            self.orphan_recovered = false;
        }
        self.exit_pending = false;
        self.mark_signal(now);
        self.trade_times.push_back(now);
    }

    /// Applies a confirmed full exit.
    pub fn exit(&mut self, reason: Option<ExitReason>, now: DateTime<Utc>) {
        self.reset_flat();
        self.mark_signal(now);
        self.trade_times.push_back(now);

        if reason == Some(ExitReason::StopLoss) && self.config.hibernation_secs > 0 {
            let until = now + Duration::seconds(self.config.hibernation_secs);
            self.hibernate_until = Some(until);
            info!(
                engine = %self.engine,
                symbol = %self.symbol,
                until = %until,
                "Hibernating after stop-loss"
            );
        }
    }

    /// Re-arms exit detection after a recommended sell did not go through.
    pub fn exit_failed(&mut self) {
        self.exit_pending = false;
    }

    /// Feeds one price. Returns an exit recommendation at most once per position.
    pub fn on_tick(&mut self, price: Decimal, now: DateTime<Utc>) -> Option<ExitSignal> {
        if price <= Decimal::ZERO {
            return None;
        }
        self.record_price(price, now);

        if !self.is_in_position() || self.entry_price <= Decimal::ZERO {
            return None;
        }

        if price > self.max_price {
            self.max_price = price;
        }

        if self.config.trailing_enabled {
            let gain = ratio(price - self.entry_price, self.entry_price);
            if gain >= self.config.trailing_activation_pct || self.trailing_stop.is_some() {
                let candidate = self.max_price * (Decimal::ONE - to_decimal(self.config.trailing_pct));
                if self.trailing_stop.map_or(true, |stop| candidate > stop) {
                    debug!(
                        engine = %self.engine,
                        symbol = %self.symbol,
                        stop = %candidate,
                        max_price = %self.max_price,
                        "Trailing stop raised"
                    );
                    self.trailing_stop = Some(candidate);
                }
            }
        }

        let stop_loss = self.entry_price * (Decimal::ONE + to_decimal(self.config.stop_loss_pct));
        let take_profit = self.entry_price * (Decimal::ONE + to_decimal(self.config.take_profit_pct));

        let reason = match self.trailing_stop {
            Some(stop) if price < stop => Some(ExitReason::TrailingStop),
            _ if price < stop_loss => Some(ExitReason::StopLoss),
            _ if price >= take_profit => Some(ExitReason::TakeProfit),
            _ => None,
        }?;

        if self.exit_pending {
            return None;
        }
        self.exit_pending = true;
        self.mark_signal(now);

        let exit = ExitSignal {
            reason,
            price,
            entry_price: self.entry_price,
            pnl_pct: self.unrealized_pnl_pct(price),
        };
        info!(
            engine = %self.engine,
            symbol = %self.symbol,
            reason = %exit.reason,
            price = %price,
            pnl_pct = exit.pnl_pct,
            "Exit triggered"
        );
        Some(exit)
    }

    /// Unrealized return versus entry, in percent.
    #[must_use]
    pub fn unrealized_pnl_pct(&self, price: Decimal) -> f64 {
        ratio(price - self.entry_price, self.entry_price) * 100.0
    }

    /// Largest relative swing inside the price window.
    #[must_use]
    pub fn price_move_pct(&self) -> f64 {
        let (Some(low), Some(high)) = (
            self.prices.iter().map(|(_, p)| *p).min(),
            self.prices.iter().map(|(_, p)| *p).max(),
        ) else {
            return 0.0;
        };
        ratio(high - low, low)
    }

    #[must_use]
    pub fn is_congested(&self, move_threshold: f64) -> bool {
        self.price_move_pct() > move_threshold
    }

    fn record_price(&mut self, price: Decimal, now: DateTime<Utc>) {
        self.prices.push_back((now, price));
        let cutoff = now - Duration::seconds(self.config.price_window_secs);
        while self.prices.front().is_some_and(|(t, _)| *t < cutoff) {
            self.prices.pop_front();
        }
    }

    fn prune_trades(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::hours(1);
        while self.trade_times.front().is_some_and(|t| *t <= cutoff) {
            self.trade_times.pop_front();
        }
    }

    fn reset_flat(&mut self) {
        self.phase = WatcherPhase::Flat;
        self.entry_price = Decimal::ZERO;
        self.cost_basis = Decimal::ZERO;
        self.entry_time = None;
        self.max_price = Decimal::ZERO;
        self.trailing_stop = None;
        self.orphan_recovered = false;
        self.exit_pending = false;
    }

    fn recover_orphan(&mut self, avg_price: Decimal, cost_basis: Decimal, opened_at: DateTime<Utc>) {
        self.phase = WatcherPhase::InPosition;
        self.entry_price = avg_price;
        self.cost_basis = cost_basis;
        self.entry_time = Some(opened_at);
        self.max_price = avg_price;
        self.trailing_stop = None;
        self.orphan_recovered = true;
        self.exit_pending = false;
    }
}

fn to_decimal(value: f64) -> Decimal {
    Decimal::try_from(value).unwrap_or(Decimal::ZERO)
}

fn ratio(numerator: Decimal, denominator: Decimal) -> f64 {
    if denominator <= Decimal::ZERO {
        return 0.0;
    }
    (numerator / denominator).try_into().unwrap_or(0.0)
}

// =============================================================================
// Watcher Book
// =============================================================================

/// Open position as seen by its watcher.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivePosition {
    pub engine: String,
    pub symbol: String,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub max_price: Decimal,
    pub trailing_stop: Option<Decimal>,
    pub pnl_pct: f64,
    pub pnl_usd: Decimal,
    pub orphan_recovered: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub matched: usize,
    /// Ledger positions that had no watcher in position.
    pub orphans: Vec<(String, String)>,
    /// Watchers in position without a ledger position, reset to flat.
    pub stale_cleared: Vec<(String, String)>,
}

type WatcherKey = (String, String);

pub struct WatcherBook {
    config: WatcherConfig,
    watchers: DashMap<WatcherKey, Arc<Mutex<Watcher>>>,
    persistence: Option<Arc<dyn Persistence>>,
}

impl fmt::Debug for WatcherBook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatcherBook")
            .field("watchers", &self.watchers.len())
            .field("persistent", &self.persistence.is_some())
            .finish_non_exhaustive()
    }
}

impl WatcherBook {
    #[must_use]
    pub fn new(config: WatcherConfig) -> Self {
        Self {
            config,
            watchers: DashMap::new(),
            persistence: None,
        }
    }

    #[must_use]
    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    #[must_use]
    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }

    pub fn get_or_create(&self, engine: &str, symbol: &str, mint: &str) -> Arc<Mutex<Watcher>> {
        let key = (engine.to_string(), symbol.to_string());
        if let Some(existing) = self.watchers.get(&key) {
            return Arc::clone(existing.value());
        }
        let entry = self.watchers.entry(key).or_insert_with(|| {
            debug!(engine = %engine, symbol = %symbol, "Watching new asset");
            Arc::new(Mutex::new(Watcher::new(engine, symbol, mint, self.config.clone())))
        });
        Arc::clone(entry.value())
    }

    #[must_use]
    pub fn get(&self, engine: &str, symbol: &str) -> Option<Arc<Mutex<Watcher>>> {
        self.watchers
            .get(&(engine.to_string(), symbol.to_string()))
            .map(|w| Arc::clone(w.value()))
    }

    /// Every watcher following `symbol`, across engines.
    #[must_use]
    pub fn watchers_for_symbol(&self, symbol: &str) -> Vec<Arc<Mutex<Watcher>>> {
        self.watchers
            .iter()
            .filter(|e| e.key().1 == symbol)
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    #[must_use]
    pub fn records(&self) -> Vec<WatcherRecord> {
        let mut records: Vec<WatcherRecord> = self.watchers.iter().map(|e| e.value().lock().to_record()).collect();
        records.sort_by(|a, b| (&a.engine, &a.symbol).cmp(&(&b.engine, &b.symbol)));
        records
    }

    /// Saves the watcher in the background while it carries durable state,
    /// otherwise deletes its record.
    pub fn persist(&self, watcher: &Watcher) {
        let Some(store) = self.persistence.clone() else {
            return;
        };
        let keep = watcher.has_durable_state(Utc::now());
        let record = watcher.to_record();
        spawn_detached(async move {
            let result = if keep {
                store.save_position(&record).await
            } else {
                store.delete_position(&record.engine, &record.symbol).await
            };
            match result {
                Ok(()) => debug!(engine = %record.engine, symbol = %record.symbol, "Watcher state persisted"),
                Err(e) => warn!(engine = %record.engine, symbol = %record.symbol, error = %e, "Watcher state not persisted"),
            }
        });
    }

    /// Restores watchers from persisted records.
    ///
    /// # Errors
    ///
    /// Returns an error if the records cannot be read.
    pub async fn load_from(&self, persistence: &dyn Persistence) -> anyhow::Result<usize> {
        let records = persistence.load_all_positions().await?;
        let loaded = records.len();
        for record in records {
            let watcher = Watcher::from_record(&record, self.config.clone());
            self.watchers
                .insert((record.engine.clone(), record.symbol.clone()), Arc::new(Mutex::new(watcher)));
        }
        info!(loaded, "Watcher state restored");
        Ok(loaded)
    }

    /// Brings watchers in line with the ledger, which is authoritative.
    pub fn reconcile(&self, ledger: &CapitalLedger) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for engine in ledger.engines() {
            for (symbol, position) in ledger.get_all_positions(&engine) {
                let watcher = self.get_or_create(&engine, &symbol, &position.mint);
                let mut w = watcher.lock();
                if w.is_in_position() {
                    report.matched += 1;
                    continue;
                }
                w.recover_orphan(position.avg_price, position.cost_basis_usd, position.opened_at);
                warn!(
                    engine = %engine,
                    symbol = %symbol,
                    avg_price = %position.avg_price,
                    "Orphaned ledger position, watcher synthesized"
                );
                self.persist(&w);
                report.orphans.push((engine.clone(), symbol));
            }
        }

        let tracked: Vec<(WatcherKey, Arc<Mutex<Watcher>>)> = self
            .watchers
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        for ((engine, symbol), watcher) in tracked {
            let mut w = watcher.lock();
            if w.is_in_position() && ledger.get_position(&engine, &symbol).is_none() {
                w.reset_flat();
                info!(engine = %engine, symbol = %symbol, "Watcher had no ledger position, reset to flat");
                self.persist(&w);
                report.stale_cleared.push((engine, symbol));
            }
        }

        info!(
            matched = report.matched,
            orphans = report.orphans.len(),
            stale = report.stale_cleared.len(),
            "Watcher reconciliation complete"
        );
        report
    }

    /// Unrealized PnL of every watcher in position, marked at `prices` or entry.
    #[must_use]
    pub fn active_positions(&self, prices: &HashMap<String, Decimal>) -> Vec<ActivePosition> {
        let mut active: Vec<ActivePosition> = self
            .watchers
            .iter()
            .filter_map(|e| {
                let w = e.value().lock();
                if !w.is_in_position() {
                    return None;
                }
                let current = prices.get(&w.symbol).copied().unwrap_or(w.entry_price);
                let pnl_pct = w.unrealized_pnl_pct(current);
                let pnl_usd = if w.entry_price > Decimal::ZERO {
                    (w.cost_basis * (current - w.entry_price) / w.entry_price).round_dp(4)
                } else {
                    Decimal::ZERO
                };
                Some(ActivePosition {
                    engine: w.engine.clone(),
                    symbol: w.symbol.clone(),
                    entry_price: w.entry_price,
                    current_price: current,
                    max_price: w.max_price,
                    trailing_stop: w.trailing_stop,
                    pnl_pct,
                    pnl_usd,
                    orphan_recovered: w.orphan_recovered,
                })
            })
            .collect();
        active.sort_by(|a, b| (&a.engine, &a.symbol).cmp(&(&b.engine, &b.symbol)));
        active
    }

    /// Last tick price per symbol for `engine`'s watchers that have seen one.
    #[must_use]
    pub fn marks(&self, engine: &str) -> HashMap<String, Decimal> {
        self.watchers
            .iter()
            .filter(|e| e.key().0 == engine)
            .filter_map(|e| {
                let price = e.value().lock().last_price()?;
                Some((e.key().1.clone(), price))
            })
            .collect()
    }

    pub fn in_position_count(&self, engine: &str) -> usize {
        self.watchers
            .iter()
            .filter(|e| e.key().0 == engine && e.value().lock().is_in_position())
            .count()
    }
}
