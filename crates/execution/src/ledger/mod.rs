//! Authoritative per-engine capital and position ledger.
//!
//! Engines are registered lazily in a [`DashMap`] and each holds its state in a
//! typed [`EngineAccount`]. Mutations for one `(engine, symbol)` are serialized
//! by an async key lock acquired with a bounded timeout. The lock is only held
//! around the in-memory write; persistence happens afterwards on a background
//! task fed through a watch channel.
//!
//! # Example
//!
//! ```
//! use rust_decimal_macros::dec;
//! use tradegate_core::config::{LedgerConfig, SlippageModelConfig};
//! use tradegate_execution::ledger::{BuyOrder, CapitalLedger};
//!
//! #[tokio::main]
//! async fn main() {
//!     let ledger = CapitalLedger::new(LedgerConfig::default(), SlippageModelConfig::default());
//!     let order = BuyOrder::new("PRIMARY", "SOL", dec!(150), dec!(100)).with_liquidity(dec!(500000));
//!     let fill = ledger.execute_buy(order).await.unwrap();
//!     assert_eq!(fill.cash_after, dec!(899.25));
//! }
//! ```

mod persister;
pub mod slippage_model;

pub use slippage_model::{bps_to_fraction, SlippageModel};

use chrono::{DateTime, Datelike, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use persister::LedgerPersister;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use tradegate_core::backoff::Backoff;
use tradegate_core::config::{LedgerConfig, SlippageModelConfig};
use tradegate_core::events::{Rejection, TradeAction};
use tradegate_core::position::{EngineAccount, EngineStats, LedgerSnapshot, Position};
use tradegate_core::traits::Persistence;

/// Lock key used for engine-wide gas operations.
const GAS_KEY: &str = "__gas__";

// =============================================================================
// Errors
// =============================================================================

/// Ledger-boundary failures. None of them leave partial state behind.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    #[error("Insufficient funds: need ${required}, have ${available}")]
    InsufficientFunds {
        required: Decimal,
        available: Decimal,
    },

    #[error("No position in {symbol} for engine {engine}")]
    NoPosition { engine: String, symbol: String },

    #[error("Timed out waiting for ledger lock on {engine}/{symbol}")]
    LockTimeout { engine: String, symbol: String },

    #[error("Invalid order: {0}")]
    InvalidOrder(String),
}

impl From<LedgerError> for Rejection {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFunds {
                required,
                available,
            } => Rejection::InsufficientCash {
                required,
                available,
            },
            LedgerError::NoPosition { symbol, .. } => Rejection::NoPosition { symbol },
            LedgerError::LockTimeout { .. } => Rejection::LockTimeout,
            LedgerError::InvalidOrder(reason) => Rejection::LedgerRejected { reason },
        }
    }
}

// =============================================================================
// Orders and Fills
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct BuyOrder {
    pub engine: String,
    pub symbol: String,
    pub mint: String,
    pub price: Decimal,
    pub size_usd: Decimal,
    pub liquidity_usd: Decimal,
    pub is_volatile: bool,
    /// Fill reported by a live venue. When set the slippage model is bypassed.
    pub reported_fill: Option<Decimal>,
}

impl BuyOrder {
    #[must_use]
    pub fn new(engine: impl Into<String>, symbol: impl Into<String>, price: Decimal, size_usd: Decimal) -> Self {
        Self {
            engine: engine.into(),
            symbol: symbol.into(),
            mint: String::new(),
            price,
            size_usd,
            liquidity_usd: Decimal::ZERO,
            is_volatile: false,
            reported_fill: None,
        }
    }

    #[must_use]
    pub fn with_mint(mut self, mint: impl Into<String>) -> Self {
        self.mint = mint.into();
        self
    }

    #[must_use]
    pub fn with_liquidity(mut self, liquidity_usd: Decimal) -> Self {
        self.liquidity_usd = liquidity_usd;
        self
    }

    #[must_use]
    pub fn volatile(mut self, is_volatile: bool) -> Self {
        self.is_volatile = is_volatile;
        self
    }

    #[must_use]
    pub fn executed_at(mut self, fill_price: Decimal) -> Self {
        self.reported_fill = Some(fill_price);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SellOrder {
    pub engine: String,
    pub symbol: String,
    pub price: Decimal,
    pub reason: String,
    pub liquidity_usd: Decimal,
    pub is_volatile: bool,
    /// Quantity to sell. `None` sells the whole balance.
    pub quantity: Option<Decimal>,
    pub reported_fill: Option<Decimal>,
}

impl SellOrder {
    #[must_use]
    pub fn new(engine: impl Into<String>, symbol: impl Into<String>, price: Decimal) -> Self {
        Self {
            engine: engine.into(),
            symbol: symbol.into(),
            price,
            reason: String::new(),
            liquidity_usd: Decimal::ZERO,
            is_volatile: false,
            quantity: None,
            reported_fill: None,
        }
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    #[must_use]
    pub fn with_liquidity(mut self, liquidity_usd: Decimal) -> Self {
        self.liquidity_usd = liquidity_usd;
        self
    }

    #[must_use]
    pub fn volatile(mut self, is_volatile: bool) -> Self {
        self.is_volatile = is_volatile;
        self
    }

    #[must_use]
    pub fn with_quantity(mut self, quantity: Decimal) -> Self {
        self.quantity = Some(quantity);
        self
    }

    #[must_use]
    pub fn executed_at(mut self, fill_price: Decimal) -> Self {
        self.reported_fill = Some(fill_price);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuyFill {
    pub engine: String,
    pub symbol: String,
    pub fill_price: Decimal,
    pub quantity: Decimal,
    pub size_usd: Decimal,
    pub fee_usd: Decimal,
    pub slippage_bps: f64,
    /// Weighted average entry after this fill.
    pub avg_price: Decimal,
    pub cash_after: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SellFill {
    pub engine: String,
    pub symbol: String,
    pub fill_price: Decimal,
    pub quantity: Decimal,
    pub proceeds_usd: Decimal,
    pub fee_usd: Decimal,
    pub slippage_bps: f64,
    pub pnl_usd: Decimal,
    pub remaining_balance: Decimal,
    /// True when the position was removed.
    pub closed: bool,
    pub cash_after: Decimal,
}

// =============================================================================
// Reports
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrawdownCheck {
    pub breached: bool,
    pub drawdown_pct: f64,
    pub daily_drawdown_pct: f64,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MaintenanceReport {
    pub gas_topped_up: bool,
    /// USD credited back to cash from excess gas.
    pub gas_swept_usd: Decimal,
    pub dust_pruned: Vec<String>,
    /// Symbols force-sold for exceeding the maximum hold time, with realized PnL.
    pub zombies_sold: Vec<(String, Decimal)>,
    pub bankrupt: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub id: String,
    pub cash_balance: Decimal,
    pub gas_reserve: Decimal,
    pub open_positions: usize,
    pub book_equity: Decimal,
    pub peak_equity: Decimal,
    pub stats: EngineStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerStatus {
    pub engines: Vec<EngineStatus>,
    pub version: u64,
}

// =============================================================================
// Ledger
// =============================================================================

pub struct CapitalLedger {
    config: LedgerConfig,
    model: SlippageModel,
    engines: DashMap<String, Arc<RwLock<EngineAccount>>>,
    locks: DashMap<(String, String), Arc<Mutex<()>>>,
    persister: Option<LedgerPersister>,
    version: AtomicU64,
    // Serializes version assignment with the snapshot read.
    publish_lock: parking_lot::Mutex<()>,
}

impl std::fmt::Debug for CapitalLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapitalLedger")
            .field("config", &self.config)
            .field("engines", &self.engines.len())
            .field("persistent", &self.persister.is_some())
            .finish_non_exhaustive()
    }
}

impl CapitalLedger {
    #[must_use]
    pub fn new(config: LedgerConfig, slippage: SlippageModelConfig) -> Self {
        Self {
            config,
            model: SlippageModel::new(slippage),
            engines: DashMap::new(),
            locks: DashMap::new(),
            persister: None,
            version: AtomicU64::new(0),
            publish_lock: parking_lot::Mutex::new(()),
        }
    }

    /// Saves a snapshot after every mutation on a background task.
    ///
    /// Must be called from within a tokio runtime; otherwise persistence stays off.
    #[must_use]
    pub fn with_persistence(mut self, store: Arc<dyn Persistence>, backoff: Backoff) -> Self {
        self.persister = LedgerPersister::spawn(store, backoff);
        self
    }

    #[must_use]
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    #[must_use]
    pub fn slippage_model(&self) -> &SlippageModel {
        &self.model
    }

    /// Registers `engine` if unknown. Safe under concurrent first use.
    pub fn register_engine(&self, engine: &str) -> Arc<RwLock<EngineAccount>> {
        if let Some(existing) = self.engines.get(engine) {
            return Arc::clone(existing.value());
        }
        let entry = self.engines.entry(engine.to_string()).or_insert_with(|| {
            info!(engine = %engine, cash = %self.config.initial_cash, "Registering engine");
            Arc::new(RwLock::new(EngineAccount::new(
                engine,
                self.config.initial_cash,
                self.config.initial_gas_native,
                Utc::now(),
            )))
        });
        Arc::clone(entry.value())
    }

    #[must_use]
    pub fn engines(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.engines.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn get_available_cash(&self, engine: &str) -> Decimal {
        self.register_engine(engine).read().cash_balance.max(Decimal::ZERO)
    }

    pub fn gas_reserve(&self, engine: &str) -> Decimal {
        self.register_engine(engine).read().gas_reserve
    }

    pub fn get_position(&self, engine: &str, symbol: &str) -> Option<Position> {
        self.register_engine(engine).read().positions.get(symbol).cloned()
    }

    pub fn get_all_positions(&self, engine: &str) -> HashMap<String, Position> {
        self.register_engine(engine).read().positions.clone()
    }

    pub fn position_count(&self, engine: &str) -> usize {
        self.register_engine(engine).read().positions.len()
    }

    pub fn get_stats(&self, engine: &str) -> EngineStats {
        self.register_engine(engine).read().stats.clone()
    }

    pub fn account(&self, engine: &str) -> EngineAccount {
        self.register_engine(engine).read().clone()
    }

    /// Cash plus positions marked at `marks`, falling back to entry prices.
    pub fn equity(&self, engine: &str, marks: &HashMap<String, Decimal>) -> Decimal {
        self.register_engine(engine).read().equity(marks)
    }

    #[must_use]
    pub fn get_status(&self) -> LedgerStatus {
        let mut engines: Vec<EngineStatus> = self
            .engines
            .iter()
            .map(|entry| {
                let account = entry.value().read();
                EngineStatus {
                    id: account.id.clone(),
                    cash_balance: account.cash_balance,
                    gas_reserve: account.gas_reserve,
                    open_positions: account.positions.len(),
                    book_equity: account.book_equity(),
                    peak_equity: account.peak_equity,
                    stats: account.stats.clone(),
                }
            })
            .collect();
        engines.sort_by(|a, b| a.id.cmp(&b.id));

        LedgerStatus {
            engines,
            version: self.version.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> LedgerSnapshot {
        let mut engines: Vec<EngineAccount> = self.engines.iter().map(|e| e.value().read().clone()).collect();
        engines.sort_by(|a, b| a.id.cmp(&b.id));
        LedgerSnapshot {
            engines,
            saved_at: Utc::now(),
            version: self.version.load(Ordering::Relaxed),
        }
    }

    /// Replaces engine state with the accounts in `snapshot`.
    pub fn restore(&self, snapshot: LedgerSnapshot) {
        let restored = snapshot.engines.len();
        for account in snapshot.engines {
            self.engines
                .insert(account.id.clone(), Arc::new(RwLock::new(account)));
        }
        self.version.fetch_max(snapshot.version, Ordering::Relaxed);
        info!(engines = restored, version = snapshot.version, "Ledger restored from snapshot");
    }

    // =========================================================================
    // Trades
    // =========================================================================

    /// Applies a buy.
    ///
    /// # Errors
    ///
    /// `InvalidOrder` for non-positive price or size, `InsufficientFunds` when
    /// `size + fee` exceeds cash, `LockTimeout` when the key lock is contended.
    pub async fn execute_buy(&self, order: BuyOrder) -> Result<BuyFill, LedgerError> {
        if order.price <= Decimal::ZERO || order.size_usd <= Decimal::ZERO {
            return Err(LedgerError::InvalidOrder(format!(
                "buy {} needs positive price and size (price {}, size {})",
                order.symbol, order.price, order.size_usd
            )));
        }

        let account = self.register_engine(&order.engine);
        let _guard = self.lock_key(&order.engine, &order.symbol).await?;

        let (fill_price, bps) = self.fill_price(
            order.price,
            order.reported_fill,
            order.liquidity_usd,
            order.is_volatile,
            TradeAction::Buy,
        );
        if fill_price <= Decimal::ZERO {
            return Err(LedgerError::InvalidOrder(format!("buy {} fill price {fill_price}", order.symbol)));
        }
        let fee = self.config.fee_usd();
        let now = Utc::now();

        let fill = {
            let mut acct = account.write();
            let required = order.size_usd + fee;
            if required > acct.cash_balance {
                return Err(LedgerError::InsufficientFunds {
                    required,
                    available: acct.cash_balance,
                });
            }

            let quantity = order.size_usd / fill_price;
            acct.cash_balance -= required;

            let avg_price = match acct.positions.get_mut(&order.symbol) {
                Some(position) => {
                    position.add(quantity, fill_price, order.size_usd, now);
                    position.avg_price
                }
                None => {
                    acct.positions.insert(
                        order.symbol.clone(),
                        Position::open(&order.symbol, &order.mint, quantity, fill_price, order.size_usd, now),
                    );
                    fill_price
                }
            };

            acct.stats.trades += 1;
            acct.stats.fees_paid_usd += fee;
            acct.stats.slippage_usd += (fill_price - order.price).abs() * quantity;

            BuyFill {
                engine: order.engine.clone(),
                symbol: order.symbol.clone(),
                fill_price,
                quantity,
                size_usd: order.size_usd,
                fee_usd: fee,
                slippage_bps: bps,
                avg_price,
                cash_after: acct.cash_balance,
            }
        };

        info!(
            engine = %fill.engine,
            symbol = %fill.symbol,
            fill_price = %fill.fill_price,
            quantity = %fill.quantity,
            slippage_bps = fill.slippage_bps,
            cash = %fill.cash_after,
            "Buy filled"
        );
        self.publish();
        Ok(fill)
    }

    /// Applies a sell of `quantity` (or the full balance).
    ///
    /// # Errors
    ///
    /// `NoPosition` when nothing is held, `InvalidOrder` for non-positive price
    /// or quantity, `LockTimeout` when the key lock is contended.
    pub async fn execute_sell(&self, order: SellOrder) -> Result<SellFill, LedgerError> {
        if order.price <= Decimal::ZERO {
            return Err(LedgerError::InvalidOrder(format!(
                "sell {} needs positive price (price {})",
                order.symbol, order.price
            )));
        }

        let account = self.register_engine(&order.engine);
        let _guard = self.lock_key(&order.engine, &order.symbol).await?;

        let (fill_price, bps) = self.fill_price(
            order.price,
            order.reported_fill,
            order.liquidity_usd,
            order.is_volatile,
            TradeAction::Sell,
        );
        let fee = self.config.fee_usd();
        let dust = self.config.dust_quantity;
        let now = Utc::now();

        let fill = {
            let mut acct = account.write();
            let no_position = || LedgerError::NoPosition {
                engine: order.engine.clone(),
                symbol: order.symbol.clone(),
            };

            let position = acct.positions.get_mut(&order.symbol).ok_or_else(no_position)?;
            if position.balance <= Decimal::ZERO {
                return Err(no_position());
            }

            let quantity = order
                .quantity
                .map_or(position.balance, |q| q.min(position.balance));
            if quantity <= Decimal::ZERO {
                return Err(LedgerError::InvalidOrder(format!(
                    "sell {} quantity {quantity}",
                    order.symbol
                )));
            }

            let avg_price = position.avg_price;
            position.reduce(quantity, now);
            let remaining_balance = position.balance;
            let closed = position.is_flat(dust);
            if closed {
                acct.positions.remove(&order.symbol);
            }

            let fill_price = fill_price.max(Decimal::ZERO);
            let proceeds = quantity * fill_price;
            let pnl = (fill_price - avg_price) * quantity - fee;
            acct.cash_balance = (acct.cash_balance + proceeds - fee).max(Decimal::ZERO);

            acct.stats.trades += 1;
            if pnl > Decimal::ZERO {
                acct.stats.wins += 1;
            } else {
                acct.stats.losses += 1;
            }
            acct.stats.total_pnl_usd += pnl;
            acct.stats.fees_paid_usd += fee;
            acct.stats.slippage_usd += (order.price - fill_price).abs() * quantity;

            SellFill {
                engine: order.engine.clone(),
                symbol: order.symbol.clone(),
                fill_price,
                quantity,
                proceeds_usd: proceeds,
                fee_usd: fee,
                slippage_bps: bps,
                pnl_usd: pnl,
                remaining_balance: if closed { Decimal::ZERO } else { remaining_balance },
                closed,
                cash_after: acct.cash_balance,
            }
        };

        info!(
            engine = %fill.engine,
            symbol = %fill.symbol,
            fill_price = %fill.fill_price,
            quantity = %fill.quantity,
            pnl = %fill.pnl_usd,
            reason = %order.reason,
            cash = %fill.cash_after,
            "Sell filled"
        );
        self.publish();
        Ok(fill)
    }

    // =========================================================================
    // Risk
    // =========================================================================

    /// Updates peak and daily anchors with `equity` and checks both drawdown limits.
    pub fn check_drawdown(&self, engine: &str, equity: Decimal) -> DrawdownCheck {
        self.check_drawdown_at(engine, equity, Utc::now())
    }

    pub fn check_drawdown_at(&self, engine: &str, equity: Decimal, now: DateTime<Utc>) -> DrawdownCheck {
        let account = self.register_engine(engine);
        let mut acct = account.write();

        if now.num_days_from_ce() != acct.day_started_at.num_days_from_ce() {
            acct.daily_start_equity = equity;
            acct.day_started_at = now;
        }
        if equity > acct.peak_equity {
            acct.peak_equity = equity;
        }

        let drawdown_pct = fraction_below(acct.peak_equity, equity);
        let daily_drawdown_pct = fraction_below(acct.daily_start_equity, equity);

        let detail = if drawdown_pct > self.config.max_drawdown_pct {
            Some(format!(
                "MAX DD: -{:.2}% (Limit: {:.2}%)",
                drawdown_pct * 100.0,
                self.config.max_drawdown_pct * 100.0
            ))
        } else if daily_drawdown_pct > self.config.max_daily_drawdown_pct {
            Some(format!(
                "DAILY DD: -{:.2}% (Limit: {:.2}%)",
                daily_drawdown_pct * 100.0,
                self.config.max_daily_drawdown_pct * 100.0
            ))
        } else {
            None
        };

        if let Some(detail) = &detail {
            warn!(engine = %engine, equity = %equity, detail = %detail, "Drawdown limit breached");
        }

        DrawdownCheck {
            breached: detail.is_some(),
            drawdown_pct,
            daily_drawdown_pct,
            detail,
        }
    }

    // =========================================================================
    // Gas
    // =========================================================================

    /// Converts `gas_topup_usd` of cash into gas when the reserve is below the floor.
    ///
    /// Returns `Ok(false)` when no top-up was needed.
    ///
    /// # Errors
    ///
    /// `InsufficientFunds` when cash cannot cover the top-up, `LockTimeout` on contention.
    pub async fn ensure_gas(&self, engine: &str) -> Result<bool, LedgerError> {
        let account = self.register_engine(engine);
        let _guard = self.lock_key(engine, GAS_KEY).await?;

        let topped_up = {
            let mut acct = account.write();
            if acct.gas_reserve >= self.config.gas_floor_native {
                return Ok(false);
            }
            let cost = self.config.gas_topup_usd;
            if cost > acct.cash_balance || self.config.native_price_usd <= Decimal::ZERO {
                return Err(LedgerError::InsufficientFunds {
                    required: cost,
                    available: acct.cash_balance,
                });
            }
            acct.cash_balance -= cost;
            acct.gas_reserve += cost / self.config.native_price_usd;
            acct.gas_reserve
        };

        info!(engine = %engine, gas_reserve = %topped_up, "Gas reserve topped up");
        self.publish();
        Ok(true)
    }

    /// Charges one transaction fee for a failed transaction and returns its USD cost.
    ///
    /// # Errors
    ///
    /// `LockTimeout` on contention.
    pub async fn burn_gas(&self, engine: &str) -> Result<Decimal, LedgerError> {
        let account = self.register_engine(engine);
        let _guard = self.lock_key(engine, GAS_KEY).await?;
        let fee_usd = self.config.fee_usd();

        {
            let mut acct = account.write();
            if acct.gas_reserve >= self.config.gas_fee_native {
                acct.gas_reserve -= self.config.gas_fee_native;
            } else {
                acct.cash_balance = (acct.cash_balance - fee_usd).max(Decimal::ZERO);
            }
            acct.stats.failed_transactions += 1;
            acct.stats.fees_paid_usd += fee_usd;
        }

        debug!(engine = %engine, fee_usd = %fee_usd, "Gas burned on failed transaction");
        self.publish();
        Ok(fee_usd)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Gas top-up and sweep, dust pruning, zombie liquidation, and a bankruptcy check.
    pub async fn perform_maintenance(&self, engine: &str, now: DateTime<Utc>) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        if self.gas_reserve(engine) < self.config.gas_critical_native {
            match self.ensure_gas(engine).await {
                Ok(topped_up) => report.gas_topped_up = topped_up,
                Err(e) => warn!(engine = %engine, error = %e, "Gas top-up failed during maintenance"),
            }
        }

        match self.sweep_gas(engine).await {
            Ok(swept) => report.gas_swept_usd = swept,
            Err(e) => warn!(engine = %engine, error = %e, "Gas sweep skipped"),
        }

        report.dust_pruned = self.prune_dust(engine);

        for (symbol, price) in self.zombie_candidates(engine, now) {
            let order = SellOrder::new(engine, &symbol, price)
                .with_reason("zombie sweep")
                .with_liquidity(self.config.zombie_liquidity_usd)
                .volatile(true);
            match self.execute_sell(order).await {
                Ok(fill) => {
                    warn!(engine = %engine, symbol = %symbol, pnl = %fill.pnl_usd, "Zombie position liquidated");
                    report.zombies_sold.push((symbol, fill.pnl_usd));
                }
                Err(e) => warn!(engine = %engine, symbol = %symbol, error = %e, "Zombie liquidation failed"),
            }
        }

        let acct = self.account(engine);
        report.bankrupt = acct.positions.is_empty() && acct.cash_balance < self.config.fee_usd();
        if report.bankrupt {
            warn!(engine = %engine, cash = %acct.cash_balance, "Engine is bankrupt");
        }

        report
    }

    async fn sweep_gas(&self, engine: &str) -> Result<Decimal, LedgerError> {
        let account = self.register_engine(engine);
        let _guard = self.lock_key(engine, GAS_KEY).await?;

        let swept = {
            let mut acct = account.write();
            let ceiling = if acct.cash_balance < self.config.low_cash_threshold_usd {
                self.config.gas_sweep_high_low_cash_native
            } else {
                self.config.gas_sweep_high_native
            };
            if acct.gas_reserve <= ceiling {
                return Ok(Decimal::ZERO);
            }
            let excess = acct.gas_reserve - self.config.gas_sweep_target_native;
            let usd = excess * self.config.native_price_usd;
            acct.gas_reserve = self.config.gas_sweep_target_native;
            acct.cash_balance += usd;
            usd
        };

        info!(engine = %engine, swept_usd = %swept, "Excess gas swept to cash");
        self.publish();
        Ok(swept)
    }

    fn prune_dust(&self, engine: &str) -> Vec<String> {
        let account = self.register_engine(engine);
        let pruned: Vec<String> = {
            let mut acct = account.write();
            let dust: Vec<String> = acct
                .positions
                .values()
                .filter(|p| p.is_flat(self.config.dust_quantity))
                .map(|p| p.symbol.clone())
                .collect();
            for symbol in &dust {
                acct.positions.remove(symbol);
            }
            dust
        };

        if !pruned.is_empty() {
            debug!(engine = %engine, symbols = ?pruned, "Pruned dust positions");
            self.publish();
        }
        pruned
    }

    fn zombie_candidates(&self, engine: &str, now: DateTime<Utc>) -> Vec<(String, Decimal)> {
        if self.config.max_hold_secs == 0 {
            return Vec::new();
        }
        let max_hold = i64::try_from(self.config.max_hold_secs).unwrap_or(i64::MAX);
        self.register_engine(engine)
            .read()
            .positions
            .values()
            .filter(|p| p.held_secs(now) > max_hold)
            .map(|p| (p.symbol.clone(), p.avg_price))
            .collect()
    }

    // =========================================================================
    // Helper Functions
    // =========================================================================

    async fn lock_key(&self, engine: &str, symbol: &str) -> Result<OwnedMutexGuard<()>, LedgerError> {
        let mutex = self
            .locks
            .entry((engine.to_string(), symbol.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        tokio::time::timeout(self.config.lock_timeout(), mutex.lock_owned())
            .await
            .map_err(|_| {
                warn!(engine = %engine, symbol = %symbol, "Ledger lock timed out");
                LedgerError::LockTimeout {
                    engine: engine.to_string(),
                    symbol: symbol.to_string(),
                }
            })
    }

    fn fill_price(
        &self,
        price: Decimal,
        reported: Option<Decimal>,
        liquidity_usd: Decimal,
        is_volatile: bool,
        action: TradeAction,
    ) -> (Decimal, f64) {
        match reported {
            Some(fill) => (fill, realized_bps(price, fill)),
            None => {
                let bps = self.model.slippage_bps(liquidity_usd, is_volatile);
                (SlippageModel::apply(price, bps, action), bps)
            }
        }
    }

    fn publish(&self) {
        let _guard = self.publish_lock.lock();
        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(persister) = &self.persister {
            let mut snapshot = self.snapshot();
            snapshot.version = version;
            persister.publish(snapshot);
        }
    }
}

fn fraction_below(anchor: Decimal, value: Decimal) -> f64 {
    if anchor <= Decimal::ZERO || value >= anchor {
        return 0.0;
    }
    ((anchor - value) / anchor).try_into().unwrap_or(0.0)
}

fn realized_bps(expected: Decimal, actual: Decimal) -> f64 {
    if expected <= Decimal::ZERO {
        return 0.0;
    }
    let fraction: f64 = ((actual - expected).abs() / expected).try_into().unwrap_or(0.0);
    fraction * 10_000.0
}
