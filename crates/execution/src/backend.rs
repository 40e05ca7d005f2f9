//! Paper and live execution behind one trait.

use crate::ledger::{BuyOrder, CapitalLedger, SellOrder};
use crate::simulator::ExecutionSimulator;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tradegate_core::backoff::{Backoff, BackoffError};
use tradegate_core::config::BackoffConfig;
use tradegate_core::events::{ExecutionMode, Rejection, Signal, TradeAction, TradeResult};
use tradegate_core::traits::{SwapBackend, SwapRequest};

/// Everything a backend needs to execute one admitted order.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub engine: String,
    pub signal: Signal,
    /// Notional to spend on a buy.
    pub size_usd: Decimal,
    /// Quantity to sell. `None` sells the whole balance.
    pub quantity: Option<Decimal>,
    pub liquidity_usd: Decimal,
    pub congested: bool,
    pub slippage_bps: u32,
    pub tip_lamports: u64,
}

impl ExecutionRequest {
    #[must_use]
    pub fn buy(engine: impl Into<String>, signal: Signal, size_usd: Decimal) -> Self {
        Self {
            engine: engine.into(),
            signal,
            size_usd,
            quantity: None,
            liquidity_usd: Decimal::ZERO,
            congested: false,
            slippage_bps: 0,
            tip_lamports: 0,
        }
    }

    #[must_use]
    pub fn sell(engine: impl Into<String>, signal: Signal) -> Self {
        Self::buy(engine, signal, Decimal::ZERO)
    }

    #[must_use]
    pub fn with_quantity(mut self, quantity: Decimal) -> Self {
        self.quantity = Some(quantity);
        self
    }

    #[must_use]
    pub fn with_liquidity(mut self, liquidity_usd: Decimal) -> Self {
        self.liquidity_usd = liquidity_usd;
        self
    }

    #[must_use]
    pub fn congested(mut self, congested: bool) -> Self {
        self.congested = congested;
        self
    }

    /// Calibrated slippage tolerance and priority tip for live swaps.
    #[must_use]
    pub fn with_calibration(mut self, slippage_bps: u32, tip_lamports: u64) -> Self {
        self.slippage_bps = slippage_bps;
        self.tip_lamports = tip_lamports;
        self
    }

    #[must_use]
    pub fn action(&self) -> TradeAction {
        self.signal.action
    }

    pub(crate) fn reject(&self, mode: ExecutionMode, rejection: Rejection) -> TradeResult {
        TradeResult::rejected(&self.engine, &self.signal.symbol, self.signal.action, mode, rejection)
    }
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn mode(&self) -> ExecutionMode;

    /// Executes the request. Failures come back as an unsuccessful result.
    async fn execute(&self, request: &ExecutionRequest) -> TradeResult;
}

// =============================================================================
// Paper
// =============================================================================

/// Simulated fills applied to the shared ledger.
#[derive(Debug)]
pub struct PaperBackend {
    simulator: ExecutionSimulator,
}

impl PaperBackend {
    #[must_use]
    pub fn new(simulator: ExecutionSimulator) -> Self {
        Self { simulator }
    }

    #[must_use]
    pub fn simulator(&self) -> &ExecutionSimulator {
        &self.simulator
    }
}

#[async_trait]
impl ExecutionBackend for PaperBackend {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Paper
    }

    async fn execute(&self, request: &ExecutionRequest) -> TradeResult {
        self.simulator.simulate(request).await
    }
}

// =============================================================================
// Live
// =============================================================================

const DEFAULT_SWAP_TIMEOUT: Duration = Duration::from_secs(30);

/// Real swaps through an external [`SwapBackend`], mirrored into the ledger.
pub struct LiveBackend {
    swap: Arc<dyn SwapBackend>,
    ledger: Arc<CapitalLedger>,
    backoff: Backoff,
    timeout: Duration,
}

impl std::fmt::Debug for LiveBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveBackend")
            .field("backoff", &self.backoff)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl LiveBackend {
    #[must_use]
    pub fn new(swap: Arc<dyn SwapBackend>, ledger: Arc<CapitalLedger>, backoff: BackoffConfig) -> Self {
        Self {
            swap,
            ledger,
            backoff: Backoff::new("swap", backoff),
            timeout: DEFAULT_SWAP_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    async fn mirror(&self, request: &ExecutionRequest, fill_price: Decimal, quantity: Option<Decimal>) -> Result<TradeResult, Rejection> {
        let signal = &request.signal;
        match signal.action {
            TradeAction::Buy => {
                let order = BuyOrder::new(&request.engine, &signal.symbol, signal.price, request.size_usd)
                    .with_mint(&signal.mint)
                    .with_liquidity(request.liquidity_usd)
                    .executed_at(fill_price);
                let fill = self.ledger.execute_buy(order).await?;
                Ok(TradeResult::filled(
                    &request.engine,
                    &signal.symbol,
                    TradeAction::Buy,
                    ExecutionMode::Live,
                    fill.fill_price,
                    fill.quantity,
                )
                .with_fee(fill.fee_usd))
            }
            TradeAction::Sell => {
                let mut order = SellOrder::new(&request.engine, &signal.symbol, signal.price)
                    .with_reason(&signal.reason)
                    .with_liquidity(request.liquidity_usd)
                    .executed_at(fill_price);
                if let Some(quantity) = quantity {
                    order = order.with_quantity(quantity);
                }
                let fill = self.ledger.execute_sell(order).await?;
                Ok(TradeResult::filled(
                    &request.engine,
                    &signal.symbol,
                    TradeAction::Sell,
                    ExecutionMode::Live,
                    fill.fill_price,
                    fill.quantity,
                )
                .with_fee(fill.fee_usd)
                .with_pnl(fill.pnl_usd))
            }
            TradeAction::Hold => Err(Rejection::NotActionable),
        }
    }
}

#[async_trait]
impl ExecutionBackend for LiveBackend {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Live
    }

    async fn execute(&self, request: &ExecutionRequest) -> TradeResult {
        let started = Instant::now();
        let signal = &request.signal;

        let (amount_usd, quantity) = match signal.action {
            TradeAction::Buy => (request.size_usd, None),
            TradeAction::Sell => {
                let Some(position) = self.ledger.get_position(&request.engine, &signal.symbol) else {
                    return request.reject(
                        ExecutionMode::Live,
                        Rejection::NoPosition {
                            symbol: signal.symbol.clone(),
                        },
                    );
                };
                let quantity = request.quantity.map_or(position.balance, |q| q.min(position.balance));
                (quantity * signal.price, Some(quantity))
            }
            TradeAction::Hold => return request.reject(ExecutionMode::Live, Rejection::NotActionable),
        };

        let swap_request = SwapRequest {
            direction: signal.action,
            amount_usd,
            symbol: signal.symbol.clone(),
            mint: signal.mint.clone(),
            quantity,
            max_slippage_bps: request.slippage_bps,
            priority_fee_lamports: request.tip_lamports,
        };

        let receipt = match self.backoff.call(self.timeout, self.swap.execute_swap(swap_request)).await {
            Ok(receipt) => receipt,
            Err(e) => {
                let mut fee = Decimal::ZERO;
                if !matches!(e, BackoffError::CircuitOpen { .. }) {
                    fee = self.ledger.burn_gas(&request.engine).await.unwrap_or(Decimal::ZERO);
                }
                warn!(engine = %request.engine, symbol = %signal.symbol, error = %e, "Live swap failed");
                return request
                    .reject(
                        ExecutionMode::Live,
                        Rejection::TransactionFailed { reason: e.to_string() },
                    )
                    .with_fee(fee)
                    .with_latency_ms(elapsed_ms(started));
            }
        };

        let latency_ms = elapsed_ms(started);
        match self.mirror(request, receipt.fill_price, quantity).await {
            Ok(result) => {
                info!(
                    engine = %request.engine,
                    symbol = %signal.symbol,
                    tx_id = %receipt.tx_id,
                    fill_price = %result.fill_price,
                    latency_ms,
                    "Live swap landed"
                );
                let fill = result.fill_price;
                result
                    .with_slippage_pct(slippage_pct(signal.price, fill, signal.action))
                    .with_tx_id(receipt.tx_id)
                    .with_latency_ms(latency_ms)
                    .with_reason(&signal.reason)
            }
            Err(rejection) => {
                warn!(
                    engine = %request.engine,
                    symbol = %signal.symbol,
                    tx_id = %receipt.tx_id,
                    error = %rejection,
                    "Live fill could not be mirrored into the ledger"
                );
                request
                    .reject(ExecutionMode::Live, rejection)
                    .with_tx_id(receipt.tx_id)
                    .with_latency_ms(latency_ms)
            }
        }
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Adverse price movement between the expected and the filled price, in percent.
#[must_use]
pub fn slippage_pct(expected: Decimal, fill: Decimal, action: TradeAction) -> f64 {
    if expected <= Decimal::ZERO {
        return 0.0;
    }
    let moved = match action {
        TradeAction::Sell => expected - fill,
        TradeAction::Buy | TradeAction::Hold => fill - expected,
    };
    let pct: f64 = (moved / expected).try_into().unwrap_or(0.0);
    pct * 100.0
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
