//! Paper fill simulation.
//!
//! Each order goes through the same sequence a real transaction would:
//! a chance of outright failure (which still costs gas), network delay, a
//! possible partial fill, a fresh price after the delay, and a possible
//! sandwich penalty. Only then is the order applied to the ledger. The delay
//! happens before any ledger lock is taken.

use crate::backend::{elapsed_ms, slippage_pct, ExecutionRequest};
use crate::ledger::{BuyOrder, CapitalLedger, SellOrder};
use crate::sampler::{FillSampler, RandomFillSampler};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tradegate_core::backoff::Backoff;
use tradegate_core::config::{BackoffConfig, SimulatorConfig};
use tradegate_core::events::{ExecutionMode, Rejection, TradeAction, TradeResult};
use tradegate_core::traits::PriceReference;
use uuid::Uuid;

pub const SIMULATED_FAILURE_REASON: &str = "simulated transaction failure";

struct ReferenceFeed {
    source: Arc<dyn PriceReference>,
    backoff: Backoff,
    timeout: Duration,
    max_age_secs: i64,
}

pub struct ExecutionSimulator {
    config: SimulatorConfig,
    ledger: Arc<CapitalLedger>,
    sampler: Arc<dyn FillSampler>,
    reference: Option<ReferenceFeed>,
}

impl std::fmt::Debug for ExecutionSimulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionSimulator")
            .field("config", &self.config)
            .field("has_reference", &self.reference.is_some())
            .finish_non_exhaustive()
    }
}

impl ExecutionSimulator {
    /// Uses a [`RandomFillSampler`] seeded from `config.random_seed`.
    #[must_use]
    pub fn new(config: SimulatorConfig, ledger: Arc<CapitalLedger>) -> Self {
        let sampler = Arc::new(RandomFillSampler::new(config.random_seed));
        Self {
            config,
            ledger,
            sampler,
            reference: None,
        }
    }

    #[must_use]
    pub fn with_sampler(mut self, sampler: Arc<dyn FillSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    /// Reprices orders after the simulated delay from `source` when its quote is fresh.
    #[must_use]
    pub fn with_price_reference(
        mut self,
        source: Arc<dyn PriceReference>,
        timeout: Duration,
        max_age_secs: i64,
        backoff: BackoffConfig,
    ) -> Self {
        self.reference = Some(ReferenceFeed {
            source,
            backoff: Backoff::new("sim-reference", backoff),
            timeout,
            max_age_secs,
        });
        self
    }

    #[must_use]
    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<CapitalLedger> {
        &self.ledger
    }

    pub async fn simulate(&self, request: &ExecutionRequest) -> TradeResult {
        let started = Instant::now();
        let signal = &request.signal;
        let action = signal.action;

        if action == TradeAction::Hold {
            return request.reject(ExecutionMode::Paper, Rejection::NotActionable);
        }

        // (a) outright failure
        let failure_rate = if request.congested {
            self.config.congestion_failure_rate
        } else {
            self.config.failure_rate
        };
        if self.sampler.transaction_fails(failure_rate) {
            let fee = match self.ledger.burn_gas(&request.engine).await {
                Ok(fee) => fee,
                Err(e) => {
                    warn!(engine = %request.engine, error = %e, "Could not charge gas for failed transaction");
                    Decimal::ZERO
                }
            };
            info!(
                engine = %request.engine,
                symbol = %signal.symbol,
                action = %action,
                congested = request.congested,
                "Simulated transaction failure"
            );
            return request
                .reject(
                    ExecutionMode::Paper,
                    Rejection::TransactionFailed {
                        reason: SIMULATED_FAILURE_REASON.to_string(),
                    },
                )
                .with_fee(fee)
                .with_latency_ms(elapsed_ms(started));
        }

        // (b) network delay, before any lock
        let max_delay = if request.congested {
            self.config.congestion_delay_max_ms.max(self.config.delay_min_ms)
        } else {
            self.config.delay_max_ms
        };
        let delay = self.sampler.delay_ms(self.config.delay_min_ms, max_delay);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        // (c) partial fill
        let fill_fraction = self
            .sampler
            .partial_fill(
                self.config.partial_fill_rate,
                self.config.min_fill_pct,
                self.config.max_fill_pct,
            )
            .and_then(|f| Decimal::try_from(f.clamp(0.0, 1.0)).ok());

        // (d) price after the delay
        let market_price = self.post_delay_price(&signal.symbol, signal.price).await;

        // (e) sandwich penalty
        let penalty = self
            .sampler
            .mev_penalty(
                self.config.mev_risk_rate,
                self.config.mev_penalty_min,
                self.config.mev_penalty_max,
            )
            .map(|p| p.clamp(0.0, self.config.mev_penalty_max));
        let price = match penalty.and_then(|p| Decimal::try_from(p).ok()) {
            Some(p) if action == TradeAction::Sell => market_price * (Decimal::ONE - p),
            Some(p) => market_price * (Decimal::ONE + p),
            None => market_price,
        };

        debug!(
            engine = %request.engine,
            symbol = %signal.symbol,
            delay_ms = delay,
            fill_fraction = ?fill_fraction,
            mev_penalty = ?penalty,
            price = %price,
            "Simulated execution conditions"
        );

        // (f) apply to the ledger
        let volatile = signal.volatile || request.congested;
        let outcome = match action {
            TradeAction::Buy => self.apply_buy(request, price, fill_fraction, volatile).await,
            _ => self.apply_sell(request, price, fill_fraction, volatile).await,
        };

        let latency_ms = elapsed_ms(started);
        match outcome {
            Ok(result) => {
                let fill = result.fill_price;
                result
                    .with_slippage_pct(slippage_pct(signal.price, fill, action))
                    .with_tx_id(format!("paper-{}", Uuid::new_v4()))
                    .with_latency_ms(latency_ms)
                    .with_reason(&signal.reason)
            }
            Err(rejection) => {
                info!(
                    engine = %request.engine,
                    symbol = %signal.symbol,
                    reason = %rejection,
                    "Paper order rejected by ledger"
                );
                request
                    .reject(ExecutionMode::Paper, rejection)
                    .with_latency_ms(latency_ms)
            }
        }
    }

    async fn apply_buy(
        &self,
        request: &ExecutionRequest,
        price: Decimal,
        fill_fraction: Option<Decimal>,
        volatile: bool,
    ) -> Result<TradeResult, Rejection> {
        let signal = &request.signal;
        let size = match fill_fraction {
            Some(fraction) => (request.size_usd * fraction).round_dp(2),
            None => request.size_usd,
        };

        let order = BuyOrder::new(&request.engine, &signal.symbol, price, size)
            .with_mint(&signal.mint)
            .with_liquidity(request.liquidity_usd)
            .volatile(volatile);
        let fill = self.ledger.execute_buy(order).await?;

        Ok(TradeResult::filled(
            &request.engine,
            &signal.symbol,
            TradeAction::Buy,
            ExecutionMode::Paper,
            fill.fill_price,
            fill.quantity,
        )
        .with_fee(fill.fee_usd))
    }

    async fn apply_sell(
        &self,
        request: &ExecutionRequest,
        price: Decimal,
        fill_fraction: Option<Decimal>,
        volatile: bool,
    ) -> Result<TradeResult, Rejection> {
        let signal = &request.signal;
        let quantity = match fill_fraction {
            Some(fraction) => request
                .quantity
                .or_else(|| {
                    self.ledger
                        .get_position(&request.engine, &signal.symbol)
                        .map(|p| p.balance)
                })
                .map(|q| q * fraction),
            None => request.quantity,
        };

        let mut order = SellOrder::new(&request.engine, &signal.symbol, price)
            .with_reason(&signal.reason)
            .with_liquidity(request.liquidity_usd)
            .volatile(volatile);
        if let Some(quantity) = quantity {
            order = order.with_quantity(quantity);
        }
        let fill = self.ledger.execute_sell(order).await?;

        Ok(TradeResult::filled(
            &request.engine,
            &signal.symbol,
            TradeAction::Sell,
            ExecutionMode::Paper,
            fill.fill_price,
            fill.quantity,
        )
        .with_fee(fill.fee_usd)
        .with_pnl(fill.pnl_usd))
    }

    async fn post_delay_price(&self, symbol: &str, fallback: Decimal) -> Decimal {
        let Some(feed) = &self.reference else {
            return fallback;
        };

        match feed.backoff.call(feed.timeout, feed.source.fetch(symbol)).await {
            Ok(quote) if !quote.is_unusable(Utc::now(), feed.max_age_secs) => quote.price,
            Ok(_) => {
                debug!(symbol = %symbol, "Reference quote stale, keeping signal price");
                fallback
            }
            Err(e) => {
                debug!(symbol = %symbol, error = %e, "Reference unavailable, keeping signal price");
                fallback
            }
        }
    }
}
