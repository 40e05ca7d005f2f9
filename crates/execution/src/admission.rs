//! Pre-trade admission checks.
//!
//! Local checks read the ledger and never time out. External collaborators
//! are called through a [`Backoff`] with a short timeout and fail open: an
//! unavailable oracle never blocks a trade on its own.

use crate::ledger::CapitalLedger;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tradegate_core::backoff::Backoff;
use tradegate_core::config::{AdmissionConfig, BackoffConfig, LiquidityPolicy};
use tradegate_core::events::{ExecutionMode, Rejection, Signal};
use tradegate_core::position_sizing::size_for_confidence;
use tradegate_core::traits::{AssetSafety, LiquiditySource, PredictiveFilter, PriceReference, SafetyVerdict};

/// A buy that passed every check.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmittedBuy {
    pub size_usd: Decimal,
    /// Pool depth, or zero when the source was unavailable.
    pub liquidity_usd: Decimal,
    /// True when the size was halved for thin liquidity.
    pub halved: bool,
}

struct Guarded<T: ?Sized> {
    inner: Arc<T>,
    backoff: Backoff,
}

pub struct AdmissionGate {
    config: AdmissionConfig,
    mode: ExecutionMode,
    ledger: Arc<CapitalLedger>,
    backoff_config: BackoffConfig,
    safety: Option<Guarded<dyn AssetSafety>>,
    liquidity: Option<Guarded<dyn LiquiditySource>>,
    filter: Option<Guarded<dyn PredictiveFilter>>,
    reference: Option<Guarded<dyn PriceReference>>,
}

impl std::fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("mode", &self.mode)
            .field("config", &self.config)
            .field("safety", &self.safety.is_some())
            .field("liquidity", &self.liquidity.is_some())
            .field("filter", &self.filter.is_some())
            .field("reference", &self.reference.is_some())
            .finish_non_exhaustive()
    }
}

impl AdmissionGate {
    #[must_use]
    pub fn new(config: AdmissionConfig, mode: ExecutionMode, ledger: Arc<CapitalLedger>) -> Self {
        Self {
            config,
            mode,
            ledger,
            backoff_config: BackoffConfig::default(),
            safety: None,
            liquidity: None,
            filter: None,
            reference: None,
        }
    }

    /// Circuit-breaker settings for collaborators attached after this call.
    #[must_use]
    pub fn with_backoff(mut self, config: BackoffConfig) -> Self {
        self.backoff_config = config;
        self
    }

    #[must_use]
    pub fn with_asset_safety(mut self, safety: Arc<dyn AssetSafety>) -> Self {
        self.safety = Some(self.guard("asset-safety", safety));
        self
    }

    #[must_use]
    pub fn with_liquidity_source(mut self, source: Arc<dyn LiquiditySource>) -> Self {
        self.liquidity = Some(self.guard("liquidity", source));
        self
    }

    #[must_use]
    pub fn with_predictive_filter(mut self, filter: Arc<dyn PredictiveFilter>) -> Self {
        self.filter = Some(self.guard("predictive-filter", filter));
        self
    }

    #[must_use]
    pub fn with_price_reference(mut self, reference: Arc<dyn PriceReference>) -> Self {
        self.reference = Some(self.guard("price-reference", reference));
        self
    }

    #[must_use]
    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Runs the buy checks in order and stops at the first rejection.
    ///
    /// # Errors
    ///
    /// Returns the [`Rejection`] of the first failing check.
    pub async fn admit_buy(&self, engine: &str, signal: &Signal) -> Result<AdmittedBuy, Rejection> {
        let result = self.run_buy_checks(engine, signal).await;
        match &result {
            Ok(admitted) => debug!(
                engine = %engine,
                symbol = %signal.symbol,
                size_usd = %admitted.size_usd,
                halved = admitted.halved,
                "Buy admitted"
            ),
            Err(rejection) => info!(
                engine = %engine,
                symbol = %signal.symbol,
                mode = %self.mode,
                reason = %rejection,
                "Buy rejected at admission"
            ),
        }
        result
    }

    /// A sell only needs something to sell. Returns the held balance.
    ///
    /// # Errors
    ///
    /// `NoPosition` when the balance is zero.
    pub fn admit_sell(&self, engine: &str, symbol: &str) -> Result<Decimal, Rejection> {
        match self.ledger.get_position(engine, symbol) {
            Some(position) if position.balance > Decimal::ZERO => Ok(position.balance),
            _ => Err(Rejection::NoPosition {
                symbol: symbol.to_string(),
            }),
        }
    }

    async fn run_buy_checks(&self, engine: &str, signal: &Signal) -> Result<AdmittedBuy, Rejection> {
        self.check_confidence(signal)?;
        self.check_safety(signal).await?;
        let mut size_usd = self.check_cash(engine, signal)?;
        self.check_gas(engine).await?;
        let (liquidity_usd, halved) = self.check_liquidity(signal, &mut size_usd).await?;
        self.check_position_ceiling(engine, &signal.symbol)?;
        self.check_filter(signal).await?;
        self.check_divergence(signal).await?;

        Ok(AdmittedBuy {
            size_usd,
            liquidity_usd,
            halved,
        })
    }

    // =========================================================================
    // Checks
    // =========================================================================

    fn check_confidence(&self, signal: &Signal) -> Result<(), Rejection> {
        let minimum = self.config.min_confidence(self.mode);
        if signal.confidence < minimum {
            return Err(Rejection::LowConfidence {
                confidence: signal.confidence,
                minimum,
            });
        }
        Ok(())
    }

    async fn check_safety(&self, signal: &Signal) -> Result<(), Rejection> {
        let Some(safety) = &self.safety else {
            return Ok(());
        };
        match safety
            .backoff
            .call(
                self.config.collaborator_timeout(),
                safety.inner.check(&signal.symbol, &signal.mint),
            )
            .await
        {
            Ok(SafetyVerdict::Safe) => Ok(()),
            Ok(SafetyVerdict::Unsafe(reason)) => Err(Rejection::UnsupportedAsset { reason }),
            Err(e) => {
                warn!(symbol = %signal.symbol, error = %e, "Asset safety check unavailable, failing open");
                Ok(())
            }
        }
    }

    fn check_cash(&self, engine: &str, signal: &Signal) -> Result<Decimal, Rejection> {
        let available = self.ledger.get_available_cash(engine);
        let size = size_for_confidence(available, signal.confidence, signal.size_usd, &self.config.sizing)
            .map_err(|e| Rejection::LedgerRejected { reason: e.to_string() })?;

        let fee = self.ledger.config().fee_usd();
        if size < self.config.min_trade_usd || available < size + fee {
            return Err(Rejection::InsufficientCash {
                required: size.max(self.config.min_trade_usd) + fee,
                available,
            });
        }
        Ok(size)
    }

    async fn check_gas(&self, engine: &str) -> Result<(), Rejection> {
        let floor = self.ledger.config().gas_floor_native;
        if self.ledger.gas_reserve(engine) >= floor {
            return Ok(());
        }

        if let Err(e) = self.ledger.ensure_gas(engine).await {
            warn!(engine = %engine, error = %e, "Gas top-up failed");
        }

        let reserve = self.ledger.gas_reserve(engine);
        if reserve < floor {
            return Err(Rejection::GasFloorBreach { reserve, floor });
        }
        Ok(())
    }

    async fn check_liquidity(&self, signal: &Signal, size_usd: &mut Decimal) -> Result<(Decimal, bool), Rejection> {
        let Some(source) = &self.liquidity else {
            return Ok((Decimal::ZERO, false));
        };

        let liquidity = match source
            .backoff
            .call(self.config.collaborator_timeout(), source.inner.get_liquidity(&signal.symbol))
            .await
        {
            Ok(liquidity) => liquidity,
            Err(e) => {
                warn!(symbol = %signal.symbol, error = %e, "Liquidity source unavailable, failing open");
                return Ok((Decimal::ZERO, false));
            }
        };

        let minimum = self.config.min_liquidity_usd;
        if liquidity <= Decimal::ZERO || liquidity >= minimum {
            return Ok((liquidity.max(Decimal::ZERO), false));
        }

        match self.config.liquidity_policy {
            LiquidityPolicy::Reject => Err(Rejection::LowLiquidity { liquidity, minimum }),
            LiquidityPolicy::HalveSize => {
                let halved = (*size_usd / Decimal::TWO).round_dp(2);
                if halved < self.config.min_trade_usd {
                    return Err(Rejection::LowLiquidity { liquidity, minimum });
                }
                info!(symbol = %signal.symbol, liquidity = %liquidity, size_usd = %halved, "Thin pool, halving size");
                *size_usd = halved;
                Ok((liquidity, true))
            }
        }
    }

    fn check_position_ceiling(&self, engine: &str, symbol: &str) -> Result<(), Rejection> {
        let positions = self.ledger.get_all_positions(engine);
        if positions.contains_key(symbol) {
            return Ok(());
        }
        let open = positions.len();
        if open >= self.config.max_positions {
            return Err(Rejection::PositionCeiling {
                open,
                max: self.config.max_positions,
            });
        }
        Ok(())
    }

    async fn check_filter(&self, signal: &Signal) -> Result<(), Rejection> {
        let Some(filter) = &self.filter else {
            return Ok(());
        };
        let threshold = self.config.filter_threshold(self.mode);

        match filter
            .backoff
            .call(self.config.collaborator_timeout(), filter.inner.probability(signal))
            .await
        {
            Ok(probability) if probability < threshold => Err(Rejection::PredictiveFilterReject {
                probability,
                threshold,
            }),
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(symbol = %signal.symbol, error = %e, "Predictive filter unavailable, failing open");
                Ok(())
            }
        }
    }

    async fn check_divergence(&self, signal: &Signal) -> Result<(), Rejection> {
        let Some(reference) = &self.reference else {
            return Ok(());
        };

        let quote = match reference
            .backoff
            .call(self.config.collaborator_timeout(), reference.inner.fetch(&signal.symbol))
            .await
        {
            Ok(quote) => quote,
            Err(e) => {
                warn!(symbol = %signal.symbol, error = %e, "Price reference unavailable, failing open");
                return Ok(());
            }
        };

        if quote.is_unusable(Utc::now(), self.config.max_reference_age_secs) {
            debug!(symbol = %signal.symbol, "Reference quote stale, skipping divergence check");
            return Ok(());
        }

        if signal.price <= Decimal::ZERO {
            return Ok(());
        }
        // Measured against the signal price, the price the order was sized at.
        let gap: f64 = ((signal.price - quote.price).abs() / signal.price)
            .try_into()
            .unwrap_or(0.0);
        if gap > self.config.divergence_tolerance {
            return Err(Rejection::PriceDivergence {
                divergence_pct: gap * 100.0,
                tolerance_pct: self.config.divergence_tolerance * 100.0,
            });
        }
        Ok(())
    }

    fn guard<T: ?Sized>(&self, name: &str, inner: Arc<T>) -> Guarded<T> {
        Guarded {
            inner,
            backoff: Backoff::new(name, self.backoff_config.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use tradegate_core::config::{LedgerConfig, SlippageModelConfig};
    use tradegate_core::traits::ReferencePrice;

    struct Verdict(SafetyVerdict);

    #[async_trait]
    impl AssetSafety for Verdict {
        async fn check(&self, _symbol: &str, _mint: &str) -> anyhow::Result<SafetyVerdict> {
            Ok(self.0.clone())
        }
    }

    struct Depth(Decimal);

    #[async_trait]
    impl LiquiditySource for Depth {
        async fn get_liquidity(&self, _symbol: &str) -> anyhow::Result<Decimal> {
            Ok(self.0)
        }
    }

    struct Offline;

    #[async_trait]
    impl LiquiditySource for Offline {
        async fn get_liquidity(&self, _symbol: &str) -> anyhow::Result<Decimal> {
            Err(anyhow!("rpc down"))
        }
    }

    #[async_trait]
    impl PredictiveFilter for Offline {
        async fn probability(&self, _signal: &Signal) -> anyhow::Result<f64> {
            Err(anyhow!("model not loaded"))
        }
    }

    struct Slow;

    #[async_trait]
    impl PriceReference for Slow {
        async fn fetch(&self, _symbol: &str) -> anyhow::Result<ReferencePrice> {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Err(anyhow!("unreachable"))
        }
    }

    struct Probability(f64);

    #[async_trait]
    impl PredictiveFilter for Probability {
        async fn probability(&self, _signal: &Signal) -> anyhow::Result<f64> {
            Ok(self.0)
        }
    }

    struct Quote(Decimal);

    #[async_trait]
    impl PriceReference for Quote {
        async fn fetch(&self, _symbol: &str) -> anyhow::Result<ReferencePrice> {
            Ok(ReferencePrice {
                price: self.0,
                confidence_interval: dec!(0.01),
                publish_time: Utc::now(),
                is_stale: false,
            })
        }
    }

    fn ledger() -> Arc<CapitalLedger> {
        Arc::new(CapitalLedger::new(LedgerConfig::default(), SlippageModelConfig::default()))
    }

    fn gate(ledger: Arc<CapitalLedger>) -> AdmissionGate {
        AdmissionGate::new(AdmissionConfig::default(), ExecutionMode::Paper, ledger)
    }

    fn signal() -> Signal {
        Signal::buy("SOL", dec!(150)).with_size(dec!(100)).with_confidence(0.9)
    }

    #[tokio::test]
    async fn test_admits_plain_buy() {
        let admitted = gate(ledger()).admit_buy("PRIMARY", &signal()).await.unwrap();
        assert_eq!(admitted.size_usd, dec!(100));
        assert!(!admitted.halved);
    }

    #[tokio::test]
    async fn test_low_confidence_rejected_per_mode() {
        let paper = gate(ledger());
        let live = AdmissionGate::new(AdmissionConfig::default(), ExecutionMode::Live, ledger());
        let signal = signal().with_confidence(0.4);

        assert!(paper.admit_buy("PRIMARY", &signal).await.is_ok());
        assert!(matches!(
            live.admit_buy("PRIMARY", &signal).await,
            Err(Rejection::LowConfidence { .. })
        ));
    }

    #[tokio::test]
    async fn test_unsafe_asset_rejected() {
        let gate = gate(ledger()).with_asset_safety(Arc::new(Verdict(SafetyVerdict::Unsafe("mint authority".into()))));
        let err = gate.admit_buy("PRIMARY", &signal()).await.unwrap_err();
        assert_eq!(
            err,
            Rejection::UnsupportedAsset {
                reason: "mint authority".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_below_minimum_size() {
        let err = gate(ledger())
            .admit_buy("PRIMARY", &signal().with_size(dec!(1.5)))
            .await
            .unwrap_err();
        assert!(matches!(err, Rejection::InsufficientCash { .. }));
    }

    #[tokio::test]
    async fn test_size_capped_by_confidence_sizing() {
        let admitted = gate(ledger())
            .admit_buy("PRIMARY", &signal().with_size(dec!(900)))
            .await
            .unwrap();
        assert_eq!(admitted.size_usd, dec!(300));
    }

    #[tokio::test]
    async fn test_gas_floor_tops_up_once() {
        let ledger = Arc::new(CapitalLedger::new(
            LedgerConfig::default().with_initial_gas(dec!(0.001)),
            SlippageModelConfig::default(),
        ));
        gate(ledger.clone()).admit_buy("PRIMARY", &signal()).await.unwrap();
        assert_eq!(ledger.get_available_cash("PRIMARY"), dec!(999));
    }

    #[tokio::test]
    async fn test_gas_floor_breach_when_top_up_fails() {
        let ledger = Arc::new(CapitalLedger::new(
            LedgerConfig {
                gas_topup_usd: dec!(0.1),
                ..LedgerConfig::default().with_initial_gas(Decimal::ZERO)
            },
            SlippageModelConfig::default(),
        ));
        let err = gate(ledger).admit_buy("PRIMARY", &signal()).await.unwrap_err();
        assert!(matches!(err, Rejection::GasFloorBreach { .. }));
    }

    #[tokio::test]
    async fn test_thin_pool_rejected_or_halved() {
        let reject = gate(ledger()).with_liquidity_source(Arc::new(Depth(dec!(60000))));
        assert!(matches!(
            reject.admit_buy("PRIMARY", &signal()).await,
            Err(Rejection::LowLiquidity { .. })
        ));

        let halve = AdmissionGate::new(
            AdmissionConfig::default().with_liquidity_policy(LiquidityPolicy::HalveSize),
            ExecutionMode::Paper,
            ledger(),
        )
        .with_liquidity_source(Arc::new(Depth(dec!(60000))));
        let admitted = halve.admit_buy("PRIMARY", &signal()).await.unwrap();
        assert_eq!(admitted.size_usd, dec!(50));
        assert!(admitted.halved);
        assert_eq!(admitted.liquidity_usd, dec!(60000));
    }

    #[tokio::test]
    async fn test_liquidity_outage_fails_open() {
        let gate = gate(ledger()).with_liquidity_source(Arc::new(Offline));
        let admitted = gate.admit_buy("PRIMARY", &signal()).await.unwrap();
        assert_eq!(admitted.liquidity_usd, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_position_ceiling_allows_adding_to_held_symbol() {
        let ledger = ledger();
        for symbol in ["A", "B"] {
            ledger
                .execute_buy(crate::ledger::BuyOrder::new("PRIMARY", symbol, dec!(1), dec!(10)))
                .await
                .unwrap();
        }
        let gate = AdmissionGate::new(
            AdmissionConfig::default().with_max_positions(2),
            ExecutionMode::Paper,
            ledger,
        );

        let new_symbol = gate.admit_buy("PRIMARY", &signal()).await.unwrap_err();
        assert_eq!(new_symbol, Rejection::PositionCeiling { open: 2, max: 2 });
        assert_eq!(new_symbol.to_string(), "MAX_POSITIONS (2/2)");

        let held = Signal::buy("A", dec!(1)).with_size(dec!(10)).with_confidence(0.9);
        assert!(gate.admit_buy("PRIMARY", &held).await.is_ok());
    }

    #[tokio::test]
    async fn test_filter_threshold_and_outage() {
        let low = gate(ledger()).with_predictive_filter(Arc::new(Probability(0.3)));
        assert!(matches!(
            low.admit_buy("PRIMARY", &signal()).await,
            Err(Rejection::PredictiveFilterReject { .. })
        ));

        let high = gate(ledger()).with_predictive_filter(Arc::new(Probability(0.5)));
        assert!(high.admit_buy("PRIMARY", &signal()).await.is_ok());

        let offline = gate(ledger()).with_predictive_filter(Arc::new(Offline));
        assert!(offline.admit_buy("PRIMARY", &signal()).await.is_ok());
    }

    #[tokio::test]
    async fn test_divergence_guard() {
        // 1% away from the reference
        let far = gate(ledger()).with_price_reference(Arc::new(Quote(dec!(148.5))));
        let err = far.admit_buy("PRIMARY", &signal()).await.unwrap_err();
        assert!(matches!(err, Rejection::PriceDivergence { .. }));

        // 0.2% away
        let near = gate(ledger()).with_price_reference(Arc::new(Quote(dec!(149.7))));
        assert!(near.admit_buy("PRIMARY", &signal()).await.is_ok());
    }

    #[tokio::test]
    async fn test_divergence_measured_against_signal_price() {
        // 0.75 below a 150 signal is exactly 0.5% of the signal, just over 0.5% of the quote.
        let edge = gate(ledger()).with_price_reference(Arc::new(Quote(dec!(149.25))));
        assert!(edge.admit_buy("PRIMARY", &signal()).await.is_ok());

        let past = gate(ledger()).with_price_reference(Arc::new(Quote(dec!(149.2))));
        match past.admit_buy("PRIMARY", &signal()).await {
            Err(Rejection::PriceDivergence { divergence_pct, .. }) => {
                assert!((divergence_pct - 0.8 / 150.0 * 100.0).abs() < 1e-9);
            }
            other => panic!("expected divergence rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_slow_reference_times_out_open() {
        let gate = gate(ledger()).with_price_reference(Arc::new(Slow));
        let started = std::time::Instant::now();
        assert!(gate.admit_buy("PRIMARY", &signal()).await.is_ok());
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_checks_short_circuit_in_order() {
        // Unsafe and below the liquidity floor: the safety gate answers first.
        let gate = gate(ledger())
            .with_asset_safety(Arc::new(Verdict(SafetyVerdict::Unsafe("honeypot".into()))))
            .with_liquidity_source(Arc::new(Depth(dec!(10))));
        assert!(matches!(
            gate.admit_buy("PRIMARY", &signal()).await,
            Err(Rejection::UnsupportedAsset { .. })
        ));
    }

    #[test]
    fn test_admit_sell_requires_position() {
        let gate = gate(ledger());
        assert_eq!(
            gate.admit_sell("PRIMARY", "SOL"),
            Err(Rejection::NoPosition { symbol: "SOL".to_string() })
        );
    }
}
