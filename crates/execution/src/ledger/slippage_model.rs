use rust_decimal::Decimal;
use tradegate_core::config::SlippageModelConfig;
use tradegate_core::events::TradeAction;

const BPS_PER_UNIT: f64 = 10_000.0;

/// Liquidity-tiered slippage used to turn a quoted price into a fill price.
#[derive(Debug, Clone)]
pub struct SlippageModel {
    config: SlippageModelConfig,
}

impl SlippageModel {
    #[must_use]
    pub fn new(mut config: SlippageModelConfig) -> Self {
        config
            .tiers
            .sort_by(|a, b| b.min_liquidity_usd.cmp(&a.min_liquidity_usd));
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &SlippageModelConfig {
        &self.config
    }

    /// Total slippage in basis points, including the latency drift penalty.
    #[must_use]
    pub fn slippage_bps(&self, liquidity_usd: Decimal, is_volatile: bool) -> f64 {
        let tier_bps = self
            .config
            .tiers
            .iter()
            .find(|tier| liquidity_usd >= tier.min_liquidity_usd)
            .map_or(self.config.fallback_bps, |tier| tier.bps);

        let multiplier = if is_volatile {
            self.config.volatility_multiplier
        } else {
            1.0
        };

        (tier_bps * multiplier + self.config.latency_drift_bps)
            .min(self.config.max_bps)
            .max(0.0)
    }

    /// Moves `price` against the trader by `bps`.
    #[must_use]
    pub fn apply(price: Decimal, bps: f64, action: TradeAction) -> Decimal {
        let fraction = bps_to_fraction(bps);
        match action {
            TradeAction::Sell => price * (Decimal::ONE - fraction),
            TradeAction::Buy | TradeAction::Hold => price * (Decimal::ONE + fraction),
        }
    }
}

/// Converts basis points to a decimal fraction (25 bps -> 0.0025).
#[must_use]
pub fn bps_to_fraction(bps: f64) -> Decimal {
    Decimal::try_from(bps / BPS_PER_UNIT).unwrap_or(Decimal::ZERO)
}
