use crate::config::ConfidenceSizingConfig;
use anyhow::Result;
use rust_decimal::Decimal;

/// Sizes a trade from signal confidence when the signal carries no explicit size.
///
/// # Arguments
/// * `available_cash` - Cash the engine can spend
/// * `confidence` - Signal confidence in `[0, 1]`
/// * `requested` - Explicit size from the signal, if any
/// * `config` - Confidence tiers and the per-trade cap
///
/// # Returns
/// Notional in USD, never more than `max_capital_per_trade_pct` of cash
///
/// # Errors
/// Returns error if cash is negative or a percentage cannot be represented
pub fn size_for_confidence(
    available_cash: Decimal,
    confidence: f64,
    requested: Option<Decimal>,
    config: &ConfidenceSizingConfig,
) -> Result<Decimal> {
    if available_cash < Decimal::ZERO {
        anyhow::bail!("Available cash must not be negative");
    }

    let cap = available_cash * Decimal::try_from(config.max_capital_per_trade_pct)?;

    let size = match requested {
        Some(size) => size,
        None => {
            let pct = if confidence > config.high_threshold {
                config.high_pct
            } else if confidence >= config.medium_threshold {
                config.medium_pct
            } else {
                config.low_pct
            };
            available_cash * Decimal::try_from(pct)?
        }
    };

    Ok(size.min(cap).max(Decimal::ZERO).round_dp(2))
}
