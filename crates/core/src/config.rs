use crate::events::ExecutionMode;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration. Every section falls back to its defaults when absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub mode: ExecutionMode,
    pub engines: EnginesConfig,
    pub ledger: LedgerConfig,
    pub slippage_model: SlippageModelConfig,
    pub simulator: SimulatorConfig,
    pub admission: AdmissionConfig,
    pub watcher: WatcherConfig,
    pub auditor: AuditorConfig,
    pub slippage_controller: SlippageControllerConfig,
    pub priority_fee: PriorityFeeConfig,
    pub backoff: BackoffConfig,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnginesConfig {
    pub names: Vec<String>,
}

impl Default for EnginesConfig {
    fn default() -> Self {
        Self {
            names: vec!["PRIMARY".to_string()],
        }
    }
}

// =============================================================================
// Ledger
// =============================================================================

/// Capital and gas bookkeeping parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Cash granted to an engine on first registration.
    pub initial_cash: Decimal,
    /// Native token granted to an engine on first registration.
    pub initial_gas_native: Decimal,
    /// Native cost of one transaction.
    pub gas_fee_native: Decimal,
    /// USD price used to convert native amounts.
    pub native_price_usd: Decimal,
    /// Minimum reserve required before a buy is admitted.
    pub gas_floor_native: Decimal,
    /// Reserve level below which maintenance refills gas.
    pub gas_critical_native: Decimal,
    /// Cash converted to native on each top-up.
    pub gas_topup_usd: Decimal,
    /// Reserve above which maintenance sweeps gas back to cash.
    pub gas_sweep_high_native: Decimal,
    /// Sweep level used while cash is below `low_cash_threshold_usd`.
    pub gas_sweep_high_low_cash_native: Decimal,
    pub low_cash_threshold_usd: Decimal,
    /// Reserve left behind after a sweep.
    pub gas_sweep_target_native: Decimal,
    /// Balances at or below this are treated as flat.
    pub dust_quantity: Decimal,
    /// Positions older than this are force-sold by maintenance. Zero disables.
    pub max_hold_secs: u64,
    pub zombie_liquidity_usd: Decimal,
    pub max_drawdown_pct: f64,
    pub max_daily_drawdown_pct: f64,
    /// Bound on waiting for an (engine, symbol) lock.
    pub lock_timeout_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            initial_cash: dec!(1000),
            initial_gas_native: dec!(0.02),
            gas_fee_native: dec!(0.005),
            native_price_usd: dec!(150),
            gas_floor_native: dec!(0.005),
            gas_critical_native: dec!(0.005),
            gas_topup_usd: dec!(1),
            gas_sweep_high_native: dec!(0.1),
            gas_sweep_high_low_cash_native: dec!(0.03),
            low_cash_threshold_usd: dec!(10),
            gas_sweep_target_native: dec!(0.015),
            dust_quantity: dec!(0.000000001),
            max_hold_secs: 900,
            zombie_liquidity_usd: dec!(50000),
            max_drawdown_pct: 0.15,
            max_daily_drawdown_pct: 0.05,
            lock_timeout_ms: 2000,
        }
    }
}

impl LedgerConfig {
    /// USD cost of one transaction fee.
    #[must_use]
    pub fn fee_usd(&self) -> Decimal {
        self.gas_fee_native * self.native_price_usd
    }

    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    #[must_use]
    pub fn with_initial_cash(mut self, cash: Decimal) -> Self {
        self.initial_cash = cash;
        self
    }

    #[must_use]
    pub fn with_initial_gas(mut self, gas_native: Decimal) -> Self {
        self.initial_gas_native = gas_native;
        self
    }

    #[must_use]
    pub fn with_lock_timeout_ms(mut self, ms: u64) -> Self {
        self.lock_timeout_ms = ms;
        self
    }

    #[must_use]
    pub fn with_max_hold_secs(mut self, secs: u64) -> Self {
        self.max_hold_secs = secs;
        self
    }
}

// =============================================================================
// Slippage Model
// =============================================================================

/// One liquidity tier: pools at or above `min_liquidity_usd` slip `bps`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlippageTier {
    pub min_liquidity_usd: Decimal,
    pub bps: f64,
}

/// Liquidity-tiered slippage used by the ledger to derive fill prices.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlippageModelConfig {
    /// Tiers ordered from deepest to shallowest liquidity.
    pub tiers: Vec<SlippageTier>,
    /// Applied when liquidity is below every tier.
    pub fallback_bps: f64,
    pub volatility_multiplier: f64,
    /// Fixed penalty for price movement between quote and fill.
    pub latency_drift_bps: f64,
    pub max_bps: f64,
}

impl Default for SlippageModelConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                SlippageTier {
                    min_liquidity_usd: dec!(1000000),
                    bps: 1.0,
                },
                SlippageTier {
                    min_liquidity_usd: dec!(500000),
                    bps: 2.5,
                },
                SlippageTier {
                    min_liquidity_usd: dec!(100000),
                    bps: 10.0,
                },
                SlippageTier {
                    min_liquidity_usd: dec!(50000),
                    bps: 30.0,
                },
            ],
            fallback_bps: 80.0,
            volatility_multiplier: 3.0,
            latency_drift_bps: 0.2,
            max_bps: 5000.0,
        }
    }
}

impl SlippageModelConfig {
    /// A model with no slippage or drift at any liquidity.
    #[must_use]
    pub fn frictionless() -> Self {
        Self {
            tiers: Vec::new(),
            fallback_bps: 0.0,
            volatility_multiplier: 1.0,
            latency_drift_bps: 0.0,
            max_bps: 0.0,
        }
    }

    #[must_use]
    pub fn with_latency_drift_bps(mut self, bps: f64) -> Self {
        self.latency_drift_bps = bps.max(0.0);
        self
    }
}

// =============================================================================
// Simulator
// =============================================================================

/// Paper-mode fill simulation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Probability a transaction fails outright.
    pub failure_rate: f64,
    /// Failure probability while the network is congested.
    pub congestion_failure_rate: f64,
    pub delay_min_ms: u64,
    pub delay_max_ms: u64,
    /// Upper delay bound while congested.
    pub congestion_delay_max_ms: u64,
    pub partial_fill_rate: f64,
    pub min_fill_pct: f64,
    pub max_fill_pct: f64,
    /// Probability of a sandwich attack.
    pub mev_risk_rate: f64,
    pub mev_penalty_min: f64,
    pub mev_penalty_max: f64,
    /// Price move within the watcher window that counts as congestion.
    pub congestion_move_pct: f64,
    /// Seed for reproducible runs. `None` uses system entropy.
    pub random_seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.05,
            congestion_failure_rate: 0.15,
            delay_min_ms: 200,
            delay_max_ms: 500,
            congestion_delay_max_ms: 1000,
            partial_fill_rate: 0.10,
            min_fill_pct: 0.80,
            max_fill_pct: 0.99,
            mev_risk_rate: 0.15,
            mev_penalty_min: 0.01,
            mev_penalty_max: 0.03,
            congestion_move_pct: 0.10,
            random_seed: None,
        }
    }
}

impl SimulatorConfig {
    /// No failures, no delay, full fills, no MEV.
    #[must_use]
    pub fn deterministic() -> Self {
        Self {
            failure_rate: 0.0,
            congestion_failure_rate: 0.0,
            delay_min_ms: 0,
            delay_max_ms: 0,
            congestion_delay_max_ms: 0,
            partial_fill_rate: 0.0,
            mev_risk_rate: 0.0,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            random_seed: Some(seed),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn partial_fill_rate(mut self, rate: f64) -> Self {
        self.partial_fill_rate = rate.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn mev_risk_rate(mut self, rate: f64) -> Self {
        self.mev_risk_rate = rate.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn delay_ms(mut self, min: u64, max: u64) -> Self {
        self.delay_min_ms = min.min(max);
        self.delay_max_ms = max.max(min);
        self
    }
}

// =============================================================================
// Admission
// =============================================================================

/// What to do with a buy in a pool below the liquidity floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiquidityPolicy {
    #[default]
    Reject,
    HalveSize,
}

/// Confidence tiers used when a signal carries no explicit size.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceSizingConfig {
    pub high_threshold: f64,
    pub medium_threshold: f64,
    pub high_pct: f64,
    pub medium_pct: f64,
    pub low_pct: f64,
    /// Hard cap on any single trade as a fraction of cash.
    pub max_capital_per_trade_pct: f64,
}

impl Default for ConfidenceSizingConfig {
    fn default() -> Self {
        Self {
            high_threshold: 0.75,
            medium_threshold: 0.5,
            high_pct: 0.30,
            medium_pct: 0.10,
            low_pct: 0.05,
            max_capital_per_trade_pct: 0.30,
        }
    }
}

/// Preflight thresholds applied before a buy may execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub min_trade_usd: Decimal,
    pub min_liquidity_usd: Decimal,
    pub liquidity_policy: LiquidityPolicy,
    pub max_positions: usize,
    pub live_min_confidence: f64,
    pub paper_min_confidence: f64,
    pub live_filter_threshold: f64,
    pub paper_filter_threshold: f64,
    /// Maximum relative gap between signal and reference price.
    pub divergence_tolerance: f64,
    /// References older than this are ignored.
    pub max_reference_age_secs: i64,
    /// Timeout for each advisory collaborator call.
    pub collaborator_timeout_ms: u64,
    pub sizing: ConfidenceSizingConfig,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            min_trade_usd: dec!(2),
            min_liquidity_usd: dec!(100000),
            liquidity_policy: LiquidityPolicy::Reject,
            max_positions: 5,
            live_min_confidence: 0.5,
            paper_min_confidence: 0.35,
            live_filter_threshold: 0.65,
            paper_filter_threshold: 0.45,
            divergence_tolerance: 0.005,
            max_reference_age_secs: 10,
            collaborator_timeout_ms: 250,
            sizing: ConfidenceSizingConfig::default(),
        }
    }
}

impl AdmissionConfig {
    #[must_use]
    pub fn min_confidence(&self, mode: ExecutionMode) -> f64 {
        match mode {
            ExecutionMode::Paper => self.paper_min_confidence,
            ExecutionMode::Live => self.live_min_confidence,
        }
    }

    #[must_use]
    pub fn filter_threshold(&self, mode: ExecutionMode) -> f64 {
        match mode {
            ExecutionMode::Paper => self.paper_filter_threshold,
            ExecutionMode::Live => self.live_filter_threshold,
        }
    }

    #[must_use]
    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_millis(self.collaborator_timeout_ms)
    }

    #[must_use]
    pub fn with_max_positions(mut self, max: usize) -> Self {
        self.max_positions = max;
        self
    }

    #[must_use]
    pub fn with_liquidity_policy(mut self, policy: LiquidityPolicy) -> Self {
        self.liquidity_policy = policy;
        self
    }

    #[must_use]
    pub fn with_divergence_tolerance(mut self, tolerance: f64) -> Self {
        self.divergence_tolerance = tolerance.max(0.0);
        self
    }
}

// =============================================================================
// Watcher
// =============================================================================

/// Per-asset position lifecycle parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub signal_cooldown_secs: i64,
    pub trailing_enabled: bool,
    /// Unrealized profit that arms the trailing stop.
    pub trailing_activation_pct: f64,
    pub trailing_pct: f64,
    /// Negative fraction, e.g. -0.03 for a 3% stop.
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    /// Buy suppression after a stop-loss exit.
    pub hibernation_secs: i64,
    pub max_trades_per_hour: u32,
    /// Lookback used for congestion detection.
    pub price_window_secs: i64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            signal_cooldown_secs: 15,
            trailing_enabled: true,
            trailing_activation_pct: 0.02,
            trailing_pct: 0.015,
            stop_loss_pct: -0.03,
            take_profit_pct: 0.04,
            hibernation_secs: 1800,
            max_trades_per_hour: 3,
            price_window_secs: 300,
        }
    }
}

impl WatcherConfig {
    #[must_use]
    pub fn with_cooldown_secs(mut self, secs: i64) -> Self {
        self.signal_cooldown_secs = secs.max(0);
        self
    }

    #[must_use]
    pub fn with_max_trades_per_hour(mut self, max: u32) -> Self {
        self.max_trades_per_hour = max;
        self
    }

    #[must_use]
    pub fn with_hibernation_secs(mut self, secs: i64) -> Self {
        self.hibernation_secs = secs.max(0);
        self
    }
}

// =============================================================================
// Calibration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditorConfig {
    /// Ring buffer capacity.
    pub capacity: usize,
    /// Drift magnitude (percent) that raises an alert.
    pub alert_delta_pct: f64,
}

impl Default for AuditorConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            alert_delta_pct: 1.0,
        }
    }
}

/// Slippage tolerance controller bounds and steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlippageControllerConfig {
    pub window: usize,
    pub initial_bps: u32,
    pub min_bps: u32,
    pub max_bps: u32,
    pub step_up_bps: u32,
    pub step_down_bps: u32,
    /// Average drift above this loosens tolerance.
    pub loosen_above_pct: f64,
    /// Average drift below this tightens tolerance.
    pub tighten_below_pct: f64,
}

impl Default for SlippageControllerConfig {
    fn default() -> Self {
        Self {
            window: 5,
            initial_bps: 300,
            min_bps: 100,
            max_bps: 800,
            step_up_bps: 50,
            step_down_bps: 25,
            loosen_above_pct: 1.5,
            tighten_below_pct: 0.5,
        }
    }
}

/// Priority fee controller parameters. Tips are in lamports (1e-9 native).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityFeeConfig {
    pub window: usize,
    pub base_tip_lamports: u64,
    pub max_tip_lamports: u64,
    /// Abort when tip cost exceeds this share of expected profit.
    pub max_tip_profit_ratio: f64,
    pub native_price_usd: f64,
    pub moderate_lag_ms: f64,
    pub heavy_lag_ms: f64,
    pub emergency_lag_ms: f64,
}

impl Default for PriorityFeeConfig {
    fn default() -> Self {
        Self {
            window: 5,
            base_tip_lamports: 10_000,
            max_tip_lamports: 100_000,
            max_tip_profit_ratio: 0.5,
            native_price_usd: 150.0,
            moderate_lag_ms: 100.0,
            heavy_lag_ms: 500.0,
            emergency_lag_ms: 1000.0,
        }
    }
}

// =============================================================================
// Infrastructure
// =============================================================================

/// Retry and circuit-breaker parameters for external calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open.
    pub cooldown_ms: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_ms: 30_000,
            max_retries: 3,
            base_delay_ms: 50,
            max_delay_ms: 1000,
        }
    }
}

impl BackoffConfig {
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    #[must_use]
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown_ms = u64::try_from(cooldown.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn with_retries(mut self, max_retries: u32, base_delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.base_delay_ms = base_delay_ms;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub data_dir: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            data_dir: PathBuf::from("data"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fee_usd_from_native_price() {
        let config = LedgerConfig::default();
        assert_eq!(config.fee_usd(), dec!(0.75));
    }

    #[test]
    fn test_mode_dependent_thresholds() {
        let config = AdmissionConfig::default();
        assert!((config.filter_threshold(ExecutionMode::Live) - 0.65).abs() < f64::EPSILON);
        assert!((config.filter_threshold(ExecutionMode::Paper) - 0.45).abs() < f64::EPSILON);
        assert!(config.min_confidence(ExecutionMode::Paper) < config.min_confidence(ExecutionMode::Live));
    }

    #[test]
    fn test_simulator_deterministic_preset() {
        let config = SimulatorConfig::deterministic();
        assert!((config.failure_rate - 0.0).abs() < f64::EPSILON);
        assert_eq!(config.delay_max_ms, 0);
        assert!((config.mev_risk_rate - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_delay_builder_orders_bounds() {
        let config = SimulatorConfig::default().delay_ms(500, 100);
        assert_eq!(config.delay_min_ms, 100);
        assert_eq!(config.delay_max_ms, 500);
    }

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let config: AppConfig = serde_json::from_str(r#"{"ledger": {"initial_cash": "250"}}"#).unwrap();
        assert_eq!(config.ledger.initial_cash, dec!(250));
        assert_eq!(config.ledger.gas_fee_native, dec!(0.005));
        assert_eq!(config.slippage_controller.max_bps, 800);
        assert_eq!(config.engines.names, vec!["PRIMARY".to_string()]);
    }
}
