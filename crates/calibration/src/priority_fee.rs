//! Priority-fee (tip) controller driven by observed execution lag.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use tradegate_core::config::PriorityFeeConfig;
use tracing::{info, warn};

const LAMPORTS_PER_NATIVE: f64 = 1_000_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CongestionLevel {
    Normal,
    Moderate,
    Heavy,
    Emergency,
}

impl CongestionLevel {
    #[must_use]
    pub fn multiplier(&self) -> u64 {
        match self {
            Self::Normal => 1,
            Self::Moderate => 2,
            Self::Heavy => 3,
            Self::Emergency => 5,
        }
    }

    /// Heavy enough that simulated fills should assume a congested network.
    #[must_use]
    pub fn is_congested(&self) -> bool {
        *self >= Self::Heavy
    }
}

impl fmt::Display for CongestionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "NORMAL"),
            Self::Moderate => write!(f, "MODERATE"),
            Self::Heavy => write!(f, "HEAVY"),
            Self::Emergency => write!(f, "EMERGENCY"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriorityFeeStatus {
    pub tip_lamports: u64,
    pub tip_usd: f64,
    pub multiplier: u64,
    pub avg_lag_ms: f64,
    pub level: CongestionLevel,
    pub aborts: u64,
}

#[derive(Debug)]
struct FeeState {
    tip_lamports: u64,
    level: CongestionLevel,
    avg_lag_ms: f64,
    abort_count: u64,
}

#[derive(Debug)]
pub struct PriorityFeeController {
    config: PriorityFeeConfig,
    state: RwLock<FeeState>,
}

impl PriorityFeeController {
    #[must_use]
    pub fn new(config: PriorityFeeConfig) -> Self {
        let config = PriorityFeeConfig {
            window: config.window.max(1),
            max_tip_lamports: config.max_tip_lamports.max(config.base_tip_lamports),
            ..config
        };
        Self {
            state: RwLock::new(FeeState {
                tip_lamports: config.base_tip_lamports,
                level: CongestionLevel::Normal,
                avg_lag_ms: 0.0,
                abort_count: 0,
            }),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &PriorityFeeConfig {
        &self.config
    }

    /// Maps an average lag to a congestion level.
    #[must_use]
    pub fn level_for_lag(&self, avg_lag_ms: f64) -> CongestionLevel {
        if avg_lag_ms > self.config.emergency_lag_ms {
            CongestionLevel::Emergency
        } else if avg_lag_ms > self.config.heavy_lag_ms {
            CongestionLevel::Heavy
        } else if avg_lag_ms > self.config.moderate_lag_ms {
            CongestionLevel::Moderate
        } else {
            CongestionLevel::Normal
        }
    }

    /// Recomputes the tip from the most recent `window` lags.
    ///
    /// Returns `None` without touching state when fewer than `window` lags are supplied.
    pub fn update_from_lags(&self, lags_ms: &[i64]) -> Option<CongestionLevel> {
        let window = self.config.window;
        if lags_ms.len() < window {
            return None;
        }

        let recent = &lags_ms[lags_ms.len() - window..];
        let avg = recent.iter().map(|&l| l as f64).sum::<f64>() / window as f64;
        let level = self.level_for_lag(avg);
        let tip = self
            .config
            .base_tip_lamports
            .saturating_mul(level.multiplier())
            .min(self.config.max_tip_lamports);

        let mut state = self.state.write();
        let previous = state.level;
        state.avg_lag_ms = avg;
        state.level = level;
        state.tip_lamports = tip;

        if previous != level {
            info!(
                from = %previous,
                to = %level,
                avg_lag_ms = avg,
                tip_lamports = tip,
                "Network congestion level changed"
            );
        }

        Some(level)
    }

    #[must_use]
    pub fn current_tip_lamports(&self) -> u64 {
        self.state.read().tip_lamports
    }

    #[must_use]
    pub fn tip_usd(&self) -> f64 {
        self.lamports_to_usd(self.current_tip_lamports())
    }

    #[must_use]
    pub fn level(&self) -> CongestionLevel {
        self.state.read().level
    }

    #[must_use]
    pub fn is_congested(&self) -> bool {
        self.level().is_congested()
    }

    /// True when the tip would eat too much of the expected profit.
    ///
    /// Non-positive expected profit always aborts.
    pub fn should_abort(&self, expected_profit_usd: f64) -> bool {
        if !expected_profit_usd.is_finite() || expected_profit_usd <= 0.0 {
            self.state.write().abort_count += 1;
            warn!(expected_profit_usd, "Aborting trade, no expected profit to cover the tip");
            return true;
        }

        let tip_usd = self.tip_usd();
        let ratio = tip_usd / expected_profit_usd;
        if ratio > self.config.max_tip_profit_ratio {
            let mut state = self.state.write();
            state.abort_count += 1;
            warn!(
                tip_usd,
                expected_profit_usd,
                ratio,
                "Aborting trade, priority tip exceeds profit budget"
            );
            return true;
        }
        false
    }

    /// Jumps to the maximum tip.
    pub fn force_loosen(&self) {
        let mut state = self.state.write();
        state.tip_lamports = self.config.max_tip_lamports;
        state.level = CongestionLevel::Emergency;
        info!(tip_lamports = state.tip_lamports, "Priority tip forced to maximum");
    }

    /// Drops back to the base tip.
    pub fn force_tighten(&self) {
        let mut state = self.state.write();
        state.tip_lamports = self.config.base_tip_lamports;
        state.level = CongestionLevel::Normal;
        info!(tip_lamports = state.tip_lamports, "Priority tip forced to base");
    }

    #[must_use]
    pub fn status(&self) -> PriorityFeeStatus {
        let state = self.state.read();
        PriorityFeeStatus {
            tip_lamports: state.tip_lamports,
            tip_usd: self.lamports_to_usd(state.tip_lamports),
            multiplier: state.level.multiplier(),
            avg_lag_ms: state.avg_lag_ms,
            level: state.level,
            aborts: state.abort_count,
        }
    }

    fn lamports_to_usd(&self, lamports: u64) -> f64 {
        lamports as f64 / LAMPORTS_PER_NATIVE * self.config.native_price_usd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> PriorityFeeController {
        PriorityFeeController::new(PriorityFeeConfig::default())
    }

    /// Native priced at $100 so 10_000 lamports = $0.001.
    fn controller_with_base(base_tip_lamports: u64) -> PriorityFeeController {
        PriorityFeeController::new(PriorityFeeConfig {
            base_tip_lamports,
            native_price_usd: 100.0,
            ..Default::default()
        })
    }

    #[test]
    fn test_lag_tiers() {
        let ctl = controller();
        assert_eq!(ctl.level_for_lag(50.0), CongestionLevel::Normal);
        assert_eq!(ctl.level_for_lag(100.0), CongestionLevel::Normal);
        assert_eq!(ctl.level_for_lag(101.0), CongestionLevel::Moderate);
        assert_eq!(ctl.level_for_lag(600.0), CongestionLevel::Heavy);
        assert_eq!(ctl.level_for_lag(1500.0), CongestionLevel::Emergency);
    }

    #[test]
    fn test_emergency_lag_gives_five_x() {
        let ctl = controller();
        let level = ctl.update_from_lags(&[1500; 5]);

        assert_eq!(level, Some(CongestionLevel::Emergency));
        assert_eq!(ctl.status().multiplier, 5);
        assert_eq!(ctl.current_tip_lamports(), 50_000);
    }

    #[test]
    fn test_tip_clamped_to_max() {
        let ctl = PriorityFeeController::new(PriorityFeeConfig {
            base_tip_lamports: 30_000,
            max_tip_lamports: 100_000,
            ..Default::default()
        });
        ctl.update_from_lags(&[1500; 5]);
        assert_eq!(ctl.current_tip_lamports(), 100_000);
    }

    #[test]
    fn test_insufficient_lags_leave_state() {
        let ctl = controller();
        assert_eq!(ctl.update_from_lags(&[2000, 2000]), None);
        assert_eq!(ctl.level(), CongestionLevel::Normal);
        assert_eq!(ctl.current_tip_lamports(), 10_000);
    }

    #[test]
    fn test_should_abort_on_non_positive_profit() {
        let ctl = controller();
        assert!(ctl.should_abort(0.0));
        assert_eq!(ctl.status().aborts, 1);
        assert!(ctl.should_abort(-1.0));
        assert!(ctl.should_abort(f64::NAN));
        assert_eq!(ctl.status().aborts, 3);
    }

    #[test]
    fn test_should_abort_ratio_boundary() {
        // $0.006 tip against $0.01 profit: ratio 0.6
        let expensive = controller_with_base(60_000);
        assert!(expensive.tip_usd() > 0.005);
        assert!(expensive.should_abort(0.01));
        assert_eq!(expensive.status().aborts, 1);

        // $0.004 tip against $0.01 profit: ratio 0.4
        let cheap = controller_with_base(40_000);
        assert!((cheap.tip_usd() - 0.004).abs() < 1e-12);
        assert!(!cheap.should_abort(0.01));
        assert_eq!(cheap.status().aborts, 0);
    }

    #[test]
    fn test_force_overrides() {
        let ctl = controller();
        ctl.force_loosen();
        assert_eq!(ctl.current_tip_lamports(), 100_000);
        assert!(ctl.is_congested());

        ctl.force_tighten();
        assert_eq!(ctl.current_tip_lamports(), 10_000);
        assert_eq!(ctl.level(), CongestionLevel::Normal);
    }
}
