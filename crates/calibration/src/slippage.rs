//! Slippage tolerance controller.
//!
//! Widens the tolerance when live fills drift far from paper fills and
//! narrows it when they agree. Drift between the tighten and loosen
//! thresholds leaves the tolerance unchanged, which keeps the controller
//! from oscillating around a single threshold.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use tradegate_core::config::SlippageControllerConfig;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CalibrationAction {
    Loosen,
    Tighten,
    Hold,
    ForcedLoosen,
    ForcedTighten,
}

impl fmt::Display for CalibrationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loosen => write!(f, "LOOSEN"),
            Self::Tighten => write!(f, "TIGHTEN"),
            Self::Hold => write!(f, "HOLD"),
            Self::ForcedLoosen => write!(f, "FORCED_LOOSEN"),
            Self::ForcedTighten => write!(f, "FORCED_TIGHTEN"),
        }
    }
}

/// Traffic-light view of the current tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SlippageGauge {
    Green,
    Yellow,
    Red,
}

impl SlippageGauge {
    #[must_use]
    pub fn for_bps(bps: u32) -> Self {
        if bps <= 300 {
            Self::Green
        } else if bps <= 600 {
            Self::Yellow
        } else {
            Self::Red
        }
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Green => "Precision",
            Self::Yellow => "Volatility Buffer",
            Self::Red => "Aggressive",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlippageStatus {
    pub current_bps: u32,
    pub min_bps: u32,
    pub max_bps: u32,
    pub calibration_count: u64,
    pub last_action: Option<CalibrationAction>,
    pub last_avg_drift_pct: Option<f64>,
    pub gauge: SlippageGauge,
    pub label: &'static str,
}

#[derive(Debug)]
struct SlippageState {
    current_bps: u32,
    calibration_count: u64,
    last_action: Option<CalibrationAction>,
    last_avg_drift_pct: Option<f64>,
}

#[derive(Debug)]
pub struct SlippageController {
    config: SlippageControllerConfig,
    state: RwLock<SlippageState>,
}

impl SlippageController {
    #[must_use]
    pub fn new(config: SlippageControllerConfig) -> Self {
        let min = config.min_bps.min(config.max_bps);
        let max = config.max_bps.max(config.min_bps);
        let config = SlippageControllerConfig {
            min_bps: min,
            max_bps: max,
            window: config.window.max(1),
            ..config
        };
        let initial = config.initial_bps.clamp(min, max);

        Self {
            config,
            state: RwLock::new(SlippageState {
                current_bps: initial,
                calibration_count: 0,
                last_action: None,
                last_avg_drift_pct: None,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SlippageControllerConfig {
        &self.config
    }

    #[must_use]
    pub fn current_bps(&self) -> u32 {
        self.state.read().current_bps
    }

    /// Applies one control step from the most recent `window` drift values.
    ///
    /// Returns `None` without touching state when fewer than `window` values
    /// are supplied or their mean is not finite.
    pub fn calibrate(&self, deltas_pct: &[f64]) -> Option<CalibrationAction> {
        let window = self.config.window;
        if deltas_pct.len() < window {
            return None;
        }

        let recent = &deltas_pct[deltas_pct.len() - window..];
        let avg = recent.iter().sum::<f64>() / window as f64;
        if !avg.is_finite() {
            return None;
        }

        let mut state = self.state.write();
        let before = state.current_bps;
        let magnitude = avg.abs();

        let action = if magnitude > self.config.loosen_above_pct {
            state.current_bps = before.saturating_add(self.config.step_up_bps).min(self.config.max_bps);
            CalibrationAction::Loosen
        } else if magnitude < self.config.tighten_below_pct {
            state.current_bps = before.saturating_sub(self.config.step_down_bps).max(self.config.min_bps);
            CalibrationAction::Tighten
        } else {
            CalibrationAction::Hold
        };

        state.calibration_count += 1;
        state.last_action = Some(action);
        state.last_avg_drift_pct = Some(avg);

        if state.current_bps != before {
            info!(
                action = %action,
                avg_drift_pct = avg,
                from_bps = before,
                to_bps = state.current_bps,
                "Slippage tolerance recalibrated"
            );
        }

        Some(action)
    }

    /// Jumps straight to the maximum tolerance.
    pub fn force_loosen(&self) {
        let mut state = self.state.write();
        state.current_bps = self.config.max_bps;
        state.last_action = Some(CalibrationAction::ForcedLoosen);
        info!(bps = state.current_bps, "Slippage tolerance forced to maximum");
    }

    /// Jumps straight to the minimum tolerance.
    pub fn force_tighten(&self) {
        let mut state = self.state.write();
        state.current_bps = self.config.min_bps;
        state.last_action = Some(CalibrationAction::ForcedTighten);
        info!(bps = state.current_bps, "Slippage tolerance forced to minimum");
    }

    #[must_use]
    pub fn status(&self) -> SlippageStatus {
        let state = self.state.read();
        let gauge = SlippageGauge::for_bps(state.current_bps);
        SlippageStatus {
            current_bps: state.current_bps,
            min_bps: self.config.min_bps,
            max_bps: self.config.max_bps,
            calibration_count: state.calibration_count,
            last_action: state.last_action,
            last_avg_drift_pct: state.last_avg_drift_pct,
            gauge,
            label: gauge.label(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> SlippageController {
        SlippageController::new(SlippageControllerConfig::default())
    }

    #[test]
    fn test_insufficient_window_does_nothing() {
        let ctl = controller();
        assert_eq!(ctl.calibrate(&[3.0, 3.0, 3.0, 3.0]), None);
        assert_eq!(ctl.current_bps(), 300);
        assert_eq!(ctl.status().calibration_count, 0);
    }

    #[test]
    fn test_large_drift_loosens_until_max() {
        let ctl = controller();
        let window = [3.0; 5];
        let mut previous = ctl.current_bps();

        for _ in 0..20 {
            ctl.calibrate(&window);
            let now = ctl.current_bps();
            if previous < 800 {
                assert_eq!(now, (previous + 50).min(800));
            } else {
                assert_eq!(now, 800);
            }
            previous = now;
        }
        assert_eq!(ctl.current_bps(), 800);
    }

    #[test]
    fn test_small_drift_tightens_until_min() {
        let ctl = controller();
        let window = [0.1; 5];
        let mut previous = ctl.current_bps();

        for _ in 0..20 {
            ctl.calibrate(&window);
            let now = ctl.current_bps();
            if previous > 100 {
                assert!(now < previous);
            } else {
                assert_eq!(now, 100);
            }
            previous = now;
        }
        assert_eq!(ctl.current_bps(), 100);
    }

    #[test]
    fn test_hysteresis_band_holds() {
        let ctl = controller();
        assert_eq!(ctl.calibrate(&[1.0; 5]), Some(CalibrationAction::Hold));
        assert_eq!(ctl.calibrate(&[-1.5; 5]), Some(CalibrationAction::Hold));
        assert_eq!(ctl.calibrate(&[0.5; 5]), Some(CalibrationAction::Hold));
        assert_eq!(ctl.current_bps(), 300);
    }

    #[test]
    fn test_negative_drift_uses_magnitude() {
        let ctl = controller();
        assert_eq!(ctl.calibrate(&[-2.0; 5]), Some(CalibrationAction::Loosen));
        assert_eq!(ctl.current_bps(), 350);
    }

    #[test]
    fn test_only_latest_window_counts() {
        let ctl = controller();
        let mut deltas = vec![10.0; 20];
        deltas.extend([0.0; 5]);
        assert_eq!(ctl.calibrate(&deltas), Some(CalibrationAction::Tighten));
    }

    #[test]
    fn test_non_finite_mean_is_ignored() {
        let ctl = controller();
        assert_eq!(ctl.calibrate(&[f64::NAN; 5]), None);
        assert_eq!(ctl.current_bps(), 300);
    }

    #[test]
    fn test_force_overrides_and_gauge() {
        let ctl = controller();
        assert_eq!(ctl.status().gauge, SlippageGauge::Green);

        ctl.force_loosen();
        let status = ctl.status();
        assert_eq!(status.current_bps, 800);
        assert_eq!(status.gauge, SlippageGauge::Red);
        assert_eq!(status.label, "Aggressive");

        ctl.force_tighten();
        assert_eq!(ctl.current_bps(), 100);
        assert_eq!(ctl.status().last_action, Some(CalibrationAction::ForcedTighten));
    }

    #[test]
    fn test_initial_bps_is_clamped() {
        let ctl = SlippageController::new(SlippageControllerConfig {
            initial_bps: 5000,
            ..Default::default()
        });
        assert_eq!(ctl.current_bps(), 800);
    }
}
