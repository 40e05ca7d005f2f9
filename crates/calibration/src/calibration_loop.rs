//! Event-driven calibration of execution parameters.
//!
//! After each executed trade the loop reads the latest audits, steps both
//! controllers, and publishes a [`CalibrationSnapshot`] on a watch channel.
//! Executors read the snapshot on their next cycle, so they may lag the very
//! latest trade by one calibration.

use crate::priority_fee::{CongestionLevel, PriorityFeeController, PriorityFeeStatus};
use crate::slippage::{CalibrationAction, SlippageController, SlippageStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tradegate_core::config::{PriorityFeeConfig, SlippageControllerConfig};
use tradegate_core::events::ShadowAudit;
use tracing::{debug, warn};

/// Read access to recent drift observations.
pub trait DriftSource: Send + Sync {
    /// The `n` most recent audits, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the audits cannot be read.
    fn recent_audits(&self, n: usize) -> anyhow::Result<Vec<ShadowAudit>>;
}

/// Execution parameters as last published by the loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationSnapshot {
    pub slippage_bps: u32,
    pub tip_lamports: u64,
    pub congestion: CongestionLevel,
    pub calibration_count: u64,
    pub last_action: Option<CalibrationAction>,
    pub updated_at: DateTime<Utc>,
}

/// What one invocation of the loop did.
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationOutcome {
    /// The drift source could not be read; nothing changed.
    Skipped { reason: String },
    /// Not enough audits yet.
    Insufficient { available: usize, required: usize },
    Calibrated {
        action: Option<CalibrationAction>,
        congestion: Option<CongestionLevel>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationStatus {
    pub slippage: SlippageStatus,
    pub priority_fee: PriorityFeeStatus,
    pub skipped_reads: u64,
}

pub struct AdaptiveCalibrationLoop {
    source: Arc<dyn DriftSource>,
    slippage: SlippageController,
    fees: PriorityFeeController,
    tx: watch::Sender<CalibrationSnapshot>,
    skipped_reads: AtomicU64,
}

impl std::fmt::Debug for AdaptiveCalibrationLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveCalibrationLoop")
            .field("slippage", &self.slippage)
            .field("fees", &self.fees)
            .finish_non_exhaustive()
    }
}

impl AdaptiveCalibrationLoop {
    #[must_use]
    pub fn new(
        source: Arc<dyn DriftSource>,
        slippage_config: SlippageControllerConfig,
        fee_config: PriorityFeeConfig,
    ) -> Self {
        let slippage = SlippageController::new(slippage_config);
        let fees = PriorityFeeController::new(fee_config);
        let (tx, _rx) = watch::channel(Self::build_snapshot(&slippage, &fees));

        Self {
            source,
            slippage,
            fees,
            tx,
            skipped_reads: AtomicU64::new(0),
        }
    }

    /// Receiver that always holds the latest published snapshot.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<CalibrationSnapshot> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn snapshot(&self) -> CalibrationSnapshot {
        self.tx.borrow().clone()
    }

    #[must_use]
    pub fn slippage(&self) -> &SlippageController {
        &self.slippage
    }

    #[must_use]
    pub fn fees(&self) -> &PriorityFeeController {
        &self.fees
    }

    /// Steps both controllers from the latest audits. Call after every executed trade.
    pub fn on_trade_executed(&self) -> CalibrationOutcome {
        let required = self
            .slippage
            .config()
            .window
            .min(self.fees.config().window);
        let read = self
            .slippage
            .config()
            .window
            .max(self.fees.config().window);

        let audits = match self.source.recent_audits(read) {
            Ok(audits) => audits,
            Err(e) => {
                self.skipped_reads.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Calibration skipped, drift source unavailable");
                return CalibrationOutcome::Skipped {
                    reason: e.to_string(),
                };
            }
        };

        if audits.len() < required {
            debug!(available = audits.len(), required, "Not enough audits to calibrate");
            return CalibrationOutcome::Insufficient {
                available: audits.len(),
                required,
            };
        }

        let deltas: Vec<f64> = audits.iter().map(|a| a.delta_pct).collect();
        let lags: Vec<i64> = audits.iter().map(|a| a.lag_ms).collect();

        let action = self.slippage.calibrate(&deltas);
        let congestion = self.fees.update_from_lags(&lags);
        self.publish();

        CalibrationOutcome::Calibrated { action, congestion }
    }

    /// Forces both controllers to their widest settings.
    pub fn force_loosen(&self) {
        self.slippage.force_loosen();
        self.fees.force_loosen();
        self.publish();
    }

    /// Forces both controllers to their narrowest settings.
    pub fn force_tighten(&self) {
        self.slippage.force_tighten();
        self.fees.force_tighten();
        self.publish();
    }

    #[must_use]
    pub fn status(&self) -> CalibrationStatus {
        CalibrationStatus {
            slippage: self.slippage.status(),
            priority_fee: self.fees.status(),
            skipped_reads: self.skipped_reads.load(Ordering::Relaxed),
        }
    }

    fn publish(&self) {
        self.tx.send_replace(Self::build_snapshot(&self.slippage, &self.fees));
    }

    fn build_snapshot(slippage: &SlippageController, fees: &PriorityFeeController) -> CalibrationSnapshot {
        let status = slippage.status();
        CalibrationSnapshot {
            slippage_bps: status.current_bps,
            tip_lamports: fees.current_tip_lamports(),
            congestion: fees.level(),
            calibration_count: status.calibration_count,
            last_action: status.last_action,
            updated_at: Utc::now(),
        }
    }
}
