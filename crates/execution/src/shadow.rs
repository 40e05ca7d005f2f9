//! Paper and live execution of the same signal, side by side.
//!
//! [`DualModeExecutor`] fires both executors concurrently, hands the pair to
//! the [`ShadowAuditor`], and then steps the calibration loop. The two
//! executors must book into different engines or different ledgers.

use crate::executor::TradeExecutor;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};
use tradegate_calibration::{AdaptiveCalibrationLoop, CalibrationOutcome, ShadowAuditor};
use tradegate_core::events::{ExecutionMode, ShadowAudit, Signal, TradeResult};

#[derive(Debug, Clone)]
pub struct DualResult {
    pub paper: TradeResult,
    pub live: TradeResult,
    /// `None` when either side failed.
    pub audit: Option<ShadowAudit>,
    pub calibration: Option<CalibrationOutcome>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DualStats {
    pub executions: u64,
    pub audited: u64,
    pub paper_only: u64,
    pub live_only: u64,
}

pub struct DualModeExecutor {
    paper: Arc<TradeExecutor>,
    live: Arc<TradeExecutor>,
    auditor: Arc<ShadowAuditor>,
    calibration: Option<Arc<AdaptiveCalibrationLoop>>,
    stats: parking_lot::Mutex<DualStats>,
}

impl std::fmt::Debug for DualModeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualModeExecutor")
            .field("paper", &self.paper.engine())
            .field("live", &self.live.engine())
            .field("stats", &*self.stats.lock())
            .finish_non_exhaustive()
    }
}

impl DualModeExecutor {
    #[must_use]
    pub fn new(paper: Arc<TradeExecutor>, live: Arc<TradeExecutor>, auditor: Arc<ShadowAuditor>) -> Self {
        if paper.mode() != ExecutionMode::Paper || live.mode() != ExecutionMode::Live {
            debug!(
                paper_mode = %paper.mode(),
                live_mode = %live.mode(),
                "Dual executor sides are not paper/live"
            );
        }
        Self {
            paper,
            live,
            auditor,
            calibration: None,
            stats: parking_lot::Mutex::new(DualStats::default()),
        }
    }

    #[must_use]
    pub fn with_calibration(mut self, calibration: Arc<AdaptiveCalibrationLoop>) -> Self {
        self.calibration = Some(calibration);
        self
    }

    #[must_use]
    pub fn auditor(&self) -> &Arc<ShadowAuditor> {
        &self.auditor
    }

    #[must_use]
    pub fn stats(&self) -> DualStats {
        self.stats.lock().clone()
    }

    /// Executes `signal` on both sides, audits the pair, then calibrates.
    pub async fn execute(&self, signal: &Signal) -> DualResult {
        let (paper, live) = tokio::join!(self.paper.execute(signal), self.live.execute(signal));

        let audit = self.auditor.audit(signal, &paper, &live);
        {
            let mut stats = self.stats.lock();
            stats.executions += 1;
            match (paper.success, live.success) {
                (true, true) => stats.audited += 1,
                (true, false) => stats.paper_only += 1,
                (false, true) => stats.live_only += 1,
                (false, false) => {}
            }
        }

        if let Some(audit) = &audit {
            info!(
                symbol = %audit.symbol,
                action = %audit.action,
                delta_pct = audit.delta_pct,
                lag_ms = audit.lag_ms,
                "Shadow pair audited"
            );
        }

        let calibration = if paper.success || live.success {
            self.calibration.as_ref().map(|c| c.on_trade_executed())
        } else {
            None
        };

        DualResult {
            paper,
            live,
            audit,
            calibration,
        }
    }
}
