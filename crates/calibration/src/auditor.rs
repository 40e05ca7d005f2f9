//! Paper-vs-live drift auditing.
//!
//! The auditor pairs a PAPER and a LIVE [`TradeResult`] for the same signal,
//! derives the fill drift and execution lag, and keeps the most recent audits
//! in a fixed-capacity ring buffer. Each audit is also queued for the
//! append-only log and, when the drift is large, sent to the notifier. Neither
//! is awaited. One writer task drains the log queue, so rows land in the order
//! they were recorded.
//!
//! # Example
//!
//! ```
//! use tradegate_calibration::ShadowAuditor;
//! use tradegate_core::config::AuditorConfig;
//!
//! let auditor = ShadowAuditor::new(AuditorConfig { capacity: 3, ..Default::default() });
//! assert!(auditor.get_recent_audits(5).is_empty());
//! assert_eq!(auditor.get_stats().count, 0);
//! ```

use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tradegate_core::config::AuditorConfig;
use tradegate_core::events::{ShadowAudit, Signal, TradeResult};
use tokio::sync::mpsc;
use tradegate_core::traits::{NotificationPriority, Notifier, Persistence};
use tracing::{debug, info, warn};

/// Aggregate drift statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditStats {
    /// Audits recorded since start, including evicted ones.
    pub count: u64,
    /// Audits currently held in the buffer.
    pub buffered: usize,
    /// Audits whose drift exceeded the significance threshold.
    pub significant: u64,
    /// Pairs skipped because a side failed or had no fill.
    pub skipped: u64,
    /// Mean drift over every audit ever recorded.
    pub avg_delta_pct: f64,
    /// Extremes over the buffered audits.
    pub min_delta_pct: Option<f64>,
    pub max_delta_pct: Option<f64>,
    /// Mean lag over the buffered audits.
    pub avg_lag_ms: f64,
}

#[derive(Debug)]
struct AuditorState {
    buffer: VecDeque<ShadowAudit>,
    total_audits: u64,
    significant_deltas: u64,
    skipped: u64,
    cumulative_delta_pct: f64,
}

impl AuditorState {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity),
            total_audits: 0,
            significant_deltas: 0,
            skipped: 0,
            cumulative_delta_pct: 0.0,
        }
    }
}

pub struct ShadowAuditor {
    config: AuditorConfig,
    state: RwLock<AuditorState>,
    log: Option<mpsc::UnboundedSender<ShadowAudit>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl std::fmt::Debug for ShadowAuditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("ShadowAuditor")
            .field("config", &self.config)
            .field("buffered", &state.buffer.len())
            .field("total_audits", &state.total_audits)
            .finish_non_exhaustive()
    }
}

impl ShadowAuditor {
    #[must_use]
    pub fn new(config: AuditorConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            config: AuditorConfig { capacity, ..config },
            state: RwLock::new(AuditorState::new(capacity)),
            log: None,
            notifier: None,
        }
    }

    /// Attaches the append-only audit log and starts its writer task.
    ///
    /// Must be called from within a tokio runtime; otherwise audits are not logged.
    #[must_use]
    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.log = spawn_log_writer(persistence);
        self
    }

    /// Attaches the alert channel for significant drift.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().buffer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compares a paper and a live result for `signal`.
    ///
    /// Returns `None` (and records nothing) when either side failed or the
    /// paper fill is not positive.
    pub fn audit(&self, signal: &Signal, paper: &TradeResult, live: &TradeResult) -> Option<ShadowAudit> {
        if !paper.success || !live.success || paper.fill_price <= Decimal::ZERO {
            self.state.write().skipped += 1;
            debug!(
                symbol = %signal.symbol,
                paper_ok = paper.success,
                live_ok = live.success,
                "Skipping shadow audit"
            );
            return None;
        }

        let delta = (live.fill_price - paper.fill_price) / paper.fill_price * Decimal::ONE_HUNDRED;
        let audit = ShadowAudit {
            symbol: signal.symbol.clone(),
            action: signal.action,
            signal_price: signal.price,
            paper_fill: paper.fill_price,
            live_fill: live.fill_price,
            delta_pct: delta.to_f64().unwrap_or(0.0),
            lag_ms: (live.timestamp - paper.timestamp).num_milliseconds(),
            paper_slippage: paper.slippage_pct,
            live_slippage: live.slippage_pct,
            timestamp: chrono::Utc::now(),
        };

        self.record(audit.clone());
        Some(audit)
    }

    /// Appends an audit to the ring buffer, evicting the oldest when full.
    pub fn record(&self, audit: ShadowAudit) {
        let significant = audit.delta_pct.abs() > self.config.alert_delta_pct;
        {
            let mut state = self.state.write();
            if state.buffer.len() >= self.config.capacity {
                state.buffer.pop_front();
            }
            state.total_audits += 1;
            state.cumulative_delta_pct += audit.delta_pct;
            if significant {
                state.significant_deltas += 1;
            }
            state.buffer.push_back(audit.clone());
        }

        info!(
            symbol = %audit.symbol,
            action = %audit.action,
            delta_pct = audit.delta_pct,
            lag_ms = audit.lag_ms,
            "Shadow audit recorded"
        );

        if significant {
            warn!(symbol = %audit.symbol, delta_pct = audit.delta_pct, "Significant paper/live drift");
            self.spawn_alert(&audit);
        }
        self.enqueue_log(audit);
    }

    /// The `n` most recent audits, oldest first.
    #[must_use]
    pub fn get_recent_audits(&self, n: usize) -> Vec<ShadowAudit> {
        let state = self.state.read();
        let skip = state.buffer.len().saturating_sub(n);
        state.buffer.iter().skip(skip).cloned().collect()
    }

    #[must_use]
    pub fn get_stats(&self) -> AuditStats {
        let state = self.state.read();
        let buffered = state.buffer.len();

        let (min, max, lag_sum) = state.buffer.iter().fold(
            (None::<f64>, None::<f64>, 0i64),
            |(min, max, lag), a| {
                (
                    Some(min.map_or(a.delta_pct, |m| m.min(a.delta_pct))),
                    Some(max.map_or(a.delta_pct, |m| m.max(a.delta_pct))),
                    lag + a.lag_ms,
                )
            },
        );

        AuditStats {
            count: state.total_audits,
            buffered,
            significant: state.significant_deltas,
            skipped: state.skipped,
            avg_delta_pct: if state.total_audits == 0 {
                0.0
            } else {
                state.cumulative_delta_pct / state.total_audits as f64
            },
            min_delta_pct: min,
            max_delta_pct: max,
            avg_lag_ms: if buffered == 0 {
                0.0
            } else {
                lag_sum as f64 / buffered as f64
            },
        }
    }

    fn enqueue_log(&self, audit: ShadowAudit) {
        let Some(log) = &self.log else {
            return;
        };
        if log.send(audit).is_err() {
            debug!("Audit log writer stopped, append skipped");
        }
    }

    fn spawn_alert(&self, audit: &ShadowAudit) {
        let Some(notifier) = self.notifier.clone() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let message = format!(
            "Shadow drift {} {}: {:+.2}% (paper {} / live {}, lag {}ms)",
            audit.symbol, audit.action, audit.delta_pct, audit.paper_fill, audit.live_fill, audit.lag_ms
        );
        handle.spawn(async move {
            if let Err(e) = notifier.send(&message, NotificationPriority::High).await {
                debug!(error = %e, "Drift alert not delivered");
            }
        });
    }
}

fn spawn_log_writer(persistence: Arc<dyn Persistence>) -> Option<mpsc::UnboundedSender<ShadowAudit>> {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        warn!("No tokio runtime, shadow audit log disabled");
        return None;
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<ShadowAudit>();
    handle.spawn(async move {
        while let Some(audit) = rx.recv().await {
            if let Err(e) = persistence.append_audit(&audit).await {
                warn!(symbol = %audit.symbol, error = %e, "Failed to append shadow audit");
            }
        }
        debug!("Audit log writer stopped");
    });
    Some(tx)
}

impl crate::calibration_loop::DriftSource for ShadowAuditor {
    fn recent_audits(&self, n: usize) -> anyhow::Result<Vec<ShadowAudit>> {
        Ok(self.get_recent_audits(n))
    }
}
