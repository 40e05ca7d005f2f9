//! Integration tests for the shadow auditor feeding the calibration loop.
//!
//! Covers the fire-and-forget hooks (audit log append and drift alerts) and
//! the full audit -> calibrate path across many trades.

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tradegate_calibration::{AdaptiveCalibrationLoop, CalibrationAction, CongestionLevel, ShadowAuditor};
use tradegate_core::config::{AuditorConfig, PriorityFeeConfig, SlippageControllerConfig};
use tradegate_core::events::{ExecutionMode, ShadowAudit, Signal, TradeAction, TradeResult};
use tradegate_core::position::{LedgerSnapshot, WatcherRecord};
use tradegate_core::traits::{NotificationPriority, Notifier, Persistence};

// =============================================================================
// Helper Functions
// =============================================================================

#[derive(Default)]
struct RecordingSink {
    audits: Mutex<Vec<ShadowAudit>>,
    alerts: Mutex<Vec<(String, NotificationPriority)>>,
}

#[async_trait]
impl Notifier for RecordingSink {
    async fn send(&self, message: &str, priority: NotificationPriority) -> anyhow::Result<()> {
        self.alerts.lock().push((message.to_string(), priority));
        Ok(())
    }
}

#[async_trait]
impl Persistence for RecordingSink {
    async fn save_position(&self, _record: &WatcherRecord) -> anyhow::Result<()> {
        Ok(())
    }
    async fn load_position(&self, _engine: &str, _symbol: &str) -> anyhow::Result<Option<WatcherRecord>> {
        Ok(None)
    }
    async fn delete_position(&self, _engine: &str, _symbol: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn load_all_positions(&self) -> anyhow::Result<Vec<WatcherRecord>> {
        Ok(Vec::new())
    }
    async fn save_ledger(&self, _snapshot: &LedgerSnapshot) -> anyhow::Result<()> {
        Ok(())
    }
    async fn load_ledger(&self) -> anyhow::Result<Option<LedgerSnapshot>> {
        Ok(None)
    }
    async fn append_trade(&self, _result: &TradeResult) -> anyhow::Result<()> {
        Ok(())
    }
    async fn append_audit(&self, audit: &ShadowAudit) -> anyhow::Result<()> {
        self.audits.lock().push(audit.clone());
        Ok(())
    }
}

/// Audit log whose append latency varies with the drift value.
#[derive(Default)]
struct UnevenLog {
    audits: Mutex<Vec<ShadowAudit>>,
}

#[async_trait]
impl Persistence for UnevenLog {
    async fn save_position(&self, _record: &WatcherRecord) -> anyhow::Result<()> {
        Ok(())
    }
    async fn load_position(&self, _engine: &str, _symbol: &str) -> anyhow::Result<Option<WatcherRecord>> {
        Ok(None)
    }
    async fn delete_position(&self, _engine: &str, _symbol: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn load_all_positions(&self) -> anyhow::Result<Vec<WatcherRecord>> {
        Ok(Vec::new())
    }
    async fn save_ledger(&self, _snapshot: &LedgerSnapshot) -> anyhow::Result<()> {
        Ok(())
    }
    async fn load_ledger(&self) -> anyhow::Result<Option<LedgerSnapshot>> {
        Ok(None)
    }
    async fn append_trade(&self, _result: &TradeResult) -> anyhow::Result<()> {
        Ok(())
    }
    async fn append_audit(&self, audit: &ShadowAudit) -> anyhow::Result<()> {
        let delay = 3 - (audit.delta_pct as u64 % 4);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        self.audits.lock().push(audit.clone());
        Ok(())
    }
}

fn pair(paper: Decimal, live: Decimal, lag_ms: i64) -> (Signal, TradeResult, TradeResult) {
    let signal = Signal::buy("SOL", paper);
    let paper_result = TradeResult::filled("PRIMARY", "SOL", TradeAction::Buy, ExecutionMode::Paper, paper, dec!(1));
    let live_result = TradeResult::filled("PRIMARY", "SOL", TradeAction::Buy, ExecutionMode::Live, live, dec!(1))
        .with_timestamp(paper_result.timestamp + ChronoDuration::milliseconds(lag_ms));
    (signal, paper_result, live_result)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn significant_drift_is_logged_and_alerted() {
    let sink = Arc::new(RecordingSink::default());
    let auditor = ShadowAuditor::new(AuditorConfig::default())
        .with_persistence(sink.clone())
        .with_notifier(sink.clone());

    let (signal, paper, live) = pair(dec!(100), dec!(103), 200);
    let audit = auditor.audit(&signal, &paper, &live).unwrap();
    assert!((audit.delta_pct - 3.0).abs() < 1e-9);

    let (signal, paper, live) = pair(dec!(100), dec!(100.2), 50);
    auditor.audit(&signal, &paper, &live).unwrap();

    settle().await;

    assert_eq!(sink.audits.lock().len(), 2);
    let alerts = sink.alerts.lock();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].1, NotificationPriority::High);
    assert!(alerts[0].0.contains("SOL"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn audit_log_keeps_record_order() {
    let log = Arc::new(UnevenLog::default());
    let auditor = ShadowAuditor::new(AuditorConfig::default()).with_persistence(log.clone());

    for i in 0..40u32 {
        let mut audit = pair_audit();
        audit.delta_pct = f64::from(i);
        auditor.record(audit);
    }
    tokio::time::sleep(Duration::from_millis(400)).await;

    let deltas: Vec<f64> = log.audits.lock().iter().map(|a| a.delta_pct).collect();
    let expected: Vec<f64> = (0..40u32).map(f64::from).collect();
    assert_eq!(deltas, expected);
}

fn pair_audit() -> ShadowAudit {
    let auditor = ShadowAuditor::new(AuditorConfig::default());
    let (signal, paper, live) = pair(dec!(100), dec!(100.1), 10);
    auditor.audit(&signal, &paper, &live).unwrap()
}

#[tokio::test]
async fn persistent_drift_walks_tolerance_to_max_then_holds() {
    let auditor = Arc::new(ShadowAuditor::new(AuditorConfig::default()));
    let calibration = AdaptiveCalibrationLoop::new(
        auditor.clone(),
        SlippageControllerConfig::default(),
        PriorityFeeConfig::default(),
    );

    let mut seen = Vec::new();
    for _ in 0..20 {
        let (signal, paper, live) = pair(dec!(100), dec!(103), 1500);
        auditor.audit(&signal, &paper, &live);
        calibration.on_trade_executed();
        seen.push(calibration.snapshot().slippage_bps);
    }

    // No calibration until five audits exist.
    assert_eq!(&seen[..4], &[300, 300, 300, 300]);
    assert_eq!(&seen[4..10], &[350, 400, 450, 500, 550, 600]);
    assert!(seen[13..].iter().all(|&bps| bps == 800));

    let status = calibration.status();
    assert_eq!(status.slippage.last_action, Some(CalibrationAction::Loosen));
    assert_eq!(status.priority_fee.level, CongestionLevel::Emergency);
    assert_eq!(status.priority_fee.tip_lamports, 50_000);
}

#[tokio::test]
async fn agreement_tightens_after_loosening() {
    let auditor = Arc::new(ShadowAuditor::new(AuditorConfig::default()));
    let calibration = AdaptiveCalibrationLoop::new(
        auditor.clone(),
        SlippageControllerConfig::default(),
        PriorityFeeConfig::default(),
    );
    calibration.force_loosen();

    for _ in 0..5 {
        let (signal, paper, live) = pair(dec!(100), dec!(100.1), 20);
        auditor.audit(&signal, &paper, &live);
    }
    calibration.on_trade_executed();

    let snapshot = calibration.snapshot();
    assert_eq!(snapshot.slippage_bps, 775);
    assert_eq!(snapshot.congestion, CongestionLevel::Normal);
    assert_eq!(snapshot.tip_lamports, 10_000);
}
