//! Calibration CLI command.
//!
//! Replays the persisted shadow-audit log through a fresh auditor and
//! calibration loop, one step per audit, and reports where the slippage
//! tolerance and priority tip would stand today.

use super::{open_existing_store, resolve_data_dir};
use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tradegate_calibration::{
    AdaptiveCalibrationLoop, AuditStats, CalibrationAction, CalibrationOutcome, CalibrationStatus, DriftSource,
    ShadowAuditor,
};
use tradegate_core::config::AppConfig;

/// Arguments for the calibration command.
#[derive(Args, Debug, Clone, Default)]
pub struct CalibrationArgs {
    /// Data directory (overrides `persistence.data_dir`)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Only replay the most recent N audits
    #[arg(long)]
    pub last: Option<usize>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ActionCounts {
    pub loosen: u32,
    pub tighten: u32,
    pub hold: u32,
    pub insufficient: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CalibrationReport {
    pub replayed: usize,
    pub actions: ActionCounts,
    pub audits: AuditStats,
    pub status: CalibrationStatus,
}

/// Runs the calibration command.
///
/// # Errors
///
/// Returns an error if the data directory is missing or the audit log cannot be parsed.
pub async fn run_calibration(config: &AppConfig, args: &CalibrationArgs) -> Result<CalibrationReport> {
    let store = open_existing_store(&resolve_data_dir(config, args.data_dir.as_deref()))?;
    let mut audits = store.read_audits().context("reading the audit log")?;
    if let Some(last) = args.last {
        audits = audits.split_off(audits.len().saturating_sub(last));
    }

    let report = replay(config, audits);
    info!(
        replayed = report.replayed,
        slippage_bps = report.status.slippage.current_bps,
        "Calibration replay finished"
    );

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(report)
}

/// Feeds `audits` in order, calibrating after each one as a live run would.
pub fn replay(config: &AppConfig, audits: Vec<tradegate_core::events::ShadowAudit>) -> CalibrationReport {
    let auditor = Arc::new(ShadowAuditor::new(config.auditor.clone()));
    let calibration = AdaptiveCalibrationLoop::new(
        Arc::clone(&auditor) as Arc<dyn DriftSource>,
        config.slippage_controller.clone(),
        config.priority_fee.clone(),
    );

    let replayed = audits.len();
    let mut actions = ActionCounts::default();
    for audit in audits {
        auditor.record(audit);
        match calibration.on_trade_executed() {
            CalibrationOutcome::Calibrated { action, .. } => match action {
                Some(CalibrationAction::Loosen | CalibrationAction::ForcedLoosen) => actions.loosen += 1,
                Some(CalibrationAction::Tighten | CalibrationAction::ForcedTighten) => actions.tighten += 1,
                Some(CalibrationAction::Hold) | None => actions.hold += 1,
            },
            CalibrationOutcome::Insufficient { .. } | CalibrationOutcome::Skipped { .. } => {
                actions.insufficient += 1;
            }
        }
    }

    CalibrationReport {
        replayed,
        actions,
        audits: auditor.get_stats(),
        status: calibration.status(),
    }
}

fn print_report(report: &CalibrationReport) {
    let slippage = &report.status.slippage;
    let fees = &report.status.priority_fee;

    println!();
    println!("{}", "=".repeat(72));
    println!("CALIBRATION REPLAY  ({} audits)", report.replayed);
    println!("{}", "=".repeat(72));
    println!(
        "Actions: {} loosen, {} tighten, {} hold, {} below window",
        report.actions.loosen, report.actions.tighten, report.actions.hold, report.actions.insufficient
    );
    println!();
    println!("Slippage tolerance:  {} bps", slippage.current_bps);
    println!("Priority tip:        {} lamports", fees.tip_lamports);
    println!("Congestion:          {:?}", fees.level);
    println!();
    println!(
        "Drift: avg {:+.3}%  min {}  max {}  lag {:.0} ms  significant {}",
        report.audits.avg_delta_pct,
        report
            .audits
            .min_delta_pct
            .map_or_else(|| "-".to_string(), |v| format!("{v:+.3}%")),
        report
            .audits
            .max_delta_pct
            .map_or_else(|| "-".to_string(), |v| format!("{v:+.3}%")),
        report.audits.avg_lag_ms,
        report.audits.significant
    );
}
