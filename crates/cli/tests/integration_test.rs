use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::Path;
use std::time::Duration;
use tradegate_cli::commands::{
    run_calibration, run_simulate, run_status, CalibrationArgs, SimulateArgs, StatusArgs,
};
use tradegate_core::config::{AppConfig, SimulatorConfig, WatcherConfig};
use tradegate_core::events::{ShadowAudit, TradeAction};
use tradegate_core::traits::Persistence;
use tradegate_execution::JsonFilePersistence;

fn fast_config(data_dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.simulator = SimulatorConfig::deterministic();
    config.watcher = WatcherConfig::default()
        .with_cooldown_secs(0)
        .with_max_trades_per_hour(10_000);
    config.persistence.data_dir = data_dir.to_path_buf();
    config.engines.names = vec!["PRIMARY".to_string(), "SCALPER".to_string()];
    config
}

fn quiet_args(ticks: usize) -> SimulateArgs {
    SimulateArgs {
        ticks,
        seed: 7,
        volatility: 0.02,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_simulate_then_status() {
    let dir = tempfile::tempdir().unwrap();
    let config = fast_config(dir.path());

    let summary = run_simulate(&config, &quiet_args(150)).await.unwrap();
    assert!(!summary.restored);
    assert_eq!(summary.engines.len(), 2);
    assert!(summary.engines.iter().any(|e| e.executed > 0));
    for engine in &summary.engines {
        assert!(engine.cash_usd >= Decimal::ZERO);
    }

    // Trade log appends run in the background.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let report = run_status(
        &config,
        &StatusArgs {
            trades: 5,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert!(report.snapshot_version.is_some());
    let engines: Vec<&str> = report.engines.iter().map(|e| e.engine.as_str()).collect();
    assert_eq!(engines, vec!["PRIMARY", "SCALPER"]);
    assert!(report.trade_count > 0);
    assert!(report.recent_trades.len() <= 5);

    for (reported, simulated) in report.engines.iter().zip(&summary.engines) {
        assert_eq!(reported.cash_usd, simulated.cash_usd);
        assert_eq!(reported.open_positions, simulated.open_positions);
    }
}

#[tokio::test]
async fn test_second_run_resumes_from_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let config = fast_config(dir.path());

    let first = run_simulate(&config, &quiet_args(60)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let second = run_simulate(&config, &quiet_args(0)).await.unwrap();

    assert!(second.restored);
    for (a, b) in first.engines.iter().zip(&second.engines) {
        assert_eq!(a.cash_usd, b.cash_usd);
        assert_eq!(a.open_positions, b.open_positions);
    }
}

#[tokio::test]
async fn test_unavailable_backend_aborts_startup() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, "occupied").unwrap();

    let config = fast_config(&blocker);
    let err = run_simulate(&config, &quiet_args(10)).await.unwrap_err();
    assert!(err.to_string().contains("persistence backend unavailable"));
}

#[tokio::test]
async fn test_simulate_without_persistence_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    let config = fast_config(&data_dir);

    let args = SimulateArgs {
        no_persist: true,
        ..quiet_args(30)
    };
    run_simulate(&config, &args).await.unwrap();

    assert!(!data_dir.exists());
    assert!(run_status(&config, &StatusArgs::default()).await.is_err());
}

#[tokio::test]
async fn test_calibration_replays_audit_log() {
    let dir = tempfile::tempdir().unwrap();
    let config = fast_config(dir.path());
    let store = JsonFilePersistence::open(dir.path()).unwrap();

    for _ in 0..8 {
        store
            .append_audit(&ShadowAudit {
                symbol: "SOL".to_string(),
                action: TradeAction::Buy,
                signal_price: dec!(100),
                paper_fill: dec!(100),
                live_fill: dec!(103),
                delta_pct: 3.0,
                lag_ms: 150,
                paper_slippage: 0.0,
                live_slippage: 3.0,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
    }

    let report = run_calibration(&config, &CalibrationArgs::default()).await.unwrap();
    assert_eq!(report.replayed, 8);
    assert_eq!(report.actions.loosen, 4);
    assert_eq!(report.status.slippage.current_bps, 500);

    let recent = run_calibration(
        &config,
        &CalibrationArgs {
            last: Some(3),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(recent.replayed, 3);
    assert_eq!(recent.status.slippage.current_bps, config.slippage_controller.initial_bps);
}
