//! Order execution for the trading engines.
//!
//! - [`CapitalLedger`] is the authoritative cash/position/gas book shared by all engines.
//! - [`AdmissionGate`] runs pre-trade checks; [`ExecutionSimulator`] models paper fills.
//! - [`TradeExecutor`] ties admission, a backend, and the [`WatcherBook`] together.
//! - [`DualModeExecutor`] shadows live trading with paper and feeds calibration.

pub mod admission;
pub mod backend;
pub mod executor;
pub mod ledger;
pub mod notifier;
pub mod persistence;
pub mod runner;
pub mod sampler;
pub mod shadow;
pub mod simulator;
pub mod watcher;

pub use admission::{AdmissionGate, AdmittedBuy};
pub use backend::{slippage_pct, ExecutionBackend, ExecutionRequest, LiveBackend, PaperBackend};
pub use executor::{ExecutorStats, TradeExecutor};
pub use ledger::{
    BuyFill, BuyOrder, CapitalLedger, DrawdownCheck, LedgerError, LedgerStatus, MaintenanceReport, SellFill,
    SellOrder, SlippageModel,
};
pub use notifier::TracingNotifier;
pub use persistence::{JsonFilePersistence, MemoryPersistence, PersistenceError};
pub use runner::{spawn_engine, EngineCommand, EngineHandle};
pub use sampler::{FillSampler, RandomFillSampler, ScriptedFillSampler};
pub use shadow::{DualModeExecutor, DualResult, DualStats};
pub use simulator::{ExecutionSimulator, SIMULATED_FAILURE_REASON};
pub use watcher::{ActivePosition, ExitReason, ExitSignal, ReconcileReport, Watcher, WatcherBook, WatcherPhase};

/// Runs `task` on the current runtime without awaiting it. Outside a runtime
/// the task is dropped.
pub(crate) fn spawn_detached<F>(task: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(task);
        }
        Err(_) => tracing::debug!("No runtime available, background task skipped"),
    }
}
