//! One tokio task per engine.
//!
//! [`spawn_engine`] moves a [`TradeExecutor`] into its own task that drains an
//! mpsc command queue. [`EngineHandle`] is the cheap, clonable front end.

use crate::executor::{ExecutorStats, TradeExecutor};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use tradegate_core::events::{Signal, TradeResult};

#[derive(Debug)]
pub enum EngineCommand {
    /// Executes a signal, replying with the result when a sender is attached.
    Signal(Signal, Option<oneshot::Sender<TradeResult>>),
    Tick {
        symbol: String,
        price: Decimal,
        at: DateTime<Utc>,
    },
    Stats(oneshot::Sender<ExecutorStats>),
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct EngineHandle {
    engine: String,
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    #[must_use]
    pub fn engine(&self) -> &str {
        &self.engine
    }

    /// Executes `signal` and waits for its result.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine task has stopped.
    pub async fn submit(&self, signal: Signal) -> Result<TradeResult> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Signal(signal, Some(tx)))
            .await
            .context("engine task stopped")?;
        rx.await.context("engine dropped the reply")
    }

    /// Queues `signal` without waiting. The result goes to the results channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine task has stopped.
    pub async fn send(&self, signal: Signal) -> Result<()> {
        self.tx
            .send(EngineCommand::Signal(signal, None))
            .await
            .context("engine task stopped")
    }

    /// # Errors
    ///
    /// Returns an error if the engine task has stopped.
    pub async fn tick(&self, symbol: impl Into<String>, price: Decimal, at: DateTime<Utc>) -> Result<()> {
        self.tx
            .send(EngineCommand::Tick {
                symbol: symbol.into(),
                price,
                at,
            })
            .await
            .context("engine task stopped")
    }

    /// # Errors
    ///
    /// Returns an error if the engine task has stopped.
    pub async fn stats(&self) -> Result<ExecutorStats> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Stats(tx))
            .await
            .context("engine task stopped")?;
        rx.await.context("engine dropped the reply")
    }

    /// # Errors
    ///
    /// Returns an error if the engine task has already stopped.
    pub async fn shutdown(&self) -> Result<()> {
        self.tx
            .send(EngineCommand::Shutdown)
            .await
            .context("engine task stopped")
    }
}

/// Spawns the engine task. Every result, including tick-driven exits, is also
/// forwarded to `results` when given. The task returns its final stats.
pub fn spawn_engine(
    executor: Arc<TradeExecutor>,
    capacity: usize,
    results: Option<mpsc::UnboundedSender<TradeResult>>,
) -> (EngineHandle, JoinHandle<ExecutorStats>) {
    let (tx, mut rx) = mpsc::channel(capacity.max(1));
    let handle = EngineHandle {
        engine: executor.engine().to_string(),
        tx,
    };

    let task = tokio::spawn(async move {
        info!(engine = %executor.engine(), mode = %executor.mode(), "Engine started");
        let forward = |result: &TradeResult| {
            if let Some(results) = &results {
                let _ = results.send(result.clone());
            }
        };

        while let Some(command) = rx.recv().await {
            match command {
                EngineCommand::Signal(signal, reply) => {
                    let result = executor.execute(&signal).await;
                    forward(&result);
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
                EngineCommand::Tick { symbol, price, at } => {
                    if let Some(result) = executor.on_price_tick(&symbol, price, at).await {
                        forward(&result);
                    }
                }
                EngineCommand::Stats(reply) => {
                    let _ = reply.send(executor.stats());
                }
                EngineCommand::Shutdown => {
                    debug!(engine = %executor.engine(), "Shutdown requested");
                    break;
                }
            }
        }

        let stats = executor.stats();
        info!(
            engine = %executor.engine(),
            executed = stats.executed,
            rejected = stats.rejected,
            failed = stats.failed,
            "Engine stopped"
        );
        stats
    });

    (handle, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionGate;
    use crate::backend::PaperBackend;
    use crate::ledger::CapitalLedger;
    use crate::simulator::ExecutionSimulator;
    use rust_decimal_macros::dec;
    use tradegate_core::config::{AdmissionConfig, LedgerConfig, SimulatorConfig, SlippageModelConfig};
    use tradegate_core::events::ExecutionMode;

    fn executor(engine: &str, ledger: &Arc<CapitalLedger>) -> Arc<TradeExecutor> {
        let simulator = ExecutionSimulator::new(SimulatorConfig::deterministic(), Arc::clone(ledger));
        let gate = AdmissionGate::new(AdmissionConfig::default(), ExecutionMode::Paper, Arc::clone(ledger));
        Arc::new(TradeExecutor::new(
            engine,
            Arc::clone(ledger),
            Arc::new(PaperBackend::new(simulator)),
            gate,
        ))
    }

    #[tokio::test]
    async fn test_engines_run_independently_on_shared_ledger() {
        let ledger = Arc::new(CapitalLedger::new(
            LedgerConfig::default(),
            SlippageModelConfig::frictionless(),
        ));
        let (results_tx, mut results_rx) = mpsc::unbounded_channel();
        let (primary, primary_task) = spawn_engine(executor("PRIMARY", &ledger), 16, Some(results_tx.clone()));
        let (scalper, scalper_task) = spawn_engine(executor("SCALPER", &ledger), 16, Some(results_tx));

        let signal = Signal::buy("SOL", dec!(100)).with_size(dec!(50)).with_confidence(0.9);
        let (a, b) = tokio::join!(primary.submit(signal.clone()), scalper.submit(signal));
        assert!(a.unwrap().success);
        assert!(b.unwrap().success);

        scalper.tick("SOL", dec!(90), Utc::now()).await.unwrap();
        assert_eq!(scalper.stats().await.unwrap().executed, 2);

        primary.shutdown().await.unwrap();
        scalper.shutdown().await.unwrap();
        assert_eq!(primary_task.await.unwrap().executed, 1);
        assert_eq!(scalper_task.await.unwrap().executed, 2);

        let mut forwarded = 0;
        while results_rx.try_recv().is_ok() {
            forwarded += 1;
        }
        assert_eq!(forwarded, 3);
        assert!(ledger.get_position("PRIMARY", "SOL").is_some());
        assert!(ledger.get_position("SCALPER", "SOL").is_none());
    }

    #[tokio::test]
    async fn test_handle_errors_after_shutdown() {
        let ledger = Arc::new(CapitalLedger::new(LedgerConfig::default(), SlippageModelConfig::default()));
        let (handle, task) = spawn_engine(executor("PRIMARY", &ledger), 1, None);
        handle.shutdown().await.unwrap();
        task.await.unwrap();

        assert!(handle.submit(Signal::buy("SOL", dec!(1))).await.is_err());
    }
}
