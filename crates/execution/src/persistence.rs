//! Durable storage for watcher state, ledger snapshots, and trade/audit logs.
//!
//! Layout under the data directory:
//!
//! ```text
//! positions/{engine}__{symbol}.json   one file per watcher in position
//! ledger.json                         latest ledger snapshot (temp + rename)
//! trades.jsonl                        append-only trade log
//! shadow_audits.csv                   append-only drift log
//! ```
//!
//! Missing files read as empty. Corrupt position files are skipped with a
//! warning so one bad record never blocks startup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use tradegate_core::events::{ShadowAudit, TradeAction, TradeResult};
use tradegate_core::position::{LedgerSnapshot, WatcherRecord};
use tradegate_core::traits::Persistence;

const POSITIONS_DIR: &str = "positions";
const LEDGER_FILE: &str = "ledger.json";
const TRADES_FILE: &str = "trades.jsonl";
const AUDITS_FILE: &str = "shadow_audits.csv";

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// One row of `shadow_audits.csv`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuditRow {
    timestamp: DateTime<Utc>,
    symbol: String,
    action: TradeAction,
    signal_price: Decimal,
    paper_fill: Decimal,
    live_fill: Decimal,
    delta_pct: f64,
    execution_lag_ms: i64,
    paper_slippage: f64,
    live_slippage: f64,
}

impl From<&ShadowAudit> for AuditRow {
    fn from(audit: &ShadowAudit) -> Self {
        Self {
            timestamp: audit.timestamp,
            symbol: audit.symbol.clone(),
            action: audit.action,
            signal_price: audit.signal_price,
            paper_fill: audit.paper_fill,
            live_fill: audit.live_fill,
            delta_pct: audit.delta_pct,
            execution_lag_ms: audit.lag_ms,
            paper_slippage: audit.paper_slippage,
            live_slippage: audit.live_slippage,
        }
    }
}

impl From<AuditRow> for ShadowAudit {
    fn from(row: AuditRow) -> Self {
        Self {
            symbol: row.symbol,
            action: row.action,
            signal_price: row.signal_price,
            paper_fill: row.paper_fill,
            live_fill: row.live_fill,
            delta_pct: row.delta_pct,
            lag_ms: row.execution_lag_ms,
            paper_slippage: row.paper_slippage,
            live_slippage: row.live_slippage,
            timestamp: row.timestamp,
        }
    }
}

// =============================================================================
// JSON files
// =============================================================================

#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    root: PathBuf,
    // One appender at a time so the CSV header is written once.
    audit_lock: Arc<Mutex<()>>,
}

impl JsonFilePersistence {
    /// Opens (and creates) the data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory tree cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let root = root.into();
        fs::create_dir_all(root.join(POSITIONS_DIR))?;
        info!(path = %root.display(), "Persistence directory ready");
        Ok(Self {
            root,
            audit_lock: Arc::new(Mutex::new(())),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every trade in the log, oldest first. Unparseable lines are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the log exists but cannot be read.
    pub fn read_trades(&self) -> Result<Vec<TradeResult>, PersistenceError> {
        let path = self.root.join(TRADES_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&path)?);
        let mut trades = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(trade) => trades.push(trade),
                Err(e) => warn!(line = line_no + 1, error = %e, "Skipping unreadable trade log line"),
            }
        }
        Ok(trades)
    }

    /// Every audit in the drift log, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the log exists but cannot be parsed.
    pub fn read_audits(&self) -> Result<Vec<ShadowAudit>, PersistenceError> {
        let path = self.root.join(AUDITS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(&path)?;
        reader
            .deserialize::<AuditRow>()
            .map(|row| row.map(ShadowAudit::from).map_err(PersistenceError::from))
            .collect()
    }

    fn position_path(&self, engine: &str, symbol: &str) -> PathBuf {
        self.root
            .join(POSITIONS_DIR)
            .join(format!("{}__{}.json", sanitize(engine), sanitize(symbol)))
    }

    fn write_position(&self, record: &WatcherRecord) -> Result<(), PersistenceError> {
        let path = self.position_path(&record.engine, &record.symbol);
        write_atomic(&path, record)?;
        debug!(path = %path.display(), "Saved watcher state");
        Ok(())
    }

    fn read_position(&self, engine: &str, symbol: &str) -> Result<Option<WatcherRecord>, PersistenceError> {
        let path = self.position_path(engine, symbol);
        if !path.exists() {
            return Ok(None);
        }
        let record = serde_json::from_reader(BufReader::new(File::open(&path)?))?;
        Ok(Some(record))
    }

    fn remove_position(&self, engine: &str, symbol: &str) -> Result<(), PersistenceError> {
        let path = self.position_path(engine, symbol);
        if path.exists() {
            fs::remove_file(&path)?;
            debug!(path = %path.display(), "Cleared watcher state");
        }
        Ok(())
    }

    fn read_all_positions(&self) -> Result<Vec<WatcherRecord>, PersistenceError> {
        let dir = self.root.join(POSITIONS_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = File::open(&path)
                .map_err(PersistenceError::from)
                .and_then(|f| serde_json::from_reader::<_, WatcherRecord>(BufReader::new(f)).map_err(Into::into));
            match parsed {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping corrupt watcher state"),
            }
        }
        records.sort_by(|a, b| (&a.engine, &a.symbol).cmp(&(&b.engine, &b.symbol)));
        Ok(records)
    }

    fn write_ledger(&self, snapshot: &LedgerSnapshot) -> Result<(), PersistenceError> {
        let path = self.root.join(LEDGER_FILE);
        write_atomic(&path, snapshot)?;
        debug!(path = %path.display(), version = snapshot.version, "Saved ledger snapshot");
        Ok(())
    }

    fn read_ledger(&self) -> Result<Option<LedgerSnapshot>, PersistenceError> {
        let path = self.root.join(LEDGER_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let snapshot = serde_json::from_reader(BufReader::new(File::open(&path)?))?;
        Ok(Some(snapshot))
    }

    fn write_trade(&self, result: &TradeResult) -> Result<(), PersistenceError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(TRADES_FILE))?;
        let mut line = serde_json::to_string(result)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    fn write_audit(&self, audit: &ShadowAudit) -> Result<(), PersistenceError> {
        let _guard = self.audit_lock.lock();
        let path = self.root.join(AUDITS_FILE);
        let is_new = !path.exists() || fs::metadata(&path)?.len() == 0;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(is_new).from_writer(file);
        writer.serialize(AuditRow::from(audit))?;
        writer.flush()?;
        Ok(())
    }

    async fn blocking<T, F>(&self, op: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Self) -> Result<T, PersistenceError> + Send + 'static,
    {
        let this = self.clone();
        let result = tokio::task::spawn_blocking(move || op(this)).await?;
        Ok(result?)
    }
}

#[async_trait]
impl Persistence for JsonFilePersistence {
    async fn save_position(&self, record: &WatcherRecord) -> anyhow::Result<()> {
        let record = record.clone();
        self.blocking(move |p| p.write_position(&record)).await
    }

    async fn load_position(&self, engine: &str, symbol: &str) -> anyhow::Result<Option<WatcherRecord>> {
        let (engine, symbol) = (engine.to_string(), symbol.to_string());
        self.blocking(move |p| p.read_position(&engine, &symbol)).await
    }

    async fn delete_position(&self, engine: &str, symbol: &str) -> anyhow::Result<()> {
        let (engine, symbol) = (engine.to_string(), symbol.to_string());
        self.blocking(move |p| p.remove_position(&engine, &symbol)).await
    }

    async fn load_all_positions(&self) -> anyhow::Result<Vec<WatcherRecord>> {
        self.blocking(|p| p.read_all_positions()).await
    }

    async fn save_ledger(&self, snapshot: &LedgerSnapshot) -> anyhow::Result<()> {
        let snapshot = snapshot.clone();
        self.blocking(move |p| p.write_ledger(&snapshot)).await
    }

    async fn load_ledger(&self) -> anyhow::Result<Option<LedgerSnapshot>> {
        self.blocking(|p| p.read_ledger()).await
    }

    async fn append_trade(&self, result: &TradeResult) -> anyhow::Result<()> {
        let result = result.clone();
        self.blocking(move |p| p.write_trade(&result)).await
    }

    async fn append_audit(&self, audit: &ShadowAudit) -> anyhow::Result<()> {
        let audit = audit.clone();
        self.blocking(move |p| p.write_audit(&audit)).await
    }
}

/// File-name safe and reversible: `_` escapes every byte outside `[A-Za-z0-9-]`
/// as two hex digits, so distinct keys never share a file.
fn sanitize(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    for byte in part.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            out.push(char::from(byte));
        } else {
            out.push('_');
            out.push_str(&hex::encode([byte]));
        }
    }
    out
}

/// Writes JSON to a sibling temp file and renames it over `path`.
fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    // Concurrent writers to the same file each get their own temp file.
    let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.flush()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    positions: HashMap<(String, String), WatcherRecord>,
    ledger: Option<LedgerSnapshot>,
    trades: Vec<TradeResult>,
    audits: Vec<ShadowAudit>,
}

/// Process-local storage. `set_failing(true)` makes every call fail.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    state: Mutex<MemoryState>,
    failing: AtomicBool,
}

impl MemoryPersistence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    #[must_use]
    pub fn trades(&self) -> Vec<TradeResult> {
        self.state.lock().trades.clone()
    }

    #[must_use]
    pub fn audits(&self) -> Vec<ShadowAudit> {
        self.state.lock().audits.clone()
    }

    #[must_use]
    pub fn ledger(&self) -> Option<LedgerSnapshot> {
        self.state.lock().ledger.clone()
    }

    #[must_use]
    pub fn position_count(&self) -> usize {
        self.state.lock().positions.len()
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("persistence unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn save_position(&self, record: &WatcherRecord) -> anyhow::Result<()> {
        self.check()?;
        self.state
            .lock()
            .positions
            .insert((record.engine.clone(), record.symbol.clone()), record.clone());
        Ok(())
    }

    async fn load_position(&self, engine: &str, symbol: &str) -> anyhow::Result<Option<WatcherRecord>> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .positions
            .get(&(engine.to_string(), symbol.to_string()))
            .cloned())
    }

    async fn delete_position(&self, engine: &str, symbol: &str) -> anyhow::Result<()> {
        self.check()?;
        self.state
            .lock()
            .positions
            .remove(&(engine.to_string(), symbol.to_string()));
        Ok(())
    }

    async fn load_all_positions(&self) -> anyhow::Result<Vec<WatcherRecord>> {
        self.check()?;
        let mut records: Vec<WatcherRecord> = self.state.lock().positions.values().cloned().collect();
        records.sort_by(|a, b| (&a.engine, &a.symbol).cmp(&(&b.engine, &b.symbol)));
        Ok(records)
    }

    async fn save_ledger(&self, snapshot: &LedgerSnapshot) -> anyhow::Result<()> {
        self.check()?;
        self.state.lock().ledger = Some(snapshot.clone());
        Ok(())
    }

    async fn load_ledger(&self) -> anyhow::Result<Option<LedgerSnapshot>> {
        self.check()?;
        Ok(self.state.lock().ledger.clone())
    }

    async fn append_trade(&self, result: &TradeResult) -> anyhow::Result<()> {
        self.check()?;
        self.state.lock().trades.push(result.clone());
        Ok(())
    }

    async fn append_audit(&self, audit: &ShadowAudit) -> anyhow::Result<()> {
        self.check()?;
        self.state.lock().audits.push(audit.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;
    use tradegate_core::events::ExecutionMode;
    use tradegate_core::position::EngineAccount;

    fn store() -> (TempDir, JsonFilePersistence) {
        let dir = TempDir::new().unwrap();
        let store = JsonFilePersistence::open(dir.path()).unwrap();
        (dir, store)
    }

    fn record(engine: &str, symbol: &str) -> WatcherRecord {
        WatcherRecord {
            engine: engine.to_string(),
            symbol: symbol.to_string(),
            mint: "So11".to_string(),
            in_position: true,
            entry_price: dec!(150.04),
            cost_basis: dec!(100),
            entry_time: Some(Utc::now()),
            max_price_achieved: dec!(152),
            trailing_stop_price: Some(dec!(149.72)),
            last_signal_time: None,
            hibernate_until: None,
            orphan_recovered: false,
            recent_trades: Vec::new(),
        }
    }

    fn audit(delta_pct: f64) -> ShadowAudit {
        ShadowAudit {
            symbol: "SOL".to_string(),
            action: TradeAction::Buy,
            signal_price: dec!(150),
            paper_fill: dec!(150.04),
            live_fill: dec!(151.5),
            delta_pct,
            lag_ms: 420,
            paper_slippage: 0.03,
            live_slippage: 1.0,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_position_save_load_delete() {
        let (_dir, store) = store();
        let rec = record("PRIMARY", "SOL");

        store.save_position(&rec).await.unwrap();
        assert_eq!(store.load_position("PRIMARY", "SOL").await.unwrap(), Some(rec));

        store.delete_position("PRIMARY", "SOL").await.unwrap();
        assert_eq!(store.load_position("PRIMARY", "SOL").await.unwrap(), None);
        // Deleting again is a no-op.
        store.delete_position("PRIMARY", "SOL").await.unwrap();
    }

    #[tokio::test]
    async fn test_load_all_skips_corrupt_files() {
        let (dir, store) = store();
        store.save_position(&record("PRIMARY", "SOL")).await.unwrap();
        store.save_position(&record("SCALPER", "BONK")).await.unwrap();
        fs::write(dir.path().join(POSITIONS_DIR).join("broken__X.json"), "{ not json").unwrap();

        let all = store.load_all_positions().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].engine, "PRIMARY");
        assert_eq!(all[1].symbol, "BONK");
    }

    #[test]
    fn test_file_names_are_sanitized() {
        let (dir, store) = store();
        let path = store.position_path("ENG/1", "WIF:USD");
        assert_eq!(path, dir.path().join(POSITIONS_DIR).join("ENG_2f1__WIF_3aUSD.json"));
    }

    #[tokio::test]
    async fn test_lookalike_keys_keep_separate_files() {
        let (_dir, store) = store();
        assert_ne!(store.position_path("PRIMARY", "A/B"), store.position_path("PRIMARY", "A_B"));
        assert_ne!(store.position_path("A_", "_B"), store.position_path("A", "__B"));

        store.save_position(&record("PRIMARY", "A/B")).await.unwrap();
        store.save_position(&record("PRIMARY", "A_B")).await.unwrap();

        let all = store.load_all_positions().await.unwrap();
        let symbols: Vec<&str> = all.iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(symbols.len(), 2);
        assert!(symbols.contains(&"A/B"));
        assert!(symbols.contains(&"A_B"));
    }

    #[tokio::test]
    async fn test_ledger_snapshot_round_trip_leaves_no_temp_file() {
        let (dir, store) = store();
        assert!(store.load_ledger().await.unwrap().is_none());

        let snapshot = LedgerSnapshot {
            engines: vec![EngineAccount::new("PRIMARY", dec!(1000), dec!(0.5), Utc::now())],
            saved_at: Utc::now(),
            version: 7,
        };
        store.save_ledger(&snapshot).await.unwrap();

        let loaded = store.load_ledger().await.unwrap().unwrap();
        assert_eq!(loaded.version, 7);
        assert_eq!(loaded.engines, snapshot.engines);
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_trade_log_appends_lines() {
        let (_dir, store) = store();
        let fill = TradeResult::filled("PRIMARY", "SOL", TradeAction::Buy, ExecutionMode::Paper, dec!(150), dec!(1));
        store.append_trade(&fill).await.unwrap();
        store.append_trade(&fill.clone().with_pnl(dec!(2))).await.unwrap();

        let trades = store.read_trades().unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[1].pnl_usd, Some(dec!(2)));
    }

    #[tokio::test]
    async fn test_audit_csv_has_single_header() {
        let (dir, store) = store();
        store.append_audit(&audit(0.97)).await.unwrap();
        store.append_audit(&audit(-2.5)).await.unwrap();

        let text = fs::read_to_string(dir.path().join(AUDITS_FILE)).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "timestamp,symbol,action,signal_price,paper_fill,live_fill,delta_pct,execution_lag_ms,paper_slippage,live_slippage"
        );
        assert_eq!(lines.count(), 2);

        let audits = store.read_audits().unwrap();
        assert_eq!(audits.len(), 2);
        assert!((audits[1].delta_pct + 2.5).abs() < f64::EPSILON);
        assert_eq!(audits[0].lag_ms, 420);
        assert_eq!(audits[0].live_fill, dec!(151.5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_audits_write_one_header() {
        let (dir, store) = store();
        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.append_audit(&audit(f64::from(i))).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let text = fs::read_to_string(dir.path().join(AUDITS_FILE)).unwrap();
        assert_eq!(text.lines().filter(|l| l.starts_with("timestamp,")).count(), 1);
        assert_eq!(store.read_audits().unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_memory_failing_toggle() {
        let store = MemoryPersistence::new();
        store.append_trade(&TradeResult::filled(
            "PRIMARY",
            "SOL",
            TradeAction::Buy,
            ExecutionMode::Paper,
            dec!(1),
            dec!(1),
        ))
        .await
        .unwrap();

        store.set_failing(true);
        assert!(store.save_position(&record("PRIMARY", "SOL")).await.is_err());
        assert!(store.load_all_positions().await.is_err());

        store.set_failing(false);
        assert_eq!(store.trades().len(), 1);
        assert_eq!(store.position_count(), 0);
    }
}
