//! CLI commands for the tradegate execution core.

pub mod calibration;
pub mod simulate;
pub mod status;

pub use calibration::{run_calibration, CalibrationArgs, CalibrationReport};
pub use simulate::{run_simulate, SimulateArgs, SimulationSummary};
pub use status::{run_status, StatusArgs, StatusReport};

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tradegate_core::config::AppConfig;
use tradegate_execution::JsonFilePersistence;

fn resolve_data_dir(config: &AppConfig, overridden: Option<&Path>) -> PathBuf {
    overridden.map_or_else(|| config.persistence.data_dir.clone(), Path::to_path_buf)
}

/// Opens (creating if needed) the file store a run writes to.
fn open_store(data_dir: &Path) -> Result<Arc<JsonFilePersistence>> {
    JsonFilePersistence::open(data_dir)
        .map(Arc::new)
        .with_context(|| format!("persistence backend unavailable at {}", data_dir.display()))
}

/// Opens a store that a previous run must already have created.
fn open_existing_store(data_dir: &Path) -> Result<JsonFilePersistence> {
    if !data_dir.is_dir() {
        bail!("no data directory at {}", data_dir.display());
    }
    JsonFilePersistence::open(data_dir).with_context(|| format!("opening data directory {}", data_dir.display()))
}
