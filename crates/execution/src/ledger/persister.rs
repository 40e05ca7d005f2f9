use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};
use tradegate_core::backoff::Backoff;
use tradegate_core::position::LedgerSnapshot;
use tradegate_core::traits::Persistence;

/// Background writer for ledger snapshots.
///
/// Only the newest snapshot matters, so a watch channel coalesces bursts of
/// mutations into a single save.
pub(crate) struct LedgerPersister {
    tx: watch::Sender<Option<LedgerSnapshot>>,
}

impl LedgerPersister {
    pub(crate) fn spawn(store: Arc<dyn Persistence>, backoff: Backoff) -> Option<Self> {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime, ledger persistence disabled");
            return None;
        };

        let (tx, mut rx) = watch::channel::<Option<LedgerSnapshot>>(None);

        handle.spawn(async move {
            while rx.changed().await.is_ok() {
                let Some(snapshot) = rx.borrow_and_update().clone() else {
                    continue;
                };

                match backoff.retry(|| store.save_ledger(&snapshot)).await {
                    Ok(()) => debug!(version = snapshot.version, "Ledger snapshot saved"),
                    Err(e) => warn!(version = snapshot.version, error = %e, "Ledger snapshot not saved"),
                }
            }
            debug!("Ledger persister stopped");
        });

        Some(Self { tx })
    }

    /// Queues `snapshot` unless a newer one is already pending.
    pub(crate) fn publish(&self, snapshot: LedgerSnapshot) {
        self.tx.send_if_modified(|current| {
            if current.as_ref().map_or(true, |c| c.version < snapshot.version) {
                *current = Some(snapshot);
                true
            } else {
                false
            }
        });
    }
}
