//! Sync engine pushing queued operations to a remote note service.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use notevault_common::{OperationId, Result};
use notevault_storage::SyncQueue;

use crate::remote::RemoteNoteApi;
use crate::retry::{RetryConfig, RetryExecutor};

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Operations pushed per request.
    pub batch_size: usize,
    /// Backoff for batches that fail with transient errors.
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            retry: RetryConfig::default(),
        }
    }
}

/// Outcome of one sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Operations sent to the remote.
    pub pushed: usize,
    /// Operations acknowledged and removed from the queue.
    pub acknowledged: usize,
    /// Operations still queued after the run.
    pub remaining: usize,
    pub duration: Duration,
}

/// Drains the sync queue into a remote.
///
/// Runs are serialized. A batch is only acknowledged after the remote
/// accepted it, so a failure leaves the queue as it was and the next run
/// resends the same operations in the same order.
pub struct SyncEngine {
    queue: SyncQueue,
    config: SyncConfig,
    retry: RetryExecutor,
    running: Mutex<()>,
}

impl SyncEngine {
    pub fn new(queue: SyncQueue, config: SyncConfig) -> Self {
        let retry = RetryExecutor::new(config.retry.clone());
        Self {
            queue,
            config,
            retry,
            running: Mutex::new(()),
        }
    }

    /// Push every pending operation to `remote`.
    ///
    /// # Errors
    /// - The push error once retries are exhausted. Batches acknowledged
    ///   before the failure stay acknowledged; nothing else is removed.
    pub async fn sync(&self, remote: &dyn RemoteNoteApi) -> Result<SyncReport> {
        let _running = self.running.lock().await;
        let start = Instant::now();

        let pending = self.queue.drain()?;
        if pending.is_empty() {
            debug!(remote = remote.name(), "Nothing to sync");
            return Ok(SyncReport {
                duration: start.elapsed(),
                ..SyncReport::default()
            });
        }

        info!(remote = remote.name(), pending = pending.len(), "Starting sync");

        let mut report = SyncReport::default();
        for batch in pending.chunks(self.config.batch_size.max(1)) {
            let accepted = self
                .retry
                .execute(|attempt| {
                    debug!(attempt, size = batch.len(), "Pushing batch");
                    remote.push(batch)
                })
                .await;

            let accepted: HashSet<OperationId> = match accepted {
                Ok(ids) => ids.into_iter().collect(),
                Err(e) => {
                    warn!(remote = remote.name(), error = %e, "Sync failed");
                    return Err(e);
                }
            };
            report.pushed += batch.len();

            for op in batch.iter().filter(|op| accepted.contains(&op.id)) {
                if self.queue.acknowledge(&op.id)? {
                    report.acknowledged += 1;
                }
            }

            if batch.iter().any(|op| !accepted.contains(&op.id)) {
                // Later operations may depend on the rejected ones.
                warn!(remote = remote.name(), "Remote accepted a partial batch");
                break;
            }
        }

        report.remaining = self.queue.len()?;
        report.duration = start.elapsed();
        info!(
            pushed = report.pushed,
            acknowledged = report.acknowledged,
            remaining = report.remaining,
            "Sync complete"
        );
        Ok(report)
    }
}
