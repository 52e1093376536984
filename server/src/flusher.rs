use crate::{
    stats::{PendingWrite, Stats},
    storage::{Record, Storage},
};
use futures::future::join_all;
use std::time::Duration;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

/// Default delay between persistence passes.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Periodically persists dirty aggregates.
///
/// Mutations never wait on the flusher: they bump a version in memory and the
/// next pass writes a snapshot of whatever accumulated since the last write.
#[derive(Clone)]
pub struct Flusher<S: Storage> {
    stats: Stats,
    storage: S,
    interval: Duration,
}

impl<S: Storage> Flusher<S> {
    pub fn new(stats: Stats, storage: S, interval: Duration) -> Self {
        Self {
            stats,
            storage,
            interval,
        }
    }

    /// Spawn the flush loop. It runs until `shutdown` flips to `true` (or its
    /// sender is dropped), then performs one last pass.
    pub fn start(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // The first tick completes immediately
        ticker.tick().await;
        info!(interval = ?self.interval, "flusher started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let written = self.flush().await;
        info!(written, "flusher stopped");
    }

    /// Write every dirty aggregate that is not already being written.
    ///
    /// Returns the number of records successfully written.
    pub async fn flush(&self) -> usize {
        let writes: Vec<_> = Record::ALL
            .into_iter()
            .filter_map(|record| {
                self.stats
                    .begin_write(record)
                    .map(|pending| self.write(record, pending))
            })
            .collect();
        if writes.is_empty() {
            return 0;
        }
        join_all(writes)
            .await
            .into_iter()
            .filter(|written| *written)
            .count()
    }

    async fn write(&self, record: Record, pending: PendingWrite) -> bool {
        let PendingWrite { version, contents } = pending;
        let success = match contents.encode() {
            Ok(encoded) => match self.storage.store(record, encoded).await {
                Ok(()) => {
                    debug!(%record, version, "persisted record");
                    true
                }
                Err(e) => {
                    warn!(%record, error = %e, "failed to persist record, will retry");
                    false
                }
            },
            Err(e) => {
                warn!(%record, error = %e, "failed to encode record, will retry");
                false
            }
        };
        self.stats.finish_write(record, version, success);
        success
    }
}
