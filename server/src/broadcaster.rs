use crate::{registry::Payload, stats::Stats};
use std::time::Duration;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

/// Default delay between fan-out passes.
pub const BROADCAST_INTERVAL: Duration = Duration::from_millis(200);

/// Periodically pushes changed aggregates to every live subscriber.
#[derive(Clone)]
pub struct Broadcaster {
    stats: Stats,
    interval: Duration,
}

impl Broadcaster {
    pub fn new(stats: Stats, interval: Duration) -> Self {
        Self { stats, interval }
    }

    pub fn start(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval = ?self.interval, "broadcaster started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.broadcast();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("broadcaster stopped");
    }

    /// Run one fan-out pass.
    ///
    /// Returns the number of subscribers that received anything. A subscriber
    /// only gets changes made after it joined, since its snapshot covers the
    /// rest. Subscribers whose channel is gone are closed and deregistered
    /// without affecting the rest.
    pub fn broadcast(&self) -> usize {
        let Some(pass) = self.stats.take_broadcast() else {
            return 0;
        };

        let payloads: Vec<(u64, Payload)> = pass
            .updates
            .iter()
            .filter_map(|pending| match serde_json::to_string(&pending.update) {
                Ok(encoded) => Some((pending.changed_at, Payload::from(encoded))),
                Err(e) => {
                    warn!(error = %e, "failed to encode update");
                    None
                }
            })
            .collect();

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, listener) in pass.subscribers {
            let mut due = payloads
                .iter()
                .filter(|(changed_at, _)| *changed_at > listener.joined_at)
                .peekable();
            if due.peek().is_none() {
                continue;
            }
            let sent =
                due.all(|(_, payload)| listener.sender.unbounded_send(payload.clone()).is_ok());
            if sent {
                delivered += 1;
            } else {
                listener.sender.close_channel();
                dead.push(id);
            }
        }
        if !dead.is_empty() {
            warn!(subscribers = ?dead, "dropping disconnected subscribers");
            self.stats.remove_subscribers(&dead);
        }

        debug!(updates = payloads.len(), delivered, "broadcast pass");
        delivered
    }
}
