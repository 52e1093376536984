use crate::{
    catalog::Catalog,
    drops::RecentDrops,
    registry::{Listener, Payload, Registry, Subscription},
    storage::{Contents, Record, Storage},
    tracker::Tracker,
};
use chest_stats_types::{
    api::Update, stats::validate_items, ChestId, Counters, CountersSnapshot, DropRecord,
    RewardItem, ValidationError, RECENT_DROPS_CAPACITY,
};
use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, error, info};

/// Failure to rebuild [Stats] from storage at start-up.
#[derive(Debug, Error)]
pub enum RestoreError<E: std::error::Error + 'static> {
    #[error("failed to load {record}: {source}")]
    Load {
        record: Record,
        #[source]
        source: E,
    },
    #[error("{record} record is corrupt: {source}")]
    Corrupt {
        record: Record,
        #[source]
        source: serde_json::Error,
    },
}

/// A write the flusher should perform.
#[derive(Debug)]
pub(crate) struct PendingWrite {
    pub version: u64,
    pub contents: Contents,
}

/// An update and the change sequence it reflects.
#[derive(Debug, PartialEq)]
pub(crate) struct PendingUpdate {
    pub changed_at: u64,
    pub update: Update,
}

/// Everything the fan-out needs for one pass, captured under the lock.
///
/// A subscriber only receives updates whose `changed_at` is past its
/// `joined_at`; older changes are already in its snapshot.
pub(crate) struct BroadcastPass {
    pub updates: Vec<PendingUpdate>,
    pub subscribers: Vec<(u64, Listener)>,
}

#[derive(Debug)]
struct State {
    /// Bumped by every accepted mutation.
    sequence: u64,

    counters: Counters,
    counters_tracker: Tracker,
    counters_pending: Option<u64>,

    drops: RecentDrops,
    drops_tracker: Tracker,
    drops_pending: Option<u64>,

    catalog: Catalog,
    catalog_tracker: Tracker,
    announced: Vec<ChestId>,
    announced_at: u64,

    registry: Registry,
}

impl State {
    fn new(counters: Counters, drops: RecentDrops, catalog: Catalog) -> Self {
        Self {
            sequence: 0,
            counters,
            counters_tracker: Tracker::default(),
            counters_pending: None,
            drops,
            drops_tracker: Tracker::default(),
            drops_pending: None,
            catalog,
            catalog_tracker: Tracker::default(),
            announced: Vec::new(),
            announced_at: 0,
            registry: Registry::default(),
        }
    }

    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn tracker(&mut self, record: Record) -> &mut Tracker {
        match record {
            Record::Counters => &mut self.counters_tracker,
            Record::Drops => &mut self.drops_tracker,
            Record::Chests => &mut self.catalog_tracker,
        }
    }

    fn contents(&self, record: Record) -> Contents {
        match record {
            Record::Counters => Contents::Counters(self.counters.clone()),
            Record::Drops => Contents::Drops(self.drops.snapshot()),
            Record::Chests => Contents::Chests(self.catalog.ids().to_vec()),
        }
    }
}

/// Shared chest statistics: global open counters, the recent drops feed, the
/// announced chest catalog and the live subscriber registry.
///
/// All state sits behind a single mutex that is never held across I/O. Callers
/// only mutate memory; [crate::Flusher] and [crate::Broadcaster] pick up the
/// changes on their own schedules.
#[derive(Clone, Debug)]
pub struct Stats {
    state: Arc<Mutex<State>>,
}

impl Default for Stats {
    fn default() -> Self {
        Self::restore(Counters::default(), Vec::new(), Vec::new())
    }
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from previously persisted aggregates. Restored state starts clean.
    pub fn restore(counters: Counters, drops: Vec<DropRecord>, chests: Vec<ChestId>) -> Self {
        let state = State::new(
            counters,
            RecentDrops::restore(drops, RECENT_DROPS_CAPACITY),
            Catalog::restore(chests),
        );
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Load every record from `storage`; missing records start empty.
    pub async fn load<S: Storage>(storage: &S) -> Result<Self, RestoreError<S::Error>> {
        let counters: Counters = load_record(storage, Record::Counters)
            .await?
            .unwrap_or_default();
        let drops: Vec<DropRecord> = load_record(storage, Record::Drops)
            .await?
            .unwrap_or_default();
        let chests: Vec<ChestId> = load_record(storage, Record::Chests)
            .await?
            .unwrap_or_default();
        info!(
            total_opened = counters.total_opened,
            chests_counted = counters.per_chest_counts.len(),
            drops = drops.len(),
            announced = chests.len(),
            "restored stats"
        );
        Ok(Self::restore(counters, drops, chests))
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // Every critical section leaves the state consistent, so a panic while
        // holding the lock does not invalidate it
        self.state.lock().unwrap_or_else(|poisoned| {
            error!("stats lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Current counters. Never touches storage.
    pub fn snapshot(&self) -> CountersSnapshot {
        self.state().counters.snapshot()
    }

    pub fn recent_drops(&self) -> Vec<DropRecord> {
        self.state().drops.snapshot()
    }

    pub fn chests(&self) -> Vec<ChestId> {
        self.state().catalog.ids().to_vec()
    }

    /// Record `count` chest openings, optionally attributed to `chest`.
    pub fn report_open(
        &self,
        count: u64,
        chest: Option<ChestId>,
    ) -> Result<CountersSnapshot, ValidationError> {
        if count == 0 {
            return Err(ValidationError::ZeroCount);
        }
        let mut state = self.state();
        state.counters.increment(count, chest);
        state.counters_tracker.touch();
        state.counters_pending = Some(state.next_sequence());
        Ok(state.counters.snapshot())
    }

    /// Publish notable drops. Returns the length of the feed afterwards.
    pub fn report_drops(&self, items: Vec<RewardItem>) -> Result<usize, ValidationError> {
        validate_items(&items)?;
        let mut state = self.state();
        let len = state.drops.append(items);
        state.drops_tracker.touch();
        state.drops_pending = Some(state.next_sequence());
        Ok(len)
    }

    /// Announce chests to every viewer. Returns the full catalog.
    pub fn announce_chests(&self, ids: Vec<ChestId>) -> Result<Vec<ChestId>, ValidationError> {
        if ids.is_empty() {
            return Err(ValidationError::NoChests);
        }
        let mut state = self.state();
        if state.catalog.announce(&ids) {
            state.catalog_tracker.touch();
        }
        state.announced.extend(ids);
        state.announced_at = state.next_sequence();
        Ok(state.catalog.ids().to_vec())
    }

    /// Register a subscriber. Its first message is a full snapshot, queued
    /// before the lock is released so no periodic update can overtake it.
    pub fn subscribe(&self) -> Subscription {
        let mut state = self.state();
        let joined_at = state.sequence;
        let (id, receiver) = state.registry.register(joined_at);
        let snapshot = Update::Snapshot {
            counters: state.counters.snapshot(),
            drops: state.drops.snapshot(),
        };
        match serde_json::to_string(&snapshot) {
            Ok(encoded) => {
                state.registry.send(id, Payload::from(encoded));
            }
            Err(e) => error!(subscriber = id, ?e, "failed to encode snapshot"),
        }
        let subscribers = state.registry.len();
        drop(state);

        debug!(subscriber = id, subscribers, "subscriber registered");
        Subscription::new(id, receiver, self.clone())
    }

    /// Remove a subscriber. Returns whether it was still registered.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let removed = self.state().registry.remove(id);
        if removed {
            debug!(subscriber = id, "subscriber removed");
        }
        removed
    }

    /// Deregister every subscriber, ending their streams.
    pub fn disconnect_all(&self) -> usize {
        self.state().registry.clear()
    }

    pub fn subscribers(&self) -> usize {
        self.state().registry.len()
    }

    pub fn is_dirty(&self, record: Record) -> bool {
        self.state().tracker(record).is_dirty()
    }

    pub fn is_writing(&self, record: Record) -> bool {
        self.state().tracker(record).is_writing()
    }

    /// Snapshot `record` for persistence if it is dirty and not already being
    /// written.
    pub(crate) fn begin_write(&self, record: Record) -> Option<PendingWrite> {
        let mut state = self.state();
        let version = state.tracker(record).begin()?;
        Some(PendingWrite {
            version,
            contents: state.contents(record),
        })
    }

    pub(crate) fn finish_write(&self, record: Record, version: u64, success: bool) {
        self.state().tracker(record).finish(version, success);
    }

    /// Take pending broadcast work, or `None` if nothing changed since the
    /// previous pass.
    pub(crate) fn take_broadcast(&self) -> Option<BroadcastPass> {
        let mut state = self.state();
        if state.counters_pending.is_none()
            && state.drops_pending.is_none()
            && state.announced.is_empty()
        {
            return None;
        }

        let mut updates = Vec::with_capacity(3);
        if let Some(changed_at) = state.counters_pending.take() {
            updates.push(PendingUpdate {
                changed_at,
                update: Update::CountersUpdate(state.counters.snapshot()),
            });
        }
        if let Some(changed_at) = state.drops_pending.take() {
            updates.push(PendingUpdate {
                changed_at,
                update: Update::DropsUpdate {
                    items: state.drops.snapshot(),
                },
            });
        }
        if !state.announced.is_empty() {
            let mut ids = std::mem::take(&mut state.announced);
            let mut seen = std::collections::HashSet::new();
            ids.retain(|id| seen.insert(*id));
            updates.push(PendingUpdate {
                changed_at: state.announced_at,
                update: Update::NewChests { ids },
            });
        }

        Some(BroadcastPass {
            updates,
            subscribers: state.registry.listeners(),
        })
    }

    /// Deregister subscribers whose delivery failed.
    pub(crate) fn remove_subscribers(&self, ids: &[u64]) {
        let mut state = self.state();
        for id in ids {
            state.registry.remove(*id);
        }
    }

    /// Register a bare channel, bypassing the [Subscription] handle.
    #[cfg(test)]
    pub(crate) fn attach(
        &self,
    ) -> (u64, futures::channel::mpsc::UnboundedReceiver<Payload>) {
        let mut state = self.state();
        let joined_at = state.sequence;
        state.registry.register(joined_at)
    }
}

async fn load_record<S: Storage, T: DeserializeOwned>(
    storage: &S,
    record: Record,
) -> Result<Option<T>, RestoreError<S::Error>> {
    let Some(raw) = storage
        .load(record)
        .await
        .map_err(|source| RestoreError::Load { record, source })?
    else {
        return Ok(None);
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|source| RestoreError::Corrupt { record, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::Memory;
    use std::{collections::BTreeMap, thread};

    fn item(item_id: u64) -> RewardItem {
        RewardItem {
            item_id,
            name: format!("Item {item_id}"),
            icon_url: format!("https://example.com/{item_id}.png"),
            chance: 0.5,
            link: format!("https://example.com/items/{item_id}"),
        }
    }

    fn decode(payload: Payload) -> Update {
        serde_json::from_str(&payload).unwrap()
    }

    #[test]
    fn test_report_open_scenario() {
        let stats = Stats::new();
        stats.report_open(5, Some(1)).unwrap();
        stats.report_open(3, Some(2)).unwrap();
        let snapshot = stats.report_open(10, Some(1)).unwrap();

        assert_eq!(snapshot.total_opened, 18);
        assert_eq!(snapshot.per_chest_counts, BTreeMap::from([(1, 15), (2, 3)]));
        assert_eq!(snapshot.most_popular_chest_id, Some(1));
        assert_eq!(stats.snapshot(), snapshot);
    }

    #[test]
    fn test_concurrent_report_open() {
        let stats = Stats::new();
        let handles: Vec<_> = (0..8u64)
            .map(|worker| {
                let stats = stats.clone();
                thread::spawn(move || {
                    for i in 0..250u64 {
                        let chest = if i % 2 == 0 { Some(worker % 3) } else { None };
                        stats.report_open(1 + i % 3, chest).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut expected = Counters::default();
        for worker in 0..8u64 {
            for i in 0..250u64 {
                let chest = if i % 2 == 0 { Some(worker % 3) } else { None };
                expected.increment(1 + i % 3, chest);
            }
        }
        assert_eq!(stats.snapshot(), expected.snapshot());
    }

    #[test]
    fn test_invalid_input_changes_nothing() {
        let stats = Stats::new();
        assert_eq!(stats.report_open(0, Some(1)), Err(ValidationError::ZeroCount));
        assert_eq!(stats.report_drops(Vec::new()), Err(ValidationError::NoItems));

        let mut bad = item(2);
        bad.chance = 0.0;
        assert!(stats.report_drops(vec![item(1), bad]).is_err());
        assert_eq!(
            stats.announce_chests(Vec::new()),
            Err(ValidationError::NoChests)
        );

        assert_eq!(stats.snapshot(), CountersSnapshot::default());
        assert!(stats.recent_drops().is_empty());
        for record in Record::ALL {
            assert!(!stats.is_dirty(record));
        }
        assert!(stats.take_broadcast().is_none());
    }

    #[test]
    fn test_report_drops() {
        let stats = Stats::new();
        assert_eq!(stats.report_drops(vec![item(1), item(2)]), Ok(2));
        assert_eq!(stats.report_drops(vec![item(3)]), Ok(3));

        let ids: Vec<_> = stats
            .recent_drops()
            .iter()
            .map(|record| record.item.item_id)
            .collect();
        assert_eq!(ids, vec![3, 1, 2]);
        assert!(stats.is_dirty(Record::Drops));
        assert!(!stats.is_dirty(Record::Counters));
    }

    #[test]
    fn test_sixty_drops_keep_fifty() {
        let stats = Stats::new();
        let items: Vec<_> = (0..60).map(item).collect();
        assert_eq!(stats.report_drops(items), Ok(RECENT_DROPS_CAPACITY));

        let ids: Vec<_> = stats
            .recent_drops()
            .iter()
            .map(|record| record.item.item_id)
            .collect();
        assert_eq!(ids, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_announce_chests() {
        let stats = Stats::new();
        assert_eq!(stats.announce_chests(vec![7, 3]), Ok(vec![7, 3]));
        assert!(stats.is_dirty(Record::Chests));
        assert_eq!(stats.announce_chests(vec![3, 8, 8]), Ok(vec![7, 3, 8]));
        assert_eq!(stats.chests(), vec![7, 3, 8]);

        let pass = stats.take_broadcast().unwrap();
        assert_eq!(pass.updates.len(), 1);
        assert_eq!(pass.updates[0].update, Update::NewChests { ids: vec![7, 3, 8] });
        assert!(stats.take_broadcast().is_none());
    }

    #[test]
    fn test_subscriber_receives_one_snapshot() {
        let stats = Stats::new();
        stats.report_open(4, Some(9)).unwrap();
        stats.report_drops(vec![item(1)]).unwrap();

        let mut subscription = stats.subscribe();
        let first = decode(subscription.try_recv().unwrap());
        assert_eq!(
            first,
            Update::Snapshot {
                counters: stats.snapshot(),
                drops: stats.recent_drops(),
            }
        );
        assert!(subscription.try_recv().is_none());
    }

    #[test]
    fn test_pending_changes_skip_later_subscribers() {
        let stats = Stats::new();
        let mut early = stats.subscribe();
        early.try_recv().unwrap();

        stats.report_open(5, Some(1)).unwrap();
        let late = stats.subscribe();
        stats.report_drops(vec![item(1)]).unwrap();

        let pass = stats.take_broadcast().unwrap();
        let joined = |id| {
            pass.subscribers
                .iter()
                .find(|(subscriber, _)| *subscriber == id)
                .map(|(_, listener)| listener.joined_at)
                .unwrap()
        };
        let [counters, drops] = &pass.updates[..] else {
            panic!("expected counters and drops updates");
        };
        assert!(counters.changed_at > joined(early.id()));
        assert!(counters.changed_at <= joined(late.id()));
        assert!(drops.changed_at > joined(late.id()));
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let stats = Stats::new();
        let mut subscription = stats.subscribe();
        assert_eq!(stats.subscribers(), 1);

        assert!(stats.unsubscribe(subscription.id()));
        assert!(!stats.unsubscribe(subscription.id()));
        assert_eq!(stats.subscribers(), 0);

        // The snapshot is still delivered, then the stream ends
        assert!(subscription.try_recv().is_some());
        assert!(subscription.try_recv().is_none());
        drop(subscription);
        assert_eq!(stats.subscribers(), 0);
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let stats = Stats::new();
        let first = stats.subscribe();
        let second = stats.subscribe();
        assert_ne!(first.id(), second.id());
        assert_eq!(stats.subscribers(), 2);
        drop(first);
        assert_eq!(stats.subscribers(), 1);
        drop(second);
        assert_eq!(stats.subscribers(), 0);
    }

    #[test]
    fn test_disconnect_all() {
        let stats = Stats::new();
        let mut subscription = stats.subscribe();
        assert_eq!(stats.disconnect_all(), 1);
        assert_eq!(stats.subscribers(), 0);
        assert!(subscription.try_recv().is_some());
        assert!(subscription.try_recv().is_none());
    }

    #[test]
    fn test_write_guard() {
        let stats = Stats::new();
        assert!(stats.begin_write(Record::Counters).is_none());

        stats.report_open(2, None).unwrap();
        let pending = stats.begin_write(Record::Counters).unwrap();
        assert!(stats.is_writing(Record::Counters));
        assert!(stats.begin_write(Record::Counters).is_none());

        // Mutation while the write is in flight
        stats.report_open(1, None).unwrap();
        let Contents::Counters(written) = &pending.contents else {
            panic!("expected counters");
        };
        assert_eq!(written.total_opened, 2);

        stats.finish_write(Record::Counters, pending.version, true);
        assert!(stats.is_dirty(Record::Counters));

        let pending = stats.begin_write(Record::Counters).unwrap();
        stats.finish_write(Record::Counters, pending.version, true);
        assert!(!stats.is_dirty(Record::Counters));
    }

    #[test]
    fn test_broadcast_flags_independent_of_dirty() {
        let stats = Stats::new();
        stats.report_open(1, Some(1)).unwrap();

        let pass = stats.take_broadcast().unwrap();
        assert_eq!(pass.updates.len(), 1);
        assert!(matches!(pass.updates[0].update, Update::CountersUpdate(_)));
        assert!(stats.take_broadcast().is_none());
        assert!(stats.is_dirty(Record::Counters));
    }

    #[tokio::test]
    async fn test_load_restores_state() {
        let mut counters = Counters::default();
        counters.increment(12, Some(4));
        let drops = vec![DropRecord::new(item(5))];
        let storage = Memory::new()
            .with_record(Record::Counters, serde_json::to_vec(&counters).unwrap())
            .with_record(Record::Drops, serde_json::to_vec(&drops).unwrap());

        let stats = Stats::load(&storage).await.unwrap();
        assert_eq!(stats.snapshot(), counters.snapshot());
        assert_eq!(stats.recent_drops(), drops);
        assert!(stats.chests().is_empty());
        for record in Record::ALL {
            assert!(!stats.is_dirty(record));
        }
    }

    #[tokio::test]
    async fn test_load_rejects_corrupt_record() {
        let storage = Memory::new().with_record(Record::Chests, "not json");
        let err = Stats::load(&storage).await.unwrap_err();
        assert!(matches!(
            err,
            RestoreError::Corrupt {
                record: Record::Chests,
                ..
            }
        ));
    }
}
