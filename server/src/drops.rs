use chest_stats_types::{DropRecord, RewardItem};
use std::collections::VecDeque;

/// Bounded feed of notable drops, newest first.
#[derive(Debug)]
pub(crate) struct RecentDrops {
    records: VecDeque<DropRecord>,
    capacity: usize,
}

impl RecentDrops {
    #[cfg(test)]
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn restore(records: Vec<DropRecord>, capacity: usize) -> Self {
        let mut records = VecDeque::from(records);
        records.truncate(capacity);
        Self { records, capacity }
    }

    /// Place `items` ahead of existing records, keeping their order, then evict
    /// the oldest records past capacity. Returns the new length.
    pub fn append(&mut self, items: Vec<RewardItem>) -> usize {
        // Items past capacity would be evicted immediately
        for item in items.into_iter().take(self.capacity).rev() {
            self.records.push_front(DropRecord::new(item));
        }
        self.records.truncate(self.capacity);
        self.records.len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn snapshot(&self) -> Vec<DropRecord> {
        self.records.iter().cloned().collect()
    }
}
