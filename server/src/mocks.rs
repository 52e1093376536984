//! In-memory [Storage] for tests.

use crate::storage::{Record, Storage};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("injected storage failure for {0}")]
pub struct Failure(pub Record);

#[derive(Default)]
struct Inner {
    records: HashMap<Record, Vec<u8>>,
    writes: HashMap<Record, usize>,
    failing: bool,
}

/// Storage that keeps records in memory, counts successful and attempted
/// writes, and can be told to fail.
#[derive(Clone, Default)]
pub struct Memory {
    inner: Arc<Mutex<Inner>>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record as if it had been written by a previous run.
    pub fn with_record(self, record: Record, contents: impl Into<Vec<u8>>) -> Self {
        self.inner
            .lock()
            .unwrap()
            .records
            .insert(record, contents.into());
        self
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.inner.lock().unwrap().failing = failing;
    }

    /// Number of write attempts for `record`, failed ones included.
    pub fn writes(&self, record: Record) -> usize {
        self.inner
            .lock()
            .unwrap()
            .writes
            .get(&record)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_writes(&self) -> usize {
        self.inner.lock().unwrap().writes.values().sum()
    }

    pub fn get(&self, record: Record) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().records.get(&record).cloned()
    }
}

impl Storage for Memory {
    type Error = Failure;

    async fn load(&self, record: Record) -> Result<Option<Vec<u8>>, Failure> {
        Ok(self.get(record))
    }

    async fn store(&self, record: Record, contents: Vec<u8>) -> Result<(), Failure> {
        let mut inner = self.inner.lock().unwrap();
        *inner.writes.entry(record).or_default() += 1;
        if inner.failing {
            return Err(Failure(record));
        }
        inner.records.insert(record, contents);
        Ok(())
    }
}
