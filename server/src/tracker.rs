/// Dirty tracking for one persisted aggregate.
///
/// Every mutation bumps `version`. A write captures the version it snapshotted
/// and, on success, only marks that version persisted: mutations that land while
/// the write is in flight keep the aggregate dirty for the next flush.
#[derive(Debug, Default)]
pub(crate) struct Tracker {
    version: u64,
    persisted: u64,
    writing: bool,
}

impl Tracker {
    pub fn touch(&mut self) {
        self.version += 1;
    }

    pub fn is_dirty(&self) -> bool {
        self.version != self.persisted
    }

    pub fn is_writing(&self) -> bool {
        self.writing
    }

    /// Start a write if the aggregate is dirty and no write is in flight.
    ///
    /// Returns the version being written.
    pub fn begin(&mut self) -> Option<u64> {
        if self.writing || !self.is_dirty() {
            return None;
        }
        self.writing = true;
        Some(self.version)
    }

    pub fn finish(&mut self, version: u64, success: bool) {
        self.writing = false;
        if success && version > self.persisted {
            self.persisted = version;
        }
    }
}
