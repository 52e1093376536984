use chest_stats_types::ChestId;
use std::collections::HashSet;

/// Chests announced by an administrator, in first-announcement order.
#[derive(Debug, Default)]
pub(crate) struct Catalog {
    ids: Vec<ChestId>,
    seen: HashSet<ChestId>,
}

impl Catalog {
    pub fn restore(ids: Vec<ChestId>) -> Self {
        let mut catalog = Self::default();
        catalog.announce(&ids);
        catalog
    }

    /// Merge `ids` into the catalog. Returns whether any id was new.
    pub fn announce(&mut self, ids: &[ChestId]) -> bool {
        let mut changed = false;
        for &id in ids {
            if self.seen.insert(id) {
                self.ids.push(id);
                changed = true;
            }
        }
        changed
    }

    pub fn ids(&self) -> &[ChestId] {
        &self.ids
    }
}
