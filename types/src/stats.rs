use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Identifier of a chest in the game database.
pub type ChestId = u64;

/// Maximum number of records kept in the recent drops feed.
pub const RECENT_DROPS_CAPACITY: usize = 50;

/// Rejected input at the request boundary.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("count must be at least 1")]
    ZeroCount,
    #[error("no items provided")]
    NoItems,
    #[error("item {index} has invalid chance {chance} (expected 0 < chance <= 100)")]
    InvalidChance { index: usize, chance: f64 },
    #[error("no chest id provided")]
    NoChests,
}

/// Global open counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Counters {
    pub total_opened: u64,
    #[serde(default, deserialize_with = "chest_counts")]
    pub per_chest_counts: BTreeMap<ChestId, u64>,
}

impl Counters {
    /// Add `amount` to the total and, if given, to the chest's own count.
    pub fn increment(&mut self, amount: u64, chest: Option<ChestId>) {
        self.total_opened = self.total_opened.saturating_add(amount);
        if let Some(chest) = chest {
            let count = self.per_chest_counts.entry(chest).or_insert(0);
            *count = count.saturating_add(amount);
        }
    }

    /// The chest opened the most times. Ties go to the lowest chest id.
    pub fn most_popular(&self) -> Option<ChestId> {
        self.per_chest_counts
            .iter()
            .fold(None, |best: Option<(ChestId, u64)>, (&chest, &count)| match best {
                Some((_, max)) if max >= count => best,
                _ => Some((chest, count)),
            })
            .map(|(chest, _)| chest)
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            total_opened: self.total_opened,
            per_chest_counts: self.per_chest_counts.clone(),
            most_popular_chest_id: self.most_popular(),
        }
    }
}

/// Point-in-time view of [Counters] as served to readers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountersSnapshot {
    pub total_opened: u64,
    #[serde(deserialize_with = "chest_counts")]
    pub per_chest_counts: BTreeMap<ChestId, u64>,
    pub most_popular_chest_id: Option<ChestId>,
}

/// JSON object keys are strings; parse them back into chest ids. Needed when the
/// map sits inside a tagged [crate::api::Update], where serde buffers the keys.
fn chest_counts<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeMap<ChestId, u64>, D::Error> {
    BTreeMap::<String, u64>::deserialize(deserializer)?
        .into_iter()
        .map(|(chest, count)| {
            chest
                .parse()
                .map(|chest| (chest, count))
                .map_err(serde::de::Error::custom)
        })
        .collect()
}

/// A reward as described by the chest page.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardItem {
    pub item_id: u64,
    pub name: String,
    pub icon_url: String,
    /// Drop chance in percent.
    pub chance: f64,
    pub link: String,
}

impl RewardItem {
    fn has_valid_chance(&self) -> bool {
        self.chance.is_finite() && self.chance > 0.0 && self.chance <= 100.0
    }
}

/// Check a batch of reported rewards before it touches any state.
pub fn validate_items(items: &[RewardItem]) -> Result<(), ValidationError> {
    if items.is_empty() {
        return Err(ValidationError::NoItems);
    }
    for (index, item) in items.iter().enumerate() {
        if !item.has_valid_chance() {
            return Err(ValidationError::InvalidChance {
                index,
                chance: item.chance,
            });
        }
    }
    Ok(())
}

/// A notable reward in the recent drops feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DropRecord {
    pub uid: String,
    #[serde(flatten)]
    pub item: RewardItem,
}

impl DropRecord {
    /// Wrap `item` with a freshly generated unique id.
    pub fn new(item: RewardItem) -> Self {
        Self {
            uid: Uuid::new_v4().to_string(),
            item,
        }
    }
}
