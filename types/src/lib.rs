//! Types shared between the chest-stats server and its clients.

pub mod api;
pub mod stats;

pub use stats::{
    ChestId, Counters, CountersSnapshot, DropRecord, RewardItem, ValidationError,
    RECENT_DROPS_CAPACITY,
};
