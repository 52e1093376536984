//! Shared state for the chest opening simulator.
//!
//! Clients report chest openings and rare drops through [Api]. Reports only
//! touch memory ([Stats]); a [Flusher] persists dirty aggregates to [Storage]
//! every few seconds and a [Broadcaster] pushes changes to live subscribers
//! several times a second.

pub mod api;
pub mod broadcaster;
mod catalog;
pub mod config;
mod drops;
pub mod flusher;
pub mod registry;
pub mod stats;
pub mod storage;
mod tracker;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;

pub use api::{Api, RateLimit};
pub use broadcaster::Broadcaster;
pub use config::{Config, ConfigError, ValidatedConfig};
pub use flusher::Flusher;
pub use registry::{Payload, Subscription};
pub use stats::{RestoreError, Stats};
pub use storage::{FileStorage, Record, Storage};
