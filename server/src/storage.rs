//! Durable storage for the persisted aggregates.

use chest_stats_types::{ChestId, Counters, DropRecord};
use serde::Serialize;
use std::{
    fmt,
    future::Future,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

/// An independently persisted aggregate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Record {
    Counters,
    Drops,
    Chests,
}

impl Record {
    pub const ALL: [Record; 3] = [Record::Counters, Record::Drops, Record::Chests];

    pub fn name(&self) -> &'static str {
        match self {
            Record::Counters => "counters",
            Record::Drops => "drops",
            Record::Chests => "chests",
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Point-in-time copy of an aggregate, taken under the state lock.
#[derive(Clone, Debug, PartialEq)]
pub enum Contents {
    Counters(Counters),
    Drops(Vec<DropRecord>),
    Chests(Vec<ChestId>),
}

impl Contents {
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        fn pretty<T: Serialize>(value: &T) -> serde_json::Result<Vec<u8>> {
            serde_json::to_vec_pretty(value)
        }
        match self {
            Contents::Counters(counters) => pretty(counters),
            Contents::Drops(drops) => pretty(drops),
            Contents::Chests(ids) => pretty(ids),
        }
    }
}

/// Trait for the medium aggregates are persisted to.
pub trait Storage: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Read a record, or `None` if it was never written.
    fn load(
        &self,
        record: Record,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, Self::Error>> + Send;

    /// Replace a record.
    fn store(
        &self,
        record: Record,
        contents: Vec<u8>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Stores each record as a JSON file in one directory.
///
/// Writes go to a temporary file that is renamed over the record, so a crash
/// mid-write never leaves a truncated record behind.
#[derive(Clone, Debug)]
pub struct FileStorage {
    directory: PathBuf,
}

impl FileStorage {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn path(&self, record: Record) -> PathBuf {
        self.directory.join(format!("{}.json", record.name()))
    }
}

fn io_error(action: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> Error {
    let path = path.to_path_buf();
    move |source| Error::Io {
        action,
        path,
        source,
    }
}

impl Storage for FileStorage {
    type Error = Error;

    async fn load(&self, record: Record) -> Result<Option<Vec<u8>>, Error> {
        let path = self.path(record);
        match tokio::fs::read(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read", &path)(e)),
        }
    }

    async fn store(&self, record: Record, contents: Vec<u8>) -> Result<(), Error> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(io_error("create", &self.directory))?;

        let path = self.path(record);
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, &contents)
            .await
            .map_err(io_error("write", &staging))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(io_error("rename", &staging))?;
        debug!(%record, path = %path.display(), bytes = contents.len(), "stored record");
        Ok(())
    }
}
