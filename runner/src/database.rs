pub mod memory;
#[cfg(feature = "rusqlite")]
pub mod sqlite;

use crate::{
    config::StoreConfig,
    record::{FlatRecord, JobRecord},
};
use serde_yaml::Value;
use std::{collections::BTreeMap, path::Path};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[cfg(feature = "rusqlite")]
    #[error("SQLite operation failed")]
    SQLite(#[from] rusqlite::Error),
    #[error("record {key} of style {style} not found")]
    MissingRecord { style: String, key: String },
    #[error("record {0} already exists")]
    DuplicateKey(String),
    #[error("archive for {0} not found")]
    MissingArchive(String),
    #[error("failed to serialize record fields")]
    Serialize(#[from] serde_yaml::Error),
    #[error("archive io failed")]
    ArchiveIo(#[from] std::io::Error),
}

/// Exact-match filter over flattened record fields.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter(pub BTreeMap<String, Value>);

impl RecordFilter {
    pub fn matches(&self, row: &FlatRecord) -> bool {
        self.0
            .iter()
            .all(|(term, value)| row.get(term) == Some(value))
    }
}

/// All record store adapters.
/// These should be initialized from `Stores::load`
/// (this is deliberately not made with dynamic dispatch to avoid the headache)
#[derive(Debug, Clone)]
pub enum Stores {
    #[cfg(feature = "rusqlite")]
    SQLite(sqlite::SqliteStore),
    Memory(memory::MemoryStore),
}

impl Stores {
    pub fn load(config: &StoreConfig) -> Result<Self, StoreError> {
        match config {
            #[cfg(feature = "rusqlite")]
            StoreConfig::SQLite { path } => Ok(Self::SQLite(sqlite::SqliteStore::open(path)?)),
            StoreConfig::Memory => Ok(Self::Memory(memory::MemoryStore::new())),
        }
    }

    pub fn get_records(
        &self,
        style: &str,
        filter: &RecordFilter,
    ) -> Result<Vec<JobRecord>, StoreError> {
        match self {
            #[cfg(feature = "rusqlite")]
            Self::SQLite(store) => store.get_records(style, filter),
            Self::Memory(store) => store.get_records(style, filter),
        }
    }

    pub fn get_record(&self, style: &str, key: &str) -> Result<Option<JobRecord>, StoreError> {
        match self {
            #[cfg(feature = "rusqlite")]
            Self::SQLite(store) => store.get_record(style, key),
            Self::Memory(store) => store.get_record(style, key),
        }
    }

    pub fn add_record(&self, record: &JobRecord) -> Result<(), StoreError> {
        match self {
            #[cfg(feature = "rusqlite")]
            Self::SQLite(store) => store.add_record(record),
            Self::Memory(store) => store.add_record(record),
        }
    }

    pub fn update_record(&self, record: &JobRecord) -> Result<(), StoreError> {
        match self {
            #[cfg(feature = "rusqlite")]
            Self::SQLite(store) => store.update_record(record),
            Self::Memory(store) => store.update_record(record),
        }
    }

    /// Compress the job folder at `root_dir` and persist the archive under `key`.
    pub fn add_archive(&self, root_dir: &Path, key: &str) -> Result<(), StoreError> {
        match self {
            #[cfg(feature = "rusqlite")]
            Self::SQLite(store) => store.add_archive(root_dir, key),
            Self::Memory(store) => store.add_archive(root_dir, key),
        }
    }

    pub fn get_archive(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        match self {
            #[cfg(feature = "rusqlite")]
            Self::SQLite(store) => store.get_archive(key),
            Self::Memory(store) => store.get_archive(key),
        }
    }
}
