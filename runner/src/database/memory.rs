use super::{RecordFilter, StoreError};
use crate::{archive, record::JobRecord};
use parking_lot::{lock_api::ArcMutexGuard, FairMutex, RawFairMutex};
use std::{collections::BTreeMap, path::Path, sync::Arc};
use tracing::debug;

/// In-memory record store, shared between clones.
/// Backs ephemeral runs and the test suite.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore(Arc<FairMutex<Inner>>);

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<String, JobRecord>,
    archives: BTreeMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> ArcMutexGuard<RawFairMutex, Inner> {
        self.0.lock_arc()
    }

    pub fn get_records(
        &self,
        style: &str,
        filter: &RecordFilter,
    ) -> Result<Vec<JobRecord>, StoreError> {
        Ok(self
            .lock()
            .records
            .values()
            .filter(|record| record.style == style && filter.matches(&record.flat()))
            .cloned()
            .collect())
    }

    pub fn get_record(&self, style: &str, key: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self
            .lock()
            .records
            .get(key)
            .filter(|record| record.style == style)
            .cloned())
    }

    pub fn add_record(&self, record: &JobRecord) -> Result<(), StoreError> {
        let mut inner = self.lock();

        if inner.records.contains_key(&record.key) {
            return Err(StoreError::DuplicateKey(record.key.clone()));
        }

        inner.records.insert(record.key.clone(), record.clone());

        Ok(())
    }

    pub fn update_record(&self, record: &JobRecord) -> Result<(), StoreError> {
        let mut inner = self.lock();

        match inner.records.get_mut(&record.key) {
            Some(existing) => {
                *existing = record.clone();

                Ok(())
            }
            None => Err(StoreError::MissingRecord {
                style: record.style.clone(),
                key: record.key.clone(),
            }),
        }
    }

    pub fn add_archive(&self, root_dir: &Path, key: &str) -> Result<(), StoreError> {
        let payload = archive::pack_dir(root_dir)?;
        debug!(key = %key, bytes = payload.len(), "Stored archive");
        self.lock().archives.insert(key.to_owned(), payload);

        Ok(())
    }

    pub fn get_archive(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.lock()
            .archives
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::MissingArchive(key.to_owned()))
    }
}
