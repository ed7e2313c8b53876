use super::{RecordFilter, StoreError};
use crate::{
    archive,
    record::{JobRecord, JobStatus},
};
use parking_lot::{lock_api::ArcMutexGuard, FairMutex, RawFairMutex};
use rusqlite::{params, Connection, OptionalExtension};
use std::{collections::BTreeMap, path::Path, sync::Arc};
use tracing::{debug, error, info};

// TODO: Document below, maybe add some kind of migration utility
pub const SQL_SCHEMA: [&str; 2] = [
    "create table if not exists records (
    key text primary key,
    style text not null,
    status tinyint not null,
    input text not null,
    result text,
    error_message text
);",
    "create table if not exists archives (
    key text primary key,
    payload blob not null
);",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();

#[derive(Debug, Clone)]
/// Transparent, thread safe wrapper over `InnerConnection`
pub struct SqliteStore(Arc<FairMutex<InnerConnection>>);

#[derive(Debug)]
pub struct InnerConnection {
    connection: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let connection = Connection::open(path)?;
        let mut inner = InnerConnection { connection };
        inner.init()?;

        Ok(Self(Arc::new(FairMutex::new(inner))))
    }

    fn lock(&self) -> ArcMutexGuard<RawFairMutex, InnerConnection> {
        self.0.lock_arc()
    }

    pub fn get_records(
        &self,
        style: &str,
        filter: &RecordFilter,
    ) -> Result<Vec<JobRecord>, StoreError> {
        self.lock().get_records(style, filter)
    }

    pub fn get_record(&self, style: &str, key: &str) -> Result<Option<JobRecord>, StoreError> {
        self.lock().get_record(style, key)
    }

    pub fn add_record(&self, record: &JobRecord) -> Result<(), StoreError> {
        self.lock().add_record(record)
    }

    pub fn update_record(&self, record: &JobRecord) -> Result<(), StoreError> {
        self.lock().update_record(record)
    }

    pub fn add_archive(&self, root_dir: &Path, key: &str) -> Result<(), StoreError> {
        self.lock().add_archive(root_dir, key)
    }

    pub fn get_archive(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.lock().get_archive(key)
    }
}

type RecordRow = (String, String, i8, String, Option<String>, Option<String>);

fn record_from_row(row: RecordRow) -> Result<JobRecord, StoreError> {
    let (key, style, status, input, result, error_message) = row;
    let status = JobStatus::from_i8(status).unwrap_or_else(|| {
        error!(key = %key, status = status, "Unknown status stored for record, treating as error");
        JobStatus::Error
    });
    let input: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_str(&input)?;
    let result = result.as_deref().map(serde_yaml::from_str).transpose()?;

    Ok(JobRecord {
        key,
        style,
        status,
        input,
        result,
        error_message,
    })
}

impl InnerConnection {
    fn init(&mut self) -> Result<(), StoreError> {
        let mut counter = 1;

        for table in SQL_SCHEMA {
            match self.connection.execute(table, []) {
                Ok(_) => info!("Applied SQL schema ({counter}/{SQL_SCHEMA_NUMBER})"),
                Err(error) => {
                    error!(error = ?error, table = table, "Failed to apply SQL schema ({counter}/{SQL_SCHEMA_NUMBER}): {error}");

                    return Err(StoreError::SQLite(error));
                }
            };

            counter += 1;
        }

        Ok(())
    }

    fn get_records(
        &self,
        style: &str,
        filter: &RecordFilter,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let rows = self
            .connection
            .prepare_cached(
                "select key, style, status, input, result, error_message
                 from records where style = ?",
            )?
            .query_map(params![style], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
            .try_fold(Vec::new(), |mut init, result| {
                init.push(result?);

                Ok::<Vec<RecordRow>, StoreError>(init)
            })?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let record = record_from_row(row)?;
            if filter.matches(&record.flat()) {
                records.push(record);
            }
        }

        Ok(records)
    }

    fn get_record(&self, style: &str, key: &str) -> Result<Option<JobRecord>, StoreError> {
        let row = self
            .connection
            .prepare_cached(
                "select key, style, status, input, result, error_message
                 from records where style = ? and key = ?",
            )?
            .query_row(params![style, key], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })
            .optional()?;

        row.map(record_from_row).transpose()
    }

    fn add_record(&self, record: &JobRecord) -> Result<(), StoreError> {
        let input = serde_yaml::to_string(&record.input)?;
        let result = record
            .result
            .as_ref()
            .map(serde_yaml::to_string)
            .transpose()?;

        self.connection
            .prepare_cached(
                "insert into records
                 (key, style, status, input, result, error_message)
                 values (?, ?, ?, ?, ?, ?)",
            )?
            .execute(params![
                record.key,
                record.style,
                record.status as i8,
                input,
                result,
                record.error_message
            ])?;

        debug!(key = %record.key, style = %record.style, "Inserted record");

        Ok(())
    }

    fn update_record(&self, record: &JobRecord) -> Result<(), StoreError> {
        let result = record
            .result
            .as_ref()
            .map(serde_yaml::to_string)
            .transpose()?;

        let changed = self
            .connection
            .prepare_cached(
                "update records set status = ?, result = ?, error_message = ?
                 where key = ?",
            )?
            .execute(params![
                record.status as i8,
                result,
                record.error_message,
                record.key
            ])?;

        if changed == 0 {
            return Err(StoreError::MissingRecord {
                style: record.style.clone(),
                key: record.key.clone(),
            });
        }

        debug!(key = %record.key, status = ?record.status, "Updated record");

        Ok(())
    }

    fn add_archive(&self, root_dir: &Path, key: &str) -> Result<(), StoreError> {
        let payload = archive::pack_dir(root_dir)?;

        self.connection
            .prepare_cached("insert or replace into archives (key, payload) values (?, ?)")?
            .execute(params![key, payload])?;

        debug!(key = %key, bytes = payload.len(), "Stored archive");

        Ok(())
    }

    fn get_archive(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.connection
            .prepare_cached("select payload from archives where key = ?")?
            .query_row(params![key], |row| row.get(0))
            .optional()?
            .ok_or_else(|| StoreError::MissingArchive(key.to_owned()))
    }
}
