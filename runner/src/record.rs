use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use serde_yaml::Value;
use std::{collections::BTreeMap, fs::File, io, path::Path};
use thiserror::Error;

/// name of the resolved input file inside every job folder
pub const INPUT_FILE_NAME: &str = "input.yaml";
/// extension of cached parent record copies inside a job folder
pub const SNAPSHOT_EXTENSION: &str = "snapshot";

/// Flattened comparison row: the input terms plus the style tag.
/// Both record filtering and duplicate detection operate on these.
pub type FlatRecord = BTreeMap<String, Value>;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("failed to access record file")]
    Io(#[from] io::Error),
    #[error("record file failed to parse")]
    Yaml(#[from] serde_yaml::Error),
}

/// Job status, stored as a tinyint in the record store.
#[derive(Serialize_repr, Deserialize_repr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum JobStatus {
    Error = -1,
    NotCalculated = 0,
    Finished = 1,
}

impl JobStatus {
    pub fn from_i8(raw: i8) -> Option<Self> {
        match raw {
            -1 => Some(Self::Error),
            0 => Some(Self::NotCalculated),
            1 => Some(Self::Finished),
            _ => None,
        }
    }
}

/// The unit of persisted state: one prepared, possibly executed, job.
///
/// Created `NotCalculated` by the preparer and mutated exactly once, by the
/// manager that wins the corresponding folder, to `Finished` or `Error`.
/// Records are never deleted here.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub key: String,
    pub style: String,
    pub status: JobStatus,
    /// fully resolved parameter set the job was built from
    pub input: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl JobRecord {
    /// a freshly prepared record, not yet picked up by any manager
    pub fn provisional(key: String, style: String, input: BTreeMap<String, Value>) -> Self {
        Self {
            key,
            style,
            status: JobStatus::NotCalculated,
            input,
            result: None,
            error_message: None,
        }
    }

    pub fn finish(&mut self, result: Value) {
        self.status = JobStatus::Finished;
        self.result = Some(result);
        self.error_message = None;
    }

    pub fn fail(&mut self, message: String) {
        self.status = JobStatus::Error;
        self.result = None;
        self.error_message = Some(message);
    }

    pub fn flat(&self) -> FlatRecord {
        flat_row(&self.style, &self.input)
    }

    pub fn to_yaml_file(&self, path: &Path) -> Result<(), RecordError> {
        Ok(serde_yaml::to_writer(File::create(path)?, self)?)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, RecordError> {
        Ok(serde_yaml::from_reader(File::open(path)?)?)
    }
}

pub fn flat_row(style: &str, input: &BTreeMap<String, Value>) -> FlatRecord {
    let mut row = input.clone();
    row.insert("style".to_owned(), Value::String(style.to_owned()));

    row
}

/// The resolved input file written into every job folder. Carries enough to
/// match the folder back to its record without trusting the folder name.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct InputFile {
    pub key: String,
    pub style: String,
    pub parameters: BTreeMap<String, Value>,
}

impl InputFile {
    pub fn to_yaml_file(&self, path: &Path) -> Result<(), RecordError> {
        Ok(serde_yaml::to_writer(File::create(path)?, self)?)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, RecordError> {
        Ok(serde_yaml::from_reader(File::open(path)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_stored_as_tinyint() {
        assert_eq!(serde_yaml::to_string(&JobStatus::Finished).unwrap(), "1\n");
        assert_eq!(serde_yaml::to_string(&JobStatus::Error).unwrap(), "-1\n");

        assert_eq!(JobStatus::from_i8(0), Some(JobStatus::NotCalculated));
        assert_eq!(JobStatus::from_i8(7), None);
    }

    #[test]
    fn lifecycle_mutations() {
        let mut record =
            JobRecord::provisional("k".to_owned(), "relax".to_owned(), BTreeMap::new());
        assert_eq!(record.status, JobStatus::NotCalculated);

        record.finish(Value::from(-3.7));
        assert_eq!(record.status, JobStatus::Finished);
        assert!(record.error_message.is_none());

        record.fail("solver crashed".to_owned());
        assert_eq!(record.status, JobStatus::Error);
        assert!(record.result.is_none());
    }

    #[test]
    fn flat_row_carries_style_and_input() {
        let mut input = BTreeMap::new();
        input.insert("lattice".to_owned(), Value::from(4.05));
        let record = JobRecord::provisional("k".to_owned(), "relax".to_owned(), input);

        let row = record.flat();
        assert_eq!(row.get("style"), Some(&Value::String("relax".to_owned())));
        assert_eq!(row.get("lattice"), Some(&Value::from(4.05)));
    }

    #[test]
    fn snapshot_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("parent.{SNAPSHOT_EXTENSION}"));

        let mut record =
            JobRecord::provisional("parent".to_owned(), "relax".to_owned(), BTreeMap::new());
        record.finish(Value::from(-1.0));
        record.to_yaml_file(&path).unwrap();

        let restored = JobRecord::from_yaml_file(&path).unwrap();
        assert_eq!(restored, record);
    }
}
