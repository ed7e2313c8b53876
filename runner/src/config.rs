use crate::{dedup::CompareSpec, template::BuilderRegistry, template::BuilderRef};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::{
    collections::BTreeMap, fs::File, io::Error, os::unix::fs::MetadataExt, path::PathBuf,
};
use thiserror::Error;
use tracing::{error, warn};

// check if a file is executable
pub fn check_executable(path: &PathBuf) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound)
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("File not found")]
    FileNotFound,
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
    #[error("Config failed to parse")]
    ParseError(#[from] serde_yaml::Error),
    #[error("Preflight checks found configuration errors")]
    PreflightFailed,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// shared directory all managers drain
    pub run_dir: PathBuf,
    /// archives of malformed folders, set aside for operator recovery
    #[serde(default = "default_orphan_dir")]
    pub orphan_dir: PathBuf,
    /// archives that failed upload, left for manual reconciliation
    #[serde(default = "default_hold_dir")]
    pub hold_dir: PathBuf,
    /// root the styles' resource globs are matched against
    #[serde(default)]
    pub resource_dir: Option<PathBuf>,

    #[serde(alias = "db")]
    pub database: StoreConfig,

    /// Job styles as generic executables with fixed parameters plus their
    /// declared parameter axes and comparison terms
    pub styles: BTreeMap<String, StyleConfig>,

    #[serde(default)]
    pub bidding: BidConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub enum StoreConfig {
    #[serde(rename = "sqlite")]
    SQLite { path: PathBuf },
    #[serde(rename = "memory")]
    Memory,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct StyleConfig {
    pub exec: PathBuf,
    #[serde(default)]
    pub params: Vec<String>,
    pub timeout: usize,

    #[serde(default)]
    pub axes: DeclaredAxes,
    #[serde(default)]
    pub compare: CompareSpec,
    /// candidate fields holding parent record keys, with the parent's style
    #[serde(default)]
    pub parents: Vec<ParentSpec>,
    /// glob selecting resource files to copy into each job folder
    #[serde(default)]
    pub resources: Option<String>,
    /// keys every valid candidate must carry non-null
    #[serde(default)]
    pub require: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct DeclaredAxes {
    #[serde(default)]
    pub singular: BTreeMap<String, Value>,
    #[serde(default)]
    pub groups: Vec<DeclaredGroup>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub enum DeclaredGroup {
    #[serde(rename = "inline")]
    Inline {
        keys: Vec<String>,
        columns: Vec<Vec<Value>>,
    },
    #[serde(rename = "builder")]
    Builder(BuilderRef),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ParentSpec {
    pub field: String,
    pub style: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct BidConfig {
    /// pause between placing a bid and arbitrating, milliseconds
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// successive lost rounds before a draining manager gives up
    #[serde(default = "default_max_lost_rounds")]
    pub max_lost_rounds: usize,
}

impl Default for BidConfig {
    fn default() -> Self {
        Self {
            settle_ms: default_settle_ms(),
            max_lost_rounds: default_max_lost_rounds(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// attempts for a record update before degrading
    #[serde(default = "default_record_attempts")]
    pub record_attempts: usize,
    /// attempts per deletion during folder cleanup
    #[serde(default = "default_delete_attempts")]
    pub delete_attempts: usize,
    /// pause between deletion attempts, milliseconds
    #[serde(default = "default_delete_backoff_ms")]
    pub delete_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            record_attempts: default_record_attempts(),
            delete_attempts: default_delete_attempts(),
            delete_backoff_ms: default_delete_backoff_ms(),
        }
    }
}

impl CoordinatorConfig {
    pub fn load(path: &PathBuf) -> Result<Self, ConfigErrors> {
        let file = File::open(path)?;

        Ok(serde_yaml::from_reader(file)?)
    }

    pub fn preflight_checks(&self, builders: &BuilderRegistry) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.styles.is_empty() {
            error!("No style was defined, unable to prepare or run any jobs");
            contains_error = true;
        }

        for (name, style) in self.styles.iter() {
            if !style.exec.is_file() {
                error!(
                    "Failed to find styles.{name}.exec. Either not a file or not found at {}",
                    style.exec.to_string_lossy()
                );

                contains_error = true;
            } else {
                match check_executable(&style.exec) {
                    Ok(is_executable) => {
                        if !is_executable {
                            error!(
                        "Style {name} target {} is not executable, this might cause problems",
                        style.exec.to_string_lossy()
                    );
                            contains_error = true;
                        }
                    }
                    Err(e) => {
                        error!(
                            "Failed to determine if styles.{name}.exec ({}) is an executable: {e}",
                            style.exec.to_string_lossy()
                        );

                        contains_error = true;
                    }
                }
            }

            if style.timeout == 0 {
                error!("Style {name}.timeout cannot be 0. Jobs would be killed immediately.");
                contains_error = true;
            }

            for group in style.axes.groups.iter() {
                match group {
                    DeclaredGroup::Inline { keys, columns } => {
                        let mut lengths = columns.iter().map(Vec::len);
                        let length = lengths.next().unwrap_or(0);

                        if keys.len() != columns.len() || lengths.any(|other| other != length) {
                            error!(
                                "Style {name} declares group {keys:?} with columns of unequal length"
                            );
                            contains_error = true;
                        }
                    }
                    DeclaredGroup::Builder(reference) => {
                        if !builders.contains(&reference.name) {
                            error!(
                                "Style {name} references builder {} but no such builder is registered",
                                reference.name
                            );
                            contains_error = true;
                        }
                    }
                }
            }

            for (term, tolerance) in style.compare.tolerance.iter() {
                if !tolerance.is_finite() || *tolerance < 0.0 {
                    error!(
                        "Style {name} declares tolerance {tolerance} for {term}, must be finite and non-negative"
                    );
                    contains_error = true;
                }
            }

            for parent in style.parents.iter() {
                if !self.styles.contains_key(&parent.style) {
                    warn!(
                        "Style {name} takes parents from {}, which this config does not manage",
                        parent.style
                    );
                }
            }

            if style.resources.is_some() && self.resource_dir.is_none() {
                error!("Style {name} declares a resource glob but no resource_dir is configured");
                contains_error = true;
            }
        }

        contains_error
    }
}

fn default_orphan_dir() -> PathBuf {
    PathBuf::from("orphans")
}

fn default_hold_dir() -> PathBuf {
    PathBuf::from("hold")
}

fn default_settle_ms() -> u64 {
    500
}

fn default_max_lost_rounds() -> usize {
    8
}

fn default_record_attempts() -> usize {
    3
}

fn default_delete_attempts() -> usize {
    5
}

fn default_delete_backoff_ms() -> u64 {
    200
}

/// shell-script stand-in for a compute program, used across the test suite
#[cfg(test)]
pub fn fake_executable(dir: &std::path::Path, name: &str, script: &str) -> PathBuf {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    let mut file = File::create(&path).unwrap();
    writeln!(file, "#!/bin/sh").unwrap();
    writeln!(file, "{script}").unwrap();
    drop(file);

    let mut permissions = std::fs::metadata(&path).unwrap().permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).unwrap();

    path
}
