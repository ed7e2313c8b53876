use crate::{
    config::CoordinatorConfig,
    database::{RecordFilter, StoreError, Stores},
    record::{flat_row, FlatRecord, InputFile, JobRecord, SNAPSHOT_EXTENSION},
    styles::{ResolvedInput, StyleRegistry},
    template,
};
use globset::GlobBuilder;
use ignore::WalkBuilder;
use std::{fs, path::Path, path::PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// suffix of folders still being populated, skipped by draining managers
pub const STAGING_SUFFIX: &str = ".staging";

#[derive(Debug, Error)]
pub enum PrepareError {
    #[error("style {0} is not registered")]
    UnknownStyle(String),
    #[error("combo builder {0} is not registered")]
    UnknownBuilder(String),
    #[error("combo builder {0} requires a source_style")]
    BuilderSource(String),
    #[error("multi-key group {keys:?} has columns of unequal length")]
    LockstepMismatch { keys: Vec<String> },
    #[error("candidate field {0} does not name a parent key")]
    MissingParentField(String),
    #[error("parent record {key} of style {style} not found")]
    MissingParent { style: String, key: String },
    #[error("record store operation failed")]
    Store(#[from] StoreError),
    #[error("resource globs were invalid")]
    InvalidGlobs(#[from] globset::Error),
    #[error("failed to write job folder")]
    Io(#[from] std::io::Error),
    #[error("failed to write a job folder file")]
    RecordFile(#[from] crate::record::RecordError),
    #[error("failed to serialize job input")]
    Serialize(#[from] serde_yaml::Error),
}

/// Expands one style at a time into job folders and `NotCalculated` records.
/// Re-running against an unchanged store prepares nothing new.
pub struct Preparer<'a> {
    config: &'a CoordinatorConfig,
    store: &'a Stores,
    registry: &'a StyleRegistry,
    /// surface the first candidate construction error instead of dropping it
    debug: bool,
}

impl<'a> Preparer<'a> {
    pub fn new(
        config: &'a CoordinatorConfig,
        store: &'a Stores,
        registry: &'a StyleRegistry,
        debug: bool,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            debug,
        }
    }

    /// Expand, dedup and materialize all genuinely new jobs of `style`.
    /// Returns the keys of the newly created records.
    pub fn prepare_style(&self, style: &str) -> Result<Vec<String>, PrepareError> {
        let handler = self
            .registry
            .get(style)
            .ok_or_else(|| PrepareError::UnknownStyle(style.to_owned()))?;
        let compare = self
            .config
            .styles
            .get(style)
            .map(|config| config.compare.clone())
            .unwrap_or_default();

        let axes = handler.axes(self.store)?;
        let candidates = template::expand(&axes)?;
        debug!(style = %style, candidates = candidates.len(), "Expanded parameter axes");

        let mut resolved = Vec::new();
        for candidate in candidates {
            if !handler.validate(&candidate) {
                debug!(style = %style, "Dropped candidate failing structural validation");
                continue;
            }

            match handler.build_inputs(candidate) {
                Ok(inputs) => resolved.push(inputs),
                Err(error) if self.debug => return Err(error),
                Err(error) => {
                    warn!(style = %style, error = %error, "Dropped candidate failing input construction");
                }
            }
        }

        let existing: Vec<FlatRecord> = self
            .store
            .get_records(style, &RecordFilter::default())?
            .iter()
            .map(JobRecord::flat)
            .collect();
        let candidate_rows: Vec<FlatRecord> = resolved
            .iter()
            .map(|inputs| flat_row(style, &inputs.input))
            .collect();

        let fresh = compare.filter_new(&existing, &candidate_rows);
        info!(
            style = %style,
            new = fresh.len(),
            duplicates = candidate_rows.len() - fresh.len(),
            "Filtered candidates against existing records"
        );

        let mut keys = Vec::with_capacity(fresh.len());
        for index in fresh {
            let inputs = &resolved[index];
            let key = Uuid::new_v4().to_string();

            self.materialize(style, &key, inputs)?;
            self.store.add_record(&JobRecord::provisional(
                key.clone(),
                style.to_owned(),
                inputs.input.clone(),
            ))?;

            keys.push(key);
        }

        Ok(keys)
    }

    /// Populate the job folder under a staging name, then rename it into
    /// place so managers never observe a half-written folder.
    fn materialize(
        &self,
        style: &str,
        key: &str,
        inputs: &ResolvedInput,
    ) -> Result<(), PrepareError> {
        fs::create_dir_all(&self.config.run_dir)?;

        let staging = self
            .config
            .run_dir
            .join(format!("{key}{STAGING_SUFFIX}"));
        let folder = self.config.run_dir.join(key);
        fs::create_dir(&staging)?;

        let input_file = InputFile {
            key: key.to_owned(),
            style: style.to_owned(),
            parameters: inputs.input.clone(),
        };
        input_file.to_yaml_file(&staging.join(crate::record::INPUT_FILE_NAME))?;

        for parent in &inputs.parents {
            let record = self
                .store
                .get_record(&parent.style, &parent.key)?
                .ok_or_else(|| PrepareError::MissingParent {
                    style: parent.style.clone(),
                    key: parent.key.clone(),
                })?;

            record.to_yaml_file(&staging.join(format!("{}.{SNAPSHOT_EXTENSION}", parent.key)))?;
        }

        if let Some(glob) = &inputs.resource_glob {
            self.copy_resources(glob, &staging)?;
        }

        fs::rename(&staging, &folder)?;
        debug!(key = %key, folder = ?folder, "Materialized job folder");

        Ok(())
    }

    /// copy resource files matching the style's glob into the folder
    fn copy_resources(&self, glob: &str, target: &Path) -> Result<(), PrepareError> {
        let root = match &self.config.resource_dir {
            Some(root) => root,
            None => {
                warn!("Resource glob set but no resource_dir configured, copying nothing");
                return Ok(());
            }
        };

        let matcher = GlobBuilder::new(glob).build()?.compile_matcher();

        for entry in WalkBuilder::new(root).build() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Failed to search for resource files: {e}");
                    continue;
                }
            };

            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            let relative = path.strip_prefix(root).unwrap_or(path);
            if matcher.is_match(relative) || matcher.is_match(path) {
                let name: PathBuf = match path.file_name() {
                    Some(name) => name.into(),
                    None => continue,
                };

                fs::copy(path, target.join(name))?;
            }
        }

        Ok(())
    }
}
