use crate::{
    archive::{self, ARCHIVE_SUFFIX},
    claim::{ClaimBroker, ClaimError, ClaimOutcome, FsClaimBroker, BID_EXTENSION},
    config::{CoordinatorConfig, StyleConfig},
    database::{StoreError, Stores},
    prepare::STAGING_SUFFIX,
    record::{InputFile, JobRecord, JobStatus, RecordError, INPUT_FILE_NAME, SNAPSHOT_EXTENSION},
};
use nix::unistd::gethostname;
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use rayon::{prelude::*, ThreadPoolBuilder};
use serde_yaml::Value;
use std::{
    fs, io,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use wait_timeout::ChildExt;

/// best-effort host name for manager identity logging
static HOSTNAME: Lazy<String> = Lazy::new(|| {
    gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_owned())
});

#[derive(Debug, Error)]
pub enum RunError {
    #[error("record store operation failed")]
    Store(#[from] StoreError),
    #[error("bidding failed")]
    Claim(#[from] ClaimError),
    #[error("run directory operation failed")]
    Io(#[from] io::Error),
    #[error("job folder file was unreadable")]
    RecordFile(#[from] RecordError),
    #[error("failed to build the worker pool")]
    Workers(#[from] rayon::ThreadPoolBuildError),
}

/// Outcome of one bidding round against one job folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// job executed and its record updated
    Executed(JobStatus),
    /// job executed but the record update kept failing, the result survives
    /// only in the archive
    RecordUploadFailed(JobStatus),
    /// another claimant is ahead or the folder is gone
    Lost,
    /// a dependency is not yet finished, retry against it
    ParentPending { parent: String },
    /// malformed folder archived into the orphan directory
    Orphaned,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub executed: usize,
    /// subset of `executed` that recorded an error status
    pub failed: usize,
    pub orphaned: usize,
    pub lost_rounds: usize,
    pub upload_failures: usize,
}

impl DrainSummary {
    fn merge(mut self, other: Self) -> Self {
        self.executed += other.executed;
        self.failed += other.failed;
        self.orphaned += other.orphaned;
        self.lost_rounds += other.lost_rounds;
        self.upload_failures += other.upload_failures;

        self
    }
}

/// distinct claimant id per in-process worker, derived from the OS pid so
/// workers of different managers never collide
pub fn claimant_id(worker: usize) -> u64 {
    ((std::process::id() as u64) << 16) | worker as u64
}

enum ParentGate {
    Ready,
    Failed(String),
    Pending(String),
}

/// Drains a shared run directory by competitively claiming one folder at a
/// time, gating on parent readiness, executing the job's external program and
/// uploading the outcome. Any number of managers may race against the same
/// directory; the claim broker guarantees one executor per folder.
pub struct RunManager<'a, B: ClaimBroker> {
    config: &'a CoordinatorConfig,
    store: &'a Stores,
    broker: B,
}

impl<'a, B: ClaimBroker> RunManager<'a, B> {
    pub fn new(config: &'a CoordinatorConfig, store: &'a Stores, broker: B) -> Self {
        Self {
            config,
            store,
            broker,
        }
    }

    /// Repeatedly pick a folder and run the bidding protocol against it until
    /// the directory is empty or too many successive rounds were lost.
    ///
    /// Folders are picked uniformly at random to reduce bidding collisions
    /// among many managers; a job deferred on an unfinished parent is followed
    /// by an immediate round against that parent instead of a random pick.
    pub fn drain(&self) -> Result<DrainSummary, RunError> {
        info!(
            claimant = self.broker.claimant(),
            host = %HOSTNAME.as_str(),
            run_dir = ?self.config.run_dir,
            "Draining run directory"
        );

        let mut summary = DrainSummary::default();
        let mut lost_streak = 0;
        let mut target: Option<String> = None;

        loop {
            let key = match target.take() {
                Some(key) => key,
                None => match self.pick_folder()? {
                    Some(key) => key,
                    None => break,
                },
            };

            let outcome = match self.run_key(&key) {
                Ok(outcome) => outcome,
                Err(error) => {
                    // a per-folder failure must not end the drain
                    warn!(key = %key, error = %error, "Run round failed");
                    RunOutcome::Lost
                }
            };

            match outcome {
                RunOutcome::Executed(status) => {
                    lost_streak = 0;
                    summary.executed += 1;
                    if status == JobStatus::Error {
                        summary.failed += 1;
                    }
                }
                RunOutcome::RecordUploadFailed(status) => {
                    lost_streak = 0;
                    summary.executed += 1;
                    summary.upload_failures += 1;
                    if status == JobStatus::Error {
                        summary.failed += 1;
                    }
                }
                RunOutcome::Orphaned => {
                    lost_streak = 0;
                    summary.orphaned += 1;
                }
                RunOutcome::ParentPending { parent } => {
                    target = Some(parent);
                }
                RunOutcome::Lost => {
                    summary.lost_rounds += 1;
                    lost_streak += 1;
                    if lost_streak >= self.config.bidding.max_lost_rounds {
                        info!(
                            lost = lost_streak,
                            "Giving up on a contested or emptying directory"
                        );
                        break;
                    }
                }
            }
        }

        info!(
            executed = summary.executed,
            failed = summary.failed,
            orphaned = summary.orphaned,
            "Drain loop finished"
        );

        Ok(summary)
    }

    /// Run one bidding round against `key` and, on a win, the full
    /// gate/execute/persist/archive/cleanup sequence.
    pub fn run_key(&self, key: &str) -> Result<RunOutcome, RunError> {
        let folder = self.config.run_dir.join(key);

        match self.broker.claim(&folder)? {
            ClaimOutcome::Lost => return Ok(RunOutcome::Lost),
            ClaimOutcome::Won => {
                debug!(key = %key, claimant = self.broker.claimant(), "Won the bidding round")
            }
        }

        self.run_claimed(key, &folder)
    }

    /// winner path: the own bid stays in the folder as the claim marker
    fn run_claimed(&self, key: &str, folder: &Path) -> Result<RunOutcome, RunError> {
        let input = match read_input(folder, key) {
            Ok(input) => input,
            Err(reason) => {
                warn!(key = %key, reason = %reason, "Malformed folder, setting it aside");
                self.orphan(key, folder)?;

                return Ok(RunOutcome::Orphaned);
            }
        };

        let mut record = match self.store.get_record(&input.style, &input.key)? {
            Some(record) => record,
            None => {
                warn!(key = %key, style = %input.style, "No matching record, setting the folder aside");
                self.orphan(key, folder)?;

                return Ok(RunOutcome::Orphaned);
            }
        };

        let style = match self.config.styles.get(&input.style) {
            Some(style) => style,
            None => {
                warn!(key = %key, style = %input.style, "Record style is not configured, setting the folder aside");
                self.orphan(key, folder)?;

                return Ok(RunOutcome::Orphaned);
            }
        };

        match self.check_parents(folder)? {
            ParentGate::Pending(parent) => {
                debug!(key = %key, parent = %parent, "Parent not finished yet, deferring");
                self.broker.release(folder)?;

                return Ok(RunOutcome::ParentPending { parent });
            }
            ParentGate::Failed(parent) => {
                info!(key = %key, parent = %parent, "Parent failed, recording the error without execution");
                record.fail(format!("parent job {parent} failed"));
            }
            ParentGate::Ready => {
                info!(key = %key, style = %record.style, "Executing job");
                self.execute(style, folder, &mut record);
            }
        }

        let persisted = self.persist(&record);

        if self.archive_or_hold(key, folder) {
            if let Err(error) = self.cleanup(folder) {
                warn!(key = %key, error = %error, "Folder cleanup incomplete");
            }
        }

        Ok(if persisted {
            RunOutcome::Executed(record.status)
        } else {
            RunOutcome::RecordUploadFailed(record.status)
        })
    }

    /// Check every cached parent snapshot. A failed parent dominates a
    /// pending one; stale snapshots are refreshed in place from the store.
    fn check_parents(&self, folder: &Path) -> Result<ParentGate, RunError> {
        let mut parents = Vec::new();

        for entry in fs::read_dir(folder)? {
            let path = entry?.path();
            if path.extension().map(|ext| ext == SNAPSHOT_EXTENSION) != Some(true) {
                continue;
            }

            parents.push((JobRecord::from_yaml_file(&path)?, path));
        }

        // stale snapshots: the parent may have moved on since prepare time
        for (parent, path) in parents.iter_mut() {
            if parent.status != JobStatus::NotCalculated {
                continue;
            }

            if let Some(live) = self.store.get_record(&parent.style, &parent.key)? {
                if live.status != JobStatus::NotCalculated {
                    debug!(parent = %live.key, status = ?live.status, "Refreshing stale parent snapshot");
                    live.to_yaml_file(path)?;
                    *parent = live;
                }
            }
        }

        for (parent, _) in &parents {
            if parent.status == JobStatus::Error {
                return Ok(ParentGate::Failed(parent.key.clone()));
            }
        }
        for (parent, _) in &parents {
            if parent.status == JobStatus::NotCalculated {
                return Ok(ParentGate::Pending(parent.key.clone()));
            }
        }

        Ok(ParentGate::Ready)
    }

    /// Run the style's external program against the folder's input file and
    /// capture the outcome into the record.
    fn execute(&self, style: &StyleConfig, folder: &Path, record: &mut JobRecord) {
        let timeout = Duration::from_secs(style.timeout as u64);
        let start = Instant::now();

        let child = Command::new(&style.exec)
            .args(style.params.iter())
            .arg(folder.join(INPUT_FILE_NAME))
            .current_dir(folder)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(error) => {
                warn!(key = %record.key, error = %error, "Failed to spawn job executable");
                record.fail(format!(
                    "failed to spawn {}: {error}",
                    style.exec.to_string_lossy()
                ));

                return;
            }
        };

        match child.wait_timeout(timeout) {
            Ok(Some(status)) => {
                let stdout = read_pipe(child.stdout.take());
                let stderr = read_pipe(child.stderr.take());
                debug!(
                    key = %record.key,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    success = status.success(),
                    "Job exited"
                );

                if status.success() {
                    record.finish(parse_result(&stdout));
                } else {
                    let mut diagnostic = stderr.trim().to_owned();
                    if diagnostic.is_empty() {
                        diagnostic = stdout.trim().to_owned();
                    }
                    record.fail(format!("job exited with {status}: {diagnostic}"));
                }
            }
            Ok(None) => {
                // child hasn't exited yet
                if let Err(error) = child.kill() {
                    warn!(key = %record.key, error = %error, "Failed to kill timed out job");
                }
                let _ = child.wait();
                record.fail(format!("job timed out after {}s", style.timeout));
            }
            Err(error) => {
                let _ = child.kill();
                record.fail(format!("failed to await job: {error}"));
            }
        }
    }

    /// bounded retries; exhaustion degrades the outcome instead of crashing
    fn persist(&self, record: &JobRecord) -> bool {
        for attempt in 1..=self.config.retry.record_attempts.max(1) {
            match self.store.update_record(record) {
                Ok(()) => return true,
                Err(error) => {
                    warn!(key = %record.key, attempt, error = %error, "Record update failed")
                }
            }
        }

        error!(
            key = %record.key,
            "Record update kept failing, the result survives only in the archive"
        );

        false
    }

    /// Push the folder archive to the store, falling back to the hold
    /// directory. Returns whether the folder contents are safe to delete.
    fn archive_or_hold(&self, key: &str, folder: &Path) -> bool {
        match self.store.add_archive(folder, key) {
            Ok(()) => true,
            Err(error) => {
                warn!(key = %key, error = %error, "Archive upload failed, holding it for manual reconciliation");

                let target = self.config.hold_dir.join(format!("{key}{ARCHIVE_SUFFIX}"));
                let held = fs::create_dir_all(&self.config.hold_dir)
                    .and_then(|()| archive::pack_dir_to(folder, &target));

                match held {
                    Ok(_) => true,
                    Err(error) => {
                        error!(key = %key, error = %error, "Could not hold the archive either, leaving the folder in place");

                        false
                    }
                }
            }
        }
    }

    /// Archive a malformed folder into the orphan directory and drop it from
    /// the run directory without executing it.
    fn orphan(&self, key: &str, folder: &Path) -> Result<(), RunError> {
        fs::create_dir_all(&self.config.orphan_dir)?;
        let target = self.config.orphan_dir.join(format!("{key}{ARCHIVE_SUFFIX}"));
        archive::pack_dir_to(folder, &target)?;
        self.cleanup(folder)?;

        Ok(())
    }

    /// Delete the folder contents with bid files last, so no concurrent
    /// claimant ever observes a half-deleted folder as unclaimed. Returns the
    /// deletion order of the removed entries.
    fn cleanup(&self, folder: &Path) -> Result<Vec<PathBuf>, RunError> {
        let mut plain = Vec::new();
        let mut bids = Vec::new();

        for entry in fs::read_dir(folder)? {
            let path = entry?.path();
            if path.extension().map(|ext| ext == BID_EXTENSION) == Some(true) {
                bids.push(path);
            } else {
                plain.push(path);
            }
        }

        let mut order = Vec::with_capacity(plain.len() + bids.len());
        for path in plain.into_iter().chain(bids) {
            self.remove_with_retries(&path, remove_entry)?;
            order.push(path);
        }
        self.remove_with_retries(folder, |p: &Path| fs::remove_dir(p))?;

        Ok(order)
    }

    /// deletion retries tolerate the latency of network filesystems
    fn remove_with_retries(
        &self,
        path: &Path,
        remove: fn(&Path) -> io::Result<()>,
    ) -> Result<(), RunError> {
        let backoff = Duration::from_millis(self.config.retry.delete_backoff_ms);
        let mut last = None;

        for attempt in 1..=self.config.retry.delete_attempts.max(1) {
            match remove(path) {
                Ok(()) => return Ok(()),
                Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(error) => {
                    debug!(path = ?path, attempt, error = %error, "Deletion failed, retrying");
                    last = Some(error);
                    thread::sleep(backoff);
                }
            }
        }

        Err(RunError::Io(last.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "deletion retries exhausted")
        })))
    }

    /// uniformly random pick over the current folder names
    fn pick_folder(&self) -> Result<Option<String>, RunError> {
        let entries = match fs::read_dir(&self.config.run_dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            // still being populated by a preparer
            if name.ends_with(STAGING_SUFFIX) {
                continue;
            }

            keys.push(name);
        }

        Ok(keys.choose(&mut rand::thread_rng()).cloned())
    }
}

fn remove_entry(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// The folder must carry exactly one readable input file whose declared key
/// matches the folder name; anything else is an orphan condition.
fn read_input(folder: &Path, key: &str) -> Result<InputFile, String> {
    let path = folder.join(INPUT_FILE_NAME);
    if !path.is_file() {
        return Err(format!("no {INPUT_FILE_NAME} present"));
    }

    let input = InputFile::from_yaml_file(&path)
        .map_err(|error| format!("unreadable {INPUT_FILE_NAME}: {error}"))?;

    if input.key != key {
        return Err(format!("input declares key {}, folder is {key}", input.key));
    }

    Ok(input)
}

fn read_pipe<R: io::Read>(pipe: Option<R>) -> String {
    let mut output = String::new();

    if let Some(mut pipe) = pipe {
        if let Err(error) = pipe.read_to_string(&mut output) {
            warn!(error = %error, "Failed to read job output");
        }
    }

    output
}

/// job output is recorded as YAML when it parses, raw text otherwise
fn parse_result(stdout: &str) -> Value {
    serde_yaml::from_str(stdout)
        .unwrap_or_else(|_| Value::String(stdout.trim_end().to_owned()))
}

/// Drain with `workers` managers on a thread pool, each bidding under its own
/// claimant id against the same directory.
pub fn drain_parallel(
    config: &CoordinatorConfig,
    store: &Stores,
    workers: usize,
) -> Result<DrainSummary, RunError> {
    let settle = Duration::from_millis(config.bidding.settle_ms);
    let pool = ThreadPoolBuilder::new().num_threads(workers).build()?;

    let summaries = pool.install(|| {
        (0..workers)
            .into_par_iter()
            .map(|worker| {
                let broker = FsClaimBroker::new(claimant_id(worker), settle);

                RunManager::new(config, store, broker).drain()
            })
            .collect::<Result<Vec<_>, _>>()
    })?;

    Ok(summaries
        .into_iter()
        .fold(DrainSummary::default(), DrainSummary::merge))
}

/// Re-expand orphan archives into the run directory, stripping leftover bid
/// files, so folders of crashed or disconnected runs become claimable again.
pub fn recover_orphans(config: &CoordinatorConfig) -> Result<Vec<String>, RunError> {
    let entries = match fs::read_dir(&config.orphan_dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(error.into()),
    };

    let mut restored = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let name = match path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => continue,
        };
        let key = match archive::key_from_archive_name(&name) {
            Some(key) => key.to_owned(),
            None => continue,
        };

        let target = config.run_dir.join(&key);
        if target.exists() {
            warn!(key = %key, "Folder already present, leaving the orphan archive in place");
            continue;
        }

        let staging = config.run_dir.join(format!("{key}{STAGING_SUFFIX}"));
        let payload = fs::read(&path)?;
        archive::unpack_to(&payload, &staging)?;

        // leftover bids of the crashed run would block every new claimant
        for entry in fs::read_dir(&staging)? {
            let leftover = entry?.path();
            if leftover.extension().map(|ext| ext == BID_EXTENSION) == Some(true) {
                fs::remove_file(&leftover)?;
            }
        }

        fs::rename(&staging, &target)?;
        fs::remove_file(&path)?;
        info!(key = %key, "Restored orphaned job folder");
        restored.push(key);
    }

    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{fake_executable, BidConfig, RetryConfig, StoreConfig},
        database::memory::MemoryStore,
        dedup::CompareSpec,
        record::flat_row,
    };
    use std::collections::BTreeMap;

    fn test_config(dir: &Path, script: &str) -> CoordinatorConfig {
        let exec = fake_executable(dir, "solver.sh", script);

        let mut styles = BTreeMap::new();
        styles.insert(
            "relax".to_owned(),
            StyleConfig {
                exec,
                params: Vec::new(),
                timeout: 60,
                axes: Default::default(),
                compare: CompareSpec::default(),
                parents: Vec::new(),
                resources: None,
                require: Vec::new(),
            },
        );

        CoordinatorConfig {
            run_dir: dir.join("run"),
            orphan_dir: dir.join("orphans"),
            hold_dir: dir.join("hold"),
            resource_dir: None,
            database: StoreConfig::Memory,
            styles,
            bidding: BidConfig {
                settle_ms: 5,
                max_lost_rounds: 2,
            },
            retry: RetryConfig {
                record_attempts: 2,
                delete_attempts: 2,
                delete_backoff_ms: 1,
            },
        }
    }

    fn manager<'a>(
        config: &'a CoordinatorConfig,
        store: &'a Stores,
    ) -> RunManager<'a, FsClaimBroker> {
        let broker = FsClaimBroker::new(claimant_id(0), Duration::from_millis(5));

        RunManager::new(config, store, broker)
    }

    /// job folder plus matching record, built the way the preparer would
    fn seed_job(config: &CoordinatorConfig, store: &Stores, key: &str) {
        let input: BTreeMap<String, serde_yaml::Value> =
            [("prototype".to_owned(), Value::String("fcc".to_owned()))]
                .into_iter()
                .collect();

        let folder = config.run_dir.join(key);
        fs::create_dir_all(&folder).unwrap();
        InputFile {
            key: key.to_owned(),
            style: "relax".to_owned(),
            parameters: input.clone(),
        }
        .to_yaml_file(&folder.join(INPUT_FILE_NAME))
        .unwrap();

        store
            .add_record(&JobRecord::provisional(
                key.to_owned(),
                "relax".to_owned(),
                input,
            ))
            .unwrap();
    }

    fn snapshot(config: &CoordinatorConfig, key: &str, parent: &JobRecord) {
        parent
            .to_yaml_file(
                &config
                    .run_dir
                    .join(key)
                    .join(format!("{}.{SNAPSHOT_EXTENSION}", parent.key)),
            )
            .unwrap();
    }

    #[test]
    fn executes_and_records_success() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), "echo 'energy: -1.5'");
        let store = Stores::Memory(MemoryStore::new());
        seed_job(&config, &store, "job-a");

        let outcome = manager(&config, &store).run_key("job-a").unwrap();
        assert_eq!(outcome, RunOutcome::Executed(JobStatus::Finished));

        let record = store.get_record("relax", "job-a").unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Finished);
        let result = record.result.unwrap();
        assert_eq!(result.get("energy"), Some(&Value::from(-1.5)));

        // folder drained, archive uploaded
        assert!(!config.run_dir.join("job-a").exists());
        assert!(!store.get_archive("job-a").unwrap().is_empty());
    }

    #[test]
    fn failing_job_records_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), "echo 'solver blew up' >&2; exit 3");
        let store = Stores::Memory(MemoryStore::new());
        seed_job(&config, &store, "job-a");

        let outcome = manager(&config, &store).run_key("job-a").unwrap();
        assert_eq!(outcome, RunOutcome::Executed(JobStatus::Error));

        let record = store.get_record("relax", "job-a").unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Error);
        let message = record.error_message.unwrap();
        assert!(message.contains("solver blew up"), "{message}");
    }

    #[test]
    fn failed_parent_gates_execution() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("executed.marker");
        let config = test_config(dir.path(), &format!("touch {}", marker.display()));
        let store = Stores::Memory(MemoryStore::new());
        seed_job(&config, &store, "job-a");

        let mut parent =
            JobRecord::provisional("p1".to_owned(), "relax".to_owned(), BTreeMap::new());
        parent.fail("upstream crash".to_owned());
        snapshot(&config, "job-a", &parent);

        let outcome = manager(&config, &store).run_key("job-a").unwrap();
        assert_eq!(outcome, RunOutcome::Executed(JobStatus::Error));

        let record = store.get_record("relax", "job-a").unwrap().unwrap();
        assert!(record.error_message.unwrap().contains("p1"));
        // the external program must never have run
        assert!(!marker.exists());
    }

    #[test]
    fn pending_parent_defers_then_runs() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), "echo done");
        let store = Stores::Memory(MemoryStore::new());
        seed_job(&config, &store, "job-a");

        let parent =
            JobRecord::provisional("p1".to_owned(), "relax".to_owned(), BTreeMap::new());
        store.add_record(&parent).unwrap();
        snapshot(&config, "job-a", &parent);

        let runner = manager(&config, &store);
        assert_eq!(
            runner.run_key("job-a").unwrap(),
            RunOutcome::ParentPending {
                parent: "p1".to_owned()
            }
        );

        // deferred folder is left untouched, without residual bids
        let folder = config.run_dir.join("job-a");
        assert!(folder.join(INPUT_FILE_NAME).is_file());
        assert!(!fs::read_dir(&folder).unwrap().any(|entry| {
            entry.unwrap().path().extension().map(|ext| ext == BID_EXTENSION) == Some(true)
        }));

        // once the parent finishes, the job goes through
        let mut parent = store.get_record("relax", "p1").unwrap().unwrap();
        parent.finish(Value::Null);
        store.update_record(&parent).unwrap();

        assert_eq!(
            runner.run_key("job-a").unwrap(),
            RunOutcome::Executed(JobStatus::Finished)
        );
    }

    #[test]
    fn stale_snapshot_is_refreshed_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), "echo done");
        let store = Stores::Memory(MemoryStore::new());
        seed_job(&config, &store, "job-a");

        // snapshot still says not calculated, the store already knows better
        let parent =
            JobRecord::provisional("p1".to_owned(), "relax".to_owned(), BTreeMap::new());
        snapshot(&config, "job-a", &parent);
        let mut finished = parent;
        finished.finish(Value::from(-2.0));
        store.add_record(&finished).unwrap();

        assert_eq!(
            manager(&config, &store).run_key("job-a").unwrap(),
            RunOutcome::Executed(JobStatus::Finished)
        );
    }

    #[test]
    fn cleanup_deletes_bids_last() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), "exit 0");
        let store = Stores::Memory(MemoryStore::new());

        let folder = config.run_dir.join("job-a");
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join("input.yaml"), "").unwrap();
        fs::write(folder.join("output.log"), "").unwrap();
        fs::write(folder.join("7.bid"), "").unwrap();
        fs::write(folder.join("9.bid"), "").unwrap();

        let order = manager(&config, &store).cleanup(&folder).unwrap();
        assert_eq!(order.len(), 4);
        assert!(!folder.exists());

        let first_bid = order
            .iter()
            .position(|path| path.extension().map(|ext| ext == BID_EXTENSION) == Some(true))
            .unwrap();
        // every non-bid entry went first
        assert_eq!(first_bid, 2);
    }

    #[test]
    fn malformed_folder_is_orphaned_and_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), "exit 0");
        let store = Stores::Memory(MemoryStore::new());

        // input present but no record in the store
        let folder = config.run_dir.join("stray");
        fs::create_dir_all(&folder).unwrap();
        InputFile {
            key: "stray".to_owned(),
            style: "relax".to_owned(),
            parameters: BTreeMap::new(),
        }
        .to_yaml_file(&folder.join(INPUT_FILE_NAME))
        .unwrap();

        let outcome = manager(&config, &store).run_key("stray").unwrap();
        assert_eq!(outcome, RunOutcome::Orphaned);
        assert!(!folder.exists());
        assert!(config.orphan_dir.join("stray.tar.gz").is_file());

        // recovery restores the folder and strips the leftover claim marker
        let restored = recover_orphans(&config).unwrap();
        assert_eq!(restored, vec!["stray".to_owned()]);
        assert!(folder.join(INPUT_FILE_NAME).is_file());
        assert!(!fs::read_dir(&folder).unwrap().any(|entry| {
            entry.unwrap().path().extension().map(|ext| ext == BID_EXTENSION) == Some(true)
        }));
        assert!(!config.orphan_dir.join("stray.tar.gz").exists());
    }

    #[test]
    fn missing_input_is_orphaned() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), "exit 0");
        let store = Stores::Memory(MemoryStore::new());

        let folder = config.run_dir.join("junk");
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join("leftover.dat"), "noise").unwrap();

        assert_eq!(
            manager(&config, &store).run_key("junk").unwrap(),
            RunOutcome::Orphaned
        );
        assert!(config.orphan_dir.join("junk.tar.gz").is_file());
    }

    #[test]
    fn existing_bid_loses_the_round() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), "exit 0");
        let store = Stores::Memory(MemoryStore::new());
        seed_job(&config, &store, "job-a");

        fs::write(config.run_dir.join("job-a").join("1.bid"), []).unwrap();

        assert_eq!(
            manager(&config, &store).run_key("job-a").unwrap(),
            RunOutcome::Lost
        );
        // the record is untouched
        let record = store.get_record("relax", "job-a").unwrap().unwrap();
        assert_eq!(record.status, JobStatus::NotCalculated);
    }

    #[test]
    fn drain_empties_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), "echo 'energy: -1.0'");
        let store = Stores::Memory(MemoryStore::new());
        seed_job(&config, &store, "job-a");
        seed_job(&config, &store, "job-b");

        let summary = manager(&config, &store).drain().unwrap();
        assert_eq!(summary.executed, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.orphaned, 0);

        assert!(fs::read_dir(&config.run_dir).unwrap().next().is_none());
        for key in ["job-a", "job-b"] {
            let record = store.get_record("relax", key).unwrap().unwrap();
            assert_eq!(record.status, JobStatus::Finished);
        }
    }

    #[test]
    fn drain_follows_pending_parents() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), "echo done");
        let store = Stores::Memory(MemoryStore::new());

        // child depends on a parent whose folder is also still in the run dir
        seed_job(&config, &store, "parent-p");
        seed_job(&config, &store, "child-c");
        let parent = store.get_record("relax", "parent-p").unwrap().unwrap();
        snapshot(&config, "child-c", &parent);

        let summary = manager(&config, &store).drain().unwrap();
        // both ran, regardless of which folder the random pick hit first
        assert_eq!(summary.executed, 2);
        assert!(fs::read_dir(&config.run_dir).unwrap().next().is_none());
    }

    #[test]
    fn parallel_drain_executes_every_job_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), "echo 'energy: -1.0'");
        let store = Stores::Memory(MemoryStore::new());
        for index in 0..6 {
            seed_job(&config, &store, &format!("job-{index}"));
        }

        let summary = drain_parallel(&config, &store, 3).unwrap();
        assert_eq!(summary.executed, 6);

        assert!(fs::read_dir(&config.run_dir).unwrap().next().is_none());
        for index in 0..6 {
            let record = store
                .get_record("relax", &format!("job-{index}"))
                .unwrap()
                .unwrap();
            assert_eq!(record.status, JobStatus::Finished);
        }
    }

    #[test]
    fn worker_claimant_ids_are_distinct() {
        assert_ne!(claimant_id(0), claimant_id(1));
        // relative order between processes survives the worker offset
        assert!(claimant_id(0) < claimant_id(1));
    }

    #[test]
    fn flat_row_helper_matches_record_flattening() {
        let input: BTreeMap<String, Value> =
            [("prototype".to_owned(), Value::String("fcc".to_owned()))]
                .into_iter()
                .collect();
        let record = JobRecord::provisional("k".to_owned(), "relax".to_owned(), input.clone());

        assert_eq!(record.flat(), flat_row("relax", &input));
    }
}
