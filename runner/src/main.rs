mod archive;
mod claim;
mod config;
mod database;
mod dedup;
mod manager;
mod prepare;
mod record;
mod styles;
mod template;

use crate::{
    claim::FsClaimBroker,
    config::CoordinatorConfig,
    database::Stores,
    manager::{claimant_id, RunManager},
    prepare::Preparer,
    template::BuilderRegistry,
};
use clap::{Parser, Subcommand};
use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "simforge-runner")]
#[command(version, about = "Prepares and drains batches of external compute jobs")]
struct Cli {
    /// coordinator configuration file
    #[arg(short, long, default_value = "coordinator.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Expand styles into job folders and provisional records
    Prepare {
        /// styles to prepare, in order
        #[arg(required = true)]
        styles: Vec<String>,

        /// surface the first candidate construction error instead of dropping it
        #[arg(long)]
        debug: bool,
    },
    /// Drain the shared run directory until it is empty or contested
    Run {
        /// number of in-process managers bidding under distinct claimant ids
        #[arg(long, default_value_t = 1)]
        workers: usize,

        /// run a single job folder instead of draining
        #[arg(long)]
        key: Option<String>,
    },
    /// Re-expand orphan archives into the run directory
    RecoverOrphans,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config = match CoordinatorConfig::load(&cli.config) {
        Ok(config) => config,
        Err(error) => {
            error!(path = ?cli.config, error = %error, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let builders = Arc::new(BuilderRegistry::default());
    if config.preflight_checks(&builders) {
        error!("Configuration did not pass the preflight checks");
        return ExitCode::FAILURE;
    }

    let store = match Stores::load(&config.database) {
        Ok(store) => store,
        Err(error) => {
            error!(error = %error, "Failed to open the record store");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Prepare { styles, debug } => {
            let registry = crate::styles::registry_from_config(&config, builders);
            let preparer = Preparer::new(&config, &store, &registry, debug);

            for style in styles {
                match preparer.prepare_style(&style) {
                    Ok(keys) => info!(style = %style, new = keys.len(), "Prepared style"),
                    Err(error) => {
                        error!(style = %style, error = %error, "Preparation failed");
                        return ExitCode::FAILURE;
                    }
                }
            }
        }
        Command::Run { workers, key } => {
            let settle = Duration::from_millis(config.bidding.settle_ms);

            let result = match key {
                Some(key) => {
                    let broker = FsClaimBroker::new(claimant_id(0), settle);

                    RunManager::new(&config, &store, broker)
                        .run_key(&key)
                        .map(|outcome| info!(key = %key, outcome = ?outcome, "Run round finished"))
                }
                None if workers <= 1 => {
                    let broker = FsClaimBroker::new(claimant_id(0), settle);

                    RunManager::new(&config, &store, broker)
                        .drain()
                        .map(|summary| info!(summary = ?summary, "Drain finished"))
                }
                None => manager::drain_parallel(&config, &store, workers)
                    .map(|summary| info!(summary = ?summary, "Drain finished")),
            };

            if let Err(error) = result {
                error!(error = %error, "Run failed");
                return ExitCode::FAILURE;
            }
        }
        Command::RecoverOrphans => match manager::recover_orphans(&config) {
            Ok(restored) => info!(restored = restored.len(), "Recovered orphan archives"),
            Err(error) => {
                error!(error = %error, "Orphan recovery failed");
                return ExitCode::FAILURE;
            }
        },
    }

    ExitCode::SUCCESS
}
