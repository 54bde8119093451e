//! lmi-jobs CLI: inspect a profile's persisted jobs.
//!
//! Logging: set `RUST_LOG=lmi_jobs=debug` (or pass `--verbose`) for details on stderr.

mod cli;

use anyhow::{Context, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use lmi_jobs::config::load_runtime_settings;
use lmi_jobs::{JobManagerConfig, JobStorage};

use crate::cli::{Cli, Command};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if cli.verbose {
            "lmi_jobs=debug"
        } else {
            "lmi_jobs=info"
        })
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let settings = load_runtime_settings(cli.conf.as_deref());
    let storage_for = |profile: &str| {
        let config = JobManagerConfig::from_settings(profile, &settings);
        let root = cli.storage_root.clone().unwrap_or(config.storage_root);
        JobStorage::for_profile(&root, profile)
    };

    match &cli.command {
        Command::List { profile } => {
            let storage = storage_for(profile);
            let jobs = storage.load_all()?;
            if jobs.is_empty() {
                println!("no persisted jobs in {}", storage.dir().display());
                return Ok(());
            }
            println!(
                "{:>6}  {:<28}  {:<10}  {:>8}  {:>4}  NAME",
                "NUMBER", "TYPE", "STATE", "PRIORITY", "%"
            );
            for job in jobs {
                println!(
                    "{:>6}  {:<28}  {:<10}  {:>8}  {:>4}  {}",
                    job.number,
                    job.job_type.to_string(),
                    job.state.to_string(),
                    job.priority,
                    job.percent_complete,
                    job.name
                );
            }
            Ok(())
        }
        Command::Show { profile, number } => {
            let storage = storage_for(profile);
            let Some(file) = storage.list()?.into_iter().find(|f| f.number == *number) else {
                bail!("job {number} not found in {}", storage.dir().display());
            };
            let job = storage.load(&file)?;
            let json = serde_json::to_string_pretty(&job).context("failed to render job")?;
            println!("{json}");
            Ok(())
        }
    }
}
