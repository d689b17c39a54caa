use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use schedsync_core::{CoordinateFilter, Phase};
use schedsync_sync::{RunMode, SyncConfig, SyncError, Synchronizer};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "schedsync")]
#[command(about = "Updates the schedule file to match the latest upstream information")]
struct Cli {
    /// Schedule file to update in place (defaults to SCHEDSYNC_SCHEDULE_FILE or schedule.json).
    #[arg(long = "json-update-file")]
    json_update_file: Option<PathBuf>,

    /// Rebuild the entire schedule from scratch.
    #[arg(long, conflicts_with = "build_old")]
    rebuild: bool,

    /// Build the schedule for seasons before 2009 from a directory of downloaded week files.
    #[arg(long = "build-old", value_name = "DIR")]
    build_old: Option<PathBuf>,

    /// Force the update to a specific year.
    #[arg(long, conflicts_with_all = ["rebuild", "build_old"])]
    year: Option<i32>,

    /// Force the update to a specific phase (PRE, REG or POST).
    #[arg(long, conflicts_with_all = ["rebuild", "build_old"])]
    phase: Option<Phase>,

    /// Force the update to a specific week.
    #[arg(long, conflicts_with_all = ["rebuild", "build_old"])]
    week: Option<u32>,
}

impl Cli {
    fn mode(&self) -> RunMode {
        if self.rebuild {
            RunMode::Rebuild
        } else if let Some(directory) = &self.build_old {
            RunMode::Backfill {
                directory: directory.clone(),
            }
        } else {
            RunMode::Incremental {
                filter: CoordinateFilter {
                    year: self.year,
                    phase: self.phase,
                    week: self.week,
                },
            }
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if let Some(path) = &cli.json_update_file {
        config.schedule_path = path.clone();
    }
    tracing::debug!(?config, "loaded configuration");
    let schedule_path = config.schedule_path.clone();
    let synchronizer = Synchronizer::new(config).context("setting up synchronizer")?;

    match synchronizer.run(&cli.mode()).await {
        Ok(summary) => {
            println!(
                "sync complete: run_id={} mode={} coordinates={} upserted={} unavailable={} malformed={} records={} file={}",
                summary.run_id,
                summary.mode,
                summary.stats.coordinates,
                summary.stats.upserted(),
                summary.stats.unavailable.len(),
                summary.stats.malformed.len(),
                summary.total_records,
                summary.schedule_path.display()
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(SyncError::Permission(err)) => {
            eprintln!("I do not have write access to \"{}\".", schedule_path.display());
            eprintln!("Without write access, I cannot update the schedule. ({})", err.reason);
            Ok(ExitCode::FAILURE)
        }
        Err(err) => Err(err).with_context(|| format!("updating {}", schedule_path.display())),
    }
}
