use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;

use crate::reconcile::ReconcileConfig;

pub const NAME: &str = "sweep";
pub const ARG_STORAGE_ROOT: &str = "storage-root";
pub const ARG_ONCE: &str = "once";

#[derive(Debug, Clone)]
pub struct Options {
    pub storage_root: PathBuf,
    pub once: bool,
    pub config: ReconcileConfig,
}

impl Options {
    /// Parse sweep arguments from the subcommand matches.
    ///
    /// # Errors
    /// Returns an error if the storage root is missing.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let storage_root = matches
            .get_one::<String>(ARG_STORAGE_ROOT)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| anyhow::anyhow!("missing required argument: --{ARG_STORAGE_ROOT}"))?;

        let read_u64 = |id: &str, default: u64| matches.get_one::<u64>(id).copied().unwrap_or(default);

        let config = ReconcileConfig::new()
            .with_poll_interval_seconds(read_u64("poll-seconds", 30))
            .with_batch_size(matches.get_one::<usize>("batch-size").copied().unwrap_or(100))
            .with_max_attempts(matches.get_one::<u32>("max-attempts").copied().unwrap_or(8))
            .with_backoff_base_seconds(read_u64("backoff-base-seconds", 30))
            .with_backoff_max_seconds(read_u64("backoff-max-seconds", 3600))
            .normalize();

        Ok(Self {
            storage_root,
            once: matches.get_flag(ARG_ONCE),
            config,
        })
    }
}

#[must_use]
pub fn command() -> Command {
    Command::new(NAME)
        .about("Retry removal of artifacts left behind by purges")
        .arg(
            Arg::new(ARG_STORAGE_ROOT)
                .long(ARG_STORAGE_ROOT)
                .help("Root directory of the object store")
                .env("GATEKEEP_STORAGE_ROOT")
                .required(true),
        )
        .arg(
            Arg::new(ARG_ONCE)
                .long(ARG_ONCE)
                .help("Sweep a single batch and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("poll-seconds")
                .long("poll-seconds")
                .help("Reconciliation poll interval in seconds")
                .env("GATEKEEP_SWEEP_POLL_SECONDS")
                .default_value("30")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("batch-size")
                .long("batch-size")
                .help("Artifacts claimed per poll")
                .env("GATEKEEP_SWEEP_BATCH_SIZE")
                .default_value("100")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("max-attempts")
                .long("max-attempts")
                .help("Attempts before an artifact is marked abandoned")
                .env("GATEKEEP_SWEEP_MAX_ATTEMPTS")
                .default_value("8")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("backoff-base-seconds")
                .long("backoff-base-seconds")
                .help("Base delay for retry backoff")
                .env("GATEKEEP_SWEEP_BACKOFF_BASE_SECONDS")
                .default_value("30")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("backoff-max-seconds")
                .long("backoff-max-seconds")
                .help("Max delay for retry backoff")
                .env("GATEKEEP_SWEEP_BACKOFF_MAX_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(u64)),
        )
}
