use clap::{Arg, ArgMatches, Command};
use std::time::Duration;

use crate::policy::AdmissionPolicy;

pub const NAME: &str = "prune";
pub const ARG_RETENTION_SECONDS: &str = "retention-seconds";

#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub retention: Duration,
    pub policy: AdmissionPolicy,
}

impl Options {
    /// Parse prune arguments from the subcommand matches.
    ///
    /// # Errors
    /// Returns an error if an argument is missing.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let read = |id: &str| -> anyhow::Result<u64> {
            matches
                .get_one::<u64>(id)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("missing required argument: --{id}"))
        };

        let window = Duration::from_secs(read("window-seconds")?);
        let policy = AdmissionPolicy::new()
            .with_account_limit(5, window)
            .with_origin_limit(20, window)
            .with_lockout_duration(Duration::from_secs(read("lockout-seconds")?))
            .normalize();

        Ok(Self {
            retention: Duration::from_secs(read(ARG_RETENTION_SECONDS)?),
            policy,
        })
    }

    /// Retention actually applied: never shorter than what admission needs.
    #[must_use]
    pub fn effective_retention(&self) -> Duration {
        self.retention.max(self.policy.retention_floor())
    }
}

#[must_use]
pub fn command() -> Command {
    Command::new(NAME)
        .about("Delete auth events and throttle hits past the retention horizon")
        .arg(
            Arg::new(ARG_RETENTION_SECONDS)
                .long(ARG_RETENTION_SECONDS)
                .help("Keep history for this many seconds (raised to the lockout window if shorter)")
                .env("GATEKEEP_RETENTION_SECONDS")
                .default_value("2592000")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("window-seconds")
                .long("window-seconds")
                .help("Failure counting window in seconds")
                .env("GATEKEEP_WINDOW_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("lockout-seconds")
                .long("lockout-seconds")
                .help("Lockout duration in seconds")
                .env("GATEKEEP_LOCKOUT_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(u64)),
        )
}
