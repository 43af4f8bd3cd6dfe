//! Maps parsed CLI matches to an [`Action`].

use crate::cli::actions::{migrate, prune, sweep, Action};
use crate::cli::commands::{self, database};
use anyhow::{bail, Result};

/// Map validated CLI matches to an action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let database = database::Options::parse(matches)?;

    match matches.subcommand() {
        Some((commands::MIGRATE, _)) => Ok(Action::Migrate(migrate::Args { database })),
        Some((commands::sweep::NAME, sub_m)) => {
            let options = commands::sweep::Options::parse(sub_m)?;
            Ok(Action::Sweep(sweep::Args {
                database,
                storage_root: options.storage_root,
                once: options.once,
                config: options.config,
            }))
        }
        Some((commands::prune::NAME, sub_m)) => {
            let options = commands::prune::Options::parse(sub_m)?;
            Ok(Action::Prune(prune::Args {
                database,
                retention: options.effective_retention(),
            }))
        }
        Some((other, _)) => bail!("unknown subcommand: {other}"),
        None => bail!("missing subcommand"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const DSN: &str = "postgres://gatekeep@localhost:5432/gatekeep";

    #[test]
    fn migrate_action() {
        let matches = commands::new().get_matches_from(vec!["gatekeep", "--dsn", DSN, "migrate"]);
        assert!(matches!(handler(&matches), Ok(Action::Migrate(_))));
    }

    #[test]
    fn prune_action_carries_effective_retention() {
        temp_env::with_vars([("GATEKEEP_RETENTION_SECONDS", None::<&str>)], || {
            let matches = commands::new().get_matches_from(vec![
                "gatekeep",
                "--dsn",
                DSN,
                "prune",
                "--retention-seconds",
                "10",
            ]);
            match handler(&matches) {
                Ok(Action::Prune(args)) => {
                    assert_eq!(args.retention, Duration::from_secs(900));
                    assert_eq!(args.database.dsn, DSN);
                }
                other => panic!("unexpected action: {other:?}"),
            }
        });
    }

    #[test]
    fn sweep_action() {
        let matches = commands::new().get_matches_from(vec![
            "gatekeep",
            "--dsn",
            DSN,
            "sweep",
            "--storage-root",
            "/srv/blobs",
        ]);
        match handler(&matches) {
            Ok(Action::Sweep(args)) => {
                assert!(!args.once);
                assert_eq!(args.storage_root.to_str(), Some("/srv/blobs"));
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }
}
