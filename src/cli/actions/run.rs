use crate::cli::actions::{migrate, prune, sweep, Action};
use anyhow::Result;

/// Single dispatch point for all CLI actions.
/// # Errors
/// Returns an error if the action fails.
pub async fn execute(action: Action) -> Result<()> {
    match action {
        Action::Migrate(args) => migrate::execute(args).await,
        Action::Sweep(args) => sweep::execute(args).await,
        Action::Prune(args) => prune::execute(args).await,
    }
}
