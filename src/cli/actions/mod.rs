pub mod migrate;
pub mod prune;
pub mod sweep;

// Interpreter for `Action`, kept apart so this module only declares variants.
mod run;

#[derive(Debug)]
pub enum Action {
    Migrate(migrate::Args),
    Sweep(sweep::Args),
    Prune(prune::Args),
}

impl Action {
    /// Execute the action.
    /// # Errors
    /// Returns an error if the action fails.
    pub async fn execute(self) -> anyhow::Result<()> {
        run::execute(self).await
    }
}
