use crate::cli::{commands::database, database::connect};
use crate::schema;
use anyhow::Result;

#[derive(Debug)]
pub struct Args {
    pub database: database::Options,
}

/// Apply the embedded schema.
/// # Errors
/// Returns an error if the database is unreachable or a statement fails.
pub async fn execute(args: Args) -> Result<()> {
    let pool = connect(&args.database).await?;
    schema::apply(&pool).await?;
    pool.close().await;
    Ok(())
}
