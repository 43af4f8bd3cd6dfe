use anyhow::{anyhow, Context, Result};
use secrecy::{ExposeSecret, SecretString};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::cli::commands::database::Options;

/// Inject `password` into `dsn`, replacing any password already present.
fn dsn_with_password(dsn: &str, password: Option<&SecretString>) -> Result<String> {
    let Some(password) = password else {
        return Ok(dsn.to_string());
    };

    let mut dsn = Url::parse(dsn).context("invalid database DSN")?;
    dsn.set_password(Some(password.expose_secret()))
        .map_err(|()| anyhow!("Error setting password"))?;
    Ok(dsn.to_string())
}

/// Open a connection pool for a CLI action.
///
/// # Errors
/// Returns an error if the DSN is invalid or the database is unreachable.
pub async fn connect(options: &Options) -> Result<PgPool> {
    let dsn = dsn_with_password(&options.dsn, options.password.as_ref())?;

    let pool = PgPoolOptions::new()
        .max_connections(options.max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&dsn)
        .await
        .context("Failed to connect to database")?;

    debug!(max_connections = options.max_connections, "database pool ready");
    Ok(pool)
}
