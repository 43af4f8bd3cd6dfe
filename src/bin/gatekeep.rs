use anyhow::Result;
use gatekeep::cli;

#[tokio::main]
async fn main() -> Result<()> {
    let action = cli::start()?;

    let result = action.execute().await;
    cli::telemetry::shutdown_tracer();

    result
}
