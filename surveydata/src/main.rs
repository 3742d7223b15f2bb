use anyhow::Result;
use clap::Parser;
use surveydata::cli::{run, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment (credentials live here, never in the config file).
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt::init();
    tracing::info!("CLI startup: tracing initialised, environment loaded");

    let cli = Cli::parse();
    let result = run(cli).await;
    match &result {
        Ok(_) => tracing::info!("CLI completed successfully"),
        Err(e) => tracing::error!(error = %e, "CLI exited with error"),
    }
    result
}
