use anyhow::Result;
use clap::Parser;
use order_escalation::cli::{self, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    cli::run(Cli::parse()).await
}
