//
// main.rs
// radifox
//
// Tokio entry point: sets up logging, then hands off execution to the CLI layer.
//
// Thales Matheus Mendonça Santos - October 2026

use clap::Parser;
use radifox::cli::{self, Cli};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins; otherwise info, or debug with --verbose.
    let default_filter = if cli.verbose { "radifox=debug" } else { "radifox=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    cli::run(cli).await
}
