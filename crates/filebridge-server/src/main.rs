//! Filebridge server binary
//!
//! Serves the bridge as JSON lines on stdin/stdout. Logs go to stderr.
//!
//! ## Usage
//!
//! ```bash
//! filebridge-server --config bridge.toml
//! echo '{"id":1,"op":"list_storages"}' | filebridge-server
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use filebridge_server::{ServerConfig, serve, start};
use tokio::io::BufReader;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "filebridge-server", version, about = "Virtual file-operation bridge over JSON lines")]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter (overrides RUST_LOG), e.g. "debug" or "filebridge_kernel=trace"
    #[arg(long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = match &args.log {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    let bridge = start(&config).await?;

    serve(
        bridge,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await?;
    Ok(())
}
