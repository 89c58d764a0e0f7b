use anyhow::{Context, Result};
use clap::Parser;

use vmkitd::Vmkitd;

#[derive(Parser)]
#[command(name = "vmkitd", about = "Single-host control plane for OCI-image-backed Cloud Hypervisor microVMs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Load config, recover state, and run until signalled to stop.
    Serve {
        /// Path to the TOML configuration file.
        #[arg(long, default_value = "/etc/vmkitd/config.toml")]
        config: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .init();

    match cli.command {
        Command::Serve { config } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(serve(&config))
        }
    }
}

async fn serve(config_path: &str) -> Result<()> {
    let config = vmkit_core::config::Config::load(std::path::Path::new(config_path))
        .await
        .with_context(|| format!("loading config from {config_path}"))?;

    let vmkitd = Vmkitd::bootstrap(config).await.context("bootstrapping vmkitd")?;
    tracing::info!(builds_enabled = vmkitd.builds().is_ok(), "vmkitd ready");

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    tracing::info!("vmkitd shutting down");
    Ok(())
}
