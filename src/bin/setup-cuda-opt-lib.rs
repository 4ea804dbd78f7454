use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use dist_builder::merge::{install_all, InstallOutcome};
use dist_builder::Platform;

/// Install cuTENSOR, NCCL and cuDNN trees fetched by the library installer
/// into a CUDA installation.
#[derive(Parser)]
#[command(name = "setup-cuda-opt-lib", version)]
struct Args {
    /// Library installer output (`<cuda>/<library>/<version>/...`)
    #[arg(long, value_name = "DIR")]
    src: PathBuf,

    /// CUDA installation to install into
    #[arg(long, value_name = "DIR")]
    dst: PathBuf,

    /// Directory layout to follow (defaults to the host platform)
    #[arg(long, value_enum)]
    platform: Option<Platform>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let platform = match args.platform {
        Some(platform) => platform,
        None => Platform::host()?,
    };
    let outcomes = install_all(platform, &args.src, &args.dst)?;
    let installed = outcomes
        .iter()
        .filter(|(_, outcome)| matches!(outcome, InstallOutcome::Installed(_)))
        .map(|(name, _)| *name)
        .collect::<Vec<_>>();
    info!("installed: [{}]", installed.join(", "));
    Ok(())
}
