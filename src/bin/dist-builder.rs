use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use dist_builder::{
    preflight, Action, BuildRequest, DistConfig, DistError, HostExec, Pipeline, Target,
    VerifyRequest,
};

#[derive(Parser)]
#[command(
    name = "dist-builder",
    about = "Build and verify CuPy source distributions and wheels",
    version
)]
struct Args {
    /// Pipeline phase to run
    #[arg(long, value_enum)]
    action: Action,

    /// Distribution to build or verify
    #[arg(long, value_enum)]
    target: Target,

    /// Python version to build or verify for (e.g. 3.10.0)
    #[arg(long)]
    python: String,

    /// CUDA (or ROCm) configuration key; required for wheels
    #[arg(long)]
    cuda: Option<String>,

    /// Directory holding the NCCL archives named in the configuration
    #[arg(long, value_name = "DIR")]
    nccl_assets: Option<PathBuf>,

    /// Source checkout to build from
    #[arg(long, value_name = "DIR")]
    source: Option<PathBuf>,

    /// Directory to place the built distribution in
    #[arg(long, value_name = "DIR", default_value = ".")]
    output: PathBuf,

    /// Distribution file to verify
    #[arg(long, value_name = "FILE")]
    dist: Option<PathBuf>,

    /// Test directory to run against the distribution (repeatable)
    #[arg(long = "test", value_name = "DIR")]
    tests: Vec<PathBuf>,

    /// Release configuration (defaults to the built-in table)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

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

    let config = DistConfig::load(args.config.as_deref())?;
    let tools =
        preflight::required_tools(&config, args.action, args.target, args.cuda.as_deref())?;
    preflight::check_required_tools(&tools)?;

    // builder/, verifier/ and the library installer are resolved from here.
    let driver_root = std::env::current_dir().context("reading current directory")?;
    let exec = HostExec;
    let pipeline = Pipeline::new(&config, &exec, driver_root);

    match args.action {
        Action::Build => {
            let source = args
                .source
                .ok_or_else(|| DistError::config("--source must be specified to build"))?;
            let request = BuildRequest {
                target: args.target,
                cuda: args.cuda,
                python: args.python,
                nccl_assets: args.nccl_assets,
                source,
                output: args.output,
            };
            let artifact = pipeline.build(&request)?;
            info!("distribution written to {}", artifact.display());
        }
        Action::Verify => {
            let dist = args
                .dist
                .ok_or_else(|| DistError::config("--dist must be specified to verify"))?;
            if args.tests.is_empty() {
                return Err(DistError::config("--test must be specified to verify").into());
            }
            let request = VerifyRequest {
                target: args.target,
                cuda: args.cuda,
                python: args.python,
                nccl_assets: args.nccl_assets,
                dist,
                tests: args.tests,
            };
            pipeline.verify(&request)?;
            info!("verification passed");
        }
    }
    Ok(())
}
