//! Preflight checks for distribution runs.
//!
//! Validates that the host has every external tool the requested action will
//! invoke, so a run does not fail halfway through after building images.
//!
//! # Example
//!
//! ```rust,ignore
//! use dist_builder::preflight::{check_required_tools, required_tools};
//!
//! let tools = required_tools(&config, Action::Build, Target::WheelLinux, Some("12.x"))?;
//! check_required_tools(&tools)?;
//! ```

use anyhow::{bail, Result};

use crate::config::{DistConfig, NcclConfig};
use crate::error::DistError;
use crate::target::{AcceleratorKind, Action, Target};

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Host tool needed by a run: `(command, where to get it)`.
pub type Tool = (&'static str, &'static str);

const DOCKER: Tool = ("docker", "docker");
const NVIDIA_DOCKER: Tool = ("nvidia-docker", "nvidia-container-toolkit");
const CURL: Tool = ("curl", "curl");
const TAR: Tool = ("tar", "tar");
const DPKG: Tool = ("dpkg", "dpkg");

fn nccl_tools(nccl: Option<&NcclConfig>) -> Vec<Tool> {
    match nccl {
        Some(NcclConfig::V1Deb { .. }) => vec![DPKG],
        Some(NcclConfig::V2Tar { .. }) => vec![TAR],
        None => Vec::new(),
    }
}

/// Tools invoked by `action` on `target`.
pub fn required_tools(
    config: &DistConfig,
    action: Action,
    target: Target,
    cuda: Option<&str>,
) -> Result<Vec<Tool>, DistError> {
    let mut tools = Vec::new();
    match target {
        Target::Sdist => {
            tools.extend([DOCKER, NVIDIA_DOCKER]);
            if action == Action::Verify {
                tools.extend(nccl_tools(config.sdist.nccl.as_ref()));
            }
        }
        Target::WheelLinux => {
            let cuda = cuda.ok_or_else(|| {
                DistError::config("target wheel-linux requires a CUDA version (--cuda)")
            })?;
            let wheel = config.wheel_linux(cuda)?;
            tools.push(DOCKER);
            if wheel.kind == AcceleratorKind::Cuda {
                tools.push(NVIDIA_DOCKER);
                if action == Action::Build {
                    tools.extend(nccl_tools(wheel.nccl.as_ref()));
                    tools.extend([CURL, TAR]);
                }
            }
        }
        // Off Windows the pipeline's host check rejects the run before any tool is used.
        Target::WheelWin => {
            if action == Action::Build && cfg!(windows) {
                tools.extend([CURL, TAR]);
            }
        }
    }
    let mut unique = Vec::with_capacity(tools.len());
    for tool in tools {
        if !unique.contains(&tool) {
            unique.push(tool);
        }
    }
    Ok(unique)
}

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with list of missing tools and their packages
pub fn check_required_tools(tools: &[Tool]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!(DistError::precondition(format!(
            "missing required host tools:\n{}",
            msg
        )));
    }

    Ok(())
}
