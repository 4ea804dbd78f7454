//! Running external tools.
//!
//! Every package manager, container runtime and archive tool call goes through
//! [`Exec`], so a pipeline can be driven against a recording fake in tests.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::info;

use crate::error::DistError;

pub trait Exec {
    /// Run to completion with inherited stdio; non-zero exit is an error.
    fn run(&self, cmd: &mut Command) -> Result<()>;

    /// Run to completion and return captured stdout; non-zero exit is an error.
    fn output(&self, cmd: &mut Command) -> Result<Vec<u8>>;
}

/// Executes commands on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostExec;

impl Exec for HostExec {
    fn run(&self, cmd: &mut Command) -> Result<()> {
        let line = describe(cmd);
        info!("running command: {line}");
        let status = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .with_context(|| format!("spawning `{line}`"))?;
        if !status.success() {
            return Err(DistError::ToolFailed {
                command: line,
                status,
            }
            .into());
        }
        Ok(())
    }

    fn output(&self, cmd: &mut Command) -> Result<Vec<u8>> {
        let line = describe(cmd);
        info!("running command: {line}");
        let output = cmd
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .with_context(|| format!("spawning `{line}`"))?;
        if !output.status.success() {
            return Err(DistError::ToolFailed {
                command: line,
                status: output.status,
            }
            .into());
        }
        Ok(output.stdout)
    }
}

/// Render a command as a single shell-like line for logs and errors.
pub fn describe(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().into_owned()));
    let line = parts.join(" ");
    match cmd.get_current_dir() {
        Some(dir) => format!("{line} (in {})", dir.display()),
        None => line,
    }
}

/// `uid:gid` of the current user, used to hand container output back to us.
#[cfg(unix)]
pub fn owner_spec() -> String {
    // SAFETY: getuid/getgid cannot fail and have no preconditions.
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    format!("{uid}:{gid}")
}

#[cfg(not(unix))]
pub fn owner_spec() -> String {
    "0:0".to_string()
}

/// Command for `program`, run inside `dir` when given.
pub fn command(program: impl AsRef<std::ffi::OsStr>, dir: Option<&Path>) -> Command {
    let mut cmd = Command::new(program);
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    cmd
}
