use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::{Version3, WheelWindowsConfig};
use crate::error::DistError;
use crate::process::{command, Exec};

/// Facts about the machine a non-isolated (Windows) build runs on.
#[derive(Debug, Clone, Default)]
pub struct HostEnv {
    pub os: String,
    /// Version of the interpreter that will run the agent.
    pub python_version: Option<String>,
    /// `$CUDA_PATH`, the toolkit that cuDNN gets installed into.
    pub cuda_path: Option<PathBuf>,
    pub cuda_runtime: Option<Version3>,
    /// Directories of `$PATH`, in order.
    pub search_path: Vec<PathBuf>,
}

#[derive(Deserialize)]
struct CudaVersionJson {
    cuda: Option<ComponentVersion>,
    cuda_cudart: Option<ComponentVersion>,
}

#[derive(Deserialize)]
struct ComponentVersion {
    version: String,
}

impl HostEnv {
    /// Inspect the running host. Probes that fail leave their field empty.
    pub fn detect(exec: &dyn Exec, python: &str) -> Self {
        let cuda_path = env::var_os("CUDA_PATH").map(PathBuf::from);
        let search_path = env::var_os("PATH")
            .map(|p| env::split_paths(&p).collect())
            .unwrap_or_default();
        let cuda_runtime = cuda_path
            .as_deref()
            .and_then(runtime_from_version_json)
            .or_else(|| runtime_from_nvcc(exec));

        Self {
            os: env::consts::OS.to_string(),
            python_version: python_version(exec, python),
            cuda_path,
            cuda_runtime,
            search_path,
        }
    }

    /// First `$PATH` entry containing `name`.
    pub fn find_file(&self, name: &str) -> Option<PathBuf> {
        self.search_path
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
    }

    /// Refuse to build/verify a Windows wheel on a host that cannot produce it.
    pub fn check_windows(
        &self,
        wheel: &WheelWindowsConfig,
        cuda: &str,
        python: &str,
    ) -> Result<(), DistError> {
        if self.os != "windows" {
            return Err(DistError::precondition(format!(
                "you are on non-Windows system: {}",
                self.os
            )));
        }

        match &self.python_version {
            Some(current) if same_minor(current, python) => {}
            Some(current) => {
                warn!("note: building wheel for Python {python} using Python {current}")
            }
            None => warn!("note: could not determine host Python version"),
        }

        let cudart = format!("{}.dll", wheel.cudart_lib);
        let runtime = match (self.find_file(&cudart), self.cuda_runtime) {
            (Some(_), Some(runtime)) => runtime,
            _ => {
                return Err(DistError::precondition(
                    "cannot build wheel without CUDA Runtime installed",
                ))
            }
        };
        if !wheel.check_version.accepts(runtime) {
            return Err(DistError::precondition(format!(
                "cannot build wheel for CUDA {cuda} using CUDA {runtime}"
            )));
        }
        Ok(())
    }
}

fn same_minor(a: &str, b: &str) -> bool {
    match (a.parse::<Version3>(), b.parse::<Version3>()) {
        (Ok(a), Ok(b)) => (a.0, a.1) == (b.0, b.1),
        _ => a == b,
    }
}

fn python_version(exec: &dyn Exec, python: &str) -> Option<String> {
    let mut cmd = command(python, None);
    cmd.arg("-c")
        .arg("import platform; print(platform.python_version())");
    match exec.output(&mut cmd) {
        Ok(out) => Some(String::from_utf8_lossy(&out).trim().to_string()),
        Err(err) => {
            debug!("python version probe failed: {err:#}");
            None
        }
    }
}

fn runtime_from_version_json(cuda_path: &Path) -> Option<Version3> {
    let bytes = fs::read(cuda_path.join("version.json")).ok()?;
    let parsed: CudaVersionJson = serde_json::from_slice(&bytes).ok()?;
    parsed
        .cuda_cudart
        .or(parsed.cuda)
        .and_then(|c| c.version.parse().ok())
}

fn runtime_from_nvcc(exec: &dyn Exec) -> Option<Version3> {
    let mut cmd = command("nvcc", None);
    cmd.arg("--version");
    let out = exec.output(&mut cmd).ok()?;
    parse_nvcc_release(&String::from_utf8_lossy(&out))
}

/// `Cuda compilation tools, release 12.2, V12.2.140` -> 12.2.140
fn parse_nvcc_release(text: &str) -> Option<Version3> {
    let line = text.lines().find(|l| l.contains("release"))?;
    let full = line.rsplit(", V").next().filter(|v| *v != line);
    let short = line.split("release ").nth(1)?.split(',').next()?;
    full.unwrap_or(short).trim().parse().ok()
}
