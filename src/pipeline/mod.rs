//! Two-phase distribution pipeline.
//!
//! `build` produces one sdist or wheel; `verify` installs a produced
//! distribution into a clean environment and runs the test suite against it.
//! Linux targets run their agent inside a container built for the run;
//! Windows targets run it directly on the host after a host check.
//!
//! Every run owns a fresh [`WorkDir`] that is removed whatever the outcome.

mod build;
mod container;
mod host;
mod resolve;
#[cfg(test)]
mod testing;
mod verify;

pub use container::{run_container, DockerfileTemplate};
pub use host::HostEnv;
pub use resolve::{resolve_build, resolve_verify_linux, BuildPlan, SystemImage, VerifyPlan};

use anyhow::Result;
use std::cell::OnceCell;
use std::path::{Path, PathBuf};

use crate::config::DistConfig;
use crate::process::Exec;
use crate::target::Target;
use crate::workdir::WorkDir;

/// Inputs of one build run.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub target: Target,
    pub cuda: Option<String>,
    pub python: String,
    /// Directory holding the NCCL files named in the configuration.
    pub nccl_assets: Option<PathBuf>,
    /// Root of the source checkout.
    pub source: PathBuf,
    /// Directory the finished artifact is copied into.
    pub output: PathBuf,
}

/// Inputs of one verification run.
#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub target: Target,
    pub cuda: Option<String>,
    pub python: String,
    pub nccl_assets: Option<PathBuf>,
    /// The sdist or wheel under test.
    pub dist: PathBuf,
    /// Test directories, staged under `tests/` by basename.
    pub tests: Vec<PathBuf>,
}

pub struct Pipeline<'a> {
    config: &'a DistConfig,
    exec: &'a dyn Exec,
    /// Directory holding `builder/`, `verifier/` and the library installer.
    driver_root: PathBuf,
    scratch_root: Option<PathBuf>,
    host: OnceCell<HostEnv>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a DistConfig,
        exec: &'a dyn Exec,
        driver_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            exec,
            driver_root: driver_root.into(),
            scratch_root: None,
            host: OnceCell::new(),
        }
    }

    /// Use `host` instead of probing the running machine.
    pub fn with_host(self, host: HostEnv) -> Self {
        let _ = self.host.set(host);
        self
    }

    /// Create working directories under `dir` instead of the system temp dir.
    pub fn with_scratch_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(dir.into());
        self
    }

    /// Build the requested distribution; returns the published artifact path.
    pub fn build(&self, request: &BuildRequest) -> Result<PathBuf> {
        match request.target {
            Target::WheelWin => self.build_windows(request),
            Target::Sdist | Target::WheelLinux => self.build_linux(request),
        }
    }

    /// Verify the requested distribution.
    pub fn verify(&self, request: &VerifyRequest) -> Result<()> {
        match request.target {
            Target::WheelWin => self.verify_windows(request),
            Target::Sdist | Target::WheelLinux => self.verify_linux(request),
        }
    }

    fn host(&self) -> &HostEnv {
        self.host
            .get_or_init(|| HostEnv::detect(self.exec, &self.config.python))
    }

    fn workdir(&self) -> Result<WorkDir> {
        match &self.scratch_root {
            Some(root) => WorkDir::create_in(root),
            None => WorkDir::create(),
        }
    }

    fn driver_path(&self, rel: &Path) -> PathBuf {
        self.driver_root.join(rel)
    }
}
