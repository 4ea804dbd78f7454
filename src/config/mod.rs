//! Static release configuration.
//!
//! Everything that used to be module-level tables (per-CUDA wheel configs, the
//! sdist config, per-Python build requirements) is one immutable `DistConfig`,
//! loaded once from TOML and passed by reference to each pipeline step.

mod version;

pub use version::{CudaVersionCheck, Version3};

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::DistError;
use crate::target::AcceleratorKind;

const BUILTIN_CONFIG: &str = include_str!("../../config/dist.toml");

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DistConfig {
    /// Cython pinned inside the builder image.
    pub cython_version: String,
    /// Python versions accepted on the command line and baked into builder images.
    pub python_versions: Vec<String>,
    /// Python versions installed into verifier images.
    pub verify_python_versions: Vec<String>,
    /// Library installer script, relative to the driver's working directory.
    pub library_installer: PathBuf,
    /// Version file inside the source tree.
    pub version_file: PathBuf,
    /// Docker build context / agent directory for builds.
    pub builder_dir: PathBuf,
    /// Docker build context / agent directory for verification.
    pub verifier_dir: PathBuf,
    /// Python interpreter used for host-side helpers and Windows agents.
    #[serde(default = "default_python")]
    pub python: String,
    pub sdist_long_description: String,
    /// Long description for wheels; `{cuda}` is replaced with the CUDA version.
    pub wheel_long_description: String,
    pub sdist: SdistConfig,
    #[serde(default)]
    pub wheel_python: BTreeMap<String, WheelPythonConfig>,
    #[serde(default)]
    pub wheel_linux: BTreeMap<String, WheelLinuxConfig>,
    #[serde(default)]
    pub wheel_windows: BTreeMap<String, WheelWindowsConfig>,
}

fn default_python() -> String {
    if cfg!(windows) { "python" } else { "python3" }.to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SdistConfig {
    pub image: String,
    pub verify_image: String,
    pub verify_systems: Vec<String>,
    #[serde(default)]
    pub verify_preloads: Vec<String>,
    pub nccl: Option<NcclConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WheelPythonConfig {
    #[serde(default)]
    pub requires: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WheelLinuxConfig {
    pub name: String,
    pub kind: AcceleratorKind,
    pub image: String,
    #[serde(default)]
    pub libs: Vec<String>,
    /// `(include path, path relative to the wheel)` pairs.
    #[serde(default)]
    pub includes: Vec<(String, String)>,
    pub verify_image: String,
    pub verify_systems: Vec<String>,
    #[serde(default)]
    pub verify_preloads: Vec<String>,
    pub nccl: Option<NcclConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WheelWindowsConfig {
    pub name: String,
    /// CUDA runtime DLL base name, e.g. `cudart64_12`.
    pub cudart_lib: String,
    #[serde(default)]
    pub check_version: CudaVersionCheck,
    #[serde(default)]
    pub libs: Vec<String>,
}

/// Where the NCCL redistributables come from.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NcclConfig {
    /// Debian packages, unpacked with `dpkg -x`.
    V1Deb { files: Vec<String> },
    /// Tarballs with one leading directory.
    V2Tar { files: Vec<String> },
}

impl NcclConfig {
    pub fn files(&self) -> &[String] {
        match self {
            NcclConfig::V1Deb { files } | NcclConfig::V2Tar { files } => files,
        }
    }
}

impl DistConfig {
    /// Configuration compiled into the binary.
    pub fn builtin() -> Result<Self> {
        Self::from_toml(BUILTIN_CONFIG, Path::new("<builtin>"))
    }

    /// Load from `path`, or the built-in table when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("reading dist config '{}'", path.display()))?;
                Self::from_toml(&raw, path)
            }
            None => Self::builtin(),
        }
    }

    pub fn from_toml(raw: &str, origin: &Path) -> Result<Self> {
        let config: DistConfig = toml::from_str(raw)
            .with_context(|| format!("parsing dist config '{}'", origin.display()))?;
        config
            .validate()
            .with_context(|| format!("validating dist config '{}'", origin.display()))?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), DistError> {
        if self.python_versions.is_empty() {
            return Err(DistError::config("python_versions must not be empty"));
        }
        for version in self.python_versions.iter().chain(&self.verify_python_versions) {
            version.parse::<Version3>()?;
        }
        if let Some(unknown) = self
            .wheel_python
            .keys()
            .find(|v| !self.python_versions.contains(*v))
        {
            return Err(DistError::config(format!(
                "wheel_python has entry for unlisted python version '{unknown}'"
            )));
        }
        if !self.sdist.verify_preloads.is_empty() {
            return Err(DistError::config("sdist.verify_preloads must be empty"));
        }
        for (cuda, wheel) in &self.wheel_linux {
            if wheel.kind == AcceleratorKind::Rocm && wheel.nccl.is_some() {
                return Err(DistError::config(format!(
                    "wheel_linux '{cuda}' is a ROCm build but declares NCCL assets"
                )));
            }
        }
        Ok(())
    }

    pub fn ensure_python(&self, python: &str) -> Result<(), DistError> {
        if self.python_versions.iter().any(|v| v == python) {
            return Ok(());
        }
        Err(DistError::config(format!(
            "unsupported python version '{python}'; expected one of: {}",
            self.python_versions.join(", ")
        )))
    }

    pub fn wheel_linux(&self, cuda: &str) -> Result<&WheelLinuxConfig, DistError> {
        self.wheel_linux.get(cuda).ok_or_else(|| {
            DistError::config(format!(
                "no wheel-linux configuration for CUDA '{cuda}'; expected one of: {}",
                join_keys(&self.wheel_linux)
            ))
        })
    }

    pub fn wheel_windows(&self, cuda: &str) -> Result<&WheelWindowsConfig, DistError> {
        self.wheel_windows.get(cuda).ok_or_else(|| {
            DistError::config(format!(
                "no wheel-win configuration for CUDA '{cuda}'; expected one of: {}",
                join_keys(&self.wheel_windows)
            ))
        })
    }

    /// Build requirements installed before building a wheel for `python`.
    pub fn wheel_requires(&self, python: &str) -> Result<&[String], DistError> {
        self.wheel_python
            .get(python)
            .map(|cfg| cfg.requires.as_slice())
            .ok_or_else(|| {
                DistError::config(format!("no wheel build requirements for python '{python}'"))
            })
    }

    pub fn wheel_description(&self, cuda: &str) -> String {
        self.wheel_long_description.replace("{cuda}", cuda)
    }
}

fn join_keys<V>(map: &BTreeMap<String, V>) -> String {
    map.keys().map(String::as_str).collect::<Vec<_>>().join(", ")
}
