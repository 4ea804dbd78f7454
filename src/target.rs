//! Build targets, host platforms and accelerator back ends.

use std::fmt;

use serde::Deserialize;

use crate::error::DistError;

/// Pipeline phase requested on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Action {
    Build,
    Verify,
}

/// Distribution to build or verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Target {
    #[value(name = "sdist")]
    Sdist,
    #[value(name = "wheel-linux")]
    WheelLinux,
    #[value(name = "wheel-win")]
    WheelWin,
}

impl Target {
    pub fn as_str(self) -> &'static str {
        match self {
            Target::Sdist => "sdist",
            Target::WheelLinux => "wheel-linux",
            Target::WheelWin => "wheel-win",
        }
    }

    pub fn is_wheel(self) -> bool {
        !matches!(self, Target::Sdist)
    }

    /// Platform the agent for this target runs on.
    pub fn platform(self) -> Platform {
        match self {
            Target::WheelWin => Platform::Windows,
            Target::Sdist | Target::WheelLinux => Platform::Linux,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Platform {
    Linux,
    Windows,
}

impl Platform {
    /// Platform of the running process.
    pub fn host() -> Result<Self, DistError> {
        Self::from_os(std::env::consts::OS)
    }

    pub fn from_os(os: &str) -> Result<Self, DistError> {
        match os {
            "linux" => Ok(Platform::Linux),
            "windows" => Ok(Platform::Windows),
            other => Err(DistError::config(format!(
                "unsupported platform '{other}'; expected linux or windows"
            ))),
        }
    }

    /// Key used for this platform in library installer asset records.
    pub fn asset_key(self) -> &'static str {
        match self {
            Platform::Linux => "Linux",
            Platform::Windows => "Windows",
        }
    }
}

/// GPU back end a wheel is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceleratorKind {
    Cuda,
    Rocm,
}

impl fmt::Display for AcceleratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AcceleratorKind::Cuda => "cuda",
            AcceleratorKind::Rocm => "rocm",
        })
    }
}
