//! `_wheel.json`: tells the build agent which CUDA libraries the wheel preloads.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::cudnn::CudnnRelease;

pub const WHEEL_METADATA_FILENAME: &str = "_wheel.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WheelMetadata {
    pub cuda: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cudnn: Option<CudnnMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CudnnMetadata {
    pub version: String,
    pub filename: String,
}

impl WheelMetadata {
    pub fn new(cuda: Option<&str>, cudnn: Option<&CudnnRelease>) -> Self {
        Self {
            cuda: cuda.map(str::to_string),
            cudnn: cudnn.map(|release| CudnnMetadata {
                version: release.version.clone(),
                filename: release.asset.filename.clone(),
            }),
        }
    }

    /// Write to `<workdir>/_wheel.json`.
    pub fn write(&self, workdir: &Path) -> Result<PathBuf> {
        let path = workdir.join(WHEEL_METADATA_FILENAME);
        let bytes = serde_json::to_vec(self).context("serializing wheel metadata")?;
        fs::write(&path, bytes)
            .with_context(|| format!("writing wheel metadata '{}'", path.display()))?;
        Ok(path)
    }
}
