//! cuDNN redistributables: registry lookup through the library installer and
//! download/extraction of the selected archive.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::archive;
use crate::error::DistError;
use crate::process::{command, Exec};
use crate::target::Platform;

/// One entry of `install_library.py --action dump`.
#[derive(Debug, Clone, Deserialize)]
pub struct CudnnRecord {
    pub cuda: String,
    pub cudnn: String,
    pub assets: BTreeMap<String, CudnnAsset>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CudnnAsset {
    pub url: String,
    pub filename: String,
}

/// cuDNN version plus the asset chosen for a platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CudnnRelease {
    pub version: String,
    pub asset: CudnnAsset,
}

/// Ask the library installer for every cuDNN record it knows for `cuda`.
pub fn dump_records(
    exec: &dyn Exec,
    python: &str,
    installer: &Path,
    cuda: &str,
) -> Result<Vec<CudnnRecord>> {
    let mut cmd = command(python, None);
    cmd.arg(installer)
        .args(["--library", "cudnn", "--cuda", cuda, "--action", "dump"]);
    let stdout = exec.output(&mut cmd).context("dumping cuDNN records")?;
    serde_json::from_slice(&stdout).context("parsing cuDNN records from library installer")
}

/// Pick the record for `cuda` and its asset for `platform`.
pub fn select_release(
    records: &[CudnnRecord],
    cuda: &str,
    platform: Platform,
) -> Result<CudnnRelease, DistError> {
    let record = records.iter().find(|r| r.cuda == cuda).ok_or_else(|| {
        DistError::config(format!("CUDA {cuda} not supported by install_library tool"))
    })?;
    let asset = record.assets.get(platform.asset_key()).ok_or_else(|| {
        DistError::config(format!(
            "cuDNN {} for CUDA {cuda} has no {} asset",
            record.cudnn,
            platform.asset_key()
        ))
    })?;
    Ok(CudnnRelease {
        version: record.cudnn.clone(),
        asset: asset.clone(),
    })
}

/// Resolve the cuDNN release for `(cuda, platform)`.
pub fn resolve(
    exec: &dyn Exec,
    python: &str,
    installer: &Path,
    cuda: &str,
    platform: Platform,
) -> Result<CudnnRelease> {
    info!("retrieving cuDNN records for CUDA {cuda} ({})", platform.asset_key());
    let records = dump_records(exec, python, installer, cuda)?;
    let release = select_release(&records, cuda, platform)?;
    info!("cuDNN version: {}", release.version);
    info!("cuDNN asset: {} ({})", release.asset.filename, release.asset.url);
    Ok(release)
}

/// Download `url`, extract it and move its top-level `cuda/` directory to `dest`.
///
/// The scratch directory is created next to `dest` so the final move is a rename.
pub fn download_and_extract(exec: &dyn Exec, url: &str, dest: &Path) -> Result<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| anyhow::anyhow!("cuDNN destination has no parent: {}", dest.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("creating '{}'", parent.display()))?;
    let scratch = tempfile::Builder::new()
        .prefix("cudnn-download-")
        .tempdir_in(parent)
        .with_context(|| format!("creating download directory under '{}'", parent.display()))?;

    let archive_path = scratch.path().join(url_basename(url)?);
    info!("downloading {url} to {}", archive_path.display());
    let mut cmd = command("curl", None);
    cmd.args(["--fail", "-L", "-o"]).arg(&archive_path).arg(url);
    exec.run(&mut cmd).with_context(|| format!("downloading cuDNN from {url}"))?;

    let unpacked = scratch.path().join("unpacked");
    archive::extract(exec, &archive_path, &unpacked, 0)?;

    let payload = unpacked.join("cuda");
    if !payload.is_dir() {
        return Err(DistError::precondition(format!(
            "cuDNN archive {url} has no top-level 'cuda' directory"
        ))
        .into());
    }
    info!("moving cuDNN to {}", dest.display());
    fs::rename(&payload, dest)
        .with_context(|| format!("moving '{}' to '{}'", payload.display(), dest.display()))?;
    Ok(())
}

fn url_basename(url: &str) -> Result<PathBuf> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    match path.rsplit('/').next().filter(|name| !name.is_empty()) {
        Some(name) => Ok(PathBuf::from(name)),
        None => Err(DistError::config(format!("cannot derive file name from URL '{url}'")).into()),
    }
}
