//! Archive extraction for vendor redistributables.
//!
//! Plain and zstd tarballs are unpacked in-process; other compressions, zip
//! files and Debian packages go through the host's `tar`, `unzip` and `dpkg`.

use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};
use tracing::info;

use crate::config::NcclConfig;
use crate::error::DistError;
use crate::process::{command, Exec};

/// Multiarch library directory used by the NCCL Debian packages.
const DEB_LIB_DIR: &str = "usr/lib/x86_64-linux-gnu";
const DEB_INCLUDE_DIR: &str = "usr/include";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarZst,
    /// xz, gzip or bzip2 tarball, handed to the host `tar`.
    CompressedTar,
    Zip,
    Deb,
}

impl ArchiveFormat {
    /// Detect the format from the file name.
    pub fn detect(path: &Path) -> Result<Self, DistError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        let ends = |suffixes: &[&str]| suffixes.iter().any(|s| name.ends_with(s));

        if ends(&[".tar.zst", ".tzst"]) {
            Ok(ArchiveFormat::TarZst)
        } else if ends(&[".tar.xz", ".txz", ".tar.gz", ".tgz", ".tar.bz2", ".tbz2"]) {
            Ok(ArchiveFormat::CompressedTar)
        } else if ends(&[".tar"]) {
            Ok(ArchiveFormat::Tar)
        } else if ends(&[".zip"]) {
            Ok(ArchiveFormat::Zip)
        } else if ends(&[".deb"]) {
            Ok(ArchiveFormat::Deb)
        } else {
            Err(DistError::config(format!(
                "unknown archive format: {}",
                path.display()
            )))
        }
    }
}

/// Extract `archive` into `dest`, dropping `strip` leading path components.
pub fn extract(exec: &dyn Exec, archive: &Path, dest: &Path, strip: usize) -> Result<()> {
    let format = ArchiveFormat::detect(archive)?;
    fs::create_dir_all(dest).with_context(|| format!("creating '{}'", dest.display()))?;
    info!("extracting {} to {}", archive.display(), dest.display());

    match format {
        ArchiveFormat::Tar => {
            let file = File::open(archive)
                .with_context(|| format!("opening archive '{}'", archive.display()))?;
            unpack_tar(BufReader::new(file), dest, strip)
        }
        ArchiveFormat::TarZst => {
            let file = File::open(archive)
                .with_context(|| format!("opening archive '{}'", archive.display()))?;
            let decoder = zstd::stream::Decoder::new(file)?;
            unpack_tar(decoder, dest, strip)
        }
        ArchiveFormat::CompressedTar => {
            let mut cmd = command("tar", None);
            cmd.arg("-x").arg("-f").arg(archive).arg("-C").arg(dest);
            if strip > 0 {
                cmd.arg("--strip-components").arg(strip.to_string());
            }
            exec.run(&mut cmd)
        }
        ArchiveFormat::Zip => {
            if strip > 0 {
                return Err(DistError::config(format!(
                    "cannot strip path components from zip archive '{}'",
                    archive.display()
                ))
                .into());
            }
            // bsdtar (shipped with Windows) reads zip files; GNU tar does not.
            let mut cmd = if cfg!(windows) {
                let mut cmd = command("tar", None);
                cmd.arg("-x").arg("-f").arg(archive).arg("-C").arg(dest);
                cmd
            } else {
                let mut cmd = command("unzip", None);
                cmd.arg("-q").arg("-o").arg(archive).arg("-d").arg(dest);
                cmd
            };
            exec.run(&mut cmd)
        }
        ArchiveFormat::Deb => {
            if strip > 0 {
                bail!("cannot strip path components from Debian package '{}'", archive.display());
            }
            let mut cmd = command("dpkg", None);
            cmd.arg("-x").arg(archive).arg(dest);
            exec.run(&mut cmd)
        }
    }
}

fn unpack_tar<R: Read>(reader: R, dest: &Path, strip: usize) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);

    for entry in archive.entries().context("reading tar entries")? {
        let mut entry = entry.context("reading tar entry")?;
        let path = entry.path().context("decoding tar entry path")?.into_owned();
        let Some(rel) = stripped(&path, strip)? else {
            continue;
        };
        let target = dest.join(&rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating '{}'", parent.display()))?;
        }
        entry
            .unpack(&target)
            .with_context(|| format!("unpacking '{}'", target.display()))?;
    }
    Ok(())
}

/// Remove `strip` leading components; `None` when nothing is left.
fn stripped(path: &Path, strip: usize) -> Result<Option<PathBuf>> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => parts.push(part),
            _ => bail!("refusing tar entry outside destination: {}", path.display()),
        }
    }
    let rel: PathBuf = parts.into_iter().skip(strip).collect();
    Ok((!rel.as_os_str().is_empty()).then_some(rel))
}

/// Unpack the configured NCCL assets from `assets_dir` into `dest`.
///
/// Debian packages are flattened afterwards so both formats end up with the
/// tarball layout (`lib/`, `include/`).
pub fn extract_nccl(
    exec: &dyn Exec,
    nccl: &NcclConfig,
    assets_dir: &Path,
    dest: &Path,
) -> Result<()> {
    info!(
        "extracting NCCL assets from {} to {}",
        assets_dir.display(),
        dest.display()
    );
    match nccl {
        NcclConfig::V1Deb { files } => {
            for file in files {
                let mut cmd = command("dpkg", None);
                cmd.arg("-x").arg(assets_dir.join(file)).arg(dest);
                exec.run(&mut cmd)
                    .with_context(|| format!("extracting NCCL package '{file}'"))?;
            }
            move_dir(&dest.join(DEB_LIB_DIR), &dest.join("lib"))?;
            move_dir(&dest.join(DEB_INCLUDE_DIR), &dest.join("include"))?;
        }
        NcclConfig::V2Tar { files } => {
            for file in files {
                extract(exec, &assets_dir.join(file), dest, 1)
                    .with_context(|| format!("extracting NCCL archive '{file}'"))?;
            }
        }
    }
    Ok(())
}

fn move_dir(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to)
        .with_context(|| format!("moving '{}' to '{}'", from.display(), to.display()))
}
