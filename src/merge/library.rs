use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{copy_file, merge_directory};
use crate::error::DistError;

/// How one vendor library tree is grafted onto a destination root.
#[derive(Debug, Clone)]
pub struct LibraryInstallSpec {
    pub name: String,
    pub source_root: PathBuf,
    pub dest_root: PathBuf,
    /// Payload entry name -> destination name. Unlisted names map to themselves.
    pub name_map: BTreeMap<String, String>,
}

impl LibraryInstallSpec {
    pub fn new(
        name: impl Into<String>,
        source_root: impl Into<PathBuf>,
        dest_root: impl Into<PathBuf>,
        name_map: &[(&str, &str)],
    ) -> Self {
        Self {
            name: name.into(),
            source_root: source_root.into(),
            dest_root: dest_root.into(),
            name_map: name_map
                .iter()
                .map(|(from, to)| (from.to_string(), to.to_string()))
                .collect(),
        }
    }

    pub fn mapped_name<'a>(&'a self, name: &'a str) -> &'a str {
        self.name_map.get(name).map(String::as_str).unwrap_or(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Payload directory that was merged.
    Installed(PathBuf),
    /// The vendor tree has no directory for this library.
    Skipped,
}

/// Result of looking for the single entry of a version-scoped directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildLookup {
    Found(PathBuf),
    NotFound,
    Ambiguous(Vec<PathBuf>),
}

/// Inspect `dir` for exactly one entry.
pub fn single_child(dir: &Path) -> Result<ChildLookup> {
    let mut children = fs::read_dir(dir)
        .with_context(|| format!("reading vendor directory '{}'", dir.display()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("listing vendor directory '{}'", dir.display()))?;
    children.sort();

    Ok(match children.len() {
        0 => ChildLookup::NotFound,
        1 => ChildLookup::Found(children.remove(0)),
        _ => ChildLookup::Ambiguous(children),
    })
}

fn require_single_child(dir: &Path) -> Result<PathBuf> {
    match single_child(dir)? {
        ChildLookup::Found(path) => Ok(path),
        ChildLookup::NotFound => Err(DistError::precondition(format!(
            "vendor directory '{}' is empty; expected exactly one version directory",
            dir.display()
        ))
        .into()),
        ChildLookup::Ambiguous(found) => Err(DistError::AmbiguousLayout {
            dir: dir.to_path_buf(),
            found,
        }
        .into()),
    }
}

/// Install one library from `<source_root>/<cuda>/<name>/<version>/`.
///
/// The payload is located completely before anything is written, so an
/// ambiguous layout leaves `dest_root` untouched.
pub fn install_library(spec: &LibraryInstallSpec) -> Result<InstallOutcome> {
    let cuda_dir = require_single_child(&spec.source_root)?;
    let library_dir = cuda_dir.join(&spec.name);
    if !library_dir.exists() {
        info!("skip installing {} (unavailable)", spec.name);
        return Ok(InstallOutcome::Skipped);
    }
    let payload = require_single_child(&library_dir)?;

    info!(
        "installing {} from {} to {}",
        spec.name,
        payload.display(),
        spec.dest_root.display()
    );

    let mut entries = fs::read_dir(&payload)
        .with_context(|| format!("reading payload directory '{}'", payload.display()))?
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("listing payload directory '{}'", payload.display()))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();
        let dest = spec.dest_root.join(spec.mapped_name(&name));
        if entry.path().is_dir() {
            merge_directory(&entry.path(), &dest).with_context(|| {
                format!("merging '{}' into '{}'", entry.path().display(), dest.display())
            })?;
        } else {
            if !spec.dest_root.is_dir() {
                fs::create_dir_all(&spec.dest_root).with_context(|| {
                    format!("creating directory '{}'", spec.dest_root.display())
                })?;
            }
            debug!("copying: {} <- {}", dest.display(), entry.path().display());
            copy_file(&entry.path(), &dest)?;
        }
    }

    Ok(InstallOutcome::Installed(payload))
}
