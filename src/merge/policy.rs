use anyhow::{Context, Result};
use std::path::Path;

use super::library::{install_library, InstallOutcome, LibraryInstallSpec};
use crate::error::DistError;
use crate::target::Platform;

type NameMap = &'static [(&'static str, &'static str)];

const LINUX: &[(&str, NameMap)] = &[
    ("cutensor", &[("lib", "lib64"), ("include", "include")]),
    ("nccl", &[("lib", "lib64"), ("include", "include")]),
    // cuDNN tarballs already ship lib64/.
    ("cudnn", &[("lib64", "lib64"), ("include", "include")]),
];

const WINDOWS: &[(&str, NameMap)] = &[
    ("cutensor", &[("lib", "bin"), ("include", "include")]),
    // lib/ holds the static import libraries.
    ("cudnn", &[("bin", "bin"), ("lib", "lib"), ("include", "include")]),
];

fn table(platform: Platform) -> &'static [(&'static str, NameMap)] {
    match platform {
        Platform::Linux => LINUX,
        Platform::Windows => WINDOWS,
    }
}

/// Libraries installed on `platform`, in installation order.
pub fn library_names(platform: Platform) -> Vec<&'static str> {
    table(platform).iter().map(|(name, _)| *name).collect()
}

/// Directory name map for `library` on `platform`.
pub fn name_map(platform: Platform, library: &str) -> Result<NameMap, DistError> {
    table(platform)
        .iter()
        .find(|(name, _)| *name == library)
        .map(|(_, map)| *map)
        .ok_or_else(|| {
            DistError::config(format!(
                "library '{library}' is not supported on {platform:?}; expected one of: {}",
                library_names(platform).join(", ")
            ))
        })
}

impl LibraryInstallSpec {
    /// Build the install spec for `library` using the platform policy.
    pub fn for_platform(
        platform: Platform,
        library: &str,
        source_root: &Path,
        dest_root: &Path,
    ) -> Result<Self, DistError> {
        let map = name_map(platform, library)?;
        Ok(Self::new(library, source_root, dest_root, map))
    }
}

/// Install every library of the platform policy from `src` into `dst`.
pub fn install_all(
    platform: Platform,
    src: &Path,
    dst: &Path,
) -> Result<Vec<(&'static str, InstallOutcome)>> {
    let mut outcomes = Vec::new();
    for library in library_names(platform) {
        let spec = LibraryInstallSpec::for_platform(platform, library, src, dst)?;
        let outcome = install_library(&spec)
            .with_context(|| format!("installing {library} into '{}'", dst.display()))?;
        outcomes.push((library, outcome));
    }
    Ok(outcomes)
}
