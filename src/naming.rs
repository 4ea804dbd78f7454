//! Distribution file names and source version discovery.

use anyhow::{Context, Result};
use std::fmt;
use std::fs;
use std::path::Path;

use crate::config::Version3;
use crate::error::DistError;

/// Wheel platform tags produced or published by this tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformTag {
    /// What `bdist_wheel` emits inside the builder container.
    LinuxX86_64,
    /// Published name for Linux wheels.
    Manylinux1X86_64,
    WinAmd64,
}

impl PlatformTag {
    pub fn as_str(self) -> &'static str {
        match self {
            PlatformTag::LinuxX86_64 => "linux_x86_64",
            PlatformTag::Manylinux1X86_64 => "manylinux1_x86_64",
            PlatformTag::WinAmd64 => "win_amd64",
        }
    }
}

impl fmt::Display for PlatformTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn sdist_name(package: &str, version: &str) -> String {
    format!("{package}-{version}.tar.gz")
}

/// `{package}-{version}-cpXY-cpXY{abi}-{platform}.whl`; the `m` ABI flag only
/// exists before Python 3.8.
pub fn wheel_name(
    package: &str,
    version: &str,
    python: &str,
    platform: PlatformTag,
) -> Result<String, DistError> {
    let py: Version3 = python.parse()?;
    let tag = format!("cp{}{}", py.major(), py.minor());
    let abi = if (py.major(), py.minor()) < (3, 8) { "m" } else { "" };
    Ok(format!("{package}-{version}-{tag}-{tag}{abi}-{platform}.whl"))
}

/// Read `__version__` from the version file of a source tree.
pub fn version_from_source_tree(source: &Path, version_file: &Path) -> Result<String> {
    let path = source.join(version_file);
    let text = fs::read_to_string(&path)
        .with_context(|| format!("reading version file '{}'", path.display()))?;
    parse_version_assignment(&text).ok_or_else(|| {
        DistError::config(format!("no __version__ assignment in '{}'", path.display())).into()
    })
}

fn parse_version_assignment(text: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("__version__")?;
        let value = rest.trim_start().strip_prefix('=')?.trim();
        let quote = value.chars().next().filter(|c| *c == '\'' || *c == '"')?;
        let inner = &value[1..];
        let end = inner.find(quote)?;
        Some(inner[..end].to_string())
    })
}
