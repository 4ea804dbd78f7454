//! Ephemeral staging directory owned by one pipeline run.

use anyhow::{Context, Result};
use std::path::Path;
use tempfile::TempDir;
use tracing::{info, warn};

const WORKDIR_PREFIX: &str = "cupy-dist-";

/// Working directory removed when dropped, whatever the outcome of the run.
///
/// Removal failures are logged and swallowed: by the time the guard is
/// released the result of the run has already been decided.
#[derive(Debug)]
pub struct WorkDir {
    dir: Option<TempDir>,
}

impl WorkDir {
    /// Create a fresh directory under the system temp dir.
    pub fn create() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(WORKDIR_PREFIX)
            .tempdir()
            .context("creating working directory")?;
        info!("using working directory: {}", dir.path().display());
        Ok(Self { dir: Some(dir) })
    }

    /// Create a fresh directory under `parent`.
    pub fn create_in(parent: &Path) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(WORKDIR_PREFIX)
            .tempdir_in(parent)
            .with_context(|| format!("creating working directory under '{}'", parent.display()))?;
        info!("using working directory: {}", dir.path().display());
        Ok(Self { dir: Some(dir) })
    }

    pub fn path(&self) -> &Path {
        match &self.dir {
            Some(dir) => dir.path(),
            None => unreachable!("working directory is only released on drop"),
        }
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        let path = dir.path().to_path_buf();
        info!("removing working directory: {}", path.display());
        if let Err(err) = dir.close() {
            warn!(
                "failed to clean up working directory: {err}; please remove it manually: {}",
                path.display()
            );
        }
    }
}
