//! Error categories for distribution builds.
//!
//! Orchestration code returns `anyhow::Result` and attaches context; the
//! variants here mark *why* a run stopped so callers (and tests) can tell a
//! bad configuration apart from a failed tool or a missing artifact.

use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DistError {
    /// Unrecognized target/platform/version combination.
    #[error("configuration error: {0}")]
    Config(String),

    /// Host environment does not satisfy the requested build.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A vendor tree had more than one candidate where exactly one is expected.
    #[error("ambiguous vendor layout under '{}': expected exactly one entry, found {}", dir.display(), found.len())]
    AmbiguousLayout { dir: PathBuf, found: Vec<PathBuf> },

    /// An external command exited unsuccessfully.
    #[error("command `{command}` failed with {status}")]
    ToolFailed { command: String, status: ExitStatus },

    /// The agent reported success but the expected artifact is not there.
    #[error("expected artifact missing after build: {}", path.display())]
    MissingArtifact { path: PathBuf },
}

impl DistError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }
}

/// Returns the categorized error carried by `err`, if any.
pub fn category(err: &anyhow::Error) -> Option<&DistError> {
    err.chain().find_map(|cause| cause.downcast_ref::<DistError>())
}
