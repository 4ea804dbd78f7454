//! Release tooling for GPU array library distributions.
//!
//! The crate has two halves:
//!
//! - **Tree merger** ([`merge`]) - grafts vendor library trees (cuTENSOR,
//!   NCCL, cuDNN) onto a CUDA installation using a per-platform directory
//!   rename policy.
//! - **Distribution pipeline** ([`pipeline`]) - builds a source distribution
//!   or a binary wheel for one accelerator/Python combination inside an
//!   isolated environment, then verifies it on every configured system.
//!
//! # Architecture
//!
//! ```text
//! dist-builder (binary)
//!     │
//!     ├── config::DistConfig     static release tables (TOML)
//!     ├── preflight              host tool checks
//!     └── pipeline::Pipeline
//!             ├── resolve        pure: request + config -> plan
//!             ├── archive/cudnn  NCCL and cuDNN staging
//!             ├── metadata       _wheel.json
//!             ├── container      docker build / run
//!             └── WorkDir        scoped scratch directory
//!
//! setup-cuda-opt-lib (binary)
//!     └── merge::install_all
//! ```
//!
//! External commands all go through [`process::Exec`], so the pipeline can be
//! driven against a recording fake.

pub mod archive;
pub mod config;
pub mod cudnn;
pub mod error;
pub mod merge;
pub mod metadata;
pub mod naming;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod target;
pub mod workdir;

pub use config::DistConfig;
pub use error::DistError;
pub use pipeline::{BuildRequest, Pipeline, VerifyRequest};
pub use process::{Exec, HostExec};
pub use target::{AcceleratorKind, Action, Platform, Target};
