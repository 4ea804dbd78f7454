//! Docker images for builder and verifier agents.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::info;

use super::resolve::SystemImage;
use crate::error::DistError;
use crate::process::{command, Exec};
use crate::target::AcceleratorKind;

/// Dockerfile flavour matching the base image's package manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DockerfileTemplate {
    Rhel,
    Debian,
}

impl DockerfileTemplate {
    pub fn detect(base_image: &str) -> Result<Self, DistError> {
        if base_image.contains("rhel") || base_image.contains("centos") {
            Ok(DockerfileTemplate::Rhel)
        } else if base_image.contains("ubuntu") || base_image.contains("rocm") {
            Ok(DockerfileTemplate::Debian)
        } else {
            Err(DistError::config(format!(
                "cannot detect Dockerfile template for base image '{base_image}'"
            )))
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            DockerfileTemplate::Rhel => "Dockerfile.rhel",
            DockerfileTemplate::Debian => "Dockerfile.debian",
        }
    }
}

fn docker_build(
    exec: &dyn Exec,
    context: &Path,
    tag: &str,
    build_args: &[(&str, String)],
) -> Result<()> {
    info!("building docker image {tag} from {}", context.display());
    let mut cmd = command("docker", None);
    cmd.arg("build").arg("-t").arg(tag);
    for (key, value) in build_args {
        cmd.arg("--build-arg").arg(format!("{key}={value}"));
    }
    cmd.arg(context);
    exec.run(&mut cmd)
        .with_context(|| format!("building docker image '{tag}'"))
}

/// Build the builder image from `context` (the workdir's builder directory).
pub fn build_builder_image(
    exec: &dyn Exec,
    context: &Path,
    tag: &str,
    base_image: &str,
    python_versions: &[String],
    cython_version: &str,
) -> Result<()> {
    docker_build(
        exec,
        context,
        tag,
        &[
            ("base_image", base_image.to_string()),
            ("python_versions", python_versions.join(" ")),
            ("cython_version", cython_version.to_string()),
        ],
    )
}

/// Install `template` as the context's Dockerfile, then build the verifier image.
pub fn build_verifier_image(
    exec: &dyn Exec,
    context: &Path,
    image: &SystemImage,
    python_versions: &[String],
) -> Result<()> {
    let template = context.join(image.template.file_name());
    let dockerfile = context.join("Dockerfile");
    fs::copy(&template, &dockerfile).with_context(|| {
        format!("copying '{}' to '{}'", template.display(), dockerfile.display())
    })?;
    docker_build(
        exec,
        context,
        &image.tag,
        &[
            ("base_image", image.base_image.clone()),
            ("python_versions", python_versions.join(" ")),
        ],
    )
}

/// Run `tag` with `workdir` mounted at `/work`, passing `args` to the agent.
pub fn run_container(
    exec: &dyn Exec,
    tag: &str,
    kind: AcceleratorKind,
    workdir: &Path,
    args: &[String],
) -> Result<()> {
    let mut cmd = match kind {
        AcceleratorKind::Cuda => {
            let mut cmd = command("nvidia-docker", None);
            cmd.arg("run");
            cmd
        }
        AcceleratorKind::Rocm => {
            let mut cmd = command("docker", None);
            cmd.args([
                "run",
                "--device=/dev/kfd",
                "--device=/dev/dri",
                "--security-opt",
                "seccomp=unconfined",
                "--group-add",
                "video",
                "--env",
                "HCC_AMDGPU_TARGET",
            ]);
            cmd
        }
    };
    cmd.arg("--rm")
        .arg("--volume")
        .arg(format!("{}:/work", workdir.display()))
        .arg("--workdir")
        .arg("/work")
        .arg(tag)
        .args(args);
    exec.run(&mut cmd)
        .with_context(|| format!("running container '{tag}'"))
}
