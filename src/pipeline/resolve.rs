use crate::config::{DistConfig, NcclConfig};
use crate::error::DistError;
use crate::naming::{sdist_name, wheel_name, PlatformTag};
use crate::target::{AcceleratorKind, Target};

use super::container::DockerfileTemplate;
use super::{BuildRequest, VerifyRequest};

/// Everything a build needs, decided before any side effect.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    pub target: Target,
    pub kind: AcceleratorKind,
    pub cuda: Option<String>,
    pub python: String,
    pub version: String,
    pub package_name: String,
    /// Builder image tag and base image; `None` for non-isolated builds.
    pub image: Option<(String, String)>,
    pub nccl: Option<NcclConfig>,
    pub needs_cudnn: bool,
    pub long_description: String,
    /// File name the agent produces under `dist/`.
    pub asset_name: String,
    /// File name published to the output directory.
    pub asset_dest_name: String,
    pub requires: Vec<String>,
    pub libs: Vec<String>,
    pub includes: Vec<(String, String)>,
}

impl BuildPlan {
    pub fn agent_action(&self) -> &'static str {
        if self.target.is_wheel() {
            "bdist_wheel"
        } else {
            "sdist"
        }
    }
}

fn check_cuda_arg(target: Target, cuda: Option<&str>) -> Result<Option<String>, DistError> {
    match (target, cuda) {
        (Target::Sdist, Some(cuda)) => Err(DistError::config(format!(
            "target sdist does not take a CUDA version (got '{cuda}')"
        ))),
        (Target::Sdist, None) => Ok(None),
        (_, None) => Err(DistError::config(format!(
            "target {target} requires a CUDA version (--cuda)"
        ))),
        (_, Some(cuda)) => Ok(Some(cuda.to_string())),
    }
}

/// Resolve the static configuration for a build of source `version`.
pub fn resolve_build(
    config: &DistConfig,
    request: &BuildRequest,
    version: &str,
) -> Result<BuildPlan, DistError> {
    config.ensure_python(&request.python)?;
    let cuda = check_cuda_arg(request.target, request.cuda.as_deref())?;
    let python = request.python.clone();

    let plan = match (request.target, cuda.as_deref()) {
        (Target::Sdist, _) => {
            let package_name = "cupy".to_string();
            let asset_name = sdist_name(&package_name, version);
            BuildPlan {
                target: Target::Sdist,
                kind: AcceleratorKind::Cuda,
                cuda: None,
                python,
                version: version.to_string(),
                image: Some(("cupy-builder-sdist".to_string(), config.sdist.image.clone())),
                nccl: None,
                needs_cudnn: false,
                long_description: config.sdist_long_description.clone(),
                asset_dest_name: asset_name.clone(),
                asset_name,
                package_name,
                requires: Vec::new(),
                libs: Vec::new(),
                includes: Vec::new(),
            }
        }
        (Target::WheelLinux, Some(cuda)) => {
            let wheel = config.wheel_linux(cuda)?;
            let (nccl, needs_cudnn) = match wheel.kind {
                AcceleratorKind::Cuda => (wheel.nccl.clone(), true),
                AcceleratorKind::Rocm => (None, false),
            };
            BuildPlan {
                target: Target::WheelLinux,
                kind: wheel.kind,
                cuda: Some(cuda.to_string()),
                version: version.to_string(),
                package_name: wheel.name.clone(),
                image: Some((format!("cupy-builder-{cuda}"), wheel.image.clone())),
                nccl,
                needs_cudnn,
                long_description: config.wheel_description(cuda),
                asset_name: wheel_name(&wheel.name, version, &python, PlatformTag::LinuxX86_64)?,
                asset_dest_name: wheel_name(
                    &wheel.name,
                    version,
                    &python,
                    PlatformTag::Manylinux1X86_64,
                )?,
                requires: config.wheel_requires(&python)?.to_vec(),
                libs: wheel.libs.clone(),
                includes: wheel.includes.clone(),
                python,
            }
        }
        (Target::WheelWin, Some(cuda)) => {
            if request.nccl_assets.is_some() {
                return Err(DistError::config("NCCL not supported on Windows"));
            }
            let wheel = config.wheel_windows(cuda)?;
            let asset_name = wheel_name(&wheel.name, version, &python, PlatformTag::WinAmd64)?;
            BuildPlan {
                target: Target::WheelWin,
                kind: AcceleratorKind::Cuda,
                cuda: Some(cuda.to_string()),
                version: version.to_string(),
                package_name: wheel.name.clone(),
                image: None,
                nccl: None,
                needs_cudnn: true,
                long_description: config.wheel_description(cuda),
                asset_dest_name: asset_name.clone(),
                asset_name,
                requires: config.wheel_requires(&python)?.to_vec(),
                libs: wheel.libs.clone(),
                includes: Vec::new(),
                python,
            }
        }
        (target, None) => {
            return Err(DistError::config(format!(
                "target {target} requires a CUDA version (--cuda)"
            )))
        }
    };

    if plan.nccl.is_some() && request.nccl_assets.is_none() {
        return Err(DistError::config(format!(
            "--nccl-assets is required to build {} for CUDA {}",
            plan.target,
            plan.cuda.as_deref().unwrap_or("-")
        )));
    }
    Ok(plan)
}

/// One verification system: image tag, concrete base image and its Dockerfile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemImage {
    pub tag: String,
    pub base_image: String,
    pub template: DockerfileTemplate,
}

/// Container verification settings for a Linux target.
#[derive(Debug, Clone)]
pub struct VerifyPlan {
    pub kind: AcceleratorKind,
    pub cuda: Option<String>,
    pub python: String,
    /// Verification systems, in order.
    pub images: Vec<SystemImage>,
    pub preloads: Vec<String>,
    pub nccl: Option<NcclConfig>,
}

/// Expand `base_image`'s `{system}` placeholder for each system and pick the
/// Dockerfile template of every resulting image.
fn system_images(
    tag_prefix: &str,
    base_image: &str,
    systems: &[String],
) -> Result<Vec<SystemImage>, DistError> {
    systems
        .iter()
        .map(|system| {
            let base_image = base_image.replace("{system}", system);
            Ok(SystemImage {
                tag: format!("{tag_prefix}-{system}"),
                template: DockerfileTemplate::detect(&base_image)?,
                base_image,
            })
        })
        .collect()
}

pub fn resolve_verify_linux(
    config: &DistConfig,
    request: &VerifyRequest,
) -> Result<VerifyPlan, DistError> {
    config.ensure_python(&request.python)?;
    let cuda = check_cuda_arg(request.target, request.cuda.as_deref())?;

    let plan = match (request.target, cuda) {
        (Target::Sdist, _) => VerifyPlan {
            kind: AcceleratorKind::Cuda,
            cuda: None,
            python: request.python.clone(),
            images: system_images(
                "cupy-verifier-sdist",
                &config.sdist.verify_image,
                &config.sdist.verify_systems,
            )?,
            preloads: Vec::new(),
            nccl: config.sdist.nccl.clone(),
        },
        (Target::WheelLinux, Some(cuda)) => {
            let wheel = config.wheel_linux(&cuda)?;
            VerifyPlan {
                kind: wheel.kind,
                python: request.python.clone(),
                images: system_images(
                    &format!("cupy-verifier-wheel-linux-{cuda}"),
                    &wheel.verify_image,
                    &wheel.verify_systems,
                )?,
                preloads: wheel.verify_preloads.clone(),
                nccl: None,
                cuda: Some(cuda),
            }
        }
        (target, _) => {
            return Err(DistError::config(format!(
                "target {target} is not verified in a Linux container"
            )))
        }
    };

    if plan.nccl.is_some() && request.nccl_assets.is_none() {
        return Err(DistError::config(
            "--nccl-assets is required to verify this target",
        ));
    }
    Ok(plan)
}
