use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use super::container;
use super::resolve::{resolve_build, BuildPlan};
use super::{BuildRequest, Pipeline};
use crate::archive;
use crate::cudnn::{self, CudnnRelease};
use crate::error::DistError;
use crate::merge::{copy_file, copy_tree, merge_directory};
use crate::metadata::{WheelMetadata, WHEEL_METADATA_FILENAME};
use crate::naming::version_from_source_tree;
use crate::process::{command, owner_spec};
use crate::target::{Platform, Target};

const SOURCE_DIR: &str = "cupy";
const DESCRIPTION_FILE: &str = "description.rst";

impl Pipeline<'_> {
    pub(super) fn build_linux(&self, request: &BuildRequest) -> Result<PathBuf> {
        let plan = self.plan_build(request)?;
        let (image_tag, base_image) = plan.image.clone().ok_or_else(|| {
            DistError::config(format!("target {} has no builder image", plan.target))
        })?;
        let agent_args = linux_agent_args(&plan, &owner_spec());

        let workdir = self.workdir()?;
        let root = workdir.path();
        self.stage_source(request, &plan, root)?;

        let context = root.join("builder");
        let builder_dir = self.driver_path(&self.config.builder_dir);
        info!("copying builder directory to {}", context.display());
        copy_tree(&builder_dir, &context)
            .with_context(|| format!("copying builder directory '{}'", builder_dir.display()))?;

        let cudnn = self.stage_accelerators(request, &plan, &context)?;
        if plan.target.is_wheel() {
            info!("writing wheel metadata");
            WheelMetadata::new(plan.cuda.as_deref(), cudnn.as_ref()).write(root)?;
        }

        container::build_builder_image(
            self.exec,
            &context,
            &image_tag,
            &base_image,
            &self.config.python_versions,
            &self.config.cython_version,
        )?;
        info!("starting build");
        container::run_container(self.exec, &image_tag, plan.kind, root, &agent_args)?;
        info!("finished build");

        collect_artifact(root, &plan, &request.output)
    }

    pub(super) fn build_windows(&self, request: &BuildRequest) -> Result<PathBuf> {
        let plan = self.plan_build(request)?;
        let cuda = plan.cuda.as_deref().unwrap_or_default();

        // The build mutates the host toolkit, so check the host before anything else.
        let host = self.host();
        host.check_windows(self.config.wheel_windows(cuda)?, cuda, &plan.python)?;
        let cuda_path = host
            .cuda_path
            .clone()
            .ok_or_else(|| DistError::precondition("CUDA_PATH is not set"))?;
        let lib_paths = plan
            .libs
            .iter()
            .map(|lib| {
                host.find_file(lib).ok_or_else(|| {
                    DistError::precondition(format!("Library {lib} could not be found in PATH"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let agent_args = windows_agent_args(&plan, &lib_paths);

        let workdir = self.workdir()?;
        let root = workdir.path();
        self.stage_source(request, &plan, root)?;

        let release = cudnn::resolve(
            self.exec,
            &self.config.python,
            &self.driver_path(&self.config.library_installer),
            cuda,
            Platform::Windows,
        )?;
        let cudnn_dir = root.join("cudnn");
        cudnn::download_and_extract(self.exec, &release.asset.url, &cudnn_dir)?;
        info!("installing cuDNN to {}", cuda_path.display());
        merge_directory(&cudnn_dir, &cuda_path)
            .with_context(|| format!("installing cuDNN into '{}'", cuda_path.display()))?;

        info!("writing wheel metadata");
        WheelMetadata::new(Some(cuda), Some(&release)).write(root)?;

        info!("starting build");
        let agent = self.driver_path(&self.config.builder_dir).join("agent.py");
        let mut cmd = command(&self.config.python, Some(root));
        cmd.arg(&agent).args(&agent_args);
        self.exec.run(&mut cmd).context("running build agent")?;
        info!("finished build");

        collect_artifact(root, &plan, &request.output)
    }

    fn plan_build(&self, request: &BuildRequest) -> Result<BuildPlan> {
        let version = version_from_source_tree(&request.source, &self.config.version_file)?;
        let plan = resolve_build(self.config, request, &version)?;
        info!(
            "starting {} build from {} (version {}, for CUDA {} + Python {})",
            plan.target,
            request.source.display(),
            plan.version,
            plan.cuda.as_deref().unwrap_or("None"),
            plan.python
        );
        Ok(plan)
    }

    fn stage_source(&self, request: &BuildRequest, plan: &BuildPlan, root: &Path) -> Result<()> {
        info!("copying source tree from {}", request.source.display());
        copy_tree(&request.source, &root.join(SOURCE_DIR))
            .with_context(|| format!("copying source tree from '{}'", request.source.display()))?;
        let description = root.join(DESCRIPTION_FILE);
        fs::write(&description, &plan.long_description)
            .with_context(|| format!("writing '{}'", description.display()))
    }

    /// Fill `<context>/nccl` and `<context>/cudnn`; both exist afterwards even
    /// when the target ships neither.
    fn stage_accelerators(
        &self,
        request: &BuildRequest,
        plan: &BuildPlan,
        context: &Path,
    ) -> Result<Option<CudnnRelease>> {
        let nccl_dir = context.join("nccl");
        fs::create_dir_all(&nccl_dir)
            .with_context(|| format!("creating '{}'", nccl_dir.display()))?;
        match (&plan.nccl, request.nccl_assets.as_deref()) {
            (Some(nccl), Some(assets)) => {
                archive::extract_nccl(self.exec, nccl, assets, &nccl_dir)?
            }
            (Some(_), None) => {
                return Err(DistError::config("--nccl-assets is required for this build").into())
            }
            (None, _) => info!("NCCL is not installed for this build"),
        }

        let cudnn_dir = context.join("cudnn");
        fs::create_dir_all(&cudnn_dir)
            .with_context(|| format!("creating '{}'", cudnn_dir.display()))?;
        let Some(cuda) = plan.cuda.as_deref().filter(|_| plan.needs_cudnn) else {
            info!("cuDNN is not installed for this build");
            return Ok(None);
        };
        let release = cudnn::resolve(
            self.exec,
            &self.config.python,
            &self.driver_path(&self.config.library_installer),
            cuda,
            Platform::Linux,
        )?;
        cudnn::download_and_extract(self.exec, &release.asset.url, &cudnn_dir.join("cuda"))?;
        Ok(Some(release))
    }
}

/// `flag v1 flag v2 ...`
fn pairs(flag: &str, values: impl IntoIterator<Item = String>) -> Vec<String> {
    values
        .into_iter()
        .flat_map(|value| [flag.to_string(), value])
        .collect()
}

fn metadata_path() -> String {
    format!("../{WHEEL_METADATA_FILENAME}")
}

/// Arguments for `builder/agent.py` inside the builder container.
fn linux_agent_args(plan: &BuildPlan, owner: &str) -> Vec<String> {
    let mut args: Vec<String> = [
        "--action",
        plan.agent_action(),
        "--source",
        SOURCE_DIR,
        "--python",
        plan.python.as_str(),
        "--chown",
        owner,
    ]
    .map(String::from)
    .to_vec();
    args.extend(pairs("--requires", plan.requires.iter().cloned()));

    args.extend(setup_args_head(plan));
    match plan.target {
        Target::WheelLinux => {
            args.extend([
                "--cupy-no-rpath".to_string(),
                "--cupy-wheel-metadata".to_string(),
                metadata_path(),
            ]);
            args.extend(pairs("--cupy-wheel-lib", plan.libs.iter().cloned()));
            args.extend(pairs(
                "--cupy-wheel-include",
                plan.includes.iter().map(|(path, rel)| format!("{path}:{rel}")),
            ));
        }
        Target::Sdist => args.push("--cupy-no-cuda".to_string()),
        Target::WheelWin => {}
    }
    args
}

/// Arguments for `builder/agent.py` run directly on a Windows host.
fn windows_agent_args(plan: &BuildPlan, lib_paths: &[PathBuf]) -> Vec<String> {
    let mut args: Vec<String> = ["--action", plan.agent_action(), "--source", SOURCE_DIR]
        .map(String::from)
        .to_vec();
    args.extend(pairs("--requires", plan.requires.iter().cloned()));
    args.extend(setup_args_head(plan));
    args.extend(["--cupy-wheel-metadata".to_string(), metadata_path()]);
    args.extend(pairs(
        "--cupy-wheel-lib",
        lib_paths.iter().map(|p| p.display().to_string()),
    ));
    args
}

fn setup_args_head(plan: &BuildPlan) -> [String; 4] {
    [
        "--cupy-package-name".to_string(),
        plan.package_name.clone(),
        "--cupy-long-description".to_string(),
        format!("../{DESCRIPTION_FILE}"),
    ]
}

/// Copy `<workdir>/cupy/dist/<asset_name>` to `<output>/<asset_dest_name>`.
fn collect_artifact(workdir: &Path, plan: &BuildPlan, output: &Path) -> Result<PathBuf> {
    let asset = workdir.join(SOURCE_DIR).join("dist").join(&plan.asset_name);
    if !asset.is_file() {
        return Err(DistError::MissingArtifact { path: asset }.into());
    }
    fs::create_dir_all(output).with_context(|| format!("creating '{}'", output.display()))?;
    let dest = output.join(&plan.asset_dest_name);
    info!("copying asset from {} to {}", asset.display(), dest.display());
    copy_file(&asset, &dest)?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DistConfig, Version3};
    use crate::error::category;
    use crate::pipeline::testing::{arg_after, volume_dir, Fixture, CUDNN_DUMP};
    use crate::pipeline::HostEnv;
    use crate::process::testing::{Recorded, RecordingExec};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn request(fixture: &Fixture, target: Target, cuda: Option<&str>) -> BuildRequest {
        BuildRequest {
            target,
            cuda: cuda.map(str::to_string),
            python: "3.10.0".into(),
            nccl_assets: None,
            source: fixture.source.clone(),
            output: fixture.output.clone(),
        }
    }

    /// Drop `name` into the agent's dist directory when the container runs.
    fn produce_on_run(name: &'static str) -> impl Fn(&Recorded) -> Result<Vec<u8>> {
        move |call| {
            if call.argv.get(1).map(String::as_str) == Some("run") {
                let dist = volume_dir(call).join("cupy/dist");
                fs::create_dir_all(&dist).unwrap();
                fs::write(dist.join(name), b"wheel").unwrap();
            }
            Ok(Vec::new())
        }
    }

    #[test]
    fn sdist_with_cuda_runs_nothing() {
        let fixture = Fixture::new();
        let config = DistConfig::builtin().unwrap();
        let exec = RecordingExec::ok();
        let pipeline = fixture.pipeline(&config, &exec);

        let err = pipeline
            .build(&request(&fixture, Target::Sdist, Some("12.x")))
            .unwrap_err();

        assert!(matches!(category(&err), Some(DistError::Config(_))));
        assert!(exec.calls.borrow().is_empty());
        assert!(fixture.scratch_is_empty());
    }

    #[test]
    fn sdist_build_publishes_tarball() {
        let fixture = Fixture::new();
        let config = DistConfig::builtin().unwrap();
        let exec = RecordingExec::new(produce_on_run("cupy-13.0.0.tar.gz"));
        let pipeline = fixture.pipeline(&config, &exec);

        let published = pipeline.build(&request(&fixture, Target::Sdist, None)).unwrap();

        assert_eq!(published, fixture.output.join("cupy-13.0.0.tar.gz"));
        let calls = exec.calls.borrow();
        assert!(calls[0].has_pair("-t", "cupy-builder-sdist"));
        assert_eq!(calls[1].program(), "nvidia-docker");
        assert!(calls[1].argv.iter().any(|a| a == "--cupy-no-cuda"));
        assert!(calls[1].has_pair("--action", "sdist"));
        assert!(fixture.scratch_is_empty());
    }

    #[test]
    fn rocm_wheel_skips_nccl_and_cudnn() {
        let fixture = Fixture::new();
        let config = DistConfig::builtin().unwrap();
        let seen_metadata = Rc::new(RefCell::new(None));
        let seen = Rc::clone(&seen_metadata);
        let produce = produce_on_run("cupy-rocm-5-0-13.0.0-cp310-cp310-linux_x86_64.whl");
        let exec = RecordingExec::new(move |call| {
            if call.argv.get(1).map(String::as_str) == Some("run") {
                let root = volume_dir(call);
                assert!(root.join("builder/nccl").is_dir());
                assert!(root.join("builder/cudnn").is_dir());
                assert_eq!(fs::read_dir(root.join("builder/cudnn")).unwrap().count(), 0);
                *seen.borrow_mut() = Some(fs::read_to_string(root.join("_wheel.json")).unwrap());
            }
            produce(call)
        });
        let pipeline = fixture.pipeline(&config, &exec);

        let published = pipeline
            .build(&request(&fixture, Target::WheelLinux, Some("rocm-5.0")))
            .unwrap();

        assert_eq!(exec.programs(), ["docker", "docker"]);
        assert!(exec.calls.borrow()[1].argv.iter().any(|a| a == "--device=/dev/kfd"));
        let metadata: serde_json::Value =
            serde_json::from_str(seen_metadata.borrow().as_deref().unwrap()).unwrap();
        assert_eq!(metadata, serde_json::json!({"cuda": "rocm-5.0"}));
        assert_eq!(
            published.file_name().unwrap(),
            "cupy-rocm-5-0-13.0.0-cp310-cp310-manylinux1_x86_64.whl"
        );
    }

    #[test]
    fn cuda_wheel_stages_nccl_and_cudnn() {
        let fixture = Fixture::new();
        let config = DistConfig::builtin().unwrap();
        let seen_metadata = Rc::new(RefCell::new(None));
        let seen = Rc::clone(&seen_metadata);
        let produce = produce_on_run("cupy-cuda12x-13.0.0-cp310-cp310-linux_x86_64.whl");
        let exec = RecordingExec::new(move |call| {
            match call.program() {
                "python3" | "python" => return Ok(CUDNN_DUMP.as_bytes().to_vec()),
                "curl" => fs::write(arg_after(call, "-o"), b"archive").unwrap(),
                "tar" => {
                    let dest = PathBuf::from(arg_after(call, "-C"));
                    let payload = if arg_after(call, "-f").contains("cudnn") {
                        "cuda/include/cudnn.h"
                    } else {
                        "lib/libnccl.so.2"
                    };
                    fs::create_dir_all(dest.join(payload).parent().unwrap()).unwrap();
                    fs::write(dest.join(payload), b"x").unwrap();
                }
                _ if call.argv[1] == "run" => {
                    let root = volume_dir(call);
                    assert!(root.join("builder/nccl/lib/libnccl.so.2").is_file());
                    assert!(root.join("builder/cudnn/cuda/include/cudnn.h").is_file());
                    *seen.borrow_mut() =
                        Some(fs::read_to_string(root.join("_wheel.json")).unwrap());
                }
                _ => {}
            }
            produce(call)
        });
        let pipeline = fixture.pipeline(&config, &exec);
        let mut req = request(&fixture, Target::WheelLinux, Some("12.x"));
        req.nccl_assets = Some(fixture.root().join("nccl-assets"));

        let published = pipeline.build(&req).unwrap();

        assert!(published.ends_with("cupy-cuda12x-13.0.0-cp310-cp310-manylinux1_x86_64.whl"));
        let metadata: serde_json::Value =
            serde_json::from_str(seen_metadata.borrow().as_deref().unwrap()).unwrap();
        assert_eq!(metadata["cudnn"]["version"], "8.9.7");
        let calls = exec.calls.borrow();
        let run = calls.last().unwrap();
        assert!(run.has_pair("--requires", "fastrlock>=0.5"));
        assert!(run.has_pair("--cupy-wheel-metadata", "../_wheel.json"));
        assert!(run.has_pair("--cupy-package-name", "cupy-cuda12x"));
        assert!(run.argv.iter().any(|a| a == "--cupy-no-rpath"));
    }

    #[test]
    fn missing_artifact_is_distinct_error() {
        let fixture = Fixture::new();
        let config = DistConfig::builtin().unwrap();
        let exec = RecordingExec::ok();
        let pipeline = fixture.pipeline(&config, &exec);

        let err = pipeline
            .build(&request(&fixture, Target::WheelLinux, Some("rocm-5.0")))
            .unwrap_err();

        assert!(matches!(
            category(&err),
            Some(DistError::MissingArtifact { .. })
        ));
        assert!(fixture.scratch_is_empty());
    }

    fn windows_host(fixture: &Fixture) -> HostEnv {
        let bin = fixture.root().join("cuda/bin");
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join("cudart64_12.dll"), b"dll").unwrap();
        fs::write(bin.join("nvToolsExt64_1.dll"), b"dll").unwrap();
        HostEnv {
            os: "windows".into(),
            python_version: Some("3.10.11".into()),
            cuda_path: Some(fixture.root().join("cuda")),
            cuda_runtime: Some(Version3(12, 2, 140)),
            search_path: vec![bin],
        }
    }

    #[test]
    fn windows_wheel_installs_cudnn_into_toolkit() {
        let fixture = Fixture::new();
        let mut config = DistConfig::builtin().unwrap();
        config.wheel_windows.get_mut("12.x").unwrap().libs = vec!["nvToolsExt64_1.dll".into()];
        let exec = RecordingExec::new(|call| {
            if call.has_pair("--action", "dump") {
                return Ok(CUDNN_DUMP.as_bytes().to_vec());
            }
            match call.program() {
                "curl" => fs::write(arg_after(call, "-o"), b"zip").unwrap(),
                "unzip" | "tar" => {
                    let dest = PathBuf::from(if call.program() == "unzip" {
                        arg_after(call, "-d")
                    } else {
                        arg_after(call, "-C")
                    });
                    fs::create_dir_all(dest.join("cuda/bin")).unwrap();
                    fs::write(dest.join("cuda/bin/cudnn64_8.dll"), b"dll").unwrap();
                }
                _ => {
                    let cwd = call.cwd.clone().unwrap();
                    assert!(call.argv[1].ends_with("agent.py"));
                    let dist = cwd.join("cupy/dist");
                    fs::create_dir_all(&dist).unwrap();
                    fs::write(dist.join("cupy-cuda12x-13.0.0-cp310-cp310-win_amd64.whl"), b"w")
                        .unwrap();
                }
            }
            Ok(Vec::new())
        });
        let pipeline = fixture
            .pipeline(&config, &exec)
            .with_host(windows_host(&fixture));

        let published = pipeline
            .build(&request(&fixture, Target::WheelWin, Some("12.x")))
            .unwrap();

        assert!(published.ends_with("cupy-cuda12x-13.0.0-cp310-cp310-win_amd64.whl"));
        assert!(fixture.root().join("cuda/bin/cudnn64_8.dll").is_file());
        assert!(fixture.root().join("cuda/bin/cudart64_12.dll").is_file());
        let calls = exec.calls.borrow();
        let agent = calls.last().unwrap();
        let lib = fixture.root().join("cuda/bin/nvToolsExt64_1.dll");
        assert!(agent.has_pair("--cupy-wheel-lib", &lib.display().to_string()));
        assert!(!agent.argv.iter().any(|a| a == "--chown"));
    }

    #[test]
    fn windows_wheel_requires_libraries_on_path() {
        let fixture = Fixture::new();
        let mut config = DistConfig::builtin().unwrap();
        config.wheel_windows.get_mut("12.x").unwrap().libs = vec!["cutensor.dll".into()];
        let exec = RecordingExec::ok();
        let pipeline = fixture
            .pipeline(&config, &exec)
            .with_host(windows_host(&fixture));

        let err = pipeline
            .build(&request(&fixture, Target::WheelWin, Some("12.x")))
            .unwrap_err();

        assert!(matches!(category(&err), Some(DistError::Precondition(_))));
        assert!(err.to_string().contains("cutensor.dll could not be found in PATH"));
        assert!(exec.calls.borrow().is_empty());
    }

    #[test]
    fn windows_wheel_refuses_linux_host() {
        let fixture = Fixture::new();
        let config = DistConfig::builtin().unwrap();
        let exec = RecordingExec::ok();
        let mut host = windows_host(&fixture);
        host.os = "linux".into();
        let pipeline = fixture.pipeline(&config, &exec).with_host(host);

        let err = pipeline
            .build(&request(&fixture, Target::WheelWin, Some("12.x")))
            .unwrap_err();

        assert!(matches!(category(&err), Some(DistError::Precondition(_))));
        assert!(fixture.scratch_is_empty());
    }

    #[test]
    fn linux_wheel_args_carry_libs_and_includes() {
        let config = DistConfig::builtin().unwrap();
        let fixture = Fixture::new();
        let req = request(&fixture, Target::WheelLinux, Some("rocm-5.0"));
        let mut plan = resolve_build(&config, &req, "13.0.0").unwrap();
        plan.libs = vec!["/opt/rocm/lib/librccl.so".into()];
        plan.includes = vec![("/opt/rocm/include/rccl.h".into(), "rccl/rccl.h".into())];

        let args = linux_agent_args(&plan, "1000:1000");

        let has = |flag: &str, value: &str| args.windows(2).any(|w| w[0] == flag && w[1] == value);
        assert!(has("--chown", "1000:1000"));
        assert!(has("--source", "cupy"));
        assert!(has("--cupy-wheel-lib", "/opt/rocm/lib/librccl.so"));
        assert!(has("--cupy-wheel-include", "/opt/rocm/include/rccl.h:rccl/rccl.h"));
        assert!(has("--cupy-long-description", "../description.rst"));
    }
}
