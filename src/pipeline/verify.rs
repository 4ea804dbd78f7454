use anyhow::{Context, Result};
use std::env;
use std::fs;
use std::path::Path;
use tracing::info;

use super::container;
use super::resolve::{resolve_verify_linux, SystemImage, VerifyPlan};
use super::{Pipeline, VerifyRequest};
use crate::archive;
use crate::error::DistError;
use crate::merge::{copy_file, copy_tree};
use crate::process::{command, owner_spec};

impl Pipeline<'_> {
    /// Verify on every configured system in order, stopping at the first failure.
    pub(super) fn verify_linux(&self, request: &VerifyRequest) -> Result<()> {
        let plan = resolve_verify_linux(self.config, request)?;
        for image in &plan.images {
            info!(
                "starting verification for {} on {} with Python {}",
                request.dist.display(),
                image.base_image,
                plan.python
            );
            self.verify_linux_system(request, &plan, image)
                .with_context(|| format!("verifying on {}", image.base_image))?;
        }
        Ok(())
    }

    fn verify_linux_system(
        &self,
        request: &VerifyRequest,
        plan: &VerifyPlan,
        image: &SystemImage,
    ) -> Result<()> {
        let dist_name = file_name(&request.dist)?;
        let agent_args = linux_agent_args(plan, &dist_name, &owner_spec());

        let workdir = self.workdir()?;
        let root = workdir.path();
        stage_dist_and_tests(request, &dist_name, root)?;

        let context = root.join("verifier");
        let verifier_dir = self.driver_path(&self.config.verifier_dir);
        info!("copying verifier directory to {}", context.display());
        copy_tree(&verifier_dir, &context)
            .with_context(|| format!("copying verifier directory '{}'", verifier_dir.display()))?;

        let nccl_dir = context.join("nccl");
        fs::create_dir_all(&nccl_dir)
            .with_context(|| format!("creating '{}'", nccl_dir.display()))?;
        match (&plan.nccl, request.nccl_assets.as_deref()) {
            (Some(nccl), Some(assets)) => {
                archive::extract_nccl(self.exec, nccl, assets, &nccl_dir)?
            }
            (Some(_), None) => {
                return Err(
                    DistError::config("--nccl-assets is required to verify this target").into(),
                )
            }
            (None, _) => info!("NCCL is not installed for this verification"),
        }

        container::build_verifier_image(
            self.exec,
            &context,
            image,
            &self.config.verify_python_versions,
        )?;
        info!("starting verification");
        container::run_container(self.exec, &image.tag, plan.kind, root, &agent_args)?;
        info!("finished verification");
        Ok(())
    }

    pub(super) fn verify_windows(&self, request: &VerifyRequest) -> Result<()> {
        self.config.ensure_python(&request.python)?;
        let cuda = request.cuda.as_deref().ok_or_else(|| {
            DistError::config("target wheel-win requires a CUDA version (--cuda)")
        })?;
        if request.nccl_assets.is_some() {
            return Err(DistError::config("NCCL not supported on Windows").into());
        }
        let wheel = self.config.wheel_windows(cuda)?;
        self.host().check_windows(wheel, cuda, &request.python)?;

        info!(
            "starting verification for {} with Python {}",
            request.dist.display(),
            request.python
        );
        let dist_name = file_name(&request.dist)?;
        let dist = if request.dist.is_absolute() {
            request.dist.clone()
        } else {
            env::current_dir()
                .context("reading current directory")?
                .join(&request.dist)
        };

        let workdir = self.workdir()?;
        let root = workdir.path();
        stage_dist_and_tests(request, &dist_name, root)?;

        info!("starting verification");
        let agent = self.driver_path(&self.config.verifier_dir).join("agent.py");
        let mut cmd = command(&self.config.python, Some(root));
        cmd.arg(&agent).arg("--dist").arg(&dist).arg("tests");
        self.exec.run(&mut cmd).context("running verification agent")?;
        info!("finished verification");
        Ok(())
    }
}

fn file_name(path: &Path) -> Result<String, DistError> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| DistError::config(format!("'{}' has no file name", path.display())))
}

/// Copy the distribution to `<root>/<dist_name>` and each test directory to
/// `<root>/tests/<basename>`.
fn stage_dist_and_tests(request: &VerifyRequest, dist_name: &str, root: &Path) -> Result<()> {
    info!("copying distribution from {}", request.dist.display());
    copy_file(&request.dist, &root.join(dist_name))?;

    let tests_dir = root.join("tests");
    fs::create_dir_all(&tests_dir)
        .with_context(|| format!("creating '{}'", tests_dir.display()))?;
    for test in &request.tests {
        info!("copying tests from {}", test.display());
        let dest = tests_dir.join(file_name(test)?);
        copy_tree(test, &dest)
            .with_context(|| format!("copying tests from '{}'", test.display()))?;
    }
    Ok(())
}

/// Arguments for `verifier/agent.py`; everything after `tests` goes to pytest.
fn linux_agent_args(plan: &VerifyPlan, dist_name: &str, owner: &str) -> Vec<String> {
    let mut args: Vec<String> = [
        "--python",
        plan.python.as_str(),
        "--dist",
        dist_name,
        "--chown",
        owner,
    ]
    .map(String::from)
    .to_vec();
    if let Some(cuda) = plan.cuda.as_deref().filter(|_| !plan.preloads.is_empty()) {
        args.extend(["--cuda".to_string(), cuda.to_string()]);
        for preload in &plan.preloads {
            args.extend(["--preload".to_string(), preload.clone()]);
        }
    }
    args.push("tests".to_string());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DistConfig, Version3};
    use crate::error::category;
    use crate::pipeline::testing::{arg_after, volume_dir, Fixture};
    use crate::pipeline::HostEnv;
    use crate::process::testing::RecordingExec;
    use crate::target::Target;

    fn request(fixture: &Fixture, target: Target, cuda: Option<&str>) -> VerifyRequest {
        VerifyRequest {
            target,
            cuda: cuda.map(str::to_string),
            python: "3.10.0".into(),
            nccl_assets: None,
            dist: fixture.dist.clone(),
            tests: vec![fixture.tests.clone()],
        }
    }

    #[test]
    fn wheel_is_verified_on_each_system() {
        let fixture = Fixture::new();
        let config = DistConfig::builtin().unwrap();
        let exec = RecordingExec::new(|call| {
            if call.program() == "nvidia-docker" {
                let root = volume_dir(call);
                assert!(root.join(arg_after(call, "--dist")).is_file());
                assert!(root.join("tests/cupy_tests/test_core.py").is_file());
                assert!(root.join("verifier/nccl").is_dir());
                let tag = &call.argv[call.argv.iter().position(|a| a == "--workdir").unwrap() + 2];
                let dockerfile = fs::read_to_string(root.join("verifier/Dockerfile")).unwrap();
                if tag.ends_with("centos7") {
                    assert_eq!(dockerfile, "# rhel\n");
                } else {
                    assert_eq!(dockerfile, "# debian\n");
                }
            }
            Ok(Vec::new())
        });
        let pipeline = fixture.pipeline(&config, &exec);

        pipeline
            .verify(&request(&fixture, Target::WheelLinux, Some("12.x")))
            .unwrap();

        assert_eq!(exec.programs(), ["docker", "nvidia-docker", "docker", "nvidia-docker"]);
        let calls = exec.calls.borrow();
        assert!(calls[0].has_pair("-t", "cupy-verifier-wheel-linux-12.x-ubuntu20.04"));
        assert!(calls[0].has_pair(
            "--build-arg",
            "base_image=nvidia/cuda:12.0.1-runtime-ubuntu20.04"
        ));
        assert!(calls[2].has_pair("-t", "cupy-verifier-wheel-linux-12.x-centos7"));
        let run = &calls[1];
        assert!(run.has_pair("--cuda", "12.x"));
        assert!(run.has_pair("--preload", "cutensor"));
        assert_eq!(run.argv.last().unwrap(), "tests");
        assert!(fixture.scratch_is_empty());
    }

    #[test]
    fn first_failing_system_stops_verification() {
        let fixture = Fixture::new();
        let config = DistConfig::builtin().unwrap();
        let exec = RecordingExec::new(|call| {
            if call.program() == "nvidia-docker" {
                anyhow::bail!("pytest failed");
            }
            Ok(Vec::new())
        });
        let pipeline = fixture.pipeline(&config, &exec);

        let err = pipeline
            .verify(&request(&fixture, Target::WheelLinux, Some("12.x")))
            .unwrap_err();

        assert!(format!("{err:#}").contains("ubuntu20.04"));
        assert_eq!(exec.programs(), ["docker", "nvidia-docker"]);
        assert!(fixture.scratch_is_empty());
    }

    #[test]
    fn unknown_system_fails_before_any_container_runs() {
        let fixture = Fixture::new();
        let mut config = DistConfig::builtin().unwrap();
        config
            .wheel_linux
            .get_mut("12.x")
            .unwrap()
            .verify_systems = vec!["ubuntu20.04".into(), "alpine3.19".into()];
        let exec = RecordingExec::ok();
        let pipeline = fixture.pipeline(&config, &exec);

        let err = pipeline
            .verify(&request(&fixture, Target::WheelLinux, Some("12.x")))
            .unwrap_err();

        assert!(matches!(category(&err), Some(DistError::Config(_))));
        assert!(err.to_string().contains("alpine3.19"));
        assert!(exec.calls.borrow().is_empty());
        assert!(fixture.scratch_is_empty());
    }

    #[test]
    fn sdist_verification_stages_nccl() {
        let fixture = Fixture::new();
        let config = DistConfig::builtin().unwrap();
        let exec = RecordingExec::ok();
        let pipeline = fixture.pipeline(&config, &exec);
        let mut req = request(&fixture, Target::Sdist, None);

        let err = pipeline.verify(&req).unwrap_err();
        assert!(matches!(category(&err), Some(DistError::Config(_))));
        assert!(exec.calls.borrow().is_empty());

        req.nccl_assets = Some(fixture.root().join("nccl-assets"));
        pipeline.verify(&req).unwrap();

        let calls = exec.calls.borrow();
        assert_eq!(calls[0].program(), "tar");
        assert!(calls[0].has_pair("--strip-components", "1"));
        let run = calls.iter().find(|c| c.program() == "nvidia-docker").unwrap();
        assert!(!run.argv.iter().any(|a| a == "--preload" || a == "--cuda"));
    }

    #[test]
    fn rocm_wheel_is_verified_with_docker() {
        let fixture = Fixture::new();
        let config = DistConfig::builtin().unwrap();
        let exec = RecordingExec::ok();
        let pipeline = fixture.pipeline(&config, &exec);

        pipeline
            .verify(&request(&fixture, Target::WheelLinux, Some("rocm-5.0")))
            .unwrap();

        let calls = exec.calls.borrow();
        assert!(calls[0].has_pair("--build-arg", "base_image=rocm/dev-ubuntu-20.04:5.0"));
        assert!(calls[1].argv.iter().any(|a| a == "--device=/dev/dri"));
        assert!(!calls[1].argv.iter().any(|a| a == "--cuda"));
    }

    fn windows_host(fixture: &Fixture) -> HostEnv {
        let bin = fixture.root().join("cuda/bin");
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join("cudart64_12.dll"), b"dll").unwrap();
        HostEnv {
            os: "windows".into(),
            python_version: Some("3.10.11".into()),
            cuda_path: Some(fixture.root().join("cuda")),
            cuda_runtime: Some(Version3(12, 1, 105)),
            search_path: vec![bin],
        }
    }

    #[test]
    fn windows_verification_runs_agent_on_host() {
        let fixture = Fixture::new();
        let config = DistConfig::builtin().unwrap();
        let exec = RecordingExec::new(|call| {
            let cwd = call.cwd.clone().unwrap();
            assert!(cwd.join("tests/cupy_tests/test_core.py").is_file());
            Ok(Vec::new())
        });
        let pipeline = fixture
            .pipeline(&config, &exec)
            .with_host(windows_host(&fixture));

        pipeline
            .verify(&request(&fixture, Target::WheelWin, Some("12.x")))
            .unwrap();

        let calls = exec.calls.borrow();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].argv[1].ends_with("agent.py"));
        assert!(calls[0].has_pair("--dist", &fixture.dist.display().to_string()));
        assert_eq!(calls[0].argv.last().unwrap(), "tests");
    }

    #[test]
    fn windows_verification_rejects_nccl() {
        let fixture = Fixture::new();
        let config = DistConfig::builtin().unwrap();
        let exec = RecordingExec::ok();
        let pipeline = fixture
            .pipeline(&config, &exec)
            .with_host(windows_host(&fixture));
        let mut req = request(&fixture, Target::WheelWin, Some("12.x"));
        req.nccl_assets = Some(fixture.root().join("nccl-assets"));

        let err = pipeline.verify(&req).unwrap_err();

        assert!(err.to_string().contains("NCCL not supported on Windows"));
        assert!(exec.calls.borrow().is_empty());
    }
}
