//! Shared fixtures for pipeline tests.

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use super::Pipeline;
use crate::config::DistConfig;
use crate::process::testing::Recorded;
use crate::process::Exec;

pub const CUDNN_DUMP: &str = r#"[
    {"cuda": "11.x", "cudnn": "8.8.1",
     "assets": {"Linux": {"url": "https://example.invalid/cudnn-11.tar.xz", "filename": "libcudnn.so.8"}}},
    {"cuda": "12.x", "cudnn": "8.9.7",
     "assets": {"Linux": {"url": "https://example.invalid/cudnn-12.tar.xz", "filename": "libcudnn.so.8"},
                "Windows": {"url": "https://example.invalid/cudnn-12.zip", "filename": "cudnn64_8.dll"}}}
]"#;

/// Driver checkout, source tree, distribution and tests laid out in a temp dir.
pub struct Fixture {
    temp: TempDir,
    pub driver_root: PathBuf,
    pub source: PathBuf,
    pub output: PathBuf,
    pub scratch: PathBuf,
    pub dist: PathBuf,
    pub tests: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let write = |rel: &str, body: &str| {
            let path = root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, body).unwrap();
        };
        write("driver/builder/Dockerfile", "FROM ${base_image}\n");
        write("driver/builder/agent.py", "");
        write("driver/verifier/Dockerfile.rhel", "# rhel\n");
        write("driver/verifier/Dockerfile.debian", "# debian\n");
        write("driver/verifier/agent.py", "");
        write("src/cupy/_version.py", "__version__ = '13.0.0'\n");
        write("src/setup.py", "");
        write("nccl-assets/README", "");
        write("dist/cupy_cuda12x-13.0.0-cp310-cp310-manylinux1_x86_64.whl", "wheel");
        write("tests/cupy_tests/test_core.py", "def test_ok(): pass\n");
        fs::create_dir_all(root.join("scratch")).unwrap();

        Self {
            driver_root: root.join("driver"),
            source: root.join("src"),
            output: root.join("out"),
            scratch: root.join("scratch"),
            dist: root.join("dist/cupy_cuda12x-13.0.0-cp310-cp310-manylinux1_x86_64.whl"),
            tests: root.join("tests/cupy_tests"),
            temp,
        }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn pipeline<'a>(&self, config: &'a DistConfig, exec: &'a dyn Exec) -> Pipeline<'a> {
        Pipeline::new(config, exec, &self.driver_root).with_scratch_root(&self.scratch)
    }

    /// True once every working directory has been cleaned up.
    pub fn scratch_is_empty(&self) -> bool {
        fs::read_dir(&self.scratch).unwrap().next().is_none()
    }
}

pub fn arg_after<'c>(call: &'c Recorded, flag: &str) -> &'c str {
    let pos = call.argv.iter().position(|a| a == flag).unwrap();
    &call.argv[pos + 1]
}

/// Host side of the `--volume <dir>:/work` mount.
pub fn volume_dir(call: &Recorded) -> PathBuf {
    PathBuf::from(arg_after(call, "--volume").strip_suffix(":/work").unwrap())
}
