use assert_cmd::Command;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub struct TestProject {
    pub root: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        Self { root }
    }

    /// demos/ 以下のプロジェクトを一時ディレクトリに複製
    pub fn from_demo(name: &str) -> Self {
        let project = Self::new();
        let demo = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../demos")
            .join(name);
        copy_dir(&demo, project.root.path());
        project
    }

    pub fn write_sky_kdl(&self, content: &str) {
        fs::write(self.root.path().join("sky.kdl"), content).unwrap();
    }

    #[allow(dead_code)]
    pub fn write_settings(&self, content: &str) {
        let dir = self.root.path().join(".skyflow");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("config.yaml"), content).unwrap();
    }

    pub fn path(&self) -> PathBuf {
        self.root.path().to_path_buf()
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.path().join(".skyflow").join("state.json")
    }

    /// プロジェクトをカレントディレクトリにした `sky` コマンド
    #[allow(deprecated)]
    pub fn sky(&self) -> Command {
        let mut cmd = Command::cargo_bin("sky").unwrap();
        cmd.current_dir(self.path())
            .env_remove("SKYFLOW_PROJECT_ROOT")
            .env_remove("SKYFLOW_PARALLELISM")
            .env_remove("SKYFLOW_LOCAL_FAIL")
            .env_remove("AWS_REGION")
            .env_remove("RUST_LOG")
            .env("NO_COLOR", "1");
        cmd
    }
}

fn copy_dir(from: &Path, to: &Path) {
    fs::create_dir_all(to).unwrap();
    for entry in fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        let target = to.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            copy_dir(&entry.path(), &target);
        } else {
            fs::copy(entry.path(), target).unwrap();
        }
    }
}
