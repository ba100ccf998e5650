#![allow(dead_code)]

use std::path::Path;
use std::process::Command;

use datmo::config::Config;
use datmo::project::ProjectRoot;

/// Scratch directory for one test, under `TEST_DATMO_DIR` when set.
pub fn scratch_dir() -> tempfile::TempDir {
    match std::env::var_os("TEST_DATMO_DIR") {
        Some(dir) => tempfile::Builder::new()
            .prefix("datmo-test-")
            .tempdir_in(dir)
            .expect("tempdir in TEST_DATMO_DIR"),
        None => tempfile::tempdir().expect("tempdir"),
    }
}

/// Settings that keep the container runtime out of a test.
pub fn offline_config() -> Config {
    let mut cfg = Config::default();
    cfg.environment.docker_command = "datmo-test-no-container-runtime".to_owned();
    cfg
}

pub fn init_project(dir: &Path, cfg: Config) -> ProjectRoot {
    let root = ProjectRoot::new(dir, cfg).expect("project root");
    root.init("test-project", Some("integration")).expect("init");
    root
}

pub fn docker_available() -> bool {
    Command::new("docker")
        .args(["info", "--format", "{{.ServerVersion}}"])
        .output()
        .is_ok_and(|out| out.status.success())
}
