#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use crate::config::Config;

pub const HIDDEN_DIR: &str = ".datmo";
pub const IGNORE_FILE: &str = ".datmoignore";
pub const TASK_LOG_FILE: &str = "task.log";

/// On-disk layout of one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
    environment_dir: String,
    files_dir: String,
}

impl Layout {
    #[must_use]
    pub fn new(root: PathBuf, cfg: &Config) -> Self {
        Self {
            root,
            environment_dir: cfg.project.environment_dir.clone(),
            files_dir: cfg.project.files_dir.clone(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn hidden_dir(&self) -> PathBuf {
        self.root.join(HIDDEN_DIR)
    }

    #[must_use]
    pub fn database_dir(&self) -> PathBuf {
        self.hidden_dir().join("database")
    }

    #[must_use]
    pub fn code_dir(&self) -> PathBuf {
        self.hidden_dir().join("code")
    }

    #[must_use]
    pub fn collections_dir(&self) -> PathBuf {
        self.hidden_dir().join("collections")
    }

    #[must_use]
    pub fn tasks_dir(&self) -> PathBuf {
        self.hidden_dir().join("tasks")
    }

    #[must_use]
    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.tasks_dir().join(task_id)
    }

    #[must_use]
    pub fn tmp_dir(&self) -> PathBuf {
        self.hidden_dir().join("tmp")
    }

    #[must_use]
    pub fn driver_config_file(&self) -> PathBuf {
        self.hidden_dir().join(".config")
    }

    #[must_use]
    pub fn environment_dir_name(&self) -> &str {
        &self.environment_dir
    }

    #[must_use]
    pub fn environment_dir(&self) -> PathBuf {
        self.root.join(&self.environment_dir)
    }

    #[must_use]
    pub fn files_dir_name(&self) -> &str {
        &self.files_dir
    }

    #[must_use]
    pub fn files_dir(&self) -> PathBuf {
        self.root.join(&self.files_dir)
    }

    #[must_use]
    pub fn ignore_file(&self) -> PathBuf {
        self.root.join(IGNORE_FILE)
    }

    /// Top-level entries that never belong to the tracked code tree.
    #[must_use]
    pub fn untracked_roots(&self) -> Vec<&str> {
        vec![
            HIDDEN_DIR,
            ".git",
            IGNORE_FILE,
            self.environment_dir.as_str(),
            self.files_dir.as_str(),
        ]
    }

    /// Path relative to the project root, `/`-separated.
    #[must_use]
    pub fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        Some(crate::core::tree::slash_path(rel))
    }
}
