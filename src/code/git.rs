#![forbid(unsafe_code)]

//! Code refs kept inside an existing git repository under `refs/datmo/<commit>`.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use crate::code::CodeDriver;
use crate::core::layout::HIDDEN_DIR;
use crate::error::{DatmoError, io_at};

const AUTO_COMMIT_MESSAGE: &str = "auto commit by datmo";

#[derive(Debug, Clone)]
pub struct GitCodeDriver {
    repo_root: PathBuf,
    execpath: String,
}

impl GitCodeDriver {
    #[must_use]
    pub fn new(repo_root: PathBuf, execpath: String) -> Self {
        Self {
            repo_root,
            execpath,
        }
    }

    #[must_use]
    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    fn refs_dir(&self) -> PathBuf {
        self.repo_root.join(".git").join("refs").join("datmo")
    }

    fn exclude_file(&self) -> PathBuf {
        self.repo_root.join(".git").join("info").join("exclude")
    }

    pub fn run(&self, args: &[&str]) -> Result<String, DatmoError> {
        let out = self.run_raw(args)?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&out.stderr);
            Err(DatmoError::Other(format!(
                "git {}: {}",
                args.join(" "),
                stderr.trim()
            )))
        }
    }

    pub fn run_raw(&self, args: &[&str]) -> Result<Output, DatmoError> {
        Command::new(&self.execpath)
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    DatmoError::Other(format!("git executable not found: {}", self.execpath))
                }
                _ => DatmoError::Other(format!("failed to run git: {e}")),
            })
    }

    fn exists_commit(&self, commit_id: &str) -> Result<bool, DatmoError> {
        let spec = format!("{commit_id}^{{commit}}");
        Ok(self
            .run_raw(&["cat-file", "-e", &spec])?
            .status
            .success())
    }

    fn latest_commit(&self) -> Result<String, DatmoError> {
        Ok(self.run(&["rev-parse", "HEAD"])?.trim().to_owned())
    }

    fn is_clean(&self) -> Result<bool, DatmoError> {
        Ok(self.run(&["status", "--porcelain"])?.trim().is_empty())
    }

    /// Adds `.datmo/*` to `.git/info/exclude` unless already listed.
    pub fn ensure_datmo_files_ignored(&self) -> Result<(), DatmoError> {
        let path = self.exclude_file();
        let current = std::fs::read_to_string(&path).unwrap_or_default();
        if current.contains(HIDDEN_DIR) {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_at(parent))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_at(&path))?;
        write!(file, "\n{HIDDEN_DIR}/*\n").map_err(io_at(&path))
    }
}

impl CodeDriver for GitCodeDriver {
    fn driver_type(&self) -> &'static str {
        "git"
    }

    fn init(&self) -> Result<(), DatmoError> {
        if !self.repo_root.join(".git").exists() {
            let _ = self.run(&["init"])?;
        }
        let refs = self.refs_dir();
        std::fs::create_dir_all(&refs).map_err(io_at(&refs))?;
        self.ensure_datmo_files_ignored()
    }

    fn is_initialized(&self) -> bool {
        self.repo_root.join(".git").is_dir() && self.refs_dir().is_dir()
    }

    /// HEAD when the work tree is clean, otherwise a dangling stash commit of the changes.
    fn current_hash(&self) -> Result<String, DatmoError> {
        if self.is_clean()? {
            return self.latest_commit();
        }
        let stash = self.run(&["stash", "create"])?.trim().to_owned();
        if stash.is_empty() {
            self.latest_commit()
        } else {
            Ok(stash)
        }
    }

    fn create_ref(&self, commit_id: Option<&str>) -> Result<String, DatmoError> {
        let refs = self.refs_dir();
        std::fs::create_dir_all(&refs).map_err(io_at(&refs))?;

        let commit_id = match commit_id {
            Some(c) => c.to_owned(),
            None => {
                let _ = self.run(&["add", "-A"])?;
                // Nothing staged means HEAD is the answer. Any other commit failure (identity,
                // hooks) must not be mistaken for a clean tree.
                if !self.is_clean()? {
                    self.run(&["commit", "-m", AUTO_COMMIT_MESSAGE])?;
                }
                self.latest_commit()
                    .map_err(|e| DatmoError::CommitDoesNotExist(e.to_string()))?
            }
        };
        if !self.exists_commit(&commit_id)? {
            return Err(DatmoError::CommitDoesNotExist(commit_id));
        }
        let path = refs.join(&commit_id);
        std::fs::write(&path, &commit_id).map_err(io_at(&path))?;
        tracing::debug!(commit_id = %commit_id, "created git code ref");
        Ok(commit_id)
    }

    fn latest_ref(&self) -> Result<Option<String>, DatmoError> {
        let mut latest: Option<(std::time::SystemTime, String)> = None;
        for commit_id in self.list_refs()? {
            let path = self.refs_dir().join(&commit_id);
            let modified = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .map_err(io_at(&path))?;
            if latest.as_ref().is_none_or(|(t, _)| modified >= *t) {
                latest = Some((modified, commit_id));
            }
        }
        Ok(latest.map(|(_, id)| id))
    }

    fn exists_ref(&self, commit_id: &str) -> Result<bool, DatmoError> {
        Ok(self.refs_dir().join(commit_id).is_file())
    }

    fn list_refs(&self) -> Result<Vec<String>, DatmoError> {
        let dir = self.refs_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut refs = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(io_at(&dir))? {
            let entry = entry.map_err(io_at(&dir))?;
            if entry.path().is_file() {
                refs.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        refs.sort();
        Ok(refs)
    }

    fn delete_ref(&self, commit_id: &str) -> Result<(), DatmoError> {
        if !self.exists_ref(commit_id)? {
            return Err(DatmoError::CommitDoesNotExist(commit_id.to_owned()));
        }
        let path = self.refs_dir().join(commit_id);
        std::fs::remove_file(&path).map_err(io_at(&path))
    }

    fn checkout_ref(&self, commit_id: &str) -> Result<(), DatmoError> {
        if !self.exists_ref(commit_id)? {
            return Err(DatmoError::CommitDoesNotExist(commit_id.to_owned()));
        }
        self.check_unstaged_changes()?;
        let refname = format!("refs/datmo/{commit_id}");
        let _ = self.run(&["checkout", &refname])?;
        Ok(())
    }

    fn has_unstaged_changes(&self) -> Result<bool, DatmoError> {
        Ok(!self.is_clean()?)
    }

    fn delete_refs(&self) -> Result<(), DatmoError> {
        crate::core::tree::remove_path(&self.refs_dir())
    }
}
