#![forbid(unsafe_code)]

//! Filesystem code store.
//!
//! Blobs live at `.datmo/code/<relative-path>/<file-hash>`; a commit is a manifest file
//! `.datmo/code/<commit-id>` with one `<relative-path>,<file-hash>` line per tracked file.

use std::path::PathBuf;
use std::time::SystemTime;

use crate::code::CodeDriver;
use crate::core::hash::{file_hash, manifest_hash, parse_manifest, render_manifest};
use crate::core::layout::Layout;
use crate::core::tree::{self, IgnoreList};
use crate::error::{DatmoError, io_at};

#[derive(Debug, Clone)]
pub struct FileCodeDriver {
    layout: Layout,
}

fn is_commit_name(name: &str) -> bool {
    name.len() == 32 && name.chars().all(|c| c.is_ascii_hexdigit())
}

impl FileCodeDriver {
    #[must_use]
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    fn manifest_path(&self, commit_id: &str) -> PathBuf {
        self.layout.code_dir().join(commit_id)
    }

    /// Relative paths of the files under version control.
    pub fn tracked_files(&self) -> Result<Vec<String>, DatmoError> {
        let ignore = IgnoreList::load(&self.layout.ignore_file())?;
        tree::tracked_files(self.layout.root(), &self.layout.untracked_roots(), &ignore)
    }

    fn tracked_entries(&self) -> Result<Vec<(String, String)>, DatmoError> {
        let root = self.layout.root();
        self.tracked_files()?
            .into_iter()
            .map(|rel| {
                let hash = file_hash(&root.join(&rel))?;
                Ok((rel, hash))
            })
            .collect()
    }

    fn read_manifest(&self, commit_id: &str) -> Result<Vec<(String, String)>, DatmoError> {
        let path = self.manifest_path(commit_id);
        if !path.is_file() {
            return Err(DatmoError::CommitDoesNotExist(commit_id.to_owned()));
        }
        let text = std::fs::read_to_string(&path).map_err(io_at(&path))?;
        Ok(parse_manifest(&text))
    }

    fn ensure_initialized(&self) -> Result<(), DatmoError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(DatmoError::CodeNotInitialized)
        }
    }
}

impl CodeDriver for FileCodeDriver {
    fn driver_type(&self) -> &'static str {
        "file"
    }

    fn init(&self) -> Result<(), DatmoError> {
        let dir = self.layout.code_dir();
        std::fs::create_dir_all(&dir).map_err(io_at(&dir))
    }

    fn is_initialized(&self) -> bool {
        self.layout.code_dir().is_dir()
    }

    fn current_hash(&self) -> Result<String, DatmoError> {
        Ok(manifest_hash(&self.tracked_entries()?))
    }

    fn create_ref(&self, commit_id: Option<&str>) -> Result<String, DatmoError> {
        self.ensure_initialized()?;
        if let Some(commit_id) = commit_id {
            if !self.exists_ref(commit_id)? {
                return Err(DatmoError::CommitDoesNotExist(commit_id.to_owned()));
            }
            return Ok(commit_id.to_owned());
        }

        let root = self.layout.root();
        let entries = self.tracked_entries()?;
        for (rel, hash) in &entries {
            let blob_dir = self.layout.code_dir().join(rel);
            let blob = blob_dir.join(hash);
            if blob.is_file() {
                continue;
            }
            std::fs::create_dir_all(&blob_dir).map_err(io_at(&blob_dir))?;
            std::fs::copy(root.join(rel), &blob).map_err(io_at(&blob))?;
        }

        let commit_id = manifest_hash(&entries);
        // Rewritten even when present so the manifest's mtime marks it as the latest ref.
        let path = self.manifest_path(&commit_id);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, render_manifest(&entries)).map_err(io_at(&tmp))?;
        std::fs::rename(&tmp, &path).map_err(io_at(&path))?;
        tracing::debug!(commit_id = %commit_id, files = entries.len(), "created code ref");
        Ok(commit_id)
    }

    fn latest_ref(&self) -> Result<Option<String>, DatmoError> {
        let mut latest: Option<(SystemTime, String)> = None;
        for commit_id in self.list_refs()? {
            let path = self.manifest_path(&commit_id);
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
        Ok(is_commit_name(commit_id) && self.manifest_path(commit_id).is_file())
    }

    fn list_refs(&self) -> Result<Vec<String>, DatmoError> {
        let dir = self.layout.code_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut refs = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(io_at(&dir))? {
            let entry = entry.map_err(io_at(&dir))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_commit_name(&name) && entry.path().is_file() {
                refs.push(name);
            }
        }
        refs.sort();
        Ok(refs)
    }

    fn delete_ref(&self, commit_id: &str) -> Result<(), DatmoError> {
        if !self.exists_ref(commit_id)? {
            return Err(DatmoError::CommitDoesNotExist(commit_id.to_owned()));
        }
        let path = self.manifest_path(commit_id);
        std::fs::remove_file(&path).map_err(io_at(&path))
    }

    fn checkout_ref(&self, commit_id: &str) -> Result<(), DatmoError> {
        let manifest = self.read_manifest(commit_id)?;
        self.check_unstaged_changes()?;

        let root = self.layout.root();
        for rel in self.tracked_files()? {
            let path = root.join(&rel);
            std::fs::remove_file(&path).map_err(io_at(&path))?;
        }
        for (rel, hash) in &manifest {
            let blob = self.layout.code_dir().join(rel).join(hash);
            if !blob.is_file() {
                return Err(DatmoError::PathDoesNotExist(blob));
            }
            let target = root.join(rel);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(io_at(parent))?;
            }
            std::fs::copy(&blob, &target).map_err(io_at(&target))?;
        }
        // Keep the checked-out revision as the comparison point for unstaged changes.
        self.create_ref(None)?;
        tracing::info!(commit_id, "checked out code ref");
        Ok(())
    }

    fn has_unstaged_changes(&self) -> Result<bool, DatmoError> {
        let entries = self.tracked_entries()?;
        if entries.is_empty() {
            return Ok(false);
        }
        let current = manifest_hash(&entries);
        Ok(self.latest_ref()?.as_deref() != Some(current.as_str()))
    }

    fn delete_refs(&self) -> Result<(), DatmoError> {
        tree::remove_path(&self.layout.code_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn driver(root: &std::path::Path) -> FileCodeDriver {
        let d = FileCodeDriver::new(Layout::new(root.to_path_buf(), &Config::default()));
        d.init().unwrap();
        d
    }

    #[test]
    fn create_ref_is_stable_and_matches_current_hash() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("script.py"), "print(1)").unwrap();
        let d = driver(dir.path());

        let first = d.create_ref(None).unwrap();
        assert_eq!(d.current_hash().unwrap(), first);
        assert_eq!(d.create_ref(None).unwrap(), first);
        assert_eq!(d.list_refs().unwrap(), vec![first.clone()]);
        assert_eq!(d.latest_ref().unwrap(), Some(first.clone()));
        assert!(!d.has_unstaged_changes().unwrap());

        let manifest = std::fs::read_to_string(dir.path().join(".datmo/code").join(&first)).unwrap();
        assert!(manifest.starts_with("script.py,"));
    }

    #[test]
    fn unknown_commit_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let d = driver(dir.path());
        let err = d.create_ref(Some("0123456789abcdef0123456789abcdef")).unwrap_err();
        assert_eq!(err.key(), "commit-does-not-exist");
        assert_eq!(d.checkout_ref("nope").unwrap_err().key(), "commit-does-not-exist");
    }

    #[test]
    fn empty_tree_has_no_unstaged_changes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let d = driver(dir.path());
        assert!(!d.has_unstaged_changes().unwrap());
        assert!(d.latest_ref().unwrap().is_none());
    }

    #[test]
    fn checkout_restores_previous_revision() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        std::fs::write(root.join("script.py"), "v1").unwrap();
        let d = driver(root);
        let prev = d.create_ref(None).unwrap();

        std::fs::write(root.join("script.py"), "v2").unwrap();
        std::fs::write(root.join("extra.py"), "new").unwrap();
        assert!(d.has_unstaged_changes().unwrap());
        assert_eq!(d.checkout_ref(&prev).unwrap_err().key(), "unstaged-changes");

        d.create_ref(None).unwrap();
        d.checkout_ref(&prev).unwrap();
        assert_eq!(std::fs::read_to_string(root.join("script.py")).unwrap(), "v1");
        assert!(!root.join("extra.py").exists());
        assert!(!d.has_unstaged_changes().unwrap());
    }
}
