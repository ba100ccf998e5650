#![forbid(unsafe_code)]

//! Hash-addressed, read-only file collections under `.datmo/collections/<hash>`.

use std::path::{Path, PathBuf};

use crate::core::hash::tree_hash;
use crate::core::layout::Layout;
use crate::core::tree;
use crate::entity::new_id;
use crate::error::{DatmoError, io_at};
use crate::file::PathMapping;

#[derive(Debug, Clone)]
pub struct LocalFileDriver {
    layout: Layout,
}

impl LocalFileDriver {
    #[must_use]
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    #[must_use]
    pub fn driver_type(&self) -> &'static str {
        "local"
    }

    #[must_use]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn init(&self) -> Result<(), DatmoError> {
        for dir in [
            self.layout.hidden_dir(),
            self.layout.collections_dir(),
            self.layout.tmp_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(io_at(&dir))?;
        }
        Ok(())
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.layout.hidden_dir().is_dir() && self.layout.collections_dir().is_dir()
    }

    /// A fresh scratch directory under `.datmo/tmp`.
    pub fn temp_dir(&self) -> Result<PathBuf, DatmoError> {
        let dir = self.layout.tmp_dir().join(new_id());
        std::fs::create_dir_all(&dir).map_err(io_at(&dir))?;
        Ok(dir)
    }

    /// Copies each mapping to `<dir>/<dest>`. A destination that is already taken fails.
    pub fn stage(&self, mappings: &[PathMapping], dir: &Path) -> Result<(), DatmoError> {
        for m in mappings {
            let dest = dir.join(&m.dest);
            if dest.exists() {
                return Err(DatmoError::FileAlreadyExists(m.dest.clone()));
            }
            tree::copy_into(&m.src, &dest)?;
        }
        Ok(())
    }

    /// Hash the collection would get, without persisting anything.
    pub fn calculate_hash_paths(&self, mappings: &[PathMapping]) -> Result<String, DatmoError> {
        let staging = self.temp_dir()?;
        let result = self
            .stage(mappings, &staging)
            .and_then(|()| tree_hash(&staging));
        tree::remove_path(&staging)?;
        result
    }

    /// Materialises the mappings as a collection and returns its hash.
    pub fn create_collection(&self, mappings: &[PathMapping]) -> Result<String, DatmoError> {
        let staging = self.temp_dir()?;
        let result = self
            .stage(mappings, &staging)
            .and_then(|()| self.commit_dir(&staging));
        tree::remove_path(&staging)?;
        result
    }

    /// Stores the contents of `dir` as a collection and returns its hash. `dir` is left in place.
    pub fn commit_dir(&self, dir: &Path) -> Result<String, DatmoError> {
        if !self.is_initialized() {
            return Err(DatmoError::Other(
                "file structure is not initialized".to_owned(),
            ));
        }
        let filehash = tree_hash(dir)?;
        let target = self.get_collection_path(&filehash);
        if target.is_dir() {
            return Ok(filehash);
        }
        let partial = self.layout.tmp_dir().join(format!("{filehash}.partial"));
        tree::remove_path(&partial)?;
        tree::copy_into(dir, &partial)?;
        std::fs::rename(&partial, &target).map_err(io_at(&target))?;
        tree::set_tree_readonly(&target, true)?;
        tracing::debug!(filehash = %filehash, "created file collection");
        Ok(filehash)
    }

    #[must_use]
    pub fn get_collection_path(&self, filehash: &str) -> PathBuf {
        self.layout.collections_dir().join(filehash)
    }

    /// Project-relative path of a collection.
    #[must_use]
    pub fn get_relative_collection_path(&self, filehash: &str) -> String {
        let abs = self.get_collection_path(filehash);
        self.layout.relative(&abs).unwrap_or_else(|| abs.display().to_string())
    }

    #[must_use]
    pub fn exists_collection(&self, filehash: &str) -> bool {
        !filehash.is_empty() && self.get_collection_path(filehash).is_dir()
    }

    pub fn list_file_collections(&self) -> Result<Vec<String>, DatmoError> {
        let dir = self.layout.collections_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(io_at(&dir))? {
            let entry = entry.map_err(io_at(&dir))?;
            if entry.path().is_dir() {
                out.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        out.sort();
        Ok(out)
    }

    pub fn list_files(&self, filehash: &str) -> Result<Vec<String>, DatmoError> {
        let path = self.existing_collection(filehash)?;
        tree::list_files(&path)
    }

    /// Copies the collection's contents over `dst`, which must be an existing directory.
    pub fn transfer_collection(&self, filehash: &str, dst: &Path) -> Result<(), DatmoError> {
        let path = self.existing_collection(filehash)?;
        if !dst.is_dir() {
            return Err(DatmoError::PathDoesNotExist(dst.to_path_buf()));
        }
        tree::copy_into(&path, dst)
    }

    pub fn delete_collection(&self, filehash: &str) -> Result<(), DatmoError> {
        let path = self.existing_collection(filehash)?;
        tree::remove_path(&path)
    }

    fn existing_collection(&self, filehash: &str) -> Result<PathBuf, DatmoError> {
        if !self.exists_collection(filehash) {
            return Err(DatmoError::PathDoesNotExist(
                self.get_collection_path(filehash),
            ));
        }
        Ok(self.get_collection_path(filehash))
    }
}
