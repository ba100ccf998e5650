#![forbid(unsafe_code)]

//! File collections: immutable sets of captured files and directories.

pub mod local;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::core::hash::tree_hash;
use crate::core::tree;
use crate::entity::FileCollection;
use crate::error::{DatmoError, io_at};
use crate::storage::{Dal, Query, Sort};

pub use local::LocalFileDriver;

/// One resolved `SRC>DEST` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMapping {
    pub src: PathBuf,
    pub dest: String,
    pub is_dir: bool,
}

fn has_drive_prefix(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() >= 2 && b[0].is_ascii_alphabetic() && b[1] == b':'
}

fn is_absolute_like(s: &str) -> bool {
    Path::new(s).is_absolute() || s.starts_with('/') || s.starts_with('\\') || has_drive_prefix(s)
}

fn base_name(s: &str) -> &str {
    let trimmed = s.trim_end_matches(['/', '\\']);
    let name = trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed);
    // `C:file` has no separator after the drive.
    if has_drive_prefix(name) { &name[2..] } else { name }
}

/// Splits `SRC>DEST` (or plain `SRC`, whose destination is its base name).
pub fn parse_path(path: &str) -> Result<(String, String), DatmoError> {
    let path = path.trim();
    let parts: Vec<&str> = path.split('>').collect();
    let (src, dest) = match parts.as_slice() {
        [src] => ((*src).to_owned(), base_name(src).to_owned()),
        [src, dest] => ((*src).trim().to_owned(), (*dest).trim().to_owned()),
        _ => {
            return Err(DatmoError::TooManyArguments(format!(
                "'{path}' has more than one '>'"
            )));
        }
    };
    if dest.is_empty()
        || dest.contains(['/', '\\'])
        || has_drive_prefix(&dest)
        || dest == "."
        || dest == ".."
    {
        return Err(DatmoError::InvalidDestinationName(dest));
    }
    Ok((src, dest))
}

/// Resolves user paths against `root`. Sources must exist and destinations must be distinct.
pub fn resolve_paths(root: &Path, paths: &[String]) -> Result<Vec<PathMapping>, DatmoError> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::with_capacity(paths.len());
    for raw in paths {
        let (src, dest) = parse_path(raw)?;
        let src = if is_absolute_like(&src) {
            PathBuf::from(&src)
        } else {
            root.join(&src)
        };
        if !src.exists() {
            return Err(DatmoError::PathDoesNotExist(src));
        }
        if !seen.insert(dest.clone()) {
            return Err(DatmoError::FileAlreadyExists(dest));
        }
        let is_dir = src.is_dir();
        out.push(PathMapping { src, dest, is_dir });
    }
    Ok(out)
}

/// File-collection records over a [`LocalFileDriver`].
#[derive(Debug, Clone)]
pub struct FileCollectionStore {
    dal: Dal,
    project_id: String,
    driver: LocalFileDriver,
}

impl FileCollectionStore {
    #[must_use]
    pub fn new(dal: Dal, project_id: &str, driver: LocalFileDriver) -> Self {
        Self {
            dal,
            project_id: project_id.to_owned(),
            driver,
        }
    }

    #[must_use]
    pub fn driver(&self) -> &LocalFileDriver {
        &self.driver
    }

    /// Entries of the project files directory, used when no paths are given.
    fn files_dir_paths(&self) -> Result<Vec<String>, DatmoError> {
        let dir = self.driver.layout().files_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(io_at(&dir))? {
            let entry = entry.map_err(io_at(&dir))?;
            out.push(entry.path().display().to_string());
        }
        out.sort();
        Ok(out)
    }

    /// Collects `paths` (`SRC` or `SRC>DEST`) into a collection. An empty list takes the contents
    /// of the files directory when present. Identical content returns the existing record.
    pub fn create(&self, paths: &[String]) -> Result<FileCollection, DatmoError> {
        let paths = if paths.is_empty() {
            self.files_dir_paths()?
        } else {
            paths.to_vec()
        };
        let mappings = resolve_paths(self.driver.layout().root(), &paths)?;
        let filehash = self.driver.create_collection(&mappings)?;
        self.record(&filehash, &mappings)
    }

    /// Records an already staged directory as a collection.
    pub fn create_from_dir(&self, dir: &Path) -> Result<FileCollection, DatmoError> {
        let filehash = self.driver.commit_dir(dir)?;
        self.record(&filehash, &[])
    }

    fn record(
        &self,
        filehash: &str,
        mappings: &[PathMapping],
    ) -> Result<FileCollection, DatmoError> {
        if let Some(existing) = self.find_by_hash(filehash)? {
            return Ok(existing);
        }
        let mut fc = FileCollection::new(
            &self.project_id,
            self.driver.driver_type(),
            filehash,
            &self.driver.get_relative_collection_path(filehash),
        );
        let (dirs, files): (Vec<_>, Vec<_>) = mappings.iter().partition(|m| m.is_dir);
        fc.file_path_map = to_map(&files);
        fc.directory_path_map = to_map(&dirs);
        self.dal.create(&fc)
    }

    pub fn find_by_hash(&self, filehash: &str) -> Result<Option<FileCollection>, DatmoError> {
        let query = Query::new()
            .eq("project_id", self.project_id.as_str())
            .eq("filehash", filehash);
        Ok(self.dal.query::<FileCollection>(&query)?.into_iter().next())
    }

    pub fn get(&self, id: &str) -> Result<FileCollection, DatmoError> {
        self.dal.get(id)
    }

    /// Absolute location of a collection's files.
    pub fn path_of(&self, id: &str) -> Result<PathBuf, DatmoError> {
        let fc = self.get(id)?;
        Ok(self.driver.get_collection_path(&fc.filehash))
    }

    pub fn list(&self) -> Result<Vec<FileCollection>, DatmoError> {
        self.dal.query_sorted(
            &Query::new().eq("project_id", self.project_id.as_str()),
            Some(&Sort::ascending("created_at")),
        )
    }

    /// Removes the record and, when no other record shares it, the stored content.
    pub fn delete(&self, id: &str) -> Result<(), DatmoError> {
        let fc = self.get(id)?;
        self.dal.delete::<FileCollection>(id)?;
        let shared = self
            .dal
            .query::<FileCollection>(&Query::new().eq("filehash", fc.filehash.as_str()))?;
        if shared.is_empty() && self.driver.exists_collection(&fc.filehash) {
            self.driver.delete_collection(&fc.filehash)?;
        }
        Ok(())
    }

    /// Overlays the collection onto the files directory.
    pub fn checkout(&self, id: &str) -> Result<(), DatmoError> {
        let fc = self.get(id)?;
        self.check_unstaged_changes()?;
        let dst = self.driver.layout().files_dir();
        std::fs::create_dir_all(&dst).map_err(io_at(&dst))?;
        self.driver.transfer_collection(&fc.filehash, &dst)?;
        tracing::info!(file_collection_id = id, "checked out file collection");
        Ok(())
    }

    /// Hash of the files directory contents, `None` when it is missing or empty.
    pub fn current_hash(&self) -> Result<Option<String>, DatmoError> {
        let dir = self.driver.layout().files_dir();
        if !dir.is_dir() || tree::list_files(&dir)?.is_empty() {
            return Ok(None);
        }
        Ok(Some(tree_hash(&dir)?))
    }

    /// True when the files directory holds content that no collection records.
    pub fn has_unstaged_changes(&self) -> Result<bool, DatmoError> {
        match self.current_hash()? {
            None => Ok(false),
            Some(hash) => Ok(self.find_by_hash(&hash)?.is_none()),
        }
    }

    pub fn check_unstaged_changes(&self) -> Result<(), DatmoError> {
        if self.has_unstaged_changes()? {
            return Err(DatmoError::UnstagedChanges("files".to_owned()));
        }
        Ok(())
    }
}

fn to_map(mappings: &[&PathMapping]) -> BTreeMap<String, String> {
    mappings
        .iter()
        .map(|m| (m.src.display().to_string(), m.dest.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_path_splits_destination() {
        assert_eq!(
            parse_path("data/train.csv").unwrap(),
            ("data/train.csv".to_owned(), "train.csv".to_owned())
        );
        assert_eq!(
            parse_path(" /tmp/a.txt>b.txt ").unwrap(),
            ("/tmp/a.txt".to_owned(), "b.txt".to_owned())
        );
        assert_eq!(
            parse_path(r"C:\Users\me\data>data").unwrap(),
            (r"C:\Users\me\data".to_owned(), "data".to_owned())
        );
        assert_eq!(
            parse_path(r"C:\Users\me\model.bin").unwrap().1,
            "model.bin"
        );
        assert_eq!(parse_path("dir/").unwrap().1, "dir");
    }

    #[test]
    fn parse_path_rejects_bad_destinations() {
        assert_eq!(
            parse_path("a>b/c").unwrap_err().key(),
            "invalid-destination-name"
        );
        assert_eq!(
            parse_path(r"a>C:\x").unwrap_err().key(),
            "invalid-destination-name"
        );
        assert_eq!(parse_path("a>b>c").unwrap_err().key(), "too-many-arguments");
    }

    #[test]
    fn resolve_paths_checks_sources_and_duplicates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        std::fs::write(root.join("a.txt"), "a").unwrap();
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("sub/a.txt"), "b").unwrap();

        let ok = resolve_paths(root, &["a.txt".to_owned(), "sub>folder".to_owned()]).unwrap();
        assert_eq!(ok.len(), 2);
        assert!(!ok[0].is_dir);
        assert!(ok[1].is_dir);

        let dup = resolve_paths(root, &["a.txt".to_owned(), "sub/a.txt".to_owned()]).unwrap_err();
        assert_eq!(dup.key(), "file-already-exists");

        let missing = resolve_paths(root, &["nope.txt".to_owned()]).unwrap_err();
        assert_eq!(missing.key(), "path-does-not-exist");
    }
}
