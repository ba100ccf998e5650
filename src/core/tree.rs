#![forbid(unsafe_code)]

use std::path::{Component, Path};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::error::{DatmoError, io_at};

#[must_use]
pub fn slash_path(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn walk_error(err: walkdir::Error, fallback: &Path) -> DatmoError {
    let path = err.path().unwrap_or(fallback).to_path_buf();
    match err.into_io_error() {
        Some(source) => DatmoError::IoPath { path, source },
        None => DatmoError::Other(format!("filesystem loop at {}", path.display())),
    }
}

/// Sorted relative paths of every file below `dir`.
pub fn list_files(dir: &Path) -> Result<Vec<String>, DatmoError> {
    list_files_filtered(dir, |_| true)
}

/// Like [`list_files`] but `keep` is consulted with each relative path (files and directories);
/// a rejected directory is not descended into.
pub fn list_files_filtered(
    dir: &Path,
    keep: impl Fn(&str) -> bool,
) -> Result<Vec<String>, DatmoError> {
    let mut out = Vec::new();
    let walker = WalkDir::new(dir)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            let rel = e.path().strip_prefix(dir).unwrap_or(e.path());
            rel.as_os_str().is_empty() || keep(&slash_path(rel))
        });
    for entry in walker {
        let entry = entry.map_err(|e| walk_error(e, dir))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        out.push(slash_path(rel));
    }
    out.sort();
    Ok(out)
}

/// Patterns from a `.datmoignore` file. Blank lines and `#` comments are skipped.
#[derive(Debug, Clone)]
pub struct IgnoreList {
    set: GlobSet,
}

impl IgnoreList {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            set: GlobSet::empty(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, DatmoError> {
        if !path.is_file() {
            return Ok(Self::empty());
        }
        let raw = std::fs::read_to_string(path).map_err(io_at(path))?;
        Self::parse(&raw)
    }

    /// A pattern without `/` matches at any depth, a leading `/` anchors it to the root, and a
    /// matching directory excludes everything below it.
    pub fn parse(raw: &str) -> Result<Self, DatmoError> {
        let mut builder = GlobSetBuilder::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let trimmed = line.trim_end_matches('/');
            let (anchored, pattern) = match trimmed.strip_prefix('/') {
                Some(rest) => (true, rest),
                None => (trimmed.contains('/'), trimmed),
            };
            if pattern.is_empty() {
                continue;
            }
            let mut variants = vec![pattern.to_owned(), format!("{pattern}/**")];
            if !anchored {
                variants.push(format!("**/{pattern}"));
                variants.push(format!("**/{pattern}/**"));
            }
            for v in variants {
                let glob = GlobBuilder::new(&v)
                    .literal_separator(true)
                    .build()
                    .map_err(|e| {
                        DatmoError::InvalidArgumentType(format!(
                            "invalid ignore pattern '{line}': {e}"
                        ))
                    })?;
                builder.add(glob);
            }
        }
        let set = builder
            .build()
            .map_err(|e| DatmoError::Other(format!("failed to build ignore list: {e}")))?;
        Ok(Self { set })
    }

    #[must_use]
    pub fn is_ignored(&self, rel: &str) -> bool {
        self.set.is_match(rel)
    }
}

/// Files under `root` minus the excluded top-level names and ignored paths.
pub fn tracked_files(
    root: &Path,
    excluded_roots: &[&str],
    ignore: &IgnoreList,
) -> Result<Vec<String>, DatmoError> {
    list_files_filtered(root, |rel| {
        let top = rel.split('/').next().unwrap_or(rel);
        !excluded_roots.contains(&top) && !ignore.is_ignored(rel)
    })
}

/// Copies a file or the contents of a directory to `dst`, replacing existing files.
pub fn copy_into(src: &Path, dst: &Path) -> Result<(), DatmoError> {
    if src.is_file() {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent).map_err(io_at(parent))?;
        }
        return copy_file(src, dst);
    }
    std::fs::create_dir_all(dst).map_err(io_at(dst))?;
    for entry in WalkDir::new(src).follow_links(true).min_depth(1) {
        let entry = entry.map_err(|e| walk_error(e, src))?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(io_at(&target))?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(io_at(parent))?;
            }
            copy_file(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn copy_file(src: &Path, dst: &Path) -> Result<(), DatmoError> {
    if dst.exists() {
        set_writable(dst)?;
        std::fs::remove_file(dst).map_err(io_at(dst))?;
    }
    std::fs::copy(src, dst).map_err(io_at(dst))?;
    set_writable(dst)?;
    Ok(())
}

fn set_writable(path: &Path) -> Result<(), DatmoError> {
    set_permissions(path, false)
}

#[allow(clippy::permissions_set_readonly_false)]
fn set_permissions(path: &Path, readonly: bool) -> Result<(), DatmoError> {
    let meta = std::fs::metadata(path).map_err(io_at(path))?;
    let mut perms = meta.permissions();
    if perms.readonly() == readonly {
        return Ok(());
    }
    perms.set_readonly(readonly);
    std::fs::set_permissions(path, perms).map_err(io_at(path))
}

/// Marks every file below `dir` read-only (or writable again).
pub fn set_tree_readonly(dir: &Path, readonly: bool) -> Result<(), DatmoError> {
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(|e| walk_error(e, dir))?;
        if entry.file_type().is_file() {
            set_permissions(entry.path(), readonly)?;
        }
    }
    Ok(())
}

/// Removes `path` (file or directory) even when it contains read-only files.
pub fn remove_path(path: &Path) -> Result<(), DatmoError> {
    if !path.exists() {
        return Ok(());
    }
    if path.is_dir() {
        set_tree_readonly(path, false)?;
        std::fs::remove_dir_all(path).map_err(io_at(path))
    } else {
        set_writable(path)?;
        std::fs::remove_file(path).map_err(io_at(path))
    }
}
