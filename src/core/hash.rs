#![forbid(unsafe_code)]

use std::fmt::Write as _;
use std::io::Read as _;
use std::path::Path;

use sha2::{Digest as _, Sha256};

use crate::error::{DatmoError, io_at};

/// Digest length in bytes; hex form is twice as long.
const DIGEST_BYTES: usize = 16;

fn to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(&mut s, "{b:02x}");
    }
    s
}

#[must_use]
pub fn bytes_hash(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    to_hex(&digest[..DIGEST_BYTES])
}

pub fn file_hash(path: &Path) -> Result<String, DatmoError> {
    let mut file = std::fs::File::open(path).map_err(io_at(path))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(io_at(path))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    Ok(to_hex(&digest[..DIGEST_BYTES]))
}

/// Hash of the sorted `<relative-path>,<file-hash>` lines.
#[must_use]
pub fn manifest_hash(entries: &[(String, String)]) -> String {
    bytes_hash(render_manifest(entries).as_bytes())
}

/// Manifest text: one `<relative-path>,<file-hash>` line per entry, sorted by path.
#[must_use]
pub fn render_manifest(entries: &[(String, String)]) -> String {
    let mut lines: Vec<String> = entries
        .iter()
        .map(|(path, hash)| format!("{path},{hash}"))
        .collect();
    lines.sort();
    let mut out = lines.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

pub fn parse_manifest(text: &str) -> Vec<(String, String)> {
    text.lines()
        .filter_map(|line| {
            let (path, hash) = line.rsplit_once(',')?;
            Some((path.to_owned(), hash.trim().to_owned()))
        })
        .collect()
}

/// Content hash of every regular file under `dir`, keyed by relative path.
pub fn tree_hash(dir: &Path) -> Result<String, DatmoError> {
    let entries = tree_entries(dir)?;
    Ok(manifest_hash(&entries))
}

pub fn tree_entries(dir: &Path) -> Result<Vec<(String, String)>, DatmoError> {
    let mut entries = Vec::new();
    if !dir.exists() {
        return Ok(entries);
    }
    for rel in crate::core::tree::list_files(dir)? {
        let hash = file_hash(&dir.join(&rel))?;
        entries.push((rel, hash));
    }
    Ok(entries)
}
