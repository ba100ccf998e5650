#![forbid(unsafe_code)]

//! File-backed document store.
//!
//! Each collection lives in `<dir>/<collection>.json` as a JSON object keyed by primary key.
//! Every operation re-reads the collection file so that writes made through another handle on
//! the same directory are visible; writers serialise on an exclusive lock over
//! `<collection>.lock` and replace the data file atomically.

pub mod dal;
pub mod normalize;
pub mod query;

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt as _;
use serde_json::Value;

use crate::core::time::{format_timestamp, now};
use crate::error::{DatmoError, io_at};

pub use dal::{Dal, Entity};
pub use normalize::Document;
pub use query::{Query, Sort, SortOrder};

use normalize::{PRIMARY_KEY, denormalize, normalize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Project,
    Code,
    Environment,
    FileCollection,
    Snapshot,
    Task,
    Session,
    User,
}

impl Collection {
    pub const ALL: [Self; 8] = [
        Self::Project,
        Self::Code,
        Self::Environment,
        Self::FileCollection,
        Self::Snapshot,
        Self::Task,
        Self::Session,
        Self::User,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Code => "code",
            Self::Environment => "environment",
            Self::FileCollection => "file_collection",
            Self::Snapshot => "snapshot",
            Self::Task => "task",
            Self::Session => "session",
            Self::User => "user",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, DatmoError> {
        Self::ALL
            .into_iter()
            .find(|c| c.name() == name)
            .ok_or_else(|| DatmoError::EntityCollectionNotFound(name.to_owned()))
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

type Table = BTreeMap<String, Document>;

/// Held for the duration of a read-modify-write cycle.
struct CollectionLock {
    file: File,
}

impl Drop for CollectionLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[derive(Debug, Clone)]
pub struct Store {
    dir: PathBuf,
}

impl Store {
    pub fn open(dir: &Path) -> Result<Self, DatmoError> {
        std::fs::create_dir_all(dir).map_err(io_at(dir))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn data_path(&self, c: Collection) -> PathBuf {
        self.dir.join(format!("{}.json", c.name()))
    }

    fn lock(&self, c: Collection) -> Result<CollectionLock, DatmoError> {
        let path = self.dir.join(format!("{}.lock", c.name()));
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_at(&path))?;
        file.lock_exclusive().map_err(io_at(&path))?;
        Ok(CollectionLock { file })
    }

    fn read_table(&self, c: Collection) -> Result<Table, DatmoError> {
        let path = self.data_path(c);
        if !path.is_file() {
            return Ok(Table::new());
        }
        let data = std::fs::read(&path).map_err(io_at(&path))?;
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Table::new());
        }
        serde_json::from_slice(&data).map_err(|source| DatmoError::Json { path, source })
    }

    fn write_table(&self, c: Collection, table: &Table) -> Result<(), DatmoError> {
        let path = self.data_path(c);
        let data = serde_json::to_vec_pretty(table).map_err(|source| DatmoError::Json {
            path: path.clone(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &data).map_err(io_at(&tmp))?;
        std::fs::rename(&tmp, &path).map_err(io_at(&path))?;
        Ok(())
    }

    /// Runs `f` on the current table under the collection lock and persists the result.
    fn modify<T>(
        &self,
        c: Collection,
        f: impl FnOnce(&mut Table) -> Result<T, DatmoError>,
    ) -> Result<T, DatmoError> {
        let _guard = self.lock(c)?;
        let mut table = self.read_table(c)?;
        let out = f(&mut table)?;
        self.write_table(c, &table)?;
        Ok(out)
    }

    fn not_found(c: Collection, id: &str) -> DatmoError {
        DatmoError::EntityNotFound {
            collection: c.name().to_owned(),
            id: id.to_owned(),
        }
    }

    pub fn get(&self, c: Collection, id: &str) -> Result<Document, DatmoError> {
        self.read_table(c)?
            .remove(id)
            .map(denormalize)
            .ok_or_else(|| Self::not_found(c, id))
    }

    pub fn exists(&self, c: Collection, id: &str) -> Result<bool, DatmoError> {
        Ok(self.read_table(c)?.contains_key(id))
    }

    /// Unique record whose id starts with `prefix`.
    pub fn get_by_prefix(&self, c: Collection, prefix: &str) -> Result<Document, DatmoError> {
        if prefix.is_empty() {
            return Err(DatmoError::RequiredArgumentMissing("id".to_owned()));
        }
        let table = self.read_table(c)?;
        let mut hits = table
            .into_iter()
            .filter(|(pk, _)| pk.starts_with(prefix))
            .map(|(_, doc)| doc);
        let first = hits.next().ok_or_else(|| Self::not_found(c, prefix))?;
        if hits.next().is_some() {
            return Err(DatmoError::MoreThanOneFound {
                collection: c.name().to_owned(),
                prefix: prefix.to_owned(),
            });
        }
        Ok(denormalize(first))
    }

    /// Inserts or replaces a record. A missing `id` is generated; `created_at` is kept when
    /// given and `updated_at` is stamped now.
    pub fn set(&self, c: Collection, doc: Document) -> Result<Document, DatmoError> {
        let mut doc = normalize(doc)?;
        let pk = match doc.get(PRIMARY_KEY) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Null) | None => {
                let pk = crate::entity::new_id();
                doc.insert(PRIMARY_KEY.to_owned(), Value::String(pk.clone()));
                pk
            }
            Some(other) => {
                return Err(DatmoError::IncorrectType {
                    field: "id".to_owned(),
                    msg: format!("expected a string, got {other}"),
                });
            }
        };
        let stamp = Value::String(format_timestamp(now()));
        if doc.get("created_at").is_none_or(Value::is_null) {
            doc.insert("created_at".to_owned(), stamp.clone());
        }
        doc.insert("updated_at".to_owned(), stamp);

        self.modify(c, |table| {
            table.insert(pk, doc.clone());
            Ok(())
        })?;
        Ok(denormalize(doc))
    }

    /// Merges `patch` into the existing record and bumps `updated_at`.
    pub fn update(&self, c: Collection, id: &str, patch: Document) -> Result<Document, DatmoError> {
        self.compare_and_update(c, id, |_| Ok(()), patch)
    }

    /// Like [`Store::update`], but `check` sees the current record under the lock first and may
    /// veto the write.
    pub fn compare_and_update(
        &self,
        c: Collection,
        id: &str,
        check: impl FnOnce(&Document) -> Result<(), DatmoError>,
        patch: Document,
    ) -> Result<Document, DatmoError> {
        let mut patch = normalize(patch)?;
        patch.remove(PRIMARY_KEY);
        patch.remove("created_at");
        self.modify(c, |table| {
            let current = table.get_mut(id).ok_or_else(|| Self::not_found(c, id))?;
            check(&denormalize(current.clone()))?;
            for (k, v) in patch {
                current.insert(k, v);
            }
            current.insert(
                "updated_at".to_owned(),
                Value::String(format_timestamp(now())),
            );
            Ok(denormalize(current.clone()))
        })
    }

    pub fn delete(&self, c: Collection, id: &str) -> Result<(), DatmoError> {
        self.modify(c, |table| {
            table
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| Self::not_found(c, id))
        })
    }

    pub fn query(
        &self,
        c: Collection,
        query: &Query,
        sort: Option<&Sort>,
    ) -> Result<Vec<Document>, DatmoError> {
        let query = query.normalized()?;
        let mut docs: Vec<Document> = self
            .read_table(c)?
            .into_values()
            .filter(|doc| query.matches(doc))
            .collect();
        if let Some(sort) = sort {
            sort.apply(&mut docs);
        }
        Ok(docs.into_iter().map(denormalize).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn set_generates_id_and_timestamps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path()).unwrap();

        let saved = store
            .set(Collection::Code, doc(json!({"commit_id": "abc"})))
            .unwrap();
        let id = saved["id"].as_str().unwrap().to_owned();
        assert_eq!(id.len(), 32);
        assert!(saved["created_at"].is_string());

        let loaded = store.get(Collection::Code, &id).unwrap();
        assert_eq!(loaded["commit_id"], json!("abc"));
        assert!(!loaded.contains_key("pk"));
    }

    #[test]
    fn second_handle_sees_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = Store::open(dir.path()).unwrap();
        let b = Store::open(dir.path()).unwrap();

        let saved = a
            .set(Collection::Task, doc(json!({"id": "t1", "status": "NEW"})))
            .unwrap();
        assert_eq!(saved["id"], json!("t1"));
        assert_eq!(b.get(Collection::Task, "t1").unwrap()["status"], json!("NEW"));

        b.update(Collection::Task, "t1", doc(json!({"status": "RUNNING"})))
            .unwrap();
        assert_eq!(
            a.get(Collection::Task, "t1").unwrap()["status"],
            json!("RUNNING")
        );
    }

    #[test]
    fn update_merges_and_keeps_created_at() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path()).unwrap();
        let saved = store
            .set(Collection::Snapshot, doc(json!({"id": "s", "message": "a", "visible": true})))
            .unwrap();

        let updated = store
            .update(
                Collection::Snapshot,
                "s",
                doc(json!({"message": "b", "created_at": "2001-01-01T00:00:00Z"})),
            )
            .unwrap();
        assert_eq!(updated["message"], json!("b"));
        assert_eq!(updated["visible"], json!(true));
        assert_eq!(updated["created_at"], saved["created_at"]);
    }

    #[test]
    fn compare_and_update_can_veto() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path()).unwrap();
        store
            .set(Collection::Task, doc(json!({"id": "t", "status": "RUNNING"})))
            .unwrap();

        let err = store
            .compare_and_update(
                Collection::Task,
                "t",
                |cur| {
                    if cur["status"] == json!("NEW") {
                        Ok(())
                    } else {
                        Err(DatmoError::task_run("already running"))
                    }
                },
                doc(json!({"status": "RUNNING"})),
            )
            .unwrap_err();
        assert_eq!(err.key(), "task-run");
    }

    #[test]
    fn prefix_lookup_detects_ambiguity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path()).unwrap();
        store.set(Collection::Project, doc(json!({"id": "abc1"}))).unwrap();
        store.set(Collection::Project, doc(json!({"id": "abc2"}))).unwrap();
        store.set(Collection::Project, doc(json!({"id": "xyz"}))).unwrap();

        assert_eq!(
            store.get_by_prefix(Collection::Project, "x").unwrap()["id"],
            json!("xyz")
        );
        assert_eq!(
            store.get_by_prefix(Collection::Project, "abc").unwrap_err().key(),
            "more-than-one-found"
        );
        assert!(
            store
                .get_by_prefix(Collection::Project, "q")
                .unwrap_err()
                .is_not_found()
        );
    }

    #[test]
    fn query_filters_and_sorts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path()).unwrap();
        for (id, model, n) in [("a", "m", 3), ("b", "m", 1), ("c", "other", 2)] {
            store
                .set(Collection::Snapshot, doc(json!({"id": id, "model_id": model, "n": n})))
                .unwrap();
        }

        let hits = store
            .query(
                Collection::Snapshot,
                &Query::new().eq("model_id", "m"),
                Some(&Sort::ascending("n")),
            )
            .unwrap();
        let ids: Vec<_> = hits.iter().map(|d| d["id"].clone()).collect();
        assert_eq!(ids, vec![json!("b"), json!("a")]);

        let newer = store
            .query(
                Collection::Snapshot,
                &Query::new().gte("created_at", "2000-01-01T00:00:00Z"),
                None,
            )
            .unwrap();
        assert_eq!(newer.len(), 3);
    }

    #[test]
    fn delete_missing_record_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path()).unwrap();
        assert!(store.delete(Collection::Task, "nope").unwrap_err().is_not_found());
        assert_eq!(
            Collection::from_name("sessions").unwrap_err().key(),
            "entity-collection-not-found"
        );
    }
}
