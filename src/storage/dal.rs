#![forbid(unsafe_code)]

//! Typed access to the document store.

use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::DatmoError;
use crate::storage::{Collection, Document, Query, Sort, Store};

/// A record type stored in one collection.
pub trait Entity: Serialize + DeserializeOwned {
    const COLLECTION: Collection;

    fn id(&self) -> &str;
}

#[derive(Debug, Clone)]
pub struct Dal {
    store: Store,
}

fn to_document<T: Serialize>(value: &T, collection: Collection) -> Result<Document, DatmoError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(DatmoError::IncorrectType {
            field: collection.name().to_owned(),
            msg: format!("expected a record, got {other}"),
        }),
        Err(e) => Err(DatmoError::Other(format!(
            "failed to encode {collection} record: {e}"
        ))),
    }
}

fn from_document<T: Entity>(doc: Document) -> Result<T, DatmoError> {
    serde_json::from_value(Value::Object(doc)).map_err(|e| DatmoError::IncorrectType {
        field: T::COLLECTION.name().to_owned(),
        msg: e.to_string(),
    })
}

impl Dal {
    pub fn open(dir: &Path) -> Result<Self, DatmoError> {
        Ok(Self {
            store: Store::open(dir)?,
        })
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Persists `entity`, replacing any record with the same id.
    pub fn create<T: Entity>(&self, entity: &T) -> Result<T, DatmoError> {
        let doc = to_document(entity, T::COLLECTION)?;
        tracing::debug!(collection = %T::COLLECTION, id = entity.id(), "storing record");
        from_document(self.store.set(T::COLLECTION, doc)?)
    }

    pub fn get<T: Entity>(&self, id: &str) -> Result<T, DatmoError> {
        from_document(self.store.get(T::COLLECTION, id)?)
    }

    pub fn get_by_shortened_id<T: Entity>(&self, prefix: &str) -> Result<T, DatmoError> {
        from_document(self.store.get_by_prefix(T::COLLECTION, prefix)?)
    }

    pub fn exists<T: Entity>(&self, id: &str) -> Result<bool, DatmoError> {
        self.store.exists(T::COLLECTION, id)
    }

    /// Merges the fields of `patch` (a JSON object) into the stored record.
    pub fn update<T: Entity>(&self, id: &str, patch: Value) -> Result<T, DatmoError> {
        let patch = object(patch)?;
        from_document(self.store.update(T::COLLECTION, id, patch)?)
    }

    /// Applies `patch` only if `check` accepts the current record, atomically.
    pub fn compare_and_update<T: Entity>(
        &self,
        id: &str,
        check: impl FnOnce(&T) -> Result<(), DatmoError>,
        patch: Value,
    ) -> Result<T, DatmoError> {
        let patch = object(patch)?;
        let doc = self.store.compare_and_update(
            T::COLLECTION,
            id,
            |current| check(&from_document::<T>(current.clone())?),
            patch,
        )?;
        from_document(doc)
    }

    pub fn delete<T: Entity>(&self, id: &str) -> Result<(), DatmoError> {
        tracing::debug!(collection = %T::COLLECTION, id, "deleting record");
        self.store.delete(T::COLLECTION, id)
    }

    pub fn query<T: Entity>(&self, query: &Query) -> Result<Vec<T>, DatmoError> {
        self.query_sorted(query, None)
    }

    pub fn query_sorted<T: Entity>(
        &self,
        query: &Query,
        sort: Option<&Sort>,
    ) -> Result<Vec<T>, DatmoError> {
        self.store
            .query(T::COLLECTION, query, sort)?
            .into_iter()
            .map(from_document)
            .collect()
    }
}

fn object(v: Value) -> Result<Document, DatmoError> {
    match v {
        Value::Object(map) => Ok(map),
        other => Err(DatmoError::InvalidArgumentType(format!(
            "update must be a JSON object, got {other}"
        ))),
    }
}
