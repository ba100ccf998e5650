#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::core::time::{now, serde_timestamp};
use crate::storage::{Collection, Entity};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileCollection {
    pub id: String,
    pub project_id: String,
    pub driver_type: String,
    /// Content hash; also the directory name under the collections store.
    pub filehash: String,
    /// Location relative to the project root.
    pub path: String,
    /// Source file → destination name inside the collection.
    #[serde(default)]
    pub file_path_map: BTreeMap<String, String>,
    /// Source directory → destination name inside the collection.
    #[serde(default)]
    pub directory_path_map: BTreeMap<String, String>,
    #[serde(with = "serde_timestamp")]
    pub created_at: OffsetDateTime,
    #[serde(with = "serde_timestamp")]
    pub updated_at: OffsetDateTime,
}

impl FileCollection {
    #[must_use]
    pub fn new(project_id: &str, driver_type: &str, filehash: &str, path: &str) -> Self {
        let t = now();
        Self {
            id: super::new_id(),
            project_id: project_id.to_owned(),
            driver_type: driver_type.to_owned(),
            filehash: filehash.to_owned(),
            path: path.to_owned(),
            file_path_map: BTreeMap::new(),
            directory_path_map: BTreeMap::new(),
            created_at: t,
            updated_at: t,
        }
    }
}

impl Entity for FileCollection {
    const COLLECTION: Collection = Collection::FileCollection;

    fn id(&self) -> &str {
        &self.id
    }
}
