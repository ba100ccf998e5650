#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::core::time::{now, serde_timestamp};
use crate::storage::{Collection, Entity};

/// Platform fingerprint captured when an environment is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareInfo {
    #[serde(default)]
    pub system: String,
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub release: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub machine: String,
    #[serde(default)]
    pub processor: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub id: String,
    pub project_id: String,
    pub driver_type: String,
    pub definition_filename: String,
    #[serde(default)]
    pub hardware_info: Option<HardwareInfo>,
    pub file_collection_id: String,
    pub unique_hash: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(with = "serde_timestamp")]
    pub created_at: OffsetDateTime,
    #[serde(with = "serde_timestamp")]
    pub updated_at: OffsetDateTime,
}

impl Environment {
    #[must_use]
    pub fn new(
        project_id: &str,
        driver_type: &str,
        definition_filename: &str,
        file_collection_id: &str,
        unique_hash: &str,
    ) -> Self {
        let t = now();
        Self {
            id: super::new_id(),
            project_id: project_id.to_owned(),
            driver_type: driver_type.to_owned(),
            definition_filename: definition_filename.to_owned(),
            hardware_info: None,
            file_collection_id: file_collection_id.to_owned(),
            unique_hash: unique_hash.to_owned(),
            name: None,
            description: None,
            created_at: t,
            updated_at: t,
        }
    }
}

impl Entity for Environment {
    const COLLECTION: Collection = Collection::Environment;

    fn id(&self) -> &str {
        &self.id
    }
}
