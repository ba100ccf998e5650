#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::core::time::{now, serde_timestamp};
use crate::storage::{Collection, Entity};

/// A committed revision of the tracked source tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Code {
    pub id: String,
    pub project_id: String,
    pub driver_type: String,
    pub commit_id: String,
    #[serde(with = "serde_timestamp")]
    pub created_at: OffsetDateTime,
    #[serde(with = "serde_timestamp")]
    pub updated_at: OffsetDateTime,
}

impl Code {
    #[must_use]
    pub fn new(project_id: &str, driver_type: &str, commit_id: &str) -> Self {
        let t = now();
        Self {
            id: super::new_id(),
            project_id: project_id.to_owned(),
            driver_type: driver_type.to_owned(),
            commit_id: commit_id.to_owned(),
            created_at: t,
            updated_at: t,
        }
    }
}

impl Entity for Code {
    const COLLECTION: Collection = Collection::Code;

    fn id(&self) -> &str {
        &self.id
    }
}
