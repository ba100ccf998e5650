#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::core::time::{now, serde_timestamp};
use crate::storage::{Collection, Entity};

/// Name of the session every project starts in. It cannot be renamed or deleted.
pub const DEFAULT_SESSION: &str = "default";

/// A named group of snapshots and tasks. Exactly one session per project is current.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub project_id: String,
    pub name: String,
    #[serde(default)]
    pub current: bool,
    #[serde(with = "serde_timestamp")]
    pub created_at: OffsetDateTime,
    #[serde(with = "serde_timestamp")]
    pub updated_at: OffsetDateTime,
}

impl Session {
    #[must_use]
    pub fn new(project_id: &str, name: &str) -> Self {
        let t = now();
        Self {
            id: super::new_id(),
            project_id: project_id.to_owned(),
            name: name.to_owned(),
            current: false,
            created_at: t,
            updated_at: t,
        }
    }

    #[must_use]
    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_SESSION
    }
}

impl Entity for Session {
    const COLLECTION: Collection = Collection::Session;

    fn id(&self) -> &str {
        &self.id
    }
}
