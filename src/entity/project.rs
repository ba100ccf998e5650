#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::core::time::{now, serde_timestamp};
use crate::storage::{Collection, Entity};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(with = "serde_timestamp")]
    pub created_at: OffsetDateTime,
    #[serde(with = "serde_timestamp")]
    pub updated_at: OffsetDateTime,
}

impl Project {
    #[must_use]
    pub fn new(name: &str, description: Option<&str>) -> Self {
        let t = now();
        Self {
            id: super::new_id(),
            name: name.to_owned(),
            description: description.map(str::to_owned),
            created_at: t,
            updated_at: t,
        }
    }
}

impl Entity for Project {
    const COLLECTION: Collection = Collection::Project;

    fn id(&self) -> &str {
        &self.id
    }
}
