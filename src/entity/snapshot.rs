#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::core::time::{now, serde_timestamp};
use crate::storage::{Collection, Entity};

/// Key-ordered so that equal maps serialise identically.
pub type StatMap = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub project_id: String,
    pub message: String,
    pub code_id: String,
    pub environment_id: String,
    pub file_collection_id: String,
    #[serde(default)]
    pub config: StatMap,
    #[serde(default)]
    pub stats: StatMap,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    pub visible: bool,
    #[serde(with = "serde_timestamp")]
    pub created_at: OffsetDateTime,
    #[serde(with = "serde_timestamp")]
    pub updated_at: OffsetDateTime,
}

impl Snapshot {
    #[must_use]
    pub fn new(project_id: &str, message: &str) -> Self {
        let t = now();
        Self {
            id: super::new_id(),
            project_id: project_id.to_owned(),
            message: message.to_owned(),
            code_id: String::new(),
            environment_id: String::new(),
            file_collection_id: String::new(),
            config: StatMap::new(),
            stats: StatMap::new(),
            task_id: None,
            session_id: None,
            label: None,
            visible: true,
            created_at: t,
            updated_at: t,
        }
    }

    /// Identity of the bound content, independent of metadata.
    #[must_use]
    pub fn content_key(&self) -> (String, String, String, String, String) {
        (
            self.code_id.clone(),
            self.environment_id.clone(),
            self.file_collection_id.clone(),
            canonical_json(&self.config),
            canonical_json(&self.stats),
        )
    }
}

/// Compact JSON with sorted keys at every level.
#[must_use]
pub fn canonical_json(map: &StatMap) -> String {
    fn sorted(v: &Value) -> Value {
        match v {
            Value::Object(m) => {
                let ordered: BTreeMap<&String, Value> =
                    m.iter().map(|(k, v)| (k, sorted(v))).collect();
                serde_json::to_value(ordered).unwrap_or(Value::Null)
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    let ordered: BTreeMap<&String, Value> = map.iter().map(|(k, v)| (k, sorted(v))).collect();
    serde_json::to_string(&ordered).unwrap_or_default()
}

impl Entity for Snapshot {
    const COLLECTION: Collection = Collection::Snapshot;

    fn id(&self) -> &str {
        &self.id
    }
}
