#![forbid(unsafe_code)]

//! Conversion between the external record shape (`id`, typed timestamps) and the stored shape
//! (`pk`, storage-format timestamp strings).

use serde_json::{Map, Value};

use crate::core::time::{format_timestamp, parse_timestamp};
use crate::error::DatmoError;

pub type Document = Map<String, Value>;

pub const PRIMARY_KEY: &str = "pk";
pub const TIMESTAMP_FIELDS: [&str; 4] = ["created_at", "updated_at", "start_time", "end_time"];

#[must_use]
pub fn is_timestamp_field(field: &str) -> bool {
    TIMESTAMP_FIELDS.contains(&field)
}

/// External → stored. Only timestamp columns are type-checked.
pub fn normalize(mut doc: Document) -> Result<Document, DatmoError> {
    if let Some(id) = doc.remove("id") {
        doc.insert(PRIMARY_KEY.to_owned(), id);
    }
    for field in TIMESTAMP_FIELDS {
        if let Some(v) = doc.get_mut(field) {
            *v = normalize_timestamp(field, v)?;
        }
    }
    Ok(doc)
}

/// Stored → external.
#[must_use]
pub fn denormalize(mut doc: Document) -> Document {
    if let Some(pk) = doc.remove(PRIMARY_KEY) {
        doc.insert("id".to_owned(), pk);
    }
    doc
}

pub fn normalize_timestamp(field: &str, v: &Value) -> Result<Value, DatmoError> {
    match v {
        Value::Null => Ok(Value::Null),
        Value::String(s) => parse_timestamp(s)
            .map(|t| Value::String(format_timestamp(t)))
            .ok_or_else(|| DatmoError::IncorrectType {
                field: field.to_owned(),
                msg: format!("'{s}' is not a timestamp"),
            }),
        other => Err(DatmoError::IncorrectType {
            field: field.to_owned(),
            msg: format!("expected a timestamp, got {other}"),
        }),
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
    fn renames_id_and_canonicalises_timestamps() {
        let stored = normalize(doc(json!({
            "id": "abc",
            "created_at": "2024-01-01T00:00:00Z",
            "end_time": null,
            "stats": {"created_at": 5}
        })))
        .unwrap();
        assert_eq!(stored["pk"], json!("abc"));
        assert!(!stored.contains_key("id"));
        assert_eq!(stored["created_at"], json!("2024-01-01T00:00:00.000000Z"));
        assert_eq!(stored["end_time"], Value::Null);
        assert_eq!(stored["stats"], json!({"created_at": 5}));

        let back = denormalize(stored);
        assert_eq!(back["id"], json!("abc"));
    }

    #[test]
    fn rejects_non_timestamp_values() {
        let err = normalize(doc(json!({"start_time": 12}))).unwrap_err();
        assert_eq!(err.key(), "incorrect-type");
        let err = normalize(doc(json!({"updated_at": "soon"}))).unwrap_err();
        assert_eq!(err.key(), "incorrect-type");
    }
}
