#![forbid(unsafe_code)]

use std::cmp::Ordering;

use serde_json::Value;

use crate::error::DatmoError;
use crate::storage::normalize::{Document, is_timestamp_field, normalize_timestamp};

#[derive(Debug, Clone, PartialEq)]
enum Condition {
    Eq(Value),
    Gte(Value),
}

/// Conjunction of per-field conditions: plain equality or `{"$gte": v}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    conditions: Vec<(String, Condition)>,
}

impl Query {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions
            .push((field.to_owned(), Condition::Eq(value.into())));
        self
    }

    #[must_use]
    pub fn gte(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions
            .push((field.to_owned(), Condition::Gte(value.into())));
        self
    }

    /// Parses the JSON query form, e.g. `{"model_id": "m", "created_at": {"$gte": "..."}}`.
    pub fn from_value(value: &Value) -> Result<Self, DatmoError> {
        let Value::Object(map) = value else {
            return Err(DatmoError::InvalidArgumentType(
                "query must be a JSON object".to_owned(),
            ));
        };
        let mut query = Self::new();
        for (field, v) in map {
            match v {
                Value::Object(op) if op.len() == 1 && op.contains_key("$gte") => {
                    query = query.gte(field, op["$gte"].clone());
                }
                Value::Object(op) if op.keys().any(|k| k.starts_with('$')) => {
                    return Err(DatmoError::InvalidArgumentType(format!(
                        "unsupported query operator for '{field}'"
                    )));
                }
                other => query = query.eq(field, other.clone()),
            }
        }
        Ok(query)
    }

    /// Canonicalises timestamp operands so they compare against stored values.
    pub(crate) fn normalized(&self) -> Result<Self, DatmoError> {
        let mut out = Self::new();
        for (field, cond) in &self.conditions {
            let field_name = if field == "id" { "pk" } else { field.as_str() };
            let cond = if is_timestamp_field(field) {
                match cond {
                    Condition::Eq(v) => Condition::Eq(normalize_timestamp(field, v)?),
                    Condition::Gte(v) => Condition::Gte(normalize_timestamp(field, v)?),
                }
            } else {
                cond.clone()
            };
            out.conditions.push((field_name.to_owned(), cond));
        }
        Ok(out)
    }

    /// Evaluated against the stored document shape.
    #[must_use]
    pub(crate) fn matches(&self, doc: &Document) -> bool {
        self.conditions.iter().all(|(field, cond)| {
            let actual = doc.get(field).unwrap_or(&Value::Null);
            match cond {
                Condition::Eq(v) => actual == v,
                Condition::Gte(v) => {
                    matches!(compare_values(actual, v), Some(Ordering::Greater | Ordering::Equal))
                }
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    pub key: String,
    pub order: SortOrder,
}

impl Sort {
    #[must_use]
    pub fn new(key: &str, order: SortOrder) -> Self {
        Self {
            key: key.to_owned(),
            order,
        }
    }

    #[must_use]
    pub fn descending(key: &str) -> Self {
        Self::new(key, SortOrder::Descending)
    }

    #[must_use]
    pub fn ascending(key: &str) -> Self {
        Self::new(key, SortOrder::Ascending)
    }

    /// Builds a sort from the string form. Key and order must be given together.
    pub fn parse(key: Option<&str>, order: Option<&str>) -> Result<Option<Self>, DatmoError> {
        match (key, order) {
            (None, None) => Ok(None),
            (Some(_), None) => Err(DatmoError::RequiredArgumentMissing(
                "sort_order".to_owned(),
            )),
            (None, Some(_)) => Err(DatmoError::RequiredArgumentMissing("sort_key".to_owned())),
            (Some(key), Some(order)) => {
                let order = match order {
                    "ascending" => SortOrder::Ascending,
                    "descending" => SortOrder::Descending,
                    other => {
                        return Err(DatmoError::InvalidArgumentType(format!(
                            "sort order must be 'ascending' or 'descending', got '{other}'"
                        )));
                    }
                };
                Ok(Some(Self::new(key, order)))
            }
        }
    }

    pub(crate) fn apply(&self, docs: &mut [Document]) {
        let key = if self.key == "id" { "pk" } else { self.key.as_str() };
        // Records without the key sort last in either order.
        docs.sort_by(|a, b| match (a.get(key), b.get(key)) {
            (Some(x), Some(y)) => {
                let ord = compare_values(x, y).unwrap_or(Ordering::Equal);
                match self.order {
                    SortOrder::Ascending => ord,
                    SortOrder::Descending => ord.reverse(),
                }
            }
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        });
    }
}

/// Timestamps are stored in a lexicographically ordered form, so strings compare directly.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
