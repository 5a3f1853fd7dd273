// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! The document model mirrored from server collections.

use serde_json::{Map, Value};

use crate::ejson;

/// A single document: an `_id` plus arbitrary EJSON fields.
///
/// `_id` is immutable and globally unique within its collection; it is kept
/// inline in the field map so a document serializes to exactly its wire
/// shape.
#[derive(Debug, Clone)]
pub struct Document {
    fields: Map<String, Value>,
}

impl Document {
    /// Field name of the primary key.
    pub const ID_FIELD: &'static str = "_id";

    /// Create a document from an id and its initial fields. Any `_id`
    /// present in `fields` is overwritten by `id`.
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        let mut fields = fields;
        fields.insert(Self::ID_FIELD.into(), Value::String(id.into()));
        Document { fields }
    }

    /// The document id.
    pub fn id(&self) -> &str {
        match self.fields.get(Self::ID_FIELD) {
            Some(Value::String(id)) => id,
            _ => "",
        }
    }

    /// Look up a field. Dotted paths (`"profile.name"`) descend into
    /// nested objects.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.fields.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// Apply a `changed` frame: set every field in `fields`, null out every
    /// name in `cleared`. The id is not touchable through this path.
    pub fn apply_change(&mut self, fields: &Map<String, Value>, cleared: &[String]) {
        for (name, value) in fields {
            if name != Self::ID_FIELD {
                self.fields.insert(name.clone(), value.clone());
            }
        }
        for name in cleared {
            if name != Self::ID_FIELD {
                self.fields.insert(name.clone(), Value::Null);
            }
        }
    }

    /// Borrow the raw field map, id included.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// The document as a value tree, id included.
    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .all(|(k, v)| other.fields.get(k).is_some_and(|w| ejson::equals(v, w)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn id_wins_over_fields() {
        let doc = Document::new("a", fields(json!({"_id": "forged", "x": 1})));
        assert_eq!(doc.id(), "a");
    }

    #[test]
    fn apply_change_sets_and_clears() {
        let mut doc = Document::new("a", fields(json!({"color": "red", "size": 4})));
        doc.apply_change(&fields(json!({"color": "blue"})), &["size".into()]);
        assert_eq!(doc.get("color"), Some(&json!("blue")));
        assert_eq!(doc.get("size"), Some(&Value::Null));
    }

    #[test]
    fn dotted_path_lookup() {
        let doc = Document::new("a", fields(json!({"profile": {"name": "ada"}})));
        assert_eq!(doc.get("profile.name"), Some(&json!("ada")));
        assert_eq!(doc.get("profile.missing"), None);
    }
}
