// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Cursors: immutable query snapshots.

use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::Value;

use ddp_types::Document;

use crate::observers::{CursorCallbacks, ObserverHandle, ObserverRegistry};

use super::matcher::DocumentMatcher;

/// Sort direction for one key of [`FindOptions::sort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Smallest first.
    Ascending,
    /// Largest first.
    Descending,
}

/// Options shaping a `find` snapshot.
#[derive(Default, Clone)]
pub struct FindOptions {
    /// Sort keys applied in order, dotted paths allowed.
    pub sort: Vec<(String, SortOrder)>,
    /// Documents to skip from the front of the sorted set.
    pub skip: Option<usize>,
    /// Maximum number of documents returned.
    pub limit: Option<usize>,
    /// Projection: keep only these fields (`_id` always survives).
    pub fields: Option<Vec<String>>,
}

/// An immutable snapshot of the documents matching a selector at the time
/// of the `find`, plus that selector for observer registration. Later store
/// writes do not alter an existing cursor.
pub struct Cursor {
    collection: String,
    selector: Option<Value>,
    docs: Vec<Document>,
    observers: Arc<ObserverRegistry>,
}

impl Cursor {
    pub(crate) fn new(
        collection: &str,
        selector: Option<Value>,
        all_docs: Vec<Document>,
        options: FindOptions,
        matcher: Arc<dyn DocumentMatcher>,
        observers: Arc<ObserverRegistry>,
    ) -> Self {
        let mut docs: Vec<Document> = all_docs
            .into_iter()
            .filter(|doc| match &selector {
                None => true,
                Some(selector) => matcher.matches(selector, doc),
            })
            .collect();
        if !options.sort.is_empty() {
            docs.sort_by(|a, b| compare_documents(a, b, &options.sort));
        }
        let skip = options.skip.unwrap_or(0);
        let docs: Vec<Document> = docs
            .into_iter()
            .skip(skip)
            .take(options.limit.unwrap_or(usize::MAX))
            .map(|doc| project(doc, options.fields.as_deref()))
            .collect();
        Cursor {
            collection: collection.to_string(),
            selector,
            docs,
            observers,
        }
    }

    /// Materialize the snapshot.
    pub fn fetch(&self) -> Vec<Document> {
        self.docs.clone()
    }

    /// Number of matched documents.
    pub fn count(&self) -> usize {
        self.docs.len()
    }

    /// Visit each document in order.
    pub fn for_each(&self, mut f: impl FnMut(&Document)) {
        for doc in &self.docs {
            f(doc);
        }
    }

    /// Map each document in order.
    pub fn map<T>(&self, mut f: impl FnMut(&Document) -> T) -> Vec<T> {
        self.docs.iter().map(&mut f).collect()
    }

    /// Register a selector-filtered observer for future changes to this
    /// cursor's collection. The snapshot itself never changes.
    pub fn observe(&self, callbacks: CursorCallbacks) -> ObserverHandle {
        self.observers
            .register_cursor(&self.collection, self.selector.clone(), callbacks)
    }
}

fn project(doc: Document, fields: Option<&[String]>) -> Document {
    let Some(fields) = fields else {
        return doc;
    };
    let mut projected = serde_json::Map::new();
    for field in fields {
        if let Some(value) = doc.fields().get(field) {
            projected.insert(field.clone(), value.clone());
        }
    }
    Document::new(doc.id(), projected)
}

fn compare_documents(a: &Document, b: &Document, sort: &[(String, SortOrder)]) -> Ordering {
    for (path, order) in sort {
        let ordering = compare_values(a.get(path), b.get(path));
        let ordering = match order {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 5,
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            match (x.as_f64(), y.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                _ => Ordering::Equal,
            }
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        _ => Ordering::Equal,
    }
}
