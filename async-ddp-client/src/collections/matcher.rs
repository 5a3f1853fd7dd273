// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! The selector-matching seam.
//!
//! The full minimongo query engine is an external collaborator; the store
//! and observers only need a yes/no answer for one document against one
//! selector, asked through [`DocumentMatcher`]. The built-in
//! [`BasicMatcher`] covers the shapes the client itself generates (id
//! lookups, flat field equality, `$and`/`$or`, dotted paths); applications
//! with richer queries inject their own implementation.

use serde_json::Value;

use ddp_types::{ejson, Document};

/// Decides whether a document matches a selector.
pub trait DocumentMatcher: Send + Sync {
    /// `true` when `doc` is in the set described by `selector`.
    fn matches(&self, selector: &Value, doc: &Document) -> bool;
}

/// Default matcher: id strings, field equality with dotted paths, `$and`,
/// `$or`. Everything it does not understand matches nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicMatcher;

impl BasicMatcher {
    fn matches_clause(&self, key: &str, expected: &Value, doc: &Document) -> bool {
        match key {
            "$and" => expected
                .as_array()
                .is_some_and(|clauses| clauses.iter().all(|c| self.matches(c, doc))),
            "$or" => expected
                .as_array()
                .is_some_and(|clauses| clauses.iter().any(|c| self.matches(c, doc))),
            path => match doc.get(path) {
                Some(actual) => ejson::equals(actual, expected),
                // A missing field only matches an explicit null.
                None => expected.is_null(),
            },
        }
    }
}

impl DocumentMatcher for BasicMatcher {
    fn matches(&self, selector: &Value, doc: &Document) -> bool {
        match selector {
            // A bare string selects by id.
            Value::String(id) => doc.id() == id,
            Value::Object(clauses) => clauses
                .iter()
                .all(|(key, expected)| self.matches_clause(key, expected, doc)),
            _ => false,
        }
    }
}
