// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! The in-memory mirror of server collections.
//!
//! Documents arrive through `added`/`changed`/`removed` frames and are held
//! per collection, keyed by `_id`. Reads go through [`Cursor`] snapshots;
//! change notification goes through the observer registry, which also
//! invalidates computations that read from the store. Collections flagged
//! *local* belong to the application alone: server frames never write them
//! and a cold session never clears them.

pub mod cursor;
pub mod matcher;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::warn;
use serde_json::{Map, Value};

use ddp_core::sync::Mutex;
use ddp_types::{Document, Error};

use crate::observers::ObserverRegistry;
use crate::tracker::Tracker;

pub use cursor::{Cursor, FindOptions, SortOrder};
pub use matcher::{BasicMatcher, DocumentMatcher};

/// Names that collide with `Object` prototype members on JS peers. A
/// collection under one of these names corrupts property lookups in every
/// JS process that mirrors it, so they are rejected outright.
const RESERVED_NAMES: &[&str] = &[
    "__proto__",
    "constructor",
    "prototype",
    "hasOwnProperty",
    "isPrototypeOf",
    "propertyIsEnumerable",
    "toLocaleString",
    "toString",
    "valueOf",
    "__defineGetter__",
    "__defineSetter__",
    "__lookupGetter__",
    "__lookupSetter__",
];

/// Check a collection name against the reserved list.
pub fn validate_collection_name(name: &str) -> Result<(), Error> {
    if RESERVED_NAMES.contains(&name) {
        return Err(Error::Other(format!(
            "\"{name}\" is a reserved name and cannot be used as a collection name"
        )));
    }
    Ok(())
}

struct CollectionData {
    docs: BTreeMap<String, Document>,
    local: bool,
}

/// Every mirrored collection, plus the local ones.
pub struct CollectionStore {
    tracker: Arc<Tracker>,
    observers: Arc<ObserverRegistry>,
    matcher: Arc<dyn DocumentMatcher>,
    collections: Mutex<HashMap<String, CollectionData>>,
}

impl CollectionStore {
    /// Create an empty store notifying through `observers` and filtering
    /// through `matcher`.
    pub fn new(
        tracker: Arc<Tracker>,
        observers: Arc<ObserverRegistry>,
        matcher: Arc<dyn DocumentMatcher>,
    ) -> Arc<Self> {
        Arc::new(CollectionStore {
            tracker,
            observers,
            matcher,
            collections: Mutex::new(HashMap::new()),
        })
    }

    /// Create a local collection: writable by the application, invisible
    /// to the server, immune to reconnect clearing. Creating an existing
    /// collection again is an error.
    pub fn create_local_collection(&self, name: &str) -> Result<(), Error> {
        validate_collection_name(name)?;
        let mut collections = self.collections.lock();
        if collections.contains_key(name) {
            return Err(Error::Other(format!("collection \"{name}\" already exists")));
        }
        collections.insert(
            name.to_string(),
            CollectionData {
                docs: BTreeMap::new(),
                local: true,
            },
        );
        Ok(())
    }

    /// Snapshot query. Inside a running computation this also registers a
    /// computation observer, so matching changes rerun the computation.
    pub fn find(
        &self,
        collection: &str,
        selector: Option<Value>,
        options: FindOptions,
    ) -> Result<Cursor, Error> {
        validate_collection_name(collection)?;
        if let Some(computation) = self.tracker.current_computation() {
            self.observers
                .register_computation(collection, computation, selector.clone());
        }
        let docs: Vec<Document> = {
            let collections = self.collections.lock();
            match collections.get(collection) {
                Some(data) => data.docs.values().cloned().collect(),
                None => Vec::new(),
            }
        };
        Ok(Cursor::new(
            collection,
            selector,
            docs,
            options,
            self.matcher.clone(),
            self.observers.clone(),
        ))
    }

    /// First match of `find`, or `None`.
    pub fn find_one(&self, collection: &str, selector: Option<Value>) -> Result<Option<Document>, Error> {
        let cursor = self.find(collection, selector, FindOptions { limit: Some(1), ..Default::default() })?;
        Ok(cursor.fetch().into_iter().next())
    }

    /// Upsert from the application side, for local collections.
    pub fn upsert_local(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<(), Error> {
        validate_collection_name(collection)?;
        let doc = Document::new(id, fields);
        {
            let mut collections = self.collections.lock();
            let Some(data) = collections.get_mut(collection) else {
                return Err(Error::Other(format!("no local collection \"{collection}\"")));
            };
            if !data.local {
                return Err(Error::Other(format!(
                    "collection \"{collection}\" is mirrored from the server"
                )));
            }
            data.docs.insert(id.to_string(), doc.clone());
        }
        self.observers.notify_added(collection, &doc);
        Ok(())
    }

    /// Apply an `added` frame.
    pub fn apply_added(&self, collection: &str, id: &str, fields: Map<String, Value>) {
        if let Err(err) = validate_collection_name(collection) {
            warn!("Ignoring added frame: {err}");
            return;
        }
        let doc = Document::new(id, fields);
        {
            let mut collections = self.collections.lock();
            let data = collections.entry(collection.to_string()).or_insert_with(|| {
                CollectionData {
                    docs: BTreeMap::new(),
                    local: false,
                }
            });
            if data.local {
                warn!("Ignoring added frame for local collection \"{collection}\"");
                return;
            }
            data.docs.insert(id.to_string(), doc.clone());
        }
        self.observers.notify_added(collection, &doc);
    }

    /// Apply a `changed` frame: set `fields`, null out `cleared`, then
    /// notify with both images.
    pub fn apply_changed(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
        cleared: Vec<String>,
    ) {
        if let Err(err) = validate_collection_name(collection) {
            warn!("Ignoring changed frame: {err}");
            return;
        }
        let (new_doc, old_doc) = {
            let mut collections = self.collections.lock();
            let data = collections.entry(collection.to_string()).or_insert_with(|| {
                CollectionData {
                    docs: BTreeMap::new(),
                    local: false,
                }
            });
            if data.local {
                warn!("Ignoring changed frame for local collection \"{collection}\"");
                return;
            }
            let old_doc = data
                .docs
                .get(id)
                .cloned()
                .unwrap_or_else(|| Document::new(id, Map::new()));
            let mut new_doc = old_doc.clone();
            new_doc.apply_change(&fields, &cleared);
            data.docs.insert(id.to_string(), new_doc.clone());
            (new_doc, old_doc)
        };
        self.observers.notify_changed(collection, &new_doc, &old_doc);
    }

    /// Apply a `removed` frame.
    pub fn apply_removed(&self, collection: &str, id: &str) {
        if let Err(err) = validate_collection_name(collection) {
            warn!("Ignoring removed frame: {err}");
            return;
        }
        let old_doc = {
            let mut collections = self.collections.lock();
            match collections.get_mut(collection) {
                Some(data) if !data.local => data.docs.remove(id),
                _ => return,
            }
        };
        self.observers.notify_removed(collection, id, old_doc.as_ref());
    }

    /// Empty every non-local collection, notifying observers document by
    /// document. Runs when a reconnect lands on a fresh server session,
    /// right before the server resends the world.
    pub fn clear_remote_collections(&self) {
        let drained: Vec<(String, Vec<Document>)> = {
            let mut collections = self.collections.lock();
            collections
                .iter_mut()
                .filter(|(_, data)| !data.local)
                .map(|(name, data)| {
                    let docs = std::mem::take(&mut data.docs);
                    (name.clone(), docs.into_values().collect())
                })
                .collect()
        };
        for (collection, docs) in drained {
            for doc in docs {
                self.observers
                    .notify_removed(&collection, doc.id(), Some(&doc));
            }
        }
    }

    /// A named handle for repeated queries against one collection.
    pub fn collection(self: &Arc<Self>, name: &str) -> Result<Collection, Error> {
        validate_collection_name(name)?;
        Ok(Collection {
            name: name.to_string(),
            store: self.clone(),
        })
    }

    /// Whether `name` exists and is local.
    pub fn is_local_collection(&self, name: &str) -> bool {
        self.collections
            .lock()
            .get(name)
            .is_some_and(|data| data.local)
    }

    /// Number of documents currently held in `name`.
    pub fn collection_len(&self, name: &str) -> usize {
        self.collections
            .lock()
            .get(name)
            .map(|data| data.docs.len())
            .unwrap_or(0)
    }
}

/// A collection bound to its store. Cheap to clone and hand out.
#[derive(Clone)]
pub struct Collection {
    name: String,
    store: Arc<CollectionStore>,
}

impl Collection {
    /// The collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot query; see [`CollectionStore::find`].
    pub fn find(&self, selector: Option<Value>, options: FindOptions) -> Result<Cursor, Error> {
        self.store.find(&self.name, selector, options)
    }

    /// First match, or `None`.
    pub fn find_one(&self, selector: Option<Value>) -> Result<Option<Document>, Error> {
        self.store.find_one(&self.name, selector)
    }

    /// Upsert a document; only valid on local collections.
    pub fn upsert(&self, id: &str, fields: Map<String, Value>) -> Result<(), Error> {
        self.store.upsert_local(&self.name, id, fields)
    }
}
