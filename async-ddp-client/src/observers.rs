// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Change observers over the collection store.
//!
//! Two registries live here. Cursor observers are explicit
//! `cursor.observe(callbacks)` registrations, filtered by the cursor's
//! selector. Computation observers are implicit: a `find` inside a running
//! computation registers its `(collection, computation)` pair, and any
//! matching change invalidates the computation so it reruns with a fresh
//! snapshot.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::error;
use serde_json::{json, Value};

use ddp_core::sync::Mutex;
use ddp_types::Document;

use crate::collections::matcher::DocumentMatcher;
use crate::tracker::{ComputationId, Tracker};

/// Callbacks for a cursor observer. Every member is optional.
#[derive(Default)]
pub struct CursorCallbacks {
    added: Option<Box<dyn Fn(&Document) + Send + Sync>>,
    changed: Option<Box<dyn Fn(&Document, &Document) + Send + Sync>>,
    removed: Option<Box<dyn Fn(&str, Option<&Document>) + Send + Sync>>,
}

impl CursorCallbacks {
    /// Callbacks with every member unset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with the new document when one enters the cursor's set.
    pub fn on_added(mut self, f: impl Fn(&Document) + Send + Sync + 'static) -> Self {
        self.added = Some(Box::new(f));
        self
    }

    /// Called with `(new, old)` when a document in the set changes and the
    /// post-image still matches the selector.
    pub fn on_changed(mut self, f: impl Fn(&Document, &Document) + Send + Sync + 'static) -> Self {
        self.changed = Some(Box::new(f));
        self
    }

    /// Called with `(id, old)` on every removal in the collection. This is
    /// the one channel that cannot be selector-filtered: the document is
    /// already gone.
    pub fn on_removed(
        mut self,
        f: impl Fn(&str, Option<&Document>) + Send + Sync + 'static,
    ) -> Self {
        self.removed = Some(Box::new(f));
        self
    }
}

struct CursorObserver {
    collection: String,
    selector: Option<Value>,
    callbacks: CursorCallbacks,
}

/// Stops a cursor observer when asked. Dropping the handle does not stop
/// the observer.
pub struct ObserverHandle {
    id: u64,
    registry: Weak<ObserverRegistry>,
}

impl ObserverHandle {
    /// Remove the observer from the registry.
    pub fn stop(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.cursor_observers.lock().remove(&self.id);
        }
    }
}

/// All observers over the store, cursor and computation alike.
pub struct ObserverRegistry {
    matcher: Arc<dyn DocumentMatcher>,
    tracker: Arc<Tracker>,
    cursor_observers: Mutex<HashMap<u64, Arc<CursorObserver>>>,
    computation_observers: Mutex<HashMap<(String, ComputationId), Option<Value>>>,
    next_observer: AtomicU64,
    weak_self: Mutex<Weak<ObserverRegistry>>,
}

impl ObserverRegistry {
    /// Create a registry invalidating through `tracker` and filtering
    /// through `matcher`.
    pub fn new(tracker: Arc<Tracker>, matcher: Arc<dyn DocumentMatcher>) -> Arc<Self> {
        let registry = Arc::new(ObserverRegistry {
            matcher,
            tracker,
            cursor_observers: Mutex::new(HashMap::new()),
            computation_observers: Mutex::new(HashMap::new()),
            next_observer: AtomicU64::new(1),
            weak_self: Mutex::new(Weak::new()),
        });
        *registry.weak_self.lock() = Arc::downgrade(&registry);
        registry
    }

    /// Register a cursor observer.
    pub fn register_cursor(
        &self,
        collection: &str,
        selector: Option<Value>,
        callbacks: CursorCallbacks,
    ) -> ObserverHandle {
        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        self.cursor_observers.lock().insert(
            id,
            Arc::new(CursorObserver {
                collection: collection.to_string(),
                selector,
                callbacks,
            }),
        );
        ObserverHandle {
            id,
            registry: self.weak_self.lock().clone(),
        }
    }

    /// Register (or refresh) the computation observer for a `find` made
    /// inside `computation`. The entry is torn down when the computation
    /// stops.
    pub fn register_computation(
        &self,
        collection: &str,
        computation: ComputationId,
        selector: Option<Value>,
    ) {
        let key = (collection.to_string(), computation);
        let mut observers = self.computation_observers.lock();
        let fresh = !observers.contains_key(&key);
        observers.insert(key.clone(), selector);
        drop(observers);
        if fresh {
            let weak = self.weak_self.lock().clone();
            self.tracker.on_stop(computation, move || {
                if let Some(registry) = weak.upgrade() {
                    registry.computation_observers.lock().remove(&key);
                }
            });
        }
    }

    fn matching_cursors(&self, collection: &str) -> Vec<Arc<CursorObserver>> {
        self.cursor_observers
            .lock()
            .values()
            .filter(|o| o.collection == collection)
            .cloned()
            .collect()
    }

    fn selector_matches(&self, selector: &Option<Value>, doc: &Document) -> bool {
        match selector {
            None => true,
            Some(selector) => self.matcher.matches(selector, doc),
        }
    }

    /// Selector re-check as an `{$and: [{_id}, selector]}` lookup against
    /// the post-image.
    fn rematch(&self, selector: &Option<Value>, doc: &Document) -> bool {
        match selector {
            None => true,
            Some(selector) => self
                .matcher
                .matches(&json!({"$and": [{"_id": doc.id()}, selector]}), doc),
        }
    }

    fn invalidate_matching(
        &self,
        collection: &str,
        hit: impl Fn(&Option<Value>) -> bool,
    ) {
        let hits: Vec<ComputationId> = self
            .computation_observers
            .lock()
            .iter()
            .filter(|((c, _), selector)| c.as_str() == collection && hit(selector))
            .map(|((_, id), _)| *id)
            .collect();
        for id in hits {
            self.tracker.invalidate_computation(id);
        }
    }

    /// A document appeared in `collection`.
    pub fn notify_added(&self, collection: &str, doc: &Document) {
        for observer in self.matching_cursors(collection) {
            if let Some(added) = &observer.callbacks.added {
                if self.rematch(&observer.selector, doc)
                    && catch_unwind(AssertUnwindSafe(|| added(doc))).is_err()
                {
                    error!("added observer panicked");
                }
            }
        }
        self.invalidate_matching(collection, |selector| self.selector_matches(selector, doc));
    }

    /// A document in `collection` changed from `old` to `new`.
    pub fn notify_changed(&self, collection: &str, new: &Document, old: &Document) {
        for observer in self.matching_cursors(collection) {
            if let Some(changed) = &observer.callbacks.changed {
                // Filtered on the post-image only: a document transitioning
                // out of the selector fires nothing on this channel.
                if self.rematch(&observer.selector, new)
                    && catch_unwind(AssertUnwindSafe(|| changed(new, old))).is_err()
                {
                    error!("changed observer panicked");
                }
            }
        }
        if new == old {
            // No-op rewrite: dependent computations stay valid.
            return;
        }
        self.invalidate_matching(collection, |selector| {
            self.selector_matches(selector, new) || self.selector_matches(selector, old)
        });
    }

    /// A document left `collection`. `old` is its pre-image when known.
    pub fn notify_removed(&self, collection: &str, id: &str, old: Option<&Document>) {
        for observer in self.matching_cursors(collection) {
            if let Some(removed) = &observer.callbacks.removed {
                if catch_unwind(AssertUnwindSafe(|| removed(id, old))).is_err() {
                    error!("removed observer panicked");
                }
            }
        }
        self.invalidate_matching(collection, |selector| match old {
            Some(old) => self.selector_matches(selector, old),
            None => true,
        });
    }
}
