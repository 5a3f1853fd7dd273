// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! A reactive key-value store.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use ddp_core::sync::Mutex;
use ddp_types::ejson;

use crate::tracker::{Dependency, Tracker};

struct Entry {
    value: Value,
    dep: Dependency,
}

/// String-keyed EJSON values with per-key reactivity: `get` inside a
/// computation registers a dependency, `set` invalidates dependents only
/// when the value actually changed.
pub struct ReactiveDict {
    tracker: Arc<Tracker>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl ReactiveDict {
    /// Create an empty dict on `tracker`.
    pub fn new(tracker: Arc<Tracker>) -> Self {
        ReactiveDict {
            tracker,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Read a key, registering the current computation. Missing keys read
    /// as `None` and still register, so a later `set` reruns the reader.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Null,
            dep: self.tracker.new_dependency(),
        });
        entry.dep.depend();
        match &entry.value {
            Value::Null => None,
            value => Some(value.clone()),
        }
    }

    /// Write a key. Dependents are invalidated only if the new value is
    /// not EJSON-equal to the old one.
    pub fn set(&self, key: &str, value: Value) {
        let dep = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Null,
                dep: self.tracker.new_dependency(),
            });
            if ejson::equals(&entry.value, &value) {
                return;
            }
            entry.value = value;
            entry.dep.clone()
        };
        dep.changed();
    }

    /// Remove a key, invalidating dependents if it held a value.
    pub fn delete(&self, key: &str) {
        self.set(key, Value::Null);
    }

    /// Non-reactive equality check against the stored value.
    pub fn equals(&self, key: &str, value: &Value) -> bool {
        self.entries
            .lock()
            .get(key)
            .is_some_and(|entry| ejson::equals(&entry.value, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{FlushScheduler, ManualScheduler};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SharedScheduler(Arc<ManualScheduler>);

    impl FlushScheduler for SharedScheduler {
        fn schedule(&self, flush: Box<dyn FnOnce() + Send>) {
            self.0.schedule(flush);
        }
    }

    #[test]
    fn set_reruns_readers() {
        let scheduler = Arc::new(ManualScheduler::default());
        let tracker = Tracker::new(Box::new(SharedScheduler(scheduler.clone())));
        let dict = Arc::new(ReactiveDict::new(tracker.clone()));
        let runs = Arc::new(AtomicUsize::new(0));

        let (dict_in, runs_in) = (dict.clone(), runs.clone());
        tracker.autorun(move || {
            let _ = dict_in.get("userId");
            runs_in.fetch_add(1, Ordering::SeqCst);
        });

        dict.set("userId", json!("u1"));
        scheduler.run_pending();
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        // EJSON-equal rewrite: no rerun.
        dict.set("userId", json!("u1"));
        scheduler.run_pending();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn delete_reads_as_missing() {
        let scheduler = Arc::new(ManualScheduler::default());
        let tracker = Tracker::new(Box::new(SharedScheduler(scheduler)));
        let dict = ReactiveDict::new(tracker);
        dict.set("k", json!(1));
        dict.delete("k");
        assert_eq!(dict.get("k"), None);
    }
}
