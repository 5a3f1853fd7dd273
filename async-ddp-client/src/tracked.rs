// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Reactive binding glue: a computation whose value is a watch channel.

use std::sync::Arc;

use tokio::sync::watch;

use crate::tracker::{Computation, Tracker};

/// A reactive value: `compute` runs inside a computation, its result is
/// published on a watch channel, and every invalidation republishes.
/// Dropping the guard stops the computation; this is the hook for UI-style
/// "rerun on change, dispose on unmount" consumers.
pub struct Tracked<T> {
    rx: watch::Receiver<T>,
    computation: Computation,
}

impl<T: Clone + Send + Sync + 'static> Tracked<T> {
    /// Run `compute` in a fresh computation and track it. `compute` runs
    /// exactly once here, inside the computation, so effects like
    /// subscriptions register against it.
    pub fn new(tracker: &Arc<Tracker>, mut compute: impl FnMut() -> T + Send + 'static) -> Self {
        // The channel needs the first run's value, and the first run must
        // happen inside the computation: stash the value, then wire the
        // sender for every later rerun.
        let first = Arc::new(ddp_core::sync::Mutex::new(None::<T>));
        let sender = Arc::new(ddp_core::sync::Mutex::new(None::<watch::Sender<T>>));
        let (first_in, sender_in) = (first.clone(), sender.clone());
        let computation = tracker.autorun(move || {
            let value = compute();
            match sender_in.lock().as_ref() {
                Some(tx) => {
                    let _ = tx.send(value);
                }
                None => *first_in.lock() = Some(value),
            }
        });
        let initial = first
            .lock()
            .take()
            .expect("tracked computation failed its first run");
        let (tx, rx) = watch::channel(initial);
        *sender.lock() = Some(tx);
        Tracked { rx, computation }
    }

    /// The current value.
    pub fn get(&self) -> T {
        self.rx.borrow().clone()
    }

    /// A receiver for consumers that want to await changes themselves.
    pub fn watch(&self) -> watch::Receiver<T> {
        self.rx.clone()
    }

    /// Wait until the value changes and return the new value.
    pub async fn changed(&mut self) -> Option<T> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

impl<T> Drop for Tracked<T> {
    fn drop(&mut self) {
        self.computation.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{FlushScheduler, ManualScheduler};
    use ddp_core::sync::Mutex;

    struct SharedScheduler(Arc<ManualScheduler>);

    impl FlushScheduler for SharedScheduler {
        fn schedule(&self, flush: Box<dyn FnOnce() + Send>) {
            self.0.schedule(flush);
        }
    }

    #[test]
    fn republishes_on_invalidation() {
        let scheduler = Arc::new(ManualScheduler::default());
        let tracker = Tracker::new(Box::new(SharedScheduler(scheduler.clone())));
        let dep = tracker.new_dependency();
        let value = Arc::new(Mutex::new(1));

        let (dep_in, value_in) = (dep.clone(), value.clone());
        let tracked = Tracked::new(&tracker, move || {
            dep_in.depend();
            *value_in.lock()
        });
        assert_eq!(tracked.get(), 1);

        *value.lock() = 2;
        dep.changed();
        scheduler.run_pending();
        assert_eq!(tracked.get(), 2);
    }

    #[test]
    fn drop_stops_the_computation() {
        let scheduler = Arc::new(ManualScheduler::default());
        let tracker = Tracker::new(Box::new(SharedScheduler(scheduler.clone())));
        let dep = tracker.new_dependency();

        let dep_in = dep.clone();
        let tracked = Tracked::new(&tracker, move || {
            dep_in.depend();
        });
        drop(tracked);
        assert!(!dep.has_dependents());
    }
}
