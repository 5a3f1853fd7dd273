// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! The reactive dependency graph.
//!
//! A [`Computation`] wraps a user closure together with the set of
//! [`Dependency`] values it touched during its last run. `Dependency::
//! changed` invalidates every dependent computation and schedules a batched
//! flush; the flush reruns each invalidated computation once, however many
//! times its inputs changed in between. Relationships are kept by id in
//! maps rather than by pointer, so teardown is a map removal and there are
//! no reference cycles.
//!
//! The model is cooperative: computations are rerun one at a time from the
//! flush, and user closures run without any tracker lock held, so they can
//! freely call back into the tracker (`depend`, nested `autorun`,
//! `nonreactive`).

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use log::error;

use ddp_core::sync::Mutex;

/// Identifies a computation within its tracker.
pub type ComputationId = u64;

type DependencyId = u64;

type RunFn = Arc<Mutex<Box<dyn FnMut() + Send>>>;

/// Decides where batched flushes run. The default spawns a tokio task so a
/// burst of invalidations within one tick collapses into a single flush;
/// tests inject a manual scheduler and pump it by hand.
pub trait FlushScheduler: Send + Sync {
    /// Arrange for `flush` to run soon, off the current call stack.
    fn schedule(&self, flush: Box<dyn FnOnce() + Send>);
}

/// Schedules flushes on the tokio runtime, falling back to running inline
/// when called from outside a runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl FlushScheduler for TokioScheduler {
    fn schedule(&self, flush: Box<dyn FnOnce() + Send>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { flush() });
            }
            Err(_) => flush(),
        }
    }
}

/// Collects scheduled flushes for tests to run explicitly.
#[derive(Default)]
pub struct ManualScheduler {
    pending: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl ManualScheduler {
    /// Run every flush scheduled so far.
    pub fn run_pending(&self) {
        loop {
            let batch: Vec<_> = std::mem::take(&mut *self.pending.lock());
            if batch.is_empty() {
                return;
            }
            for flush in batch {
                flush();
            }
        }
    }
}

impl FlushScheduler for ManualScheduler {
    fn schedule(&self, flush: Box<dyn FnOnce() + Send>) {
        self.pending.lock().push(flush);
    }
}

struct ComputationRecord {
    func: RunFn,
    deps: HashSet<DependencyId>,
    invalidated: bool,
    stopped: bool,
    on_invalidate: Vec<Box<dyn FnOnce() + Send>>,
    on_stop: Vec<Box<dyn FnOnce() + Send>>,
}

#[derive(Default)]
struct TrackerState {
    computations: HashMap<ComputationId, ComputationRecord>,
    dependents: HashMap<DependencyId, HashSet<ComputationId>>,
    current: Option<ComputationId>,
    next_computation: ComputationId,
    next_dependency: DependencyId,
    flush_scheduled: bool,
    in_flush: bool,
    after_flush: Vec<Box<dyn FnOnce() + Send>>,
}

/// The reactive graph. One per client; tests construct their own.
pub struct Tracker {
    state: Mutex<TrackerState>,
    scheduler: Box<dyn FlushScheduler>,
    weak_self: Mutex<Weak<Tracker>>,
}

impl Tracker {
    /// Create a tracker flushing through `scheduler`.
    pub fn new(scheduler: Box<dyn FlushScheduler>) -> Arc<Self> {
        let tracker = Arc::new(Tracker {
            state: Mutex::new(TrackerState::default()),
            scheduler,
            weak_self: Mutex::new(Weak::new()),
        });
        *tracker.weak_self.lock() = Arc::downgrade(&tracker);
        tracker
    }

    /// The computation currently running, if any.
    pub fn current_computation(&self) -> Option<ComputationId> {
        self.state.lock().current
    }

    /// Create a computation from `func` and run it once immediately. On
    /// every invalidation it is rerun in the next batched flush, until
    /// stopped.
    pub fn autorun(&self, func: impl FnMut() + Send + 'static) -> Computation {
        let id = {
            let mut state = self.state.lock();
            let id = state.next_computation;
            state.next_computation += 1;
            state.computations.insert(
                id,
                ComputationRecord {
                    func: Arc::new(Mutex::new(Box::new(func))),
                    deps: HashSet::new(),
                    invalidated: false,
                    stopped: false,
                    on_invalidate: Vec::new(),
                    on_stop: Vec::new(),
                },
            );
            id
        };
        self.run_computation(id);
        Computation {
            id,
            tracker: self.weak_self.lock().clone(),
        }
    }

    /// Run `func` with no current computation, so reads inside it do not
    /// register dependencies.
    pub fn nonreactive<T>(&self, func: impl FnOnce() -> T) -> T {
        let previous = self.state.lock().current.take();
        let result = func();
        self.state.lock().current = previous;
        result
    }

    /// Create a fresh dependency.
    pub fn new_dependency(&self) -> Dependency {
        let mut state = self.state.lock();
        let id = state.next_dependency;
        state.next_dependency += 1;
        state.dependents.insert(id, HashSet::new());
        drop(state);
        Dependency {
            inner: Arc::new(DependencyInner {
                id,
                tracker: self.weak_self.lock().clone(),
            }),
        }
    }

    /// Register `hook` to run once, at the computation's next
    /// invalidation (stopping counts as one). A rerun that needs the hook
    /// again must re-register it.
    pub fn on_invalidate(&self, computation: ComputationId, hook: impl FnOnce() + Send + 'static) {
        if let Some(record) = self.state.lock().computations.get_mut(&computation) {
            record.on_invalidate.push(Box::new(hook));
        }
    }

    /// Register `hook` to run once when `computation` is stopped.
    pub fn on_stop(&self, computation: ComputationId, hook: impl FnOnce() + Send + 'static) {
        if let Some(record) = self.state.lock().computations.get_mut(&computation) {
            record.on_stop.push(Box::new(hook));
        }
    }

    /// Run `func` at the end of the current flush cycle, scheduling one if
    /// none is pending.
    pub fn after_flush(&self, func: impl FnOnce() + Send + 'static) {
        self.state.lock().after_flush.push(Box::new(func));
        self.require_flush();
    }

    /// Rerun every invalidated computation, then drain the after-flush
    /// queue, repeating until the graph is quiet. Normally invoked through
    /// the scheduler; tests may call it directly.
    pub fn flush(&self) {
        {
            let mut state = self.state.lock();
            if state.in_flush {
                // A flush is already draining the graph, it will pick up
                // whatever got invalidated since.
                return;
            }
            state.in_flush = true;
        }
        loop {
            let next = {
                let state = self.state.lock();
                state
                    .computations
                    .iter()
                    .filter(|(_, r)| r.invalidated && !r.stopped)
                    .map(|(id, _)| *id)
                    .min()
            };
            if let Some(id) = next {
                self.run_computation(id);
                continue;
            }
            let callbacks = std::mem::take(&mut self.state.lock().after_flush);
            if callbacks.is_empty() {
                break;
            }
            for callback in callbacks {
                if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                    error!("After-flush callback panicked");
                }
            }
        }
        let mut state = self.state.lock();
        state.in_flush = false;
        state.flush_scheduled = false;
    }

    fn require_flush(&self) {
        {
            let mut state = self.state.lock();
            if state.flush_scheduled || state.in_flush {
                return;
            }
            state.flush_scheduled = true;
        }
        let weak = self.weak_self.lock().clone();
        self.scheduler.schedule(Box::new(move || {
            if let Some(tracker) = weak.upgrade() {
                tracker.flush();
            }
        }));
    }

    fn run_computation(&self, id: ComputationId) {
        let (func, previous) = {
            let mut state = self.state.lock();
            let Some(record) = state.computations.get_mut(&id) else {
                return;
            };
            if record.stopped {
                return;
            }
            record.invalidated = false;
            let func = record.func.clone();
            let old_deps: Vec<_> = record.deps.drain().collect();
            for dep in old_deps {
                if let Some(dependents) = state.dependents.get_mut(&dep) {
                    dependents.remove(&id);
                }
            }
            let previous = state.current.replace(id);
            (func, previous)
        };
        if catch_unwind(AssertUnwindSafe(|| (func.lock())())).is_err() {
            error!("Computation {id} panicked, it stays registered");
        }
        self.state.lock().current = previous;
    }

    /// Invalidate a computation by id, for registries that track
    /// computations without holding a handle.
    pub(crate) fn invalidate_computation(&self, id: ComputationId) {
        self.invalidate(id);
    }

    fn invalidate(&self, id: ComputationId) {
        let hooks = {
            let mut state = self.state.lock();
            let Some(record) = state.computations.get_mut(&id) else {
                return;
            };
            if record.stopped || record.invalidated {
                return;
            }
            record.invalidated = true;
            std::mem::take(&mut record.on_invalidate)
        };
        for hook in hooks {
            if catch_unwind(AssertUnwindSafe(hook)).is_err() {
                error!("Invalidate hook panicked");
            }
        }
        self.require_flush();
    }

    fn stop(&self, id: ComputationId) {
        let (invalidate_hooks, stop_hooks) = {
            let mut state = self.state.lock();
            let Some(mut record) = state.computations.remove(&id) else {
                return;
            };
            let deps: Vec<_> = record.deps.drain().collect();
            for dep in deps {
                if let Some(dependents) = state.dependents.get_mut(&dep) {
                    dependents.remove(&id);
                }
            }
            (record.on_invalidate, std::mem::take(&mut record.on_stop))
        };
        for hook in invalidate_hooks {
            if catch_unwind(AssertUnwindSafe(hook)).is_err() {
                error!("Invalidate hook panicked");
            }
        }
        for hook in stop_hooks {
            if catch_unwind(AssertUnwindSafe(hook)).is_err() {
                error!("Stop hook panicked");
            }
        }
    }

    fn depend(&self, dependency: DependencyId) -> bool {
        let mut state = self.state.lock();
        let Some(current) = state.current else {
            return false;
        };
        let newly_added = state
            .dependents
            .entry(dependency)
            .or_default()
            .insert(current);
        if let Some(record) = state.computations.get_mut(&current) {
            record.deps.insert(dependency);
        }
        newly_added
    }

    fn changed(&self, dependency: DependencyId) {
        let dependents: Vec<_> = {
            let state = self.state.lock();
            state
                .dependents
                .get(&dependency)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default()
        };
        for id in dependents {
            self.invalidate(id);
        }
    }

    fn has_dependents(&self, dependency: DependencyId) -> bool {
        self.state
            .lock()
            .dependents
            .get(&dependency)
            .is_some_and(|set| !set.is_empty())
    }

    fn remove_dependency(&self, dependency: DependencyId) {
        let mut state = self.state.lock();
        if let Some(dependents) = state.dependents.remove(&dependency) {
            for id in dependents {
                if let Some(record) = state.computations.get_mut(&id) {
                    record.deps.remove(&dependency);
                }
            }
        }
    }
}

/// Handle to a computation. Cloning does not duplicate the computation;
/// stopping is explicit (or via a [`crate::tracked::Tracked`] guard).
#[derive(Clone)]
pub struct Computation {
    id: ComputationId,
    tracker: Weak<Tracker>,
}

impl Computation {
    /// The id of this computation within its tracker.
    pub fn id(&self) -> ComputationId {
        self.id
    }

    /// Mark the computation dirty; it reruns in the next flush.
    pub fn invalidate(&self) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.invalidate(self.id);
        }
    }

    /// Detach the computation from every dependency and prevent further
    /// runs. Idempotent.
    pub fn stop(&self) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.stop(self.id);
        }
    }
}

struct DependencyInner {
    id: DependencyId,
    tracker: Weak<Tracker>,
}

impl Drop for DependencyInner {
    fn drop(&mut self) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.remove_dependency(self.id);
        }
    }
}

/// A source of reactivity: a set of computations to invalidate when the
/// underlying value changes. Clones share the same set.
#[derive(Clone)]
pub struct Dependency {
    inner: Arc<DependencyInner>,
}

impl Dependency {
    /// Link the currently running computation to this dependency. Returns
    /// `true` if the link is new, `false` when already linked or when no
    /// computation is running.
    pub fn depend(&self) -> bool {
        match self.inner.tracker.upgrade() {
            Some(tracker) => tracker.depend(self.inner.id),
            None => false,
        }
    }

    /// Invalidate every dependent computation and schedule a flush.
    pub fn changed(&self) {
        if let Some(tracker) = self.inner.tracker.upgrade() {
            tracker.changed(self.inner.id);
        }
    }

    /// Whether any live computation depends on this value.
    pub fn has_dependents(&self) -> bool {
        self.inner
            .tracker
            .upgrade()
            .is_some_and(|tracker| tracker.has_dependents(self.inner.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manual_tracker() -> (Arc<Tracker>, Arc<ManualScheduler>) {
        let scheduler = Arc::new(ManualScheduler::default());
        let tracker = Tracker::new(Box::new(SharedScheduler(scheduler.clone())));
        (tracker, scheduler)
    }

    struct SharedScheduler(Arc<ManualScheduler>);

    impl FlushScheduler for SharedScheduler {
        fn schedule(&self, flush: Box<dyn FnOnce() + Send>) {
            self.0.schedule(flush);
        }
    }

    #[test]
    fn autorun_runs_once_and_reruns_on_change() {
        let (tracker, scheduler) = manual_tracker();
        let dep = tracker.new_dependency();
        let runs = Arc::new(AtomicUsize::new(0));

        let runs_in = runs.clone();
        let dep_in = dep.clone();
        let _computation = tracker.autorun(move || {
            dep_in.depend();
            runs_in.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        dep.changed();
        scheduler.run_pending();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn flush_batches_multiple_changes() {
        let (tracker, scheduler) = manual_tracker();
        let dep = tracker.new_dependency();
        let runs = Arc::new(AtomicUsize::new(0));

        let runs_in = runs.clone();
        let dep_in = dep.clone();
        tracker.autorun(move || {
            dep_in.depend();
            runs_in.fetch_add(1, Ordering::SeqCst);
        });

        dep.changed();
        dep.changed();
        dep.changed();
        scheduler.run_pending();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stopped_computation_never_reruns() {
        let (tracker, scheduler) = manual_tracker();
        let dep = tracker.new_dependency();
        let runs = Arc::new(AtomicUsize::new(0));

        let runs_in = runs.clone();
        let dep_in = dep.clone();
        let computation = tracker.autorun(move || {
            dep_in.depend();
            runs_in.fetch_add(1, Ordering::SeqCst);
        });
        computation.stop();
        dep.changed();
        scheduler.run_pending();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!dep.has_dependents());
    }

    #[test]
    fn dependencies_are_rebuilt_each_run() {
        let (tracker, scheduler) = manual_tracker();
        let first = tracker.new_dependency();
        let second = tracker.new_dependency();
        let use_first = Arc::new(AtomicUsize::new(1));
        let runs = Arc::new(AtomicUsize::new(0));

        let (use_in, runs_in) = (use_first.clone(), runs.clone());
        let (first_in, second_in) = (first.clone(), second.clone());
        tracker.autorun(move || {
            if use_in.load(Ordering::SeqCst) == 1 {
                first_in.depend();
            } else {
                second_in.depend();
            }
            runs_in.fetch_add(1, Ordering::SeqCst);
        });

        use_first.store(0, Ordering::SeqCst);
        first.changed();
        scheduler.run_pending();
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        // The rerun depended on `second` only; `first` is now inert.
        first.changed();
        scheduler.run_pending();
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        second.changed();
        scheduler.run_pending();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn nonreactive_skips_dependency_registration() {
        let (tracker, scheduler) = manual_tracker();
        let dep = tracker.new_dependency();
        let runs = Arc::new(AtomicUsize::new(0));

        let runs_in = runs.clone();
        let dep_in = dep.clone();
        let tracker_in = tracker.clone();
        tracker.autorun(move || {
            tracker_in.nonreactive(|| dep_in.depend());
            runs_in.fetch_add(1, Ordering::SeqCst);
        });

        dep.changed();
        scheduler.run_pending();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn after_flush_runs_at_end_of_cycle() {
        let (tracker, scheduler) = manual_tracker();
        let dep = tracker.new_dependency();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_in = order.clone();
        let dep_in = dep.clone();
        tracker.autorun(move || {
            dep_in.depend();
            order_in.lock().push("run");
        });
        order.lock().clear();

        dep.changed();
        let order_in = order.clone();
        tracker.after_flush(move || order_in.lock().push("after"));
        scheduler.run_pending();
        assert_eq!(*order.lock(), ["run", "after"]);
    }

    #[test]
    fn invalidate_hooks_fire_immediately_and_once() {
        let (tracker, scheduler) = manual_tracker();
        let fired = Arc::new(AtomicUsize::new(0));

        let computation = tracker.autorun(|| {});
        let fired_in = fired.clone();
        tracker.on_invalidate(computation.id(), move || {
            fired_in.fetch_add(1, Ordering::SeqCst);
        });
        computation.invalidate();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // One-shot: a second invalidation does not refire the hook.
        scheduler.run_pending();
        computation.invalidate();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
