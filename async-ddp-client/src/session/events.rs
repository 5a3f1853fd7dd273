// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Public event dispatch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::error;

use ddp_core::sync::Mutex;

/// Everything the session announces to the application.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The handshake completed. `session_reused` is true when the server
    /// echoed the previous session id, meaning client-held state is still
    /// authoritative.
    Connected {
        /// Whether the server resumed the previous session.
        session_reused: bool,
    },
    /// The transport is gone; the reconnect loop may be about to run.
    Disconnected,
    /// A document was added to a collection.
    Added {
        /// Collection name.
        collection: String,
        /// Document id.
        id: String,
    },
    /// A document changed.
    Changed {
        /// Collection name.
        collection: String,
        /// Document id.
        id: String,
    },
    /// A document was removed.
    Removed {
        /// Collection name.
        collection: String,
        /// Document id.
        id: String,
    },
    /// Subscriptions became ready.
    Ready {
        /// Wire ids of the subscriptions.
        subs: Vec<String>,
    },
    /// The peer sent something this client cannot process.
    ProtocolError {
        /// Description of the offending frame.
        message: String,
    },
}

type Listener = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

/// Subscribable event registry. Emission is deferred onto a task so
/// application handlers can never reenter the frame parser synchronously,
/// and a panicking handler takes down only its dispatch task.
#[derive(Default)]
pub struct EventRegistry {
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
}

impl EventRegistry {
    /// Register a listener for every event; returns an id for
    /// [`EventRegistry::remove`].
    pub fn add(&self, listener: impl Fn(&ClientEvent) + Send + Sync + 'static) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Drop a listener.
    pub fn remove(&self, id: u64) {
        self.listeners.lock().retain(|(lid, _)| *lid != id);
    }

    /// Deliver `event` to every listener on a fresh task.
    pub fn emit(&self, event: ClientEvent) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        if listeners.is_empty() {
            return;
        }
        defer(move || {
            for listener in listeners {
                listener(&event);
            }
        });
    }
}

/// Run `f` on a task of its own: off the current call stack, and isolated
/// so a panic inside it is logged by the runtime instead of unwinding the
/// caller. Falls back to inline execution outside a runtime.
pub(crate) fn defer(f: impl FnOnce() + Send + 'static) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { f() });
        }
        Err(_) => {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
                error!("Deferred callback panicked");
            }
        }
    }
}
