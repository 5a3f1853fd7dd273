// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Side-channel event delivery ("vent").
//!
//! Some servers push transient events by piggybacking on `changed` frames:
//! the sentinel `__vent: "1"` marks the frame, `id` addresses a vent
//! subscription rather than a document, and `e` carries the payload. The
//! session offers every such frame to the dispatcher before it can touch
//! the document store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::debug;
use serde_json::Value;

use ddp_core::sync::Mutex;

use crate::session::events::defer;
use crate::session::{Session, SubscriptionCallbacks, SubscriptionHandle};

type VentListener = Arc<dyn Fn(Value) + Send + Sync>;

/// Routes vent events to their listeners by vent subscription id.
#[derive(Default)]
pub struct VentDispatcher {
    listeners: Mutex<HashMap<String, VentListener>>,
    next_id: AtomicU64,
}

impl VentDispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a vent subscription. The generated vent id is passed to the
    /// publication as its first parameter, and events addressed to it are
    /// handed to whatever [`VentHandle::listen`] registered.
    pub fn subscribe(
        self: &Arc<Self>,
        session: &Arc<Session>,
        name: &str,
        mut params: Vec<Value>,
    ) -> VentHandle {
        // The vent id doubles as the subscription's local id.
        let vent_id = format!("vent-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        params.insert(0, Value::String(vent_id.clone()));
        let subscription = session.subscribe_with_local_id(
            Some(vent_id.clone()),
            name,
            params,
            SubscriptionCallbacks::new(),
        );
        VentHandle {
            vent_id,
            subscription,
            dispatcher: Arc::downgrade(self),
        }
    }

    /// Deliver an event to the listener registered under `vent_id`.
    /// Returns whether anyone was listening.
    pub fn dispatch(&self, vent_id: &str, payload: Value) -> bool {
        let listener = self.listeners.lock().get(vent_id).cloned();
        match listener {
            Some(listener) => {
                defer(move || listener(payload));
                true
            }
            None => {
                debug!("Vent event for unknown listener {vent_id}");
                false
            }
        }
    }

    /// Drop every listener. Their subscriptions are unaffected; stop those
    /// through their handles.
    pub fn reset(&self) {
        self.listeners.lock().clear();
    }

    fn listen(&self, vent_id: &str, listener: VentListener) {
        self.listeners.lock().insert(vent_id.to_string(), listener);
    }

    fn unlisten(&self, vent_id: &str) {
        self.listeners.lock().remove(vent_id);
    }
}

/// Handle to one vent subscription.
pub struct VentHandle {
    vent_id: String,
    subscription: SubscriptionHandle,
    dispatcher: Weak<VentDispatcher>,
}

impl VentHandle {
    /// Register the event handler. Replaces any previous one.
    pub fn listen(&self, handler: impl Fn(Value) + Send + Sync + 'static) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.listen(&self.vent_id, Arc::new(handler));
        }
    }

    /// The vent id events are addressed to.
    pub fn vent_id(&self) -> &str {
        &self.vent_id
    }

    /// Stop the underlying subscription and drop the listener.
    pub fn stop(&self) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.unlisten(&self.vent_id);
        }
        self.subscription.stop();
    }
}
