// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Client-side subscription records.
//!
//! A record is keyed by its `local_id`, the stable handle identity that
//! survives reactive reuse. The `remote_id` is what goes on the wire in
//! `sub`/`unsub` and comes back in `ready`/`nosub`. The two start out
//! equal and only diverge if a subscription is ever re-issued.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use ddp_core::messages::ClientMessage;
use ddp_types::{ejson, ServerError};

use crate::tracker::Dependency;

/// Lifecycle callbacks of one subscription activation. Each fires at most
/// once; reuse installs a fresh set.
#[derive(Default)]
pub struct SubscriptionCallbacks {
    pub(crate) on_ready: Option<Box<dyn FnOnce() + Send>>,
    pub(crate) on_error: Option<Box<dyn FnOnce(ServerError) + Send>>,
    pub(crate) on_stop: Option<Box<dyn FnOnce(Option<ServerError>) + Send>>,
}

impl SubscriptionCallbacks {
    /// Callbacks with every member unset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once when the server marks the subscription ready. A reused
    /// subscription that is already ready fires immediately.
    pub fn on_ready(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_ready = Some(Box::new(f));
        self
    }

    /// Called when the server refuses or aborts the subscription. The echo
    /// of a client-initiated stop does not count.
    pub fn on_error(mut self, f: impl FnOnce(ServerError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Called when the subscription ends for any reason other than a
    /// client-initiated stop's own echo; the error is present when the
    /// server ended it.
    pub fn on_stop(mut self, f: impl FnOnce(Option<ServerError>) + Send + 'static) -> Self {
        self.on_stop = Some(Box::new(f));
        self
    }
}

pub(crate) struct SubscriptionRecord {
    pub local_id: String,
    pub remote_id: String,
    pub name: String,
    pub params: Vec<Value>,
    pub inactive: bool,
    pub ready: bool,
    /// Whether the `sub` frame ever reached a transport. Unsent frames are
    /// still in the outbound queue and must not be duplicated by replay.
    pub sent: bool,
    pub ready_dep: Dependency,
    pub callbacks: SubscriptionCallbacks,
    pub insertion: u64,
}

/// All subscription records plus the bookkeeping that swallows the `nosub`
/// echo of client-initiated stops.
#[derive(Default)]
pub(crate) struct SubscriptionState {
    records: HashMap<String, SubscriptionRecord>,
    remote_to_local: HashMap<String, String>,
    self_initiated: HashSet<String>,
    next_insertion: u64,
}

impl SubscriptionState {
    pub fn insert(&mut self, mut record: SubscriptionRecord) {
        record.insertion = self.next_insertion;
        self.next_insertion += 1;
        self.remote_to_local
            .insert(record.remote_id.clone(), record.local_id.clone());
        self.records.insert(record.local_id.clone(), record);
    }

    pub fn get(&self, local_id: &str) -> Option<&SubscriptionRecord> {
        self.records.get(local_id)
    }

    pub fn get_mut(&mut self, local_id: &str) -> Option<&mut SubscriptionRecord> {
        self.records.get_mut(local_id)
    }

    pub fn local_for_remote(&self, remote_id: &str) -> Option<&str> {
        self.remote_to_local.get(remote_id).map(String::as_str)
    }

    /// An inactive record with this name and EJSON-equal params, if any.
    /// Reactive reruns reclaim their previous subscription through this.
    pub fn find_reusable(&self, name: &str, params: &[Value]) -> Option<String> {
        self.records
            .values()
            .find(|record| {
                record.inactive
                    && record.name == name
                    && record.params.len() == params.len()
                    && record
                        .params
                        .iter()
                        .zip(params.iter())
                        .all(|(a, b)| ejson::equals(a, b))
            })
            .map(|record| record.local_id.clone())
    }

    /// The `sub` frame with this wire id was written to a transport.
    pub fn mark_sent_by_remote(&mut self, remote_id: &str) {
        if let Some(local_id) = self.remote_to_local.get(remote_id) {
            if let Some(record) = self.records.get_mut(local_id.as_str()) {
                record.sent = true;
            }
        }
    }

    pub fn mark_inactive(&mut self, local_id: &str) {
        if let Some(record) = self.records.get_mut(local_id) {
            record.inactive = true;
        }
    }

    pub fn is_inactive(&self, local_id: &str) -> bool {
        self.records
            .get(local_id)
            .is_some_and(|record| record.inactive)
    }

    /// Remove a record entirely, marking its remote id self-initiated so
    /// the server's `nosub` echo is consumed silently.
    pub fn remove_for_stop(&mut self, local_id: &str) -> Option<SubscriptionRecord> {
        let record = self.records.remove(local_id)?;
        self.remote_to_local.remove(&record.remote_id);
        self.self_initiated.insert(record.remote_id.clone());
        Some(record)
    }

    /// Remove a record in response to a server `nosub`. Returns `None` if
    /// the `nosub` was the echo of our own `unsub` and has been consumed.
    pub fn remove_for_nosub(&mut self, remote_id: &str) -> Option<SubscriptionRecord> {
        if self.self_initiated.remove(remote_id) {
            return None;
        }
        let local_id = self.remote_to_local.remove(remote_id)?;
        self.records.remove(&local_id)
    }

    /// One `sub` frame per already-sent record, in insertion order. Used
    /// to replay the active set after reconnecting onto a fresh server
    /// session; unsent records still sit in the outbound queue.
    pub fn replay_frames(&self) -> Vec<ClientMessage> {
        let mut records: Vec<&SubscriptionRecord> =
            self.records.values().filter(|record| record.sent).collect();
        records.sort_by_key(|record| record.insertion);
        records
            .into_iter()
            .map(|record| ClientMessage::Sub {
                id: record.remote_id.clone(),
                name: record.name.clone(),
                params: if record.params.is_empty() {
                    None
                } else {
                    Some(record.params.clone())
                },
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}
