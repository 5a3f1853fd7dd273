// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Method call correlation.
//!
//! A pending method keeps its original frame so it can be replayed after a
//! reconnect, and it stays registered until both halves of the server's
//! answer have arrived: `result` (resolves the caller) and `updated` (the
//! write barrier). The two can come in either order.

use serde_json::Value;

use ddp_core::messages::ClientMessage;
use ddp_core::sync::Mutex;
use ddp_types::ServerError;

use tokio::sync::oneshot;

/// Name of the authentication method; replay puts these first.
pub(crate) const LOGIN_METHOD: &str = "login";

type Callback = Box<dyn FnOnce(Result<Value, ServerError>) + Send>;

pub(crate) struct PendingMethod {
    pub id: String,
    pub message: ClientMessage,
    pub method: String,
    pub responder: Option<oneshot::Sender<Result<Value, ServerError>>>,
    pub callback: Option<Callback>,
    /// Whether the frame ever reached a transport. Unsent frames are still
    /// in the outbound queue and must not be duplicated by replay.
    pub sent: bool,
    pub result_received: bool,
    pub updated_received: bool,
}

/// What to hand to the caller after a `result` frame, dispatched outside
/// the state lock.
pub(crate) struct MethodDelivery {
    pub responder: Option<oneshot::Sender<Result<Value, ServerError>>>,
    pub callback: Option<Callback>,
    pub outcome: Result<Value, ServerError>,
}

impl MethodDelivery {
    /// Resolve the caller. At most one of responder/callback is usually
    /// set, but both are honored.
    pub fn deliver(self) {
        if let Some(responder) = self.responder {
            let _ = responder.send(self.outcome.clone());
        }
        if let Some(callback) = self.callback {
            callback(self.outcome);
        }
    }
}

/// All in-flight method calls, in send order.
#[derive(Default)]
pub(crate) struct MethodState {
    pending: Mutex<Vec<PendingMethod>>,
}

impl MethodState {
    pub fn register(&self, method: PendingMethod) {
        self.pending.lock().push(method);
    }

    /// The frame with this id was written to a transport.
    pub fn mark_sent(&self, id: &str) {
        let mut pending = self.pending.lock();
        if let Some(entry) = pending.iter_mut().find(|m| m.id == id) {
            entry.sent = true;
        }
    }

    /// Handle a `result` frame. Returns the delivery to run, or `None` for
    /// an unknown or already-resolved id.
    pub fn handle_result(
        &self,
        id: &str,
        result: Option<Value>,
        error: Option<ServerError>,
    ) -> Option<MethodDelivery> {
        let mut pending = self.pending.lock();
        let index = pending.iter().position(|m| m.id == id)?;
        let entry = &mut pending[index];
        if entry.result_received {
            return None;
        }
        entry.result_received = true;
        let outcome = match error {
            Some(error) => Err(error),
            None => Ok(result.unwrap_or(Value::Null)),
        };
        let delivery = MethodDelivery {
            responder: entry.responder.take(),
            callback: entry.callback.take(),
            outcome,
        };
        if entry.updated_received {
            pending.remove(index);
        }
        Some(delivery)
    }

    /// Handle an `updated` frame: clear the write barrier of each listed
    /// method, dropping entries whose `result` already arrived.
    pub fn handle_updated(&self, ids: &[String]) {
        let mut pending = self.pending.lock();
        for id in ids {
            if let Some(index) = pending.iter().position(|m| &m.id == id) {
                let entry = &mut pending[index];
                entry.updated_received = true;
                if entry.result_received {
                    pending.remove(index);
                }
            }
        }
    }

    /// Frames to replay after a reconnect: login calls first, then the
    /// rest in their original relative order. Only frames that actually
    /// went out are replayed; anything unsent is still in the outbound
    /// queue and drains behind the replay. Methods that already have a
    /// `result` are not re-sent; their write barrier dies with the old
    /// session, so they are dropped here.
    pub fn replay_frames(&self) -> Vec<ClientMessage> {
        let mut pending = self.pending.lock();
        pending.retain(|m| !m.result_received);
        let mut frames: Vec<ClientMessage> = pending
            .iter()
            .filter(|m| m.sent && m.method == LOGIN_METHOD)
            .map(|m| m.message.clone())
            .collect();
        frames.extend(
            pending
                .iter()
                .filter(|m| m.sent && m.method != LOGIN_METHOD)
                .map(|m| m.message.clone()),
        );
        frames
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }
}
