// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! The DDP session: protocol state machine, frame dispatch, replay.

mod event_loop;
pub(crate) mod events;
mod methods;
mod subscriptions;

pub use event_loop::SessionEventLoop;
pub use events::{ClientEvent, EventRegistry};
pub use subscriptions::SubscriptionCallbacks;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;

use log::debug;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, Notify};

use ddp_core::constants::{DDP_VERSION, SUPPORTED_DDP_VERSIONS};
use ddp_core::messages::{self, ClientMessage, InboundFrame, ServerMessage};
use ddp_core::sync::Mutex;
use ddp_core::{comms::Connector, OutboundQueue};
use ddp_types::{Error, IdGenerator, ServerError};

use crate::collections::CollectionStore;
use crate::config::ClientConfig;
use crate::tracker::Tracker;
use crate::vent::VentDispatcher;

use methods::{MethodState, PendingMethod};
use subscriptions::{SubscriptionRecord, SubscriptionState};

#[allow(unused)]
macro_rules! session_warn {
    ($session: expr, $($arg:tt)*) =>  {
        log::warn!("session:{} {}", $session.session_number(), format!($($arg)*));
    }
}
#[allow(unused)]
pub(crate) use session_warn;

#[allow(unused)]
macro_rules! session_error {
    ($session: expr, $($arg:tt)*) =>  {
        log::error!("session:{} {}", $session.session_number(), format!($($arg)*));
    }
}
#[allow(unused)]
pub(crate) use session_error;

#[allow(unused)]
macro_rules! session_debug {
    ($session: expr, $($arg:tt)*) =>  {
        log::debug!("session:{} {}", $session.session_number(), format!($($arg)*));
    }
}
#[allow(unused)]
pub(crate) use session_debug;

/// Connection status as the application sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transport, and none being established.
    Disconnected,
    /// A transport is being established or the handshake is in flight.
    Connecting,
    /// The server acknowledged the handshake; frames flow.
    Connected,
}

static NEXT_SESSION_NUMBER: AtomicU32 = AtomicU32::new(1);

/// A DDP session over one endpoint.
///
/// The session owns the outbound queue, the in-flight method and
/// subscription state, and the remembered server session id. It is driven
/// by a [`SessionEventLoop`], which must be running for anything to happen
/// at all.
pub struct Session {
    pub(crate) config: ClientConfig,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) queue: OutboundQueue,
    state_watch_tx: watch::Sender<SessionState>,
    state_watch_rx: watch::Receiver<SessionState>,
    desired_tx: watch::Sender<bool>,
    desired_rx: watch::Receiver<bool>,
    session_id: ArcSwapOption<String>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>,
    methods: MethodState,
    subscriptions: Mutex<SubscriptionState>,
    store: Arc<CollectionStore>,
    tracker: Arc<Tracker>,
    vent: Mutex<Option<Arc<VentDispatcher>>>,
    events: EventRegistry,
    ids: Arc<dyn IdGenerator>,
    reconnect_nudge: Notify,
    session_number: u32,
    weak_self: Mutex<Weak<Session>>,
}

impl Session {
    /// Create a session and the event loop that drives it.
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        store: Arc<CollectionStore>,
        tracker: Arc<Tracker>,
        ids: Arc<dyn IdGenerator>,
    ) -> (Arc<Self>, SessionEventLoop) {
        let (state_watch_tx, state_watch_rx) = watch::channel(SessionState::Disconnected);
        let (desired_tx, desired_rx) = watch::channel(false);
        let session = Arc::new(Session {
            config,
            connector,
            queue: OutboundQueue::new(),
            state_watch_tx,
            state_watch_rx,
            desired_tx,
            desired_rx,
            session_id: ArcSwapOption::empty(),
            outgoing: Mutex::new(None),
            methods: MethodState::default(),
            subscriptions: Mutex::new(SubscriptionState::default()),
            store,
            tracker,
            vent: Mutex::new(None),
            events: EventRegistry::default(),
            ids,
            reconnect_nudge: Notify::new(),
            session_number: NEXT_SESSION_NUMBER.fetch_add(1, Ordering::Relaxed),
            weak_self: Mutex::new(Weak::new()),
        });
        *session.weak_self.lock() = Arc::downgrade(&session);
        let event_loop = SessionEventLoop::new(session.clone());
        (session, event_loop)
    }

    /// Internal id for log correlation across multiple sessions in one
    /// process.
    pub fn session_number(&self) -> u32 {
        self.session_number
    }

    /// The current connection status.
    pub fn state(&self) -> SessionState {
        *self.state_watch_rx.borrow()
    }

    /// A watch receiver following the connection status.
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state_watch_rx.clone()
    }

    /// The server session id from the last `connected` frame.
    pub fn server_session_id(&self) -> Option<String> {
        self.session_id.load_full().map(|id| (*id).clone())
    }

    /// The collection store mirrored by this session.
    pub fn store(&self) -> &Arc<CollectionStore> {
        &self.store
    }

    /// The reactive tracker shared with the store.
    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    /// The public event registry.
    pub fn events(&self) -> &EventRegistry {
        &self.events
    }

    /// Attach the vent dispatcher that inspects `changed` frames.
    pub fn set_vent(&self, vent: Arc<VentDispatcher>) {
        *self.vent.lock() = Some(vent);
    }

    /// Ask the event loop to establish (or keep) a connection. Cuts an
    /// in-progress reconnect pause short.
    pub fn request_connect(&self) {
        let _ = self.desired_tx.send(true);
        self.reconnect_nudge.notify_one();
    }

    /// Wait for the next explicit connect request.
    pub(crate) async fn reconnect_nudged(&self) {
        self.reconnect_nudge.notified().await;
    }

    /// Ask the event loop to drop the connection and stay down; reconnect
    /// timers are disarmed until [`Session::request_connect`].
    pub fn request_disconnect(&self) {
        let _ = self.desired_tx.send(false);
    }

    pub(crate) fn connection_desired(&self) -> bool {
        *self.desired_rx.borrow()
    }

    pub(crate) fn desired_watch(&self) -> watch::Receiver<bool> {
        self.desired_rx.clone()
    }

    /// Wait for the session to reach the connected state.
    pub async fn wait_for_connection(&self) -> bool {
        let mut rx = self.state_watch_rx.clone();
        let result = rx.wait_for(|s| matches!(*s, SessionState::Connected)).await;
        result.is_ok()
    }

    fn defer(f: impl FnOnce() + Send + 'static) {
        events::defer(f);
    }

    fn log_frame(&self, direction: &str, frame: &Value) {
        if !self.config.is_verbose {
            return;
        }
        if self.config.is_private {
            debug!(
                "session:{} {} {}",
                self.session_number,
                direction,
                messages::scrub_frame(frame)
            );
        } else {
            debug!("session:{} {} {}", self.session_number, direction, frame);
        }
    }

    /// Hand a frame straight to the live transport, ahead of the queue.
    /// Used for the handshake and for `pong`, which must not wait behind
    /// application traffic. A no-op while disconnected.
    fn send_now(&self, message: ClientMessage) {
        if let Ok(value) = message.to_value() {
            self.log_frame("out", &value);
        }
        let outgoing = self.outgoing.lock();
        if let Some(tx) = outgoing.as_ref() {
            let _ = tx.send(message);
        }
    }

    /// Enqueue a frame behind everything already queued. Drained only
    /// while connected.
    pub(crate) fn send_message(&self, message: ClientMessage) {
        self.queue.push(message);
        self.pump_queue();
    }

    /// Drain the queue onto the transport for as long as the session is
    /// connected. Method and subscription frames are marked sent as they
    /// go, which is what makes them eligible for in-flight replay.
    pub(crate) fn pump_queue(&self) {
        let outgoing = self.outgoing.lock().clone();
        self.queue.process(|message| {
            if self.state() != SessionState::Connected {
                return false;
            }
            let Some(tx) = outgoing.as_ref() else {
                return false;
            };
            if let Ok(value) = message.to_value() {
                self.log_frame("out", &value);
            }
            if tx.send(message.clone()).is_err() {
                return false;
            }
            match message {
                ClientMessage::Method { id, .. } => self.methods.mark_sent(id),
                ClientMessage::Sub { id, .. } => {
                    ddp_core::trace_lock!(self.subscriptions).mark_sent_by_remote(id)
                }
                _ => {}
            }
            true
        });
    }

    /// The event loop obtained a transport: remember the sender and open
    /// the DDP handshake, offering to resume the remembered session.
    pub(crate) fn on_transport_open(&self, tx: mpsc::UnboundedSender<ClientMessage>) {
        *self.outgoing.lock() = Some(tx);
        let session = self.server_session_id();
        self.send_now(ClientMessage::Connect {
            version: DDP_VERSION.to_string(),
            support: SUPPORTED_DDP_VERSIONS.iter().map(|s| s.to_string()).collect(),
            session,
        });
    }

    /// The transport is gone. The queue is deliberately left intact: its
    /// frames drain after the next successful handshake, behind the
    /// replayed in-flight state.
    pub(crate) fn on_transport_closed(&self, reason: &str) {
        session_debug!(self, "Transport closed: {reason}");
        *self.outgoing.lock() = None;
        let _ = self.state_watch_tx.send(SessionState::Disconnected);
        self.events.emit(ClientEvent::Disconnected);
    }

    pub(crate) fn set_connecting(&self) {
        let _ = self.state_watch_tx.send(SessionState::Connecting);
    }

    /// Drop the transport sender; the transport closes cleanly on its next
    /// poll and any racing send becomes a no-op.
    pub(crate) fn drop_outgoing(&self) {
        *self.outgoing.lock() = None;
    }

    /// Dispatch one parsed inbound frame.
    pub(crate) fn handle_inbound(self: &Arc<Self>, frame: InboundFrame) {
        match frame {
            InboundFrame::Message(message) => {
                if let Ok(value) = serde_json::to_value(&message) {
                    self.log_frame("in", &value);
                }
                self.handle_message(message);
            }
            InboundFrame::Unknown { msg, .. } => {
                session_warn!(self, "Unrecognized server message \"{msg}\"");
                self.events.emit(ClientEvent::ProtocolError {
                    message: format!("unrecognized server message \"{msg}\""),
                });
            }
            InboundFrame::Ignored => {}
        }
    }

    fn handle_message(self: &Arc<Self>, message: ServerMessage) {
        match message {
            ServerMessage::Connected { session } => self.on_connected(session),
            ServerMessage::Failed { version } => {
                session_error!(self, "Version negotiation failed, server wants {version}");
                self.events.emit(ClientEvent::ProtocolError {
                    message: format!("server requires protocol version {version}"),
                });
            }
            ServerMessage::Ping { id } => self.send_now(ClientMessage::Pong { id }),
            ServerMessage::Pong { .. } => {}
            ServerMessage::Ready { subs } => self.on_ready(subs),
            ServerMessage::Nosub { id, error } => self.on_nosub(&id, error),
            ServerMessage::Added { collection, id, fields } => {
                self.store.apply_added(&collection, &id, fields.unwrap_or_default());
                self.events.emit(ClientEvent::Added { collection, id });
            }
            ServerMessage::Changed { collection, id, fields, cleared, vent, e } => {
                if vent.as_deref() == Some("1") {
                    let dispatcher = self.vent.lock().clone();
                    if let Some(dispatcher) = dispatcher {
                        dispatcher.dispatch(&id, e.unwrap_or(Value::Null));
                        return;
                    }
                }
                self.store.apply_changed(
                    &collection,
                    &id,
                    fields.unwrap_or_default(),
                    cleared.unwrap_or_default(),
                );
                self.events.emit(ClientEvent::Changed { collection, id });
            }
            ServerMessage::Removed { collection, id } => {
                self.store.apply_removed(&collection, &id);
                self.events.emit(ClientEvent::Removed { collection, id });
            }
            ServerMessage::Result { id, result, error } => {
                if let Some(delivery) = self.methods.handle_result(&id, result, error) {
                    Self::defer(move || delivery.deliver());
                }
            }
            ServerMessage::Updated { methods } => self.methods.handle_updated(&methods),
            ServerMessage::Error { reason, .. } => {
                let message = reason.unwrap_or_else(|| "unspecified protocol error".into());
                session_warn!(self, "Server error: {message}");
                self.events.emit(ClientEvent::ProtocolError { message });
            }
        }
    }

    /// Handshake accepted. Decide whether the server kept our session,
    /// clear mirrored state if it did not, replay in-flight work, then
    /// open the queue.
    fn on_connected(&self, new_session_id: String) {
        let session_reused = {
            let previous = self.session_id.load_full();
            let reused = previous.as_deref().map(String::as_str) == Some(new_session_id.as_str());
            self.session_id.store(Some(Arc::new(new_session_id)));
            reused
        };
        session_debug!(self, "Connected, session_reused={session_reused}");

        if !session_reused {
            self.store.clear_remote_collections();
        }

        // Replay order: login methods, other pending methods, then one
        // `sub` per active subscription when the server lost them, all
        // ahead of whatever the application queued meanwhile.
        let mut replay = self.methods.replay_frames();
        if !session_reused {
            replay.extend(ddp_core::trace_lock!(self.subscriptions).replay_frames());
        }
        if !replay.is_empty() {
            self.queue.prepend(replay);
        }

        let _ = self.state_watch_tx.send(SessionState::Connected);
        self.pump_queue();
        self.events.emit(ClientEvent::Connected { session_reused });
    }

    fn on_ready(&self, subs: Vec<String>) {
        for remote_id in &subs {
            let fired = {
                let mut state = ddp_core::trace_lock!(self.subscriptions);
                let Some(local_id) = state.local_for_remote(remote_id).map(String::from) else {
                    continue;
                };
                let Some(record) = state.get_mut(&local_id) else {
                    continue;
                };
                if record.ready {
                    continue;
                }
                record.ready = true;
                (record.callbacks.on_ready.take(), record.ready_dep.clone())
            };
            let (on_ready, ready_dep) = fired;
            ready_dep.changed();
            if let Some(on_ready) = on_ready {
                Self::defer(on_ready);
            }
        }
        self.events.emit(ClientEvent::Ready { subs });
    }

    fn on_nosub(&self, remote_id: &str, error: Option<ServerError>) {
        let record = {
            let mut state = ddp_core::trace_lock!(self.subscriptions);
            state.remove_for_nosub(remote_id)
        };
        let Some(mut record) = record else {
            // Either the echo of our own unsub, or a subscription we no
            // longer know about.
            return;
        };
        session_debug!(self, "Subscription {} ended by server", record.local_id);
        if record.ready {
            record.ready_dep.changed();
        }
        let on_error = record.callbacks.on_error.take();
        let on_stop = record.callbacks.on_stop.take();
        Self::defer(move || {
            if let Some(error) = &error {
                if let Some(on_error) = on_error {
                    on_error(error.clone());
                }
            }
            if let Some(on_stop) = on_stop {
                on_stop(error);
            }
        });
    }

    /// Invoke a server method, resolving when its `result` arrives. The
    /// frame survives disconnects: until the result is in, every reconnect
    /// replays it ahead of subscription traffic.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, Error> {
        let (tx, rx) = oneshot::channel();
        self.start_method(method, params, Some(tx), None);
        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(server_error)) => Err(Error::Method(server_error)),
            Err(_) => Err(Error::Closed),
        }
    }

    /// Invoke a server method, delivering the outcome to `callback`.
    pub fn call_with_callback(
        &self,
        method: &str,
        params: Vec<Value>,
        callback: impl FnOnce(Result<Value, ServerError>) + Send + 'static,
    ) {
        self.start_method(method, params, None, Some(Box::new(callback)));
    }

    fn start_method(
        &self,
        method: &str,
        params: Vec<Value>,
        responder: Option<oneshot::Sender<Result<Value, ServerError>>>,
        callback: Option<Box<dyn FnOnce(Result<Value, ServerError>) + Send>>,
    ) {
        let id = self.ids.next_id();
        let message = ClientMessage::Method {
            id: id.clone(),
            method: method.to_string(),
            params: if params.is_empty() { None } else { Some(params) },
        };
        self.methods.register(PendingMethod {
            id,
            message: message.clone(),
            method: method.to_string(),
            responder,
            callback,
            sent: false,
            result_received: false,
            updated_received: false,
        });
        self.send_message(message);
    }

    /// Open a subscription, or reclaim an inactive record with the same
    /// name and EJSON-equal params left behind by a reactive rerun.
    ///
    /// Called inside a computation, the subscription is marked inactive
    /// when the computation is invalidated and torn down after the flush
    /// unless the rerun reclaimed it.
    pub fn subscribe(
        self: &Arc<Self>,
        name: &str,
        params: Vec<Value>,
        callbacks: SubscriptionCallbacks,
    ) -> SubscriptionHandle {
        self.subscribe_with_local_id(None, name, params, callbacks)
    }

    /// [`Session::subscribe`] with a caller-chosen local id; the vent
    /// layer uses this to address its listeners.
    pub fn subscribe_with_local_id(
        self: &Arc<Self>,
        local_id: Option<String>,
        name: &str,
        params: Vec<Value>,
        callbacks: SubscriptionCallbacks,
    ) -> SubscriptionHandle {
        let reused = self
            .subscriptions
            .lock()
            .find_reusable(name, &params);
        let local_id = match reused {
            Some(existing) => {
                let mut state = self.subscriptions.lock();
                if let Some(record) = state.get_mut(&existing) {
                    record.inactive = false;
                    record.callbacks = callbacks;
                    if record.ready {
                        if let Some(on_ready) = record.callbacks.on_ready.take() {
                            Self::defer(on_ready);
                        }
                    }
                }
                existing
            }
            None => {
                let local_id = local_id.unwrap_or_else(|| self.ids.next_id());
                let remote_id = local_id.clone();
                self.subscriptions.lock().insert(SubscriptionRecord {
                    local_id: local_id.clone(),
                    remote_id: remote_id.clone(),
                    name: name.to_string(),
                    params: params.clone(),
                    inactive: false,
                    ready: false,
                    sent: false,
                    ready_dep: self.tracker.new_dependency(),
                    callbacks,
                    insertion: 0,
                });
                self.send_message(ClientMessage::Sub {
                    id: remote_id,
                    name: name.to_string(),
                    params: if params.is_empty() { None } else { Some(params) },
                });
                local_id
            }
        };

        if let Some(computation) = self.tracker.current_computation() {
            let weak = self.weak_self.lock().clone();
            let id_for_hook = local_id.clone();
            self.tracker.on_invalidate(computation, move || {
                let Some(session) = weak.upgrade() else {
                    return;
                };
                session.subscriptions.lock().mark_inactive(&id_for_hook);
                let weak = Arc::downgrade(&session);
                let id_for_check = id_for_hook.clone();
                session.tracker.after_flush(move || {
                    let Some(session) = weak.upgrade() else {
                        return;
                    };
                    if session.subscriptions.lock().is_inactive(&id_for_check) {
                        session.stop_subscription(&id_for_check);
                    }
                });
            });
        }

        SubscriptionHandle {
            local_id,
            session: self.weak_self.lock().clone(),
        }
    }

    /// Tear down a subscription: `unsub` goes on the wire, the record goes
    /// away synchronously, and the eventual `nosub` echo is swallowed.
    pub fn stop_subscription(&self, local_id: &str) {
        let record = {
            let mut state = ddp_core::trace_lock!(self.subscriptions);
            state.remove_for_stop(local_id)
        };
        let Some(mut record) = record else {
            return;
        };
        self.send_message(ClientMessage::Unsub {
            id: record.remote_id.clone(),
        });
        if record.ready {
            record.ready_dep.changed();
        }
        if let Some(on_stop) = record.callbacks.on_stop.take() {
            Self::defer(move || on_stop(None));
        }
    }

    /// Count of registered subscriptions, for diagnostics.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    fn subscription_ready(&self, local_id: &str) -> bool {
        let state = self.subscriptions.lock();
        let Some(record) = state.get(local_id) else {
            return false;
        };
        let dep = record.ready_dep.clone();
        let ready = record.ready;
        drop(state);
        dep.depend();
        ready
    }
}

/// Handle to one subscription. `local_id` stays stable across reactive
/// reuse even though the wire id may differ.
pub struct SubscriptionHandle {
    local_id: String,
    session: Weak<Session>,
}

impl SubscriptionHandle {
    /// Whether the server has marked the subscription ready. Registers the
    /// current computation on the readiness dependency, so a computation
    /// calling this reruns when readiness flips.
    pub fn ready(&self) -> bool {
        self.session
            .upgrade()
            .is_some_and(|session| session.subscription_ready(&self.local_id))
    }

    /// Stop the subscription.
    pub fn stop(&self) {
        if let Some(session) = self.session.upgrade() {
            session.stop_subscription(&self.local_id);
        }
    }

    /// The stable local id of this subscription.
    pub fn subscription_id(&self) -> &str {
        &self.local_id
    }
}
