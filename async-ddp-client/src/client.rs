// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! The client façade: one object owning the session, the store, the
//! tracker, auth and vent, with the whole public API on it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::task::JoinHandle;

use ddp_core::comms::{url, Connector, WebSocketConnector};
use ddp_core::sync::Mutex;
use ddp_types::{Document, Error, IdGenerator, RandomIdGenerator, ServerError};

use crate::auth::{
    AuthController, AuthEvent, KeyStorage, PasswordHasher, Sha256PasswordHasher, UserSelector,
};
use crate::collections::{
    BasicMatcher, Collection, CollectionStore, Cursor, DocumentMatcher, FindOptions,
};
use crate::config::ClientConfig;
use crate::observers::ObserverRegistry;
use crate::reachability::{wire_reachability, Reachability};
use crate::session::{
    ClientEvent, Session, SessionEventLoop, SessionState, SubscriptionCallbacks,
    SubscriptionHandle,
};
use crate::tracked::Tracked;
use crate::tracker::{Computation, FlushScheduler, TokioScheduler, Tracker};
use crate::vent::{VentDispatcher, VentHandle};

/// Name of the collection holding user documents.
const USERS_COLLECTION: &str = "users";

/// Connection status as reported by [`Client::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// Whether the session is connected right now.
    pub connected: bool,
    /// The full tri-state status.
    pub status: SessionState,
}

/// Builder for [`Client`]. Key storage is the one mandatory collaborator;
/// every other seam has a production default.
pub struct ClientBuilder {
    config: ClientConfig,
    storage: Option<Arc<dyn KeyStorage>>,
    connector: Arc<dyn Connector>,
    matcher: Arc<dyn DocumentMatcher>,
    hasher: Arc<dyn PasswordHasher>,
    ids: Arc<dyn IdGenerator>,
    scheduler: Box<dyn FlushScheduler>,
    reachability: Option<Box<dyn Reachability>>,
    reachability_url: Option<String>,
}

impl ClientBuilder {
    /// Start building a client for `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        ClientBuilder {
            config: ClientConfig::new(endpoint),
            storage: None,
            connector: Arc::new(WebSocketConnector),
            matcher: Arc::new(BasicMatcher),
            hasher: Arc::new(Sha256PasswordHasher),
            ids: Arc::new(RandomIdGenerator),
            scheduler: Box::new(TokioScheduler),
            reachability: None,
            reachability_url: None,
        }
    }

    /// Replace the whole config in one go.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Open the connection as soon as the client is built.
    pub fn auto_connect(mut self, auto_connect: bool) -> Self {
        self.config.auto_connect = auto_connect;
        self
    }

    /// Re-dial automatically after an unexpected disconnect.
    pub fn auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.config.auto_reconnect = auto_reconnect;
        self
    }

    /// Delay between reconnect attempts.
    pub fn reconnect_interval(mut self, interval: std::time::Duration) -> Self {
        self.config.reconnect_interval = interval;
        self
    }

    /// Strip payload values from verbose frame logs.
    pub fn is_private(mut self, is_private: bool) -> Self {
        self.config.is_private = is_private;
        self
    }

    /// Log every frame in and out at debug level.
    pub fn is_verbose(mut self, is_verbose: bool) -> Self {
        self.config.is_verbose = is_verbose;
        self
    }

    /// Accept endpoints that do not end in `/websocket`.
    pub fn suppress_url_errors(mut self, suppress: bool) -> Self {
        self.config.suppress_url_errors = suppress;
        self
    }

    /// The token storage. Mandatory.
    pub fn key_storage(mut self, storage: Arc<dyn KeyStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Replace the transport connector; tests inject scripted transports
    /// here.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Replace the selector matcher.
    pub fn matcher(mut self, matcher: Arc<dyn DocumentMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    /// Replace the password hasher.
    pub fn password_hasher(mut self, hasher: Arc<dyn PasswordHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    /// Replace the id generator.
    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Replace the reactive flush scheduler.
    pub fn flush_scheduler(mut self, scheduler: Box<dyn FlushScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Attach a reachability source; regaining the network triggers an
    /// immediate reconnect.
    pub fn reachability(
        mut self,
        reachability: Box<dyn Reachability>,
        reachability_url: Option<String>,
    ) -> Self {
        self.reachability = Some(reachability);
        self.reachability_url = reachability_url;
        self
    }

    /// Validate the configuration and assemble the client. With
    /// `auto_connect` (the default) and a tokio runtime on the current
    /// thread, the connection starts immediately.
    pub fn build(self) -> Result<Client, Error> {
        url::validate_endpoint(&self.config.endpoint, self.config.suppress_url_errors)?;
        let Some(storage) = self.storage else {
            return Err(Error::Other(
                "KeyStorage is required: call ClientBuilder::key_storage".into(),
            ));
        };

        let tracker = Tracker::new(self.scheduler);
        let observers = ObserverRegistry::new(tracker.clone(), self.matcher.clone());
        let store = CollectionStore::new(tracker.clone(), observers, self.matcher);
        let auto_connect = self.config.auto_connect;
        let (session, event_loop) = Session::new(
            self.config,
            self.connector,
            store.clone(),
            tracker.clone(),
            self.ids,
        );
        let vent = VentDispatcher::new();
        session.set_vent(vent.clone());
        let auth = AuthController::new(session.clone(), storage, self.hasher);

        if let Some(reachability) = &self.reachability {
            wire_reachability(
                reachability.as_ref(),
                session.clone(),
                self.reachability_url.as_deref(),
            );
        }

        let client = Client {
            session,
            auth,
            vent,
            store,
            tracker,
            event_loop: Mutex::new(Some(event_loop)),
            loop_handle: Mutex::new(None),
            resume_wired: AtomicBool::new(false),
            _reachability: self.reachability,
        };
        if auto_connect && tokio::runtime::Handle::try_current().is_ok() {
            client.connect();
        }
        Ok(client)
    }
}

/// A DDP client. Construct through [`Client::builder`].
pub struct Client {
    session: Arc<Session>,
    auth: Arc<AuthController>,
    vent: Arc<VentDispatcher>,
    store: Arc<CollectionStore>,
    tracker: Arc<Tracker>,
    event_loop: Mutex<Option<SessionEventLoop>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    resume_wired: AtomicBool,
    _reachability: Option<Box<dyn Reachability>>,
}

impl Client {
    /// Start building a client for `endpoint`.
    pub fn builder(endpoint: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(endpoint)
    }

    /// Open (or re-open) the connection. Spawns the event loop on first
    /// use; requires a tokio runtime.
    pub fn connect(&self) {
        if let Some(event_loop) = self.event_loop.lock().take() {
            *self.loop_handle.lock() = Some(event_loop.spawn());
        }
        if !self.resume_wired.swap(true, Ordering::SeqCst) {
            // Resume the stored identity on every completed handshake; the
            // controller's own guards keep concurrent resumes out.
            let auth = self.auth.clone();
            self.session.events().add(move |event| {
                if let ClientEvent::Connected { .. } = event {
                    let auth = auth.clone();
                    tokio::spawn(async move {
                        auth.load_initial_user(false).await;
                    });
                }
            });
        }
        self.session.request_connect();
    }

    /// Drop the connection and disarm reconnects until
    /// [`Client::reconnect`] (or [`Client::connect`]).
    pub fn disconnect(&self) {
        self.session.request_disconnect();
    }

    /// Re-arm and reconnect now.
    pub fn reconnect(&self) {
        self.connect();
    }

    /// The current connection status.
    pub fn status(&self) -> Status {
        let status = self.session.state();
        Status {
            connected: status == SessionState::Connected,
            status,
        }
    }

    /// Wait until the session is connected.
    pub async fn wait_for_connection(&self) -> bool {
        self.session.wait_for_connection().await
    }

    /// Call a server method and await its result.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, Error> {
        self.session.call(method, params).await
    }

    /// Call a server method, delivering the outcome to `callback`.
    pub fn call_with_callback(
        &self,
        method: &str,
        params: Vec<Value>,
        callback: impl FnOnce(Result<Value, ServerError>) + Send + 'static,
    ) {
        self.session.call_with_callback(method, params, callback)
    }

    /// Subscribe to a named record set.
    pub fn subscribe(
        &self,
        name: &str,
        params: Vec<Value>,
        callbacks: SubscriptionCallbacks,
    ) -> SubscriptionHandle {
        self.session.subscribe(name, params, callbacks)
    }

    /// A handle on one mirrored (or local) collection.
    pub fn collection(&self, name: &str) -> Result<Collection, Error> {
        self.store.collection(name)
    }

    /// Create a local collection.
    pub fn create_local_collection(&self, name: &str) -> Result<Collection, Error> {
        self.store.create_local_collection(name)?;
        self.store.collection(name)
    }

    /// Snapshot query against any collection.
    pub fn find(
        &self,
        collection: &str,
        selector: Option<Value>,
        options: FindOptions,
    ) -> Result<Cursor, Error> {
        self.store.find(collection, selector, options)
    }

    /// The logged-in user id. Reactive.
    pub fn user_id(&self) -> Option<String> {
        self.auth.user_id()
    }

    /// The logged-in user's document from the `users` collection, when the
    /// subscription delivering it is active. Reactive.
    pub fn user(&self) -> Option<Document> {
        let user_id = self.auth.user_id()?;
        self.store
            .find_one(USERS_COLLECTION, Some(json!({ "_id": user_id })))
            .ok()
            .flatten()
    }

    /// Whether a login is in flight. Reactive.
    pub fn logging_in(&self) -> bool {
        self.auth.logging_in()
    }

    /// Whether a logout is in flight. Reactive.
    pub fn logging_out(&self) -> bool {
        self.auth.logging_out()
    }

    /// Log in with a password; see [`AuthController::login_with_password`].
    pub async fn login_with_password(
        &self,
        selector: UserSelector,
        password: &str,
    ) -> Result<String, Error> {
        self.auth.login_with_password(selector, password).await
    }

    /// Password login with a TOTP code.
    pub async fn login_with_password_and_2fa_code(
        &self,
        selector: UserSelector,
        password: &str,
        code: &str,
    ) -> Result<String, Error> {
        self.auth
            .login_with_password_and_2fa_code(selector, password, code)
            .await
    }

    /// Log out; local state clears even if the server is unreachable.
    pub async fn logout(&self) {
        self.auth.logout().await
    }

    /// Invalidate this user's other sessions.
    pub async fn logout_other_clients(&self) -> Result<(), Error> {
        self.auth.logout_other_clients().await
    }

    /// The current resume token.
    pub fn get_auth_token(&self) -> Option<String> {
        self.auth.auth_token()
    }

    /// Register a listener for session events.
    pub fn on_event(&self, listener: impl Fn(&ClientEvent) + Send + Sync + 'static) -> u64 {
        self.session.events().add(listener)
    }

    /// Remove a session event listener.
    pub fn remove_event_listener(&self, id: u64) {
        self.session.events().remove(id)
    }

    /// Register a listener for auth events.
    pub fn on_auth_event(&self, listener: impl Fn(&AuthEvent) + Send + Sync + 'static) -> u64 {
        self.auth.add_listener(listener)
    }

    /// Remove an auth event listener.
    pub fn remove_auth_listener(&self, id: u64) {
        self.auth.remove_listener(id)
    }

    /// Run `func` in a computation that reruns whenever the data it read
    /// changes.
    pub fn autorun(&self, func: impl FnMut() + Send + 'static) -> Computation {
        self.tracker.autorun(func)
    }

    /// A reactive value published on a watch channel; see [`Tracked`].
    pub fn tracked<T: Clone + Send + Sync + 'static>(
        &self,
        compute: impl FnMut() -> T + Send + 'static,
    ) -> Tracked<T> {
        Tracked::new(&self.tracker, compute)
    }

    /// Open a vent subscription.
    pub fn vent_subscribe(&self, name: &str, params: Vec<Value>) -> VentHandle {
        self.vent.subscribe(&self.session, name, params)
    }

    /// Drop every vent listener.
    pub fn vent_reset(&self) {
        self.vent.reset()
    }

    /// The underlying session, for advanced use and diagnostics.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// The auth controller.
    pub fn auth(&self) -> &Arc<AuthController> {
        &self.auth
    }

    /// The reactive tracker.
    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }
}
