// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Authentication: password login, token resume, logout.
//!
//! The controller persists `{token, userId, tokenExpires}` under stable
//! keys and resumes the session from them on startup. Resume failures are
//! classified: rate limits wait out the server's window, hard rejections
//! clear the stored identity, anything else retries on a doubling backoff.
//! Every storage access is best-effort; a broken storage degrades the
//! client to a fresh login, never to a crash.

pub mod storage;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use ddp_core::sync::Mutex;
use ddp_types::{ejson, Error, ServerError};

use crate::reactive_dict::ReactiveDict;
use crate::retry::ExponentialBackoff;
use crate::session::events::defer;
use crate::session::{Session, SessionState};

pub use storage::{KeyStorage, MemoryKeyStorage, PasswordHasher, Sha256PasswordHasher};

/// Storage key of the resume token.
pub const LOGIN_TOKEN_KEY: &str = "Meteor.loginToken";
/// Storage key of the token expiry, an ISO-8601 string.
pub const LOGIN_TOKEN_EXPIRES_KEY: &str = "Meteor.loginTokenExpires";
/// Storage key of the logged-in user id.
pub const USER_ID_KEY: &str = "Meteor.userId";

const USER_ID_DICT_KEY: &str = "userId";
const LOGGING_IN_DICT_KEY: &str = "loggingIn";
const LOGGING_OUT_DICT_KEY: &str = "loggingOut";

/// Resume rejections: the token is gone for good, retrying is pointless
/// and the stored identity must be dropped.
const RESUME_REJECTION_CODES: &[&str] =
    &["403", "token-expired", "not-authorized", "incorrect-auth-token"];

const RATE_LIMIT_CODE: &str = "too-many-requests";

/// A normalized login failure, whatever shape the server error took.
#[derive(Debug, Clone)]
pub struct LoginFailure {
    /// Machine-readable code as a string, when present.
    pub error: Option<String>,
    /// Human-readable reason.
    pub reason: Option<String>,
    /// Server-rendered message.
    pub message: Option<String>,
    /// Extra payload, e.g. `{timeToReset}` on rate limits.
    pub details: Option<Value>,
    /// True when the failure also logged the user out locally.
    pub is_logout_triggered: bool,
}

impl LoginFailure {
    fn from_server(error: &ServerError, is_logout_triggered: bool) -> Self {
        LoginFailure {
            error: error.code(),
            reason: error.reason.clone(),
            message: error.message.clone(),
            details: error.details.clone(),
            is_logout_triggered,
        }
    }
}

/// Auth lifecycle notifications.
#[derive(Debug, Clone)]
pub enum AuthEvent {
    /// A login or resume succeeded.
    Login {
        /// The authenticated user id.
        user_id: String,
    },
    /// A login or resume failed; see the failure for whether it also
    /// logged the user out.
    LoginFailure(LoginFailure),
    /// The user logged out.
    Logout,
}

/// Who is logging in: an explicit username or email, or a bare string
/// classified by the presence of `@`.
#[derive(Debug, Clone)]
pub enum UserSelector {
    /// Log in by username.
    Username(String),
    /// Log in by email address.
    Email(String),
    /// Classify by shape: `@` means email.
    Auto(String),
}

impl UserSelector {
    fn to_value(&self) -> Value {
        match self {
            UserSelector::Username(username) => json!({ "username": username }),
            UserSelector::Email(email) => json!({ "email": email }),
            UserSelector::Auto(text) => {
                if text.contains('@') {
                    json!({ "email": text })
                } else {
                    json!({ "username": text })
                }
            }
        }
    }
}

struct AuthState {
    token: Option<String>,
    user_id: Option<String>,
    token_expires: Option<DateTime<Utc>>,
    is_calling_login: bool,
    retry_backoff: ExponentialBackoff,
}

type AuthListener = Arc<dyn Fn(&AuthEvent) + Send + Sync>;

/// The authentication controller for one session.
pub struct AuthController {
    session: Arc<Session>,
    storage: Arc<dyn KeyStorage>,
    hasher: Arc<dyn PasswordHasher>,
    dict: ReactiveDict,
    state: Mutex<AuthState>,
    listeners: Mutex<Vec<(u64, AuthListener)>>,
    next_listener: AtomicU64,
    weak_self: Mutex<Weak<AuthController>>,
}

impl AuthController {
    /// Create a controller bound to `session`, persisting through
    /// `storage` and hashing passwords through `hasher`.
    pub fn new(
        session: Arc<Session>,
        storage: Arc<dyn KeyStorage>,
        hasher: Arc<dyn PasswordHasher>,
    ) -> Arc<Self> {
        let dict = ReactiveDict::new(session.tracker().clone());
        let retry_backoff = ExponentialBackoff::new(
            session.config.login_retry_max,
            None,
            session.config.login_retry_initial,
        );
        let controller = Arc::new(AuthController {
            session,
            storage,
            hasher,
            dict,
            state: Mutex::new(AuthState {
                token: None,
                user_id: None,
                token_expires: None,
                is_calling_login: false,
                retry_backoff,
            }),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            weak_self: Mutex::new(Weak::new()),
        });
        *controller.weak_self.lock() = Arc::downgrade(&controller);
        controller
    }

    /// Register a listener for auth events; returns an id for
    /// [`AuthController::remove_listener`].
    pub fn add_listener(&self, listener: impl Fn(&AuthEvent) + Send + Sync + 'static) -> u64 {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Drop a listener.
    pub fn remove_listener(&self, id: u64) {
        self.listeners.lock().retain(|(lid, _)| *lid != id);
    }

    fn emit(&self, event: AuthEvent) {
        let listeners: Vec<AuthListener> = self
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

    /// The logged-in user id. Reactive.
    pub fn user_id(&self) -> Option<String> {
        self.dict
            .get(USER_ID_DICT_KEY)
            .and_then(|v| v.as_str().map(String::from))
    }

    /// Whether a login is in flight. Reactive.
    pub fn logging_in(&self) -> bool {
        self.dict
            .get(LOGGING_IN_DICT_KEY)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Whether a logout is in flight. Reactive.
    pub fn logging_out(&self) -> bool {
        self.dict
            .get(LOGGING_OUT_DICT_KEY)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// The current resume token, if any. Not reactive.
    pub fn auth_token(&self) -> Option<String> {
        self.state.lock().token.clone()
    }

    /// When the current token expires, if known.
    pub fn token_expires(&self) -> Option<DateTime<Utc>> {
        self.state.lock().token_expires
    }

    fn set_logging_in(&self, value: bool) {
        self.dict.set(LOGGING_IN_DICT_KEY, Value::Bool(value));
    }

    fn set_logging_out(&self, value: bool) {
        self.dict.set(LOGGING_OUT_DICT_KEY, Value::Bool(value));
    }

    /// Log in with a password. Resolves with the user id; the same outcome
    /// also goes to the event listeners.
    pub async fn login_with_password(
        &self,
        selector: UserSelector,
        password: &str,
    ) -> Result<String, Error> {
        self.login_with_user_payload(json!({
            "user": selector.to_value(),
            "password": self.hasher.hash(password),
        }))
        .await
    }

    /// [`AuthController::login_with_password`] with a TOTP code attached.
    pub async fn login_with_password_and_2fa_code(
        &self,
        selector: UserSelector,
        password: &str,
        code: &str,
    ) -> Result<String, Error> {
        self.login_with_user_payload(json!({
            "user": selector.to_value(),
            "password": self.hasher.hash(password),
            "code": code,
        }))
        .await
    }

    async fn login_with_user_payload(&self, payload: Value) -> Result<String, Error> {
        self.set_logging_in(true);
        let result = self.session.call("login", vec![payload]).await;
        match result {
            Ok(value) => match self.adopt_login_result(&value).await {
                Some(user_id) => Ok(user_id),
                None => {
                    let error = ServerError::from_code("no-token", "login reply carried no token");
                    self.set_logging_in(false);
                    self.emit(AuthEvent::LoginFailure(LoginFailure::from_server(&error, false)));
                    Err(Error::Method(error))
                }
            },
            Err(err) => {
                self.set_logging_in(false);
                if let Error::Method(server_error) = &err {
                    self.emit(AuthEvent::LoginFailure(LoginFailure::from_server(
                        server_error,
                        false,
                    )));
                }
                Err(err)
            }
        }
    }

    /// Resume the session from a stored token. Failures are classified and
    /// handled internally (retry, rate-limit wait, or local logout); the
    /// outcome surfaces through the event listeners.
    pub async fn login_with_token(self: &Arc<Self>, token: Option<String>) {
        let token = {
            let mut state = self.state.lock();
            if state.is_calling_login {
                return;
            }
            let Some(token) = token.filter(|t| !t.trim().is_empty()) else {
                drop(state);
                // Nothing to resume with.
                self.set_logging_in(false);
                return;
            };
            state.is_calling_login = true;
            token
        };

        self.set_logging_in(true);
        let result = self.session.call("login", vec![json!({ "resume": token })]).await;
        self.state.lock().is_calling_login = false;

        match result {
            Ok(value) => {
                if self.adopt_login_result(&value).await.is_none() {
                    // A successful reply without a token is a rejection in
                    // disguise.
                    let error =
                        ServerError::from_code("403", "login reply carried no token");
                    self.reject_resume(&error).await;
                }
            }
            Err(Error::Method(server_error)) => {
                self.classify_resume_failure(server_error, token).await;
            }
            Err(err) => {
                // Transport-level failure: retryable.
                let error = ServerError::from_code("login-failed", err.to_string());
                self.retry_resume(error, token);
            }
        }
    }

    fn classify_resume_failure(
        self: &Arc<Self>,
        error: ServerError,
        token: String,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let code = error.code().unwrap_or_default();
            if code == RATE_LIMIT_CODE {
                let wait = error
                    .details
                    .as_ref()
                    .and_then(|d| d.get("timeToReset"))
                    .and_then(Value::as_f64)
                    .map(|ms| Duration::from_millis(ms.max(0.0) as u64))
                    .unwrap_or(self.session.config.login_retry_reset)
                    + self.session.config.rate_limit_grace;
                self.set_logging_in(false);
                self.emit(AuthEvent::LoginFailure(LoginFailure::from_server(&error, false)));
                let weak = self.weak_self.lock().clone();
                tokio::spawn(async move {
                    tokio::time::sleep(wait).await;
                    if let Some(controller) = weak.upgrade() {
                        controller.load_initial_user(false).await;
                    }
                });
            } else if RESUME_REJECTION_CODES.contains(&code.as_str()) {
                self.reject_resume(&error).await;
            } else {
                self.retry_resume(error, token);
            }
        })
    }

    /// The token is dead: clear everything, tell listeners the failure
    /// logged the user out, do not retry.
    async fn reject_resume(&self, error: &ServerError) {
        self.clear_persisted_auth().await;
        {
            let mut state = self.state.lock();
            state.token = None;
            state.user_id = None;
            state.token_expires = None;
        }
        self.dict.set(USER_ID_DICT_KEY, Value::Null);
        self.set_logging_in(false);
        self.emit(AuthEvent::LoginFailure(LoginFailure::from_server(error, true)));
    }

    /// Transient failure: surface it and retry with a doubling delay.
    fn retry_resume(self: &Arc<Self>, error: ServerError, token: String) {
        self.set_logging_in(false);
        self.emit(AuthEvent::LoginFailure(LoginFailure::from_server(&error, false)));
        let delay = self.next_retry_delay();
        let weak = self.weak_self.lock().clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(controller) = weak.upgrade() {
                controller.login_with_token(Some(token)).await;
            }
        });
    }

    fn next_retry_delay(&self) -> Duration {
        let mut state = self.state.lock();
        state
            .retry_backoff
            .next()
            .unwrap_or(self.session.config.login_retry_max)
    }

    /// Take `{id, token, tokenExpires}` out of a login reply, persist and
    /// publish them. Returns the user id, or `None` when the reply carried
    /// no token.
    async fn adopt_login_result(&self, value: &Value) -> Option<String> {
        let token = value.get("token").and_then(Value::as_str)?.to_string();
        let user_id = value
            .get("id")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_default();
        let expires = value.get("tokenExpires").and_then(ejson::coerce_date);

        storage::set_best_effort(self.storage.as_ref(), LOGIN_TOKEN_KEY, &token).await;
        storage::set_best_effort(self.storage.as_ref(), USER_ID_KEY, &user_id).await;
        match expires {
            Some(expires) => {
                storage::set_best_effort(
                    self.storage.as_ref(),
                    LOGIN_TOKEN_EXPIRES_KEY,
                    &expires.to_rfc3339(),
                )
                .await;
            }
            None => {
                storage::remove_best_effort(self.storage.as_ref(), LOGIN_TOKEN_EXPIRES_KEY).await;
            }
        }

        {
            let mut state = self.state.lock();
            state.token = Some(token);
            state.user_id = Some(user_id.clone());
            state.token_expires = expires;
        }
        self.dict.set(USER_ID_DICT_KEY, Value::String(user_id.clone()));
        self.set_logging_in(false);
        self.emit(AuthEvent::Login {
            user_id: user_id.clone(),
        });
        Some(user_id)
    }

    async fn clear_persisted_auth(&self) {
        storage::remove_best_effort(self.storage.as_ref(), LOGIN_TOKEN_KEY).await;
        storage::remove_best_effort(self.storage.as_ref(), LOGIN_TOKEN_EXPIRES_KEY).await;
        storage::remove_best_effort(self.storage.as_ref(), USER_ID_KEY).await;
    }

    /// Log out. Without a live session this only clears local state; with
    /// one, the server is told first, and local state clears regardless of
    /// what it answers.
    pub async fn logout(&self) {
        self.set_logging_out(true);
        if self.session.state() == SessionState::Connected {
            let _ = self.session.call("logout", vec![]).await;
        }
        self.clear_persisted_auth().await;
        {
            let mut state = self.state.lock();
            state.token = None;
            state.user_id = None;
            state.token_expires = None;
        }
        self.dict.set(USER_ID_DICT_KEY, Value::Null);
        self.set_logging_out(false);
        self.emit(AuthEvent::Logout);
    }

    /// Invalidate every other session of this user. The server rotates our
    /// token in the process; the replacement is adopted and persisted.
    pub async fn logout_other_clients(&self) -> Result<(), Error> {
        let result = self.session.call("logoutOtherClients", vec![]).await?;
        if result.get("token").is_some() {
            self.adopt_login_result(&result).await;
        }
        Ok(())
    }

    /// Seed auth state from storage and, unless `skip_login`, resume with
    /// the stored token. Resets the retry backoff first, so a fresh app
    /// start probes at the configured pace.
    pub async fn load_initial_user(self: &Arc<Self>, skip_login: bool) {
        {
            // Fresh start: probe at the reset pace, not wherever a failed
            // retry chain left the backoff.
            let mut state = self.state.lock();
            state.retry_backoff = ExponentialBackoff::new(
                self.session.config.login_retry_max,
                None,
                self.session.config.login_retry_reset,
            );
        }
        let token = storage::get_best_effort(self.storage.as_ref(), LOGIN_TOKEN_KEY).await;
        let user_id = storage::get_best_effort(self.storage.as_ref(), USER_ID_KEY).await;
        let expires = storage::get_best_effort(self.storage.as_ref(), LOGIN_TOKEN_EXPIRES_KEY)
            .await
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc));

        {
            let mut state = self.state.lock();
            state.token = token.clone();
            state.user_id = user_id.clone();
            state.token_expires = expires;
        }
        // Seed the reactive state so user_id() reads correctly before the
        // resume round-trips.
        self.dict.set(
            USER_ID_DICT_KEY,
            user_id.map(Value::String).unwrap_or(Value::Null),
        );

        if !skip_login {
            self.login_with_token(token).await;
        }
    }
}
