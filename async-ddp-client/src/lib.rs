// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

#![warn(missing_docs)]

//! DDP client API.
//!
//! This crate implements a reactive, fault-tolerant client for DDP version
//! 1: a persistent WebSocket session with automatic reconnection and
//! in-flight replay, an in-memory mirror of server collections with
//! reactive query invalidation, method calls, subscriptions, token-based
//! authentication and side-channel ("vent") events.
//!
//! The entry point is [`Client`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use ddp_client::{Client, MemoryKeyStorage, SubscriptionCallbacks};
//!
//! # async fn run() -> Result<(), ddp_types::Error> {
//! let client = Client::builder("ws://localhost:3000/websocket")
//!     .key_storage(Arc::new(MemoryKeyStorage::default()))
//!     .build()?;
//! client.wait_for_connection().await;
//!
//! let things = client.subscribe("things", vec![], SubscriptionCallbacks::new());
//! let cursor = client.find("things", None, Default::default())?;
//! # drop((things, cursor));
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod collections;
pub mod config;
pub mod observers;
pub mod reachability;
pub mod reactive_dict;
pub mod retry;
pub mod session;
pub mod tracked;
pub mod tracker;
pub mod vent;

pub use auth::{
    AuthController, AuthEvent, KeyStorage, LoginFailure, MemoryKeyStorage, PasswordHasher,
    Sha256PasswordHasher, UserSelector,
};
pub use client::{Client, ClientBuilder, Status};
pub use collections::{
    BasicMatcher, Collection, CollectionStore, Cursor, DocumentMatcher, FindOptions, SortOrder,
};
pub use config::ClientConfig;
pub use observers::{CursorCallbacks, ObserverHandle};
pub use reachability::Reachability;
pub use reactive_dict::ReactiveDict;
pub use session::{
    ClientEvent, Session, SessionEventLoop, SessionState, SubscriptionCallbacks,
    SubscriptionHandle,
};
pub use tracked::Tracked;
pub use tracker::{Computation, Dependency, FlushScheduler, ManualScheduler, TokioScheduler, Tracker};
pub use vent::{VentDispatcher, VentHandle};
