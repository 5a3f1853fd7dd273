#![warn(missing_docs)]

//! This is a [DDP](https://github.com/meteor/meteor/blob/devel/packages/ddp/DDP.md)
//! client implementation for Rust.
//!
//! The actual implementation is in other crates, this is a convenient
//! master crate that re-exports the other crates.
//!
//! DDP is the WebSocket protocol Meteor-style servers use for reactive
//! data synchronization and remote procedure calls. The client in this
//! workspace maintains a live session across network failures, mirrors
//! server collections into an in-memory store with reactive query
//! invalidation, and authenticates with resumable tokens.

#[cfg(feature = "client")]
pub use ddp_client as client;
#[cfg(feature = "console-logging")]
pub mod console_logging;

pub use ddp_core as core;
pub use ddp_core::sync;
pub use ddp_types as types;
