// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

#![warn(missing_docs)]

//! The DDP core module holds functionality that sits between the data types
//! and the session: wire message enums, frame parsing and privacy
//! scrubbing, endpoint URL validation, the transport traits with their
//! WebSocket implementation, and the outbound frame queue.

/// Contains common DDP constants.
pub mod constants {
    /// The protocol version this client speaks.
    pub const DDP_VERSION: &str = "1";

    /// Versions advertised in the `support` list of the `connect` frame.
    pub const SUPPORTED_DDP_VERSIONS: &[&str] = &["1"];

    /// Conventional path suffix of a DDP endpoint.
    pub const ENDPOINT_PATH_SUFFIX: &str = "/websocket";
}

pub mod comms;
pub mod messages;
pub mod queue;

pub use messages::{ClientMessage, InboundFrame, ServerMessage};
pub use queue::OutboundQueue;

/// Tracing macro for obtaining a lock on a `Mutex`. Sometimes deadlocks can
/// happen in code, and if they do, this macro is useful for finding out
/// where they happened.
#[macro_export]
macro_rules! trace_lock {
    ( $x:expr ) => {{
        let v = $x.lock();
        v
    }};
}

/// Common synchronous locks. Re-exports locks from parking_lot used internally.
pub mod sync {
    /// Read-write lock. Use this if you usually only need to read the value.
    pub type RwLock<T> = parking_lot::RwLock<T>;
    /// Mutually exclusive lock. Use this if you need both read and write often.
    pub type Mutex<T> = parking_lot::Mutex<T>;
}
