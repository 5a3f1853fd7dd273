// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Network reachability wiring.

use std::sync::Arc;

use log::debug;

use crate::session::Session;

/// Host-provided reachability detection. The library never probes the
/// network itself; an implementation pushes transitions into the listener
/// it is given.
pub trait Reachability: Send + Sync {
    /// Point the detector at a URL to probe, when it supports that.
    fn configure(&self, reachability_url: Option<&str>);

    /// Install the listener; call it with `true`/`false` on every
    /// reachable/unreachable transition.
    fn subscribe(&self, listener: Box<dyn Fn(bool) + Send + Sync>);
}

/// Connect a reachability source to a session: regaining the network asks
/// the event loop to reconnect immediately instead of waiting out the
/// reconnect interval. Only sessions that want to be connected react.
pub fn wire_reachability(
    reachability: &dyn Reachability,
    session: Arc<Session>,
    reachability_url: Option<&str>,
) {
    reachability.configure(reachability_url);
    reachability.subscribe(Box::new(move |is_connected| {
        if is_connected && session.config.auto_reconnect && session.connection_desired() {
            debug!("Network reachable again, requesting reconnect");
            session.request_connect();
        }
    }));
}
