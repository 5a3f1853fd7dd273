// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

use async_trait::async_trait;
use tokio::sync::mpsc;

use ddp_types::Error;

use crate::messages::{ClientMessage, InboundFrame};

/// The result of a single call to [`Transport::poll`].
#[derive(Debug)]
pub enum TransportPollResult {
    /// An inbound frame was received and parsed.
    IncomingFrame(InboundFrame),
    /// An outbound frame was written to the wire.
    OutgoingMessageSent,
    /// The transport is gone. Carries a sanitized description, never a raw
    /// value from the WebSocket library.
    Closed(String),
}

/// Trait implemented by simple wrapper types that create a connection to a
/// DDP endpoint.
///
/// Notes for implementors:
///
///  - This deals with connection establishment up to an open, framed
///    channel; the DDP `connect` handshake happens on a higher level.
///  - This should not do any retries, that's handled on a higher level.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Attempt to establish a connection to the endpoint given by
    /// `endpoint`. The returned transport owns `outgoing` and writes every
    /// message received on it to the wire; the caller keeps the sender for
    /// the lifetime of the connection and is responsible for polling the
    /// transport for anything to be sent or received at all.
    async fn connect(
        &self,
        endpoint: &str,
        outgoing: mpsc::UnboundedReceiver<ClientMessage>,
    ) -> Result<Box<dyn Transport>, Error>;
}

/// Trait for client transport channels.
///
/// Note for implementors:
///
/// [`Transport::poll`] _must_ be cancellation safe, meaning that it cannot
/// keep internal state across calls. The easiest way to ensure this is to
/// await only a single cancel-safe future per call; streams and channel
/// `recv` are cancellation safe, a pattern frequently used in this library.
#[async_trait]
pub trait Transport: Send {
    /// Drive the transport: wait for an inbound frame or an outbound
    /// message and process it, returning what happened.
    async fn poll(&mut self) -> TransportPollResult;
}
