// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Rust DDP specific errors.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// An error as the server puts it on the wire, attached to `result` and
/// `nosub` frames. The `error` member is usually a string code such as
/// `"too-many-requests"`, but older servers send numbers (`403`), so it is
/// kept as a raw value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerError {
    /// Machine readable error code, string or number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    /// Human readable one-liner.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Usually `"{reason} [{error}]"`, set by the server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Always `"Meteor.Error"` for errors thrown deliberately by server code.
    #[serde(rename = "errorType", skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    /// Free-form extra payload, e.g. `{timeToReset}` on rate limits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ServerError {
    /// Build an error from a bare code, for synthesized failures.
    pub fn from_code(code: impl Into<String>, reason: impl Into<String>) -> Self {
        ServerError {
            error: Some(Value::String(code.into())),
            reason: Some(reason.into()),
            ..Default::default()
        }
    }

    /// The `error` member rendered as a string, whatever its wire type.
    pub fn code(&self) -> Option<String> {
        match &self.error {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(message) = &self.message {
            write!(f, "{message}")
        } else {
            match (self.code(), &self.reason) {
                (Some(code), Some(reason)) => write!(f, "{reason} [{code}]"),
                (Some(code), None) => write!(f, "[{code}]"),
                (None, Some(reason)) => write!(f, "{reason}"),
                (None, None) => write!(f, "unknown server error"),
            }
        }
    }
}

/// Rust DDP specific errors.
#[derive(Error, Debug)]
pub enum Error {
    /// The transport failed, or the peer went away. Recoverable through the
    /// reconnect loop; carries a sanitized message, never a library value.
    #[error("Transport error: {0}")]
    Transport(String),
    /// The peer sent something that is not valid for the protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// The endpoint URL was rejected before any connection was attempted.
    #[error("Invalid endpoint: {0}")]
    Endpoint(String),
    /// A frame could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The server answered a method call with an error.
    #[error("Method error: {0}")]
    Method(ServerError),
    /// The server refused a subscription with `nosub`.
    #[error("Subscription error: {0}")]
    Subscription(ServerError),
    /// The server rejected the advertised protocol versions.
    #[error("Version negotiation failed, server proposed {0}")]
    VersionNegotiation(String),
    /// An operation required a live session but the client is disconnected
    /// and not configured to wait.
    #[error("Not connected")]
    NotConnected,
    /// The client was shut down while the operation was in flight.
    #[error("Client closed")]
    Closed,
    /// Catch-all with a message, for failures in injected collaborators.
    #[error("{0}")]
    Other(String),
}

impl From<ServerError> for Error {
    fn from(value: ServerError) -> Self {
        Error::Method(value)
    }
}
