// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Messages sent from the client to the server.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use ddp_types::Error;

/// A client-to-server DDP message. The `msg` discriminant is part of the
/// serialized form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Session handshake, sent once per transport connection. `session`
    /// carries the previous session id when asking the server to resume.
    Connect {
        /// The protocol version proposed by the client.
        version: String,
        /// All protocol versions the client can fall back to.
        support: Vec<String>,
        /// Previous session id, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        session: Option<String>,
    },
    /// Answer to a server `ping`, echoing its id.
    Pong {
        /// Id from the `ping`, echoed back verbatim.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// Open a subscription to a named record set.
    Sub {
        /// Client-generated subscription id, echoed in `ready`/`nosub`.
        id: String,
        /// Name of the publication.
        name: String,
        /// EJSON parameters for the publication.
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<Vec<Value>>,
    },
    /// Tear down a subscription previously opened with `sub`.
    Unsub {
        /// The id used on the corresponding `sub`.
        id: String,
    },
    /// Remote procedure call.
    Method {
        /// Client-generated id, echoed on `result` and in `updated`.
        id: String,
        /// Name of the method.
        method: String,
        /// EJSON arguments.
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<Vec<Value>>,
    },
}

impl ClientMessage {
    /// Serialize into a text frame.
    pub fn to_frame(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    /// The message as a value tree, used by the frame scrubber.
    pub fn to_value(&self) -> Result<Value, Error> {
        Ok(serde_json::to_value(self)?)
    }

    /// The wire id of the message, for messages that carry one.
    pub fn id(&self) -> Option<&str> {
        match self {
            ClientMessage::Sub { id, .. }
            | ClientMessage::Unsub { id }
            | ClientMessage::Method { id, .. } => Some(id),
            ClientMessage::Pong { id } => id.as_deref(),
            ClientMessage::Connect { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn connect_frame_shape() {
        let msg = ClientMessage::Connect {
            version: "1".into(),
            support: vec!["1".into()],
            session: None,
        };
        let frame: Value = serde_json::from_str(&msg.to_frame().unwrap()).unwrap();
        assert_eq!(frame, json!({"msg": "connect", "version": "1", "support": ["1"]}));
    }

    #[test]
    fn connect_frame_carries_resumed_session() {
        let msg = ClientMessage::Connect {
            version: "1".into(),
            support: vec!["1".into()],
            session: Some("S1".into()),
        };
        let frame: Value = serde_json::from_str(&msg.to_frame().unwrap()).unwrap();
        assert_eq!(frame["session"], json!("S1"));
    }

    #[test]
    fn method_frame_shape() {
        let msg = ClientMessage::Method {
            id: "m1".into(),
            method: "inc".into(),
            params: Some(vec![json!(1)]),
        };
        let frame: Value = serde_json::from_str(&msg.to_frame().unwrap()).unwrap();
        assert_eq!(
            frame,
            json!({"msg": "method", "id": "m1", "method": "inc", "params": [1]})
        );
    }
}
