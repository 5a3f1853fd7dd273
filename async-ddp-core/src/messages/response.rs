// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Messages received from the server, and the frame parsing entry point.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use ddp_types::{Error, ServerError};

/// A server-to-client DDP message, decoded by its `msg` discriminant.
/// Serialization exists for frame logging and for test servers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum ServerMessage {
    /// The server accepted the `connect` handshake.
    Connected {
        /// Session id assigned (or re-confirmed) by the server.
        session: String,
    },
    /// The server rejected every proposed protocol version.
    Failed {
        /// The version the server would have accepted.
        version: String,
    },
    /// Liveness probe; must be answered with `pong`.
    Ping {
        /// Optional id to echo in the `pong`.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// Answer to a client `ping`. This client never sends `ping`, but a
    /// server may pong unsolicited.
    Pong {
        /// Echoed id, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// The named subscriptions have delivered their complete initial data.
    Ready {
        /// Wire ids of the subscriptions that became ready.
        subs: Vec<String>,
    },
    /// A subscription ended, either as an error or as the echo of a client
    /// `unsub`.
    Nosub {
        /// Wire id of the subscription.
        id: String,
        /// Present when the server refused or aborted the subscription.
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ServerError>,
    },
    /// A document entered one of the client's record sets.
    Added {
        /// Collection name.
        collection: String,
        /// Document id.
        id: String,
        /// Initial fields, excluding `_id`.
        #[serde(skip_serializing_if = "Option::is_none")]
        fields: Option<Map<String, Value>>,
    },
    /// Fields of a tracked document changed. Side-channel ("vent") events
    /// ride on this frame type: the sentinel `__vent` is `"1"`, `id` names
    /// the vent subscription instead of a document, and `e` carries the
    /// event payload.
    Changed {
        /// Collection name.
        collection: String,
        /// Document id, or the vent subscription id on vent frames.
        id: String,
        /// Fields with new values.
        #[serde(skip_serializing_if = "Option::is_none")]
        fields: Option<Map<String, Value>>,
        /// Fields that no longer exist on the document.
        #[serde(skip_serializing_if = "Option::is_none")]
        cleared: Option<Vec<String>>,
        /// Side-channel sentinel.
        #[serde(rename = "__vent", skip_serializing_if = "Option::is_none")]
        vent: Option<String>,
        /// Side-channel payload.
        #[serde(skip_serializing_if = "Option::is_none")]
        e: Option<Value>,
    },
    /// A document left all of the client's record sets.
    Removed {
        /// Collection name.
        collection: String,
        /// Document id.
        id: String,
    },
    /// Outcome of a method call.
    Result {
        /// Id from the `method` frame.
        id: String,
        /// Return value, absent when `error` is set.
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        /// Error thrown by the method, absent on success.
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ServerError>,
    },
    /// The methods listed have finished writing; all their effects are
    /// reflected in the data frames delivered so far.
    Updated {
        /// Method ids whose writes are complete.
        methods: Vec<String>,
    },
    /// The server could not process one of our messages.
    Error {
        /// Description of the problem.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        /// The message that provoked it, echoed back.
        #[serde(rename = "offendingMessage", skip_serializing_if = "Option::is_none")]
        offending_message: Option<Value>,
    },
}

/// The result of parsing one inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// A well-formed protocol message.
    Message(ServerMessage),
    /// Valid EJSON with a `msg` discriminant this client does not know.
    /// Surfaced as an `error` event rather than dropped, per the protocol.
    Unknown {
        /// The unrecognized discriminant.
        msg: String,
        /// The whole frame, for diagnostics.
        raw: Value,
    },
    /// Valid EJSON without a `msg` member. Servers send such frames (e.g.
    /// the initial `server_id` greeting); they are ignored.
    Ignored,
}

/// Parse an inbound text frame.
///
/// Returns `Err` only for text that is not valid EJSON at all; the caller
/// drops those frames silently. Frames without a `msg` member parse to
/// [`InboundFrame::Ignored`], frames with an unrecognized `msg` to
/// [`InboundFrame::Unknown`].
pub fn parse_frame(text: &str) -> Result<InboundFrame, Error> {
    let raw: Value = serde_json::from_str(text)?;
    let Some(msg) = raw.get("msg").and_then(Value::as_str) else {
        return Ok(InboundFrame::Ignored);
    };
    let msg = msg.to_string();
    match serde_json::from_value::<ServerMessage>(raw.clone()) {
        Ok(message) => Ok(InboundFrame::Message(message)),
        Err(_) => Ok(InboundFrame::Unknown { msg, raw }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(text: &str) -> InboundFrame {
        parse_frame(text).expect("frame should parse")
    }

    #[test]
    fn parses_connected() {
        assert_eq!(
            parse(r#"{"msg":"connected","session":"S1"}"#),
            InboundFrame::Message(ServerMessage::Connected { session: "S1".into() })
        );
    }

    #[test]
    fn parses_changed_with_cleared() {
        let frame = parse(r#"{"msg":"changed","collection":"items","id":"x","fields":{"a":1},"cleared":["b"]}"#);
        let InboundFrame::Message(ServerMessage::Changed { collection, id, fields, cleared, .. }) =
            frame
        else {
            panic!("wrong variant");
        };
        assert_eq!(collection, "items");
        assert_eq!(id, "x");
        assert_eq!(fields.unwrap().get("a"), Some(&json!(1)));
        assert_eq!(cleared, Some(vec!["b".into()]));
    }

    #[test]
    fn parses_result_error() {
        let frame = parse(r#"{"msg":"result","id":"m1","error":{"error":"too-many-requests","reason":"slow down","details":{"timeToReset":400}}}"#);
        let InboundFrame::Message(ServerMessage::Result { error: Some(error), result, .. }) = frame
        else {
            panic!("wrong variant");
        };
        assert!(result.is_none());
        assert_eq!(error.code().as_deref(), Some("too-many-requests"));
        assert_eq!(error.details, Some(json!({"timeToReset": 400})));
    }

    #[test]
    fn numeric_error_code_is_kept() {
        let frame = parse(r#"{"msg":"result","id":"m1","error":{"error":403,"reason":"forbidden"}}"#);
        let InboundFrame::Message(ServerMessage::Result { error: Some(error), .. }) = frame else {
            panic!("wrong variant");
        };
        assert_eq!(error.code().as_deref(), Some("403"));
    }

    #[test]
    fn vent_markers_survive_parsing() {
        let frame = parse(r#"{"msg":"changed","collection":"stream","id":"v1","__vent":"1","e":{"kind":"typing"}}"#);
        let InboundFrame::Message(ServerMessage::Changed { vent, e, id, .. }) = frame else {
            panic!("wrong variant");
        };
        assert_eq!(vent.as_deref(), Some("1"));
        assert_eq!(e, Some(json!({"kind": "typing"})));
        assert_eq!(id, "v1");
    }

    #[test]
    fn frame_without_msg_is_ignored() {
        assert_eq!(parse(r#"{"server_id":"0"}"#), InboundFrame::Ignored);
    }

    #[test]
    fn unknown_msg_is_surfaced() {
        let InboundFrame::Unknown { msg, .. } = parse(r#"{"msg":"gossip"}"#) else {
            panic!("wrong variant");
        };
        assert_eq!(msg, "gossip");
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse_frame("{nope").is_err());
    }
}
