// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! [ClientMessage] and [ServerMessage], and utilities for working with these.

mod request;
mod response;

pub use request::ClientMessage;
pub use response::{parse_frame, InboundFrame, ServerMessage};

use serde_json::{Map, Value};

/// Keys whose values are dropped from verbose frame logs when the client is
/// in private mode. Field names are kept so logs remain useful for
/// debugging message flow without leaking payloads.
const PRIVATE_KEYS: &[&str] = &["params", "fields", "result"];

const REDACTED: &str = "***";

/// Render a frame for logging with payload values stripped.
///
/// `params` entries, `fields` members and `result` are replaced by a
/// placeholder; everything else (ids, collection names, field names) is
/// preserved verbatim.
pub fn scrub_frame(frame: &Value) -> Value {
    let Some(obj) = frame.as_object() else {
        return frame.clone();
    };
    let mut scrubbed = Map::with_capacity(obj.len());
    for (key, value) in obj {
        if PRIVATE_KEYS.contains(&key.as_str()) {
            scrubbed.insert(key.clone(), redact(value));
        } else {
            scrubbed.insert(key.clone(), value.clone());
        }
    }
    Value::Object(scrubbed)
}

fn redact(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        Value::Object(obj) => Value::Object(
            obj.keys()
                .map(|k| (k.clone(), Value::String(REDACTED.into())))
                .collect(),
        ),
        _ => Value::String(REDACTED.into()),
    }
}
