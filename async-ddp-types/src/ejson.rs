// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! EJSON: JSON extended with typed values through reserved keys.
//!
//! Values travel as ordinary [`serde_json::Value`] trees. Dates are
//! `{"$date": <ms since epoch>}`, binary blobs are `{"$binary": <base64>}`.
//! This module provides the codec for those shapes plus the deep equality
//! used everywhere change detection happens: two values that decode to the
//! same date or the same bytes are equal regardless of spelling.

use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::error::Error;

/// Reserved key for dates.
pub const DATE_KEY: &str = "$date";
/// Reserved key for binary payloads.
pub const BINARY_KEY: &str = "$binary";

/// Parse an EJSON text frame into a value tree.
pub fn parse(text: &str) -> Result<Value, Error> {
    Ok(serde_json::from_str(text)?)
}

/// Serialize a value tree to an EJSON text frame.
pub fn stringify(value: &Value) -> Result<String, Error> {
    Ok(serde_json::to_string(value)?)
}

/// Encode a date as its EJSON wire shape.
pub fn date_to_value(date: DateTime<Utc>) -> Value {
    let mut obj = Map::new();
    obj.insert(DATE_KEY.into(), Value::from(date.timestamp_millis()));
    Value::Object(obj)
}

/// Decode `{"$date": ms}`. Returns `None` for anything else.
pub fn date_from_value(value: &Value) -> Option<DateTime<Utc>> {
    let obj = value.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    let ms = obj.get(DATE_KEY)?.as_f64()?;
    Utc.timestamp_millis_opt(ms as i64).single()
}

/// Encode bytes as their EJSON wire shape.
pub fn binary_to_value(bytes: &[u8]) -> Value {
    let mut obj = Map::new();
    obj.insert(
        BINARY_KEY.into(),
        Value::String(base64::engine::general_purpose::STANDARD.encode(bytes)),
    );
    Value::Object(obj)
}

/// Decode `{"$binary": base64}`. Returns `None` for anything else,
/// including payloads that do not decode as base64.
pub fn binary_from_value(value: &Value) -> Option<Vec<u8>> {
    let obj = value.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    let encoded = obj.get(BINARY_KEY)?.as_str()?;
    base64::engine::general_purpose::STANDARD.decode(encoded).ok()
}

/// Interpret a value as a point in time, accepting every spelling that
/// appears in login payloads: the EJSON date shape, epoch milliseconds as a
/// bare number, or an RFC 3339 / ISO-8601 string.
pub fn coerce_date(value: &Value) -> Option<DateTime<Utc>> {
    if let Some(date) = date_from_value(value) {
        return Some(date);
    }
    match value {
        Value::Number(n) => Utc.timestamp_millis_opt(n.as_f64()? as i64).single(),
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|d| d.with_timezone(&Utc)),
        _ => None,
    }
}

/// Deep EJSON equality.
///
/// Numbers compare by value (`5` equals `5.0`), dates by millisecond,
/// binary by bytes. Object key order is irrelevant; everything else is
/// structural.
pub fn equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| equals(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            if let (Some(x), Some(y)) = (date_from_value(a), date_from_value(b)) {
                return x == y;
            }
            if let (Some(x), Some(y)) = (binary_from_value(a), binary_from_value(b)) {
                return x == y;
            }
            x.len() == y.len()
                && x.iter().all(|(k, v)| y.get(k).is_some_and(|w| equals(v, w)))
        }
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn date_round_trip() {
        let date = Utc.timestamp_millis_opt(1_700_000_000_123).single().unwrap();
        let value = date_to_value(date);
        assert_eq!(value, json!({"$date": 1_700_000_000_123_i64}));
        assert_eq!(date_from_value(&value), Some(date));
    }

    #[test]
    fn binary_round_trip() {
        let value = binary_to_value(b"\x00\x01ddp");
        assert_eq!(binary_from_value(&value), Some(b"\x00\x01ddp".to_vec()));
    }

    #[test]
    fn coerce_date_accepts_all_spellings() {
        let date = Utc.timestamp_millis_opt(1_700_000_000_000).single().unwrap();
        assert_eq!(coerce_date(&json!({"$date": 1_700_000_000_000_i64})), Some(date));
        assert_eq!(coerce_date(&json!(1_700_000_000_000_i64)), Some(date));
        assert_eq!(coerce_date(&json!("2023-11-14T22:13:20Z")), Some(date));
        assert_eq!(coerce_date(&json!({"nope": 1})), None);
    }

    #[test]
    fn equals_normalizes_typed_values() {
        assert!(equals(&json!(5), &json!(5.0)));
        assert!(equals(
            &json!({"$date": 100}),
            &json!({"$date": 100.0})
        ));
        assert!(equals(
            &json!({"a": 1, "b": [1, 2]}),
            &json!({"b": [1, 2], "a": 1})
        ));
        assert!(!equals(&json!({"a": 1}), &json!({"a": 1, "b": 2})));
        assert!(!equals(&json!("1"), &json!(1)));
    }
}
