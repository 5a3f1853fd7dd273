// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Provides functions for parsing and validating endpoint urls.

use log::error;
use url::Url;

use ddp_types::Error;

use crate::constants::ENDPOINT_PATH_SUFFIX;

/// Scheme for cleartext WebSocket.
pub const WS_SCHEME: &str = "ws";
/// Scheme for TLS WebSocket.
pub const WSS_SCHEME: &str = "wss";

/// Creates a `Url` from the input string.
fn ddp_url_from_str(s: &str) -> Result<Url, Error> {
    Url::parse(s).map_err(|err| {
        error!("Cannot parse url \"{}\", error = {:?}", s, err);
        Error::Endpoint(format!("cannot parse url \"{s}\""))
    })
}

/// Check if this is a WebSocket URL.
pub fn is_websocket_url(url: &str) -> bool {
    ddp_url_from_str(url)
        .map(|url| matches!(url.scheme(), WS_SCHEME | WSS_SCHEME))
        .unwrap_or(false)
}

/// Validate a DDP endpoint.
///
/// The URL must use the `ws` or `wss` scheme and, unless
/// `suppress_url_errors` is set, end with the conventional `/websocket`
/// path. Servers mounted elsewhere work fine with the check suppressed;
/// the common failure this catches is passing the `http` application URL.
pub fn validate_endpoint(endpoint: &str, suppress_url_errors: bool) -> Result<Url, Error> {
    let url = ddp_url_from_str(endpoint)?;
    if !matches!(url.scheme(), WS_SCHEME | WSS_SCHEME) {
        error!("Endpoint \"{}\" does not use the ws or wss scheme", endpoint);
        return Err(Error::Endpoint(format!(
            "endpoint \"{endpoint}\" must start with ws:// or wss://"
        )));
    }
    if !suppress_url_errors && !url.path().ends_with(ENDPOINT_PATH_SUFFIX) {
        error!("Endpoint \"{}\" does not end with {}", endpoint, ENDPOINT_PATH_SUFFIX);
        return Err(Error::Endpoint(format!(
            "endpoint \"{endpoint}\" must end with {ENDPOINT_PATH_SUFFIX}"
        )));
    }
    Ok(url)
}
