// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Client configuration data.

use std::time::Duration;

use serde::{Deserialize, Serialize};

mod defaults {
    use std::time::Duration;

    pub fn auto_connect() -> bool {
        true
    }

    pub fn auto_reconnect() -> bool {
        true
    }

    pub fn reconnect_interval() -> Duration {
        Duration::from_millis(5000)
    }

    pub fn is_private() -> bool {
        true
    }

    pub fn is_verbose() -> bool {
        false
    }

    pub fn suppress_url_errors() -> bool {
        false
    }

    pub fn login_retry_initial() -> Duration {
        Duration::from_millis(50)
    }

    pub fn login_retry_max() -> Duration {
        Duration::from_millis(8000)
    }

    pub fn login_retry_reset() -> Duration {
        Duration::from_millis(500)
    }

    pub fn rate_limit_grace() -> Duration {
        Duration::from_millis(100)
    }
}

/// Client configuration. The endpoint is the only mandatory member; every
/// default matches what a freshly configured client should do: connect on
/// creation, reconnect forever, keep payloads out of logs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// The DDP endpoint, `ws[s]://host[:port]/websocket`.
    pub endpoint: String,
    /// Open the connection as soon as the client is built.
    #[serde(default = "defaults::auto_connect")]
    pub auto_connect: bool,
    /// Re-dial automatically after an unexpected disconnect.
    #[serde(default = "defaults::auto_reconnect")]
    pub auto_reconnect: bool,
    /// Delay between reconnect attempts.
    #[serde(default = "defaults::reconnect_interval")]
    pub reconnect_interval: Duration,
    /// Strip payload values from verbose frame logs.
    #[serde(default = "defaults::is_private")]
    pub is_private: bool,
    /// Log every frame in and out at debug level.
    #[serde(default = "defaults::is_verbose")]
    pub is_verbose: bool,
    /// Accept endpoints that do not end in `/websocket`.
    #[serde(default = "defaults::suppress_url_errors")]
    pub suppress_url_errors: bool,
    /// First delay of the token-resume retry backoff.
    #[serde(default = "defaults::login_retry_initial")]
    pub login_retry_initial: Duration,
    /// Ceiling of the token-resume retry backoff.
    #[serde(default = "defaults::login_retry_max")]
    pub login_retry_max: Duration,
    /// Value the retry delay is reset to when the initial user is loaded.
    #[serde(default = "defaults::login_retry_reset")]
    pub login_retry_reset: Duration,
    /// Slack added on top of a server-provided rate limit reset time.
    #[serde(default = "defaults::rate_limit_grace")]
    pub rate_limit_grace: Duration,
}

impl ClientConfig {
    /// Create a config for `endpoint` with every other member at its
    /// default.
    pub fn new(endpoint: impl Into<String>) -> Self {
        ClientConfig {
            endpoint: endpoint.into(),
            auto_connect: defaults::auto_connect(),
            auto_reconnect: defaults::auto_reconnect(),
            reconnect_interval: defaults::reconnect_interval(),
            is_private: defaults::is_private(),
            is_verbose: defaults::is_verbose(),
            suppress_url_errors: defaults::suppress_url_errors(),
            login_retry_initial: defaults::login_retry_initial(),
            login_retry_max: defaults::login_retry_max(),
            login_retry_reset: defaults::login_retry_reset(),
            rate_limit_grace: defaults::rate_limit_grace(),
        }
    }
}
