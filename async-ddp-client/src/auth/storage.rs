// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Injected collaborators of the auth controller: token storage and
//! password hashing.

use std::collections::HashMap;

use async_trait::async_trait;
use log::warn;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use ddp_core::sync::Mutex;
use ddp_types::Error;

/// Persistent key-value storage for auth tokens. Implementations must
/// tolerate concurrent reads and writes; every operation is best-effort
/// from the controller's point of view.
#[async_trait]
pub trait KeyStorage: Send + Sync {
    /// Read a key, `None` when absent.
    async fn get_item(&self, key: &str) -> Result<Option<String>, Error>;
    /// Write a key.
    async fn set_item(&self, key: &str, value: &str) -> Result<(), Error>;
    /// Delete a key; deleting an absent key is not an error.
    async fn remove_item(&self, key: &str) -> Result<(), Error>;
}

/// In-memory storage. The default for tests and for applications that do
/// not want tokens to survive a restart.
#[derive(Default)]
pub struct MemoryKeyStorage {
    inner: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl KeyStorage for MemoryKeyStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.inner.lock().get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), Error> {
        self.inner.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), Error> {
        self.inner.lock().remove(key);
        Ok(())
    }
}

/// Best-effort read: storage failures are logged and read as absent.
pub(crate) async fn get_best_effort(storage: &dyn KeyStorage, key: &str) -> Option<String> {
    match storage.get_item(key).await {
        Ok(value) => value,
        Err(err) => {
            warn!("Key storage read of {key} failed: {err}");
            None
        }
    }
}

/// Best-effort write; failures are logged and swallowed.
pub(crate) async fn set_best_effort(storage: &dyn KeyStorage, key: &str, value: &str) {
    if let Err(err) = storage.set_item(key, value).await {
        warn!("Key storage write of {key} failed: {err}");
    }
}

/// Best-effort delete; failures are logged and swallowed.
pub(crate) async fn remove_best_effort(storage: &dyn KeyStorage, key: &str) {
    if let Err(err) = storage.remove_item(key).await {
        warn!("Key storage removal of {key} failed: {err}");
    }
}

/// Turns a cleartext password into whatever the server's login method
/// expects. The client never sends cleartext.
pub trait PasswordHasher: Send + Sync {
    /// The wire value of the `password` argument.
    fn hash(&self, password: &str) -> Value;
}

/// The standard digest: hex-encoded SHA-256 tagged with its algorithm.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256PasswordHasher;

impl PasswordHasher for Sha256PasswordHasher {
    fn hash(&self, password: &str) -> Value {
        let digest = Sha256::digest(password.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        json!({ "digest": hex, "algorithm": "sha-256" })
    }
}
