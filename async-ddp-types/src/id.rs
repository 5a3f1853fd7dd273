// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Random id generation for frames and documents.

use rand::Rng;

/// Alphabet with visually ambiguous characters removed, matching what DDP
/// servers generate for document ids.
const UNMISTAKABLE_CHARS: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTWXYZabcdefghijkmnopqrstuvwxyz";

/// Length of a generated id.
const ID_LENGTH: usize = 17;

/// Source of ids for method calls, subscriptions and client-created
/// documents. Injected so tests can produce deterministic sequences.
pub trait IdGenerator: Send + Sync {
    /// Produce the next id. Must be unique for the lifetime of the client.
    fn next_id(&self) -> String;
}

/// The default generator: 17 characters drawn uniformly from the
/// unmistakable alphabet.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdGenerator;

impl IdGenerator for RandomIdGenerator {
    fn next_id(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..ID_LENGTH)
            .map(|_| UNMISTAKABLE_CHARS[rng.gen_range(0..UNMISTAKABLE_CHARS.len())] as char)
            .collect()
    }
}
