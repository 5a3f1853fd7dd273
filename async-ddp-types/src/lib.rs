// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

#![warn(missing_docs)]

//! Data types shared by every crate in the DDP client family.
//!
//! DDP frames carry EJSON: JSON extended with typed values encoded through
//! reserved `$`-keys (`$date`, `$binary`). This crate holds the EJSON
//! helpers, the document model mirrored from server collections, random id
//! generation, and the common error types. It contains no I/O.

pub mod document;
pub mod ejson;
pub mod error;
pub mod id;

pub use document::Document;
pub use error::{Error, ServerError};
pub use id::{IdGenerator, RandomIdGenerator};
