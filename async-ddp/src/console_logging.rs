// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Installs a console logger, useful for general logging from samples and
//! ad-hoc debugging. Respects `RUST_LOG`, defaulting to `info`.

/// Install the logger. Call once, early.
pub fn init() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}
