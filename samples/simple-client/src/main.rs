// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! A simple client: connect to a DDP endpoint, subscribe to a publication
//! and print every matching document as it changes.
//!
//! ```text
//! cargo run --bin ddp-simple-client -- --url ws://localhost:3000/websocket --publication tasks
//! ```

use std::sync::Arc;

use ddp::client::{Client, FindOptions, MemoryKeyStorage, SubscriptionCallbacks};
use log::info;

struct Args {
    url: String,
    publication: String,
    collection: String,
}

fn parse_args() -> Result<Args, pico_args::Error> {
    let mut args = pico_args::Arguments::from_env();
    Ok(Args {
        url: args
            .opt_value_from_str("--url")?
            .unwrap_or_else(|| "ws://localhost:3000/websocket".to_string()),
        publication: args
            .opt_value_from_str("--publication")?
            .unwrap_or_else(|| "tasks".to_string()),
        collection: args
            .opt_value_from_str("--collection")?
            .unwrap_or_else(|| "tasks".to_string()),
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ddp::console_logging::init();
    let args = parse_args()?;

    let client = Arc::new(
        Client::builder(&args.url)
            .key_storage(Arc::new(MemoryKeyStorage::default()))
            .build()?,
    );
    client.wait_for_connection().await;
    info!("Connected to {}", args.url);

    let subscription = client.subscribe(
        &args.publication,
        vec![],
        SubscriptionCallbacks::new().on_ready(|| info!("Subscription ready")),
    );

    // Rerun on every change to the mirrored collection and print the
    // current documents.
    let collection = args.collection.clone();
    let store = client.clone();
    let mut tracked = client.tracked(move || {
        store
            .find(&collection, None, FindOptions::default())
            .map(|cursor| cursor.map(|doc| doc.to_value()))
            .unwrap_or_default()
    });

    loop {
        let docs = tracked.get();
        info!("{} document(s):", docs.len());
        for doc in &docs {
            info!("  {doc}");
        }
        if tracked.changed().await.is_none() {
            break;
        }
    }

    subscription.stop();
    Ok(())
}
