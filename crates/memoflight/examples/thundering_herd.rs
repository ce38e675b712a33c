// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Demonstrates a registry absorbing a burst of requests for the same key.
//!
//! Fifty requests arrive within a few milliseconds. The producer is allowed to run at most
//! twice at the same time, with launches at least 50ms apart, so nearly every request is
//! served by a fetch that is already in flight or by the cached result.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use memoflight::{BoxError, Config, Registry};

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let config = Config::builder()
        .ttl(Duration::from_secs(1))
        .max_concurrent(2)
        .stagger_delay(Duration::from_millis(50))
        .cleanup_period(Duration::from_secs(5))
        .build()?;

    let registry = Arc::new(Registry::new(config)?);
    let executions = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&executions);
    registry.register_default("user:123", move || {
        let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            println!("  producer run #{count}: querying the database...");
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, BoxError>(format!("UserData(name: Alice, version: {count})"))
        }
    })?;

    println!("Starting 50 requests for user:123...\n");

    let mut handles = Vec::new();
    for i in 1..=50 {
        let registry = Arc::clone(&registry);
        handles.push(tokio::spawn(async move {
            let result = registry.get("user:123").await;
            (i, result)
        }));
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    for handle in handles {
        let (i, result) = handle.await?;
        if i % 10 == 0 {
            println!("  [request {i}] {}", result?);
        }
    }

    println!(
        "\nProducer executed {} time(s) for 50 requests.",
        executions.load(Ordering::SeqCst)
    );
    println!("{}", registry.stats_json("user:123", false)?);

    Ok(())
}
