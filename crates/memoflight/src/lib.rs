// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Request-coalescing, TTL-bounded memoization of expensive async producers.
//!
//! This crate wraps an expensive operation (a slow lookup, a remote call, a heavy
//! computation) so that many concurrent callers asking for the same key share a small,
//! bounded number of underlying invocations instead of each running their own. Results are
//! served from memory until they are older than a configured time-to-live.
//!
//! # When to Use
//!
//! - **Thundering herd**: many requests hit the same expiring value at once
//! - **Slow dependencies**: a backend that must not see one call per incoming request
//! - **Bounded refresh**: stale values should be refreshed at a limited rate
//!
//! # How a Call Is Served
//!
//! Each key is a [`CachingEntry`] in one of three [`EntryState`]s:
//!
//! - **Init**: nothing cached, so the call launches the producer.
//! - **Fetching**: a producer call is running. The caller joins it, unless fewer than
//!   `max_concurrent` calls are running and the last launch is at least `stagger_delay` ago,
//!   in which case an additional call is launched.
//! - **Cached**: a completed result exists. It is returned right away while younger than
//!   `ttl`; once stale, a refresh is launched under the same concurrency and stagger limits.
//!
//! Callers joined on a fetch receive its outcome, value or error. A newer fetch that
//! supersedes a pending one forwards its outcome to the older [`ResultCell`], so nobody is
//! left waiting.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use memoflight::{BoxError, Config, Registry};
//!
//! # async fn example() -> memoflight::Result<()> {
//! let config = Config::builder()
//!     .ttl(Duration::from_secs(1))
//!     .max_concurrent(2)
//!     .stagger_delay(Duration::from_millis(50))
//!     .build()?;
//!
//! let registry = Registry::new(config)?;
//! registry.register_default("user:123", || async {
//!     // The expensive lookup runs at most twice at a time, however many callers there are.
//!     Ok::<_, BoxError>("UserData(name: Alice)".to_string())
//! })?;
//!
//! let user = registry.get("user:123").await?;
//! let stats = registry.stats_for("user:123")?;
//! assert_eq!(stats.total_calls, 1);
//! # Ok(())
//! # }
//! ```
//!
//! # Runtime
//!
//! Producers run on their own Tokio task when called within a Tokio runtime, so a caller
//! that gives up does not strand the callers joined on its fetch. Outside a runtime the
//! producer runs inline in the calling future. The background sweep of a [`Registry`]
//! always requires a Tokio runtime.

mod cell;
mod config;
mod entry;
mod error;
mod registry;
mod stats;
mod sweep;

#[doc(inline)]
pub use cell::ResultCell;
#[doc(inline)]
pub use config::{Config, ConfigBuilder};
#[doc(inline)]
pub use entry::{CachingEntry, EntryState};
#[doc(inline)]
pub use error::{BoxError, Error, Result};
#[doc(inline)]
pub use registry::Registry;
#[doc(inline)]
pub use stats::{StatsCollector, StatsSnapshot};
