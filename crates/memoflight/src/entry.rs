// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-key caching and coalescing state machine.

use std::fmt::Debug;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::time::Instant;

use crate::cell::ResultCell;
use crate::stats::{StatsCollector, StatsSnapshot};
use crate::{BoxError, Config, Error, Result};

type ProducerFn<T> = dyn Fn() -> BoxFuture<'static, std::result::Result<T, BoxError>> + Send + Sync;

/// Where a [`CachingEntry`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    /// No result is held and nothing is in flight.
    Init,
    /// At least one producer call is outstanding and its result is not cached yet.
    Fetching,
    /// A completed result exists. It may be stale.
    Cached,
}

/// Memoizes one expensive async producer and coalesces concurrent callers.
///
/// Every [`get`](Self::get) either serves the cached result, joins a fetch that is already in
/// flight, or launches a new producer call. A new call is launched when nothing is cached,
/// or when the cached result is older than the TTL, or when a fetch is in flight and more
/// parallelism is allowed. Launches beyond the first require that fewer than
/// `max_concurrent` calls are running and that at least `stagger_delay` has passed since the
/// previous launch.
///
/// The decision is taken under a short lock; the producer itself always runs with the lock
/// released. Within a Tokio runtime the producer runs on its own task, so it finishes and
/// releases everyone waiting for it even if the caller that launched it goes away.
///
/// Cloning a `CachingEntry` is cheap and yields a handle to the same entry.
///
/// # Examples
///
/// ```
/// use memoflight::{BoxError, CachingEntry, Config};
///
/// # async fn example() -> memoflight::Result<()> {
/// let entry = CachingEntry::new("answer", Config::default(), || async {
///     Ok::<_, BoxError>(42_u32)
/// });
///
/// assert_eq!(entry.get().await?, 42);
/// # Ok(())
/// # }
/// ```
pub struct CachingEntry<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for CachingEntry<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Debug for CachingEntry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("CachingEntry")
            .field("key", &self.shared.key)
            .field("config", &self.shared.config)
            .field("state", &inner.state)
            .field("in_flight", &inner.in_flight)
            .finish_non_exhaustive()
    }
}

struct Shared<T> {
    key: String,
    config: Config,
    producer: Box<ProducerFn<T>>,
    inner: Mutex<Inner<T>>,
    stats: StatsCollector,
}

/// Everything a transition touches, guarded as one unit.
struct Inner<T> {
    state: EntryState,
    current: Option<Arc<ResultCell<T>>>,
    in_flight: usize,
    last_launch_at: Option<Instant>,
}

enum Decision<T> {
    Cached(Result<T>),
    Join(Arc<ResultCell<T>>),
    Launch(Launch<T>),
}

struct Launch<T> {
    cell: Arc<ResultCell<T>>,
    superseded_age: Duration,
    concurrent: usize,
}

impl<T> CachingEntry<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates an entry for `key` wrapping `producer`.
    ///
    /// The producer is invoked lazily by [`get`](Self::get), possibly several times in parallel
    /// when the configuration allows it.
    pub fn new<F, Fut, E>(key: impl Into<String>, config: Config, producer: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let key = key.into();
        let producer: Box<ProducerFn<T>> = Box::new(move || {
            let produced = producer();
            async move { produced.await.map_err(Into::into) }.boxed()
        });

        Self {
            shared: Arc::new(Shared {
                stats: StatsCollector::new(key.clone()),
                key,
                config,
                producer,
                inner: Mutex::new(Inner {
                    state: EntryState::Init,
                    current: None,
                    in_flight: 0,
                    last_launch_at: None,
                }),
            }),
        }
    }

    /// Returns the value for this entry, fetching it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProducerFailure`] when the fetch this call was served by failed.
    /// A failed fetch is treated like any other result: it is shared with every caller
    /// joined on it and, with caching enabled, served until it goes stale.
    pub async fn get(&self) -> Result<T> {
        let started = Instant::now();

        // Hits are recorded only once a call is answered, so they always add up to `total_calls`.
        let outcome = match self.shared.decide(started) {
            Decision::Cached(outcome) => {
                self.shared.stats.record_cache_hit();
                outcome
            }
            Decision::Join(cell) => {
                let outcome = cell.wait().await;
                self.shared.stats.record_in_flight_hit();
                self.shared.stats.record_join_wait(started.elapsed());
                outcome
            }
            Decision::Launch(launch) => {
                let cell = Arc::clone(&launch.cell);
                let fetch = PendingFetch {
                    shared: Arc::clone(&self.shared),
                    launch: Some(launch),
                }
                .run();
                match Handle::try_current() {
                    Ok(handle) => drop(handle.spawn(fetch)),
                    Err(_outside_runtime) => fetch.await,
                }
                let outcome = cell.wait().await;
                self.shared.stats.record_producer_hit();
                outcome
            }
        };

        self.shared.stats.record_call(started.elapsed());
        outcome
    }
}

impl<T> CachingEntry<T> {
    /// Key this entry is registered under.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.shared.key
    }

    /// Configuration of this entry.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> EntryState {
        self.shared.inner.lock().state
    }

    /// Number of producer calls currently running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.inner.lock().in_flight
    }

    /// Age of the current result, or `None` if no completed result is held.
    #[must_use]
    pub fn result_age(&self) -> Option<Duration> {
        self.shared.inner.lock().current.as_ref().and_then(|cell| cell.age())
    }

    /// Returns a snapshot of the entry's statistics.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Renders the statistics as JSON, optionally resetting them afterwards.
    #[must_use]
    pub fn stats_json(&self, reset: bool) -> String {
        let json = self.shared.stats.snapshot().to_json();
        if reset {
            self.shared.stats.reset();
        }
        json
    }

    /// Clears the statistics.
    pub fn reset_stats(&self) {
        self.shared.stats.reset();
    }

    /// Drops a stale result and returns the entry to [`EntryState::Init`].
    ///
    /// Nothing happens while any producer call is running, so a result some caller may still
    /// be waiting for is never discarded. Returns `true` if the entry was cleared.
    pub fn clear_if_stale(&self) -> bool {
        let mut inner = self.shared.inner.lock();

        let stale = inner
            .current
            .as_ref()
            .and_then(|cell| cell.age())
            .is_some_and(|age| age > self.shared.config.ttl());

        if !stale || inner.in_flight > 0 {
            return false;
        }

        inner.state = EntryState::Init;
        inner.current = None;
        drop(inner);

        tracing::event!(
            name: "memoflight.sweep.cleared",
            tracing::Level::INFO,
            cache.key = %self.shared.key,
        );
        true
    }
}

impl<T: Clone> Shared<T> {
    fn decide(&self, now: Instant) -> Decision<T> {
        let mut inner = self.inner.lock();

        match (inner.state, inner.current.clone()) {
            (EntryState::Fetching, Some(cell)) if !self.may_launch_another(&inner, now) => Decision::Join(cell),
            (EntryState::Cached, Some(cell)) => {
                let stale = cell.age().is_none_or(|age| age > self.config.ttl());
                if stale && self.may_launch_another(&inner, now) {
                    Self::launch(&mut inner, now)
                } else if let Some(outcome) = cell.outcome() {
                    Decision::Cached(outcome)
                } else {
                    Decision::Join(cell)
                }
            }
            _ => Self::launch(&mut inner, now),
        }
    }

    fn may_launch_another(&self, inner: &Inner<T>, now: Instant) -> bool {
        let staggered = inner
            .last_launch_at
            .is_none_or(|last| now.saturating_duration_since(last) >= self.config.stagger_delay());

        self.config.allows_another_fetch(inner.in_flight) && staggered
    }

    fn launch(inner: &mut Inner<T>, now: Instant) -> Decision<T> {
        let previous = inner.current.take();
        let superseded_age = previous.as_ref().and_then(|cell| cell.age()).unwrap_or_default();
        let cell = ResultCell::superseding(previous);

        inner.current = Some(Arc::clone(&cell));
        inner.state = EntryState::Fetching;
        inner.in_flight += 1;
        inner.last_launch_at = Some(now);

        Decision::Launch(Launch {
            cell,
            superseded_age,
            concurrent: inner.in_flight,
        })
    }

    fn finish(&self, launch: &Launch<T>, outcome: Result<T>) {
        let mut inner = self.inner.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        launch.cell.settle(outcome);

        // A newer launch owns the state until it completes.
        if inner.current.as_ref().is_some_and(|current| Arc::ptr_eq(current, &launch.cell)) {
            inner.state = if self.config.caching_enabled() {
                EntryState::Cached
            } else {
                EntryState::Init
            };
        }
    }

    /// Releases a fetch that was dropped before its producer completed.
    ///
    /// Waiters are failed rather than left parked, and the entry goes back to `Init` so the
    /// next call launches a fresh fetch instead of serving the cancellation.
    fn abandon(&self, launch: &Launch<T>) {
        let mut inner = self.inner.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        launch
            .cell
            .settle(Err(Error::producer_failure(self.key.clone(), BoxError::from("fetch cancelled"))));

        if inner.current.as_ref().is_some_and(|current| Arc::ptr_eq(current, &launch.cell)) {
            inner.state = EntryState::Init;
            inner.current = None;
        }
        drop(inner);

        tracing::event!(
            name: "memoflight.fetch.cancelled",
            tracing::Level::WARN,
            cache.key = %self.key,
        );
    }
}

/// Owns a launched fetch until it is finished.
///
/// Dropping it before [`complete`](Self::complete) abandons the fetch, which happens when the
/// future running the producer is cancelled.
struct PendingFetch<T: Clone> {
    shared: Arc<Shared<T>>,
    launch: Option<Launch<T>>,
}

impl<T: Clone> PendingFetch<T> {
    fn complete(mut self, outcome: Result<T>) {
        if let Some(launch) = self.launch.take() {
            self.shared.finish(&launch, outcome);
        }
    }
}

impl<T: Clone> Drop for PendingFetch<T> {
    fn drop(&mut self) {
        if let Some(launch) = self.launch.take() {
            self.shared.abandon(&launch);
        }
    }
}

impl<T> PendingFetch<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn run(self) {
        let Some(launch) = self.launch.as_ref() else {
            return;
        };
        let concurrent = launch.concurrent;
        let superseded_age = launch.superseded_age;
        let started_at = launch.cell.started_at();
        let shared = Arc::clone(&self.shared);

        tracing::event!(
            name: "memoflight.fetch.launched",
            tracing::Level::DEBUG,
            cache.key = %shared.key,
            cache.in_flight = concurrent,
        );

        let produced = match AssertUnwindSafe(async { (shared.producer)().await }).catch_unwind().await {
            Ok(produced) => produced,
            Err(_panic) => Err(BoxError::from("producer panicked")),
        };

        let outcome = produced.map_err(|error| {
            tracing::event!(
                name: "memoflight.fetch.failed",
                tracing::Level::WARN,
                cache.key = %shared.key,
                error = %error,
            );
            Error::producer_failure(shared.key.clone(), error)
        });

        // Stats first, so callers released by the cell observe this run.
        shared.stats.record_producer_run(started_at.elapsed(), superseded_age, concurrent);
        self.complete(outcome);
    }
}
