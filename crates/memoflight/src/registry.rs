// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Multi-key manager of caching entries.

use std::fmt::Debug;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::runtime::Handle;

use crate::stats::StatsSnapshot;
use crate::sweep::{self, SweepHandle};
use crate::{BoxError, CachingEntry, Config, Error, Result};

/// Maps keys to [`CachingEntry`] instances that share a value type.
///
/// Keys are independent: each entry guards its own state, and lookups never block on another
/// key's producer. The first registration of a key wins; later attempts fail with
/// [`Error::AlreadyRegistered`] and leave the original entry untouched.
///
/// When the registry's configuration enables cleanup (and caching), a background task
/// periodically returns entries holding a stale result to their initial state, so an idle key
/// does not keep serving or holding an outdated value. The task stops when the registry is
/// dropped or [`shutdown`](Self::shutdown) is called.
///
/// # Examples
///
/// ```
/// use memoflight::{BoxError, Config, Registry};
///
/// # async fn example() -> memoflight::Result<()> {
/// let registry = Registry::new(Config::default())?;
///
/// registry.register_default("greeting", || async { Ok::<_, BoxError>("hello".to_string()) })?;
///
/// assert_eq!(registry.get("greeting").await?, "hello");
/// println!("{}", registry.stats_json("greeting", false)?);
/// # Ok(())
/// # }
/// ```
pub struct Registry<T> {
    default_config: Config,
    entries: Arc<DashMap<String, CachingEntry<T>>>,
    sweep: Option<SweepHandle>,
}

impl<T> Debug for Registry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("default_config", &self.default_config)
            .field("entries", &self.entries.len())
            .field("sweep", &self.sweep)
            .finish()
    }
}

impl<T> Registry<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates an empty registry.
    ///
    /// `default_config` is used by [`register_default`](Self::register_default) and decides
    /// whether, and how often, the background sweep runs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the sweep is enabled but no Tokio runtime is available to
    /// run it.
    pub fn new(default_config: Config) -> Result<Self> {
        let entries = Arc::new(DashMap::new());

        let sweep = if default_config.sweep_enabled() {
            let handle = Handle::try_current()
                .map_err(|_no_runtime| Error::config("the background sweep requires a Tokio runtime"))?;
            Some(sweep::spawn(&handle, Arc::downgrade(&entries), default_config.cleanup_period()))
        } else {
            None
        };

        Ok(Self {
            default_config,
            entries,
            sweep,
        })
    }

    /// Registers `producer` under `key` with its own configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRegistered`] if `key` is taken.
    pub fn register<F, Fut, E>(&self, key: impl Into<String>, config: Config, producer: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        match self.entries.entry(key.into()) {
            Entry::Occupied(occupied) => Err(Error::already_registered(occupied.key().clone())),
            Entry::Vacant(vacant) => {
                let entry = CachingEntry::new(vacant.key().clone(), config, producer);
                tracing::event!(
                    name: "memoflight.registered",
                    tracing::Level::DEBUG,
                    cache.key = %vacant.key(),
                );
                vacant.insert(entry);
                Ok(())
            }
        }
    }

    /// Registers `producer` under `key` with the registry's default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRegistered`] if `key` is taken.
    pub fn register_default<F, Fut, E>(&self, key: impl Into<String>, producer: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.register(key, self.default_config, producer)
    }

    /// Returns the value for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownKey`] if nothing is registered under `key`, or
    /// [`Error::ProducerFailure`] if the fetch serving this call failed.
    pub async fn get(&self, key: &str) -> Result<T> {
        let entry = self.entry(key)?;
        entry.get().await
    }
}

impl<T> Registry<T> {
    /// Returns a handle to the entry registered under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownKey`] if nothing is registered under `key`.
    pub fn entry(&self, key: &str) -> Result<CachingEntry<T>> {
        self.entries
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::unknown_key(key))
    }

    /// Returns the statistics of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownKey`] if nothing is registered under `key`.
    pub fn stats_for(&self, key: &str) -> Result<StatsSnapshot> {
        self.entry(key).map(|entry| entry.stats())
    }

    /// Renders the statistics of `key` as JSON, optionally resetting them afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownKey`] if nothing is registered under `key`.
    pub fn stats_json(&self, key: &str, reset: bool) -> Result<String> {
        self.entry(key).map(|entry| entry.stats_json(reset))
    }

    /// Clears the statistics of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownKey`] if nothing is registered under `key`.
    pub fn reset_stats(&self, key: &str) -> Result<()> {
        self.entry(key).map(|entry| entry.reset_stats())
    }

    /// Number of producer calls currently running for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownKey`] if nothing is registered under `key`.
    pub fn in_flight(&self, key: &str) -> Result<usize> {
        self.entry(key).map(|entry| entry.in_flight())
    }

    /// Emits the statistics of every entry as a `memoflight.stats` event.
    pub fn log_stats(&self, reset: bool) {
        for entry in self.entries.iter() {
            tracing::event!(
                name: "memoflight.stats",
                tracing::Level::INFO,
                cache.key = %entry.key(),
                stats = %entry.value().stats_json(reset),
            );
        }
    }

    /// Runs one sweep pass right away and returns how many entries were cleared.
    pub fn sweep_now(&self) -> usize {
        sweep::sweep(&self.entries)
    }

    /// Returns `true` if `key` is registered.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Returns the registered keys, in no particular order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of registered keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every registration.
    ///
    /// Callers already inside [`get`](Self::get) finish against the entry they looked up.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// The configuration used by [`register_default`](Self::register_default).
    #[must_use]
    pub fn default_config(&self) -> &Config {
        &self.default_config
    }

    /// Returns `true` while the background sweep task is attached.
    #[must_use]
    pub fn sweep_running(&self) -> bool {
        self.sweep.is_some()
    }

    /// Stops the background sweep and waits for it to exit.
    pub async fn shutdown(&mut self) {
        if let Some(sweep) = self.sweep.take() {
            sweep.shutdown().await;
        }
    }
}
