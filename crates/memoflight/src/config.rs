// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Tunables for a cache entry and for the registry's background sweep.

use std::collections::HashMap;
use std::hash::BuildHasher;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::{Error, Result};

const DEFAULT_TTL: Duration = Duration::from_millis(100);
const DEFAULT_MAX_CONCURRENT: usize = 10;
const DEFAULT_STAGGER_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_CLEANUP_PERIOD: Duration = Duration::from_millis(5000);

const TTL_PROPERTY: &str = "ttl_ms";
const MAX_CONCURRENT_PROPERTY: &str = "max_concurrent";
const STAGGER_DELAY_PROPERTY: &str = "stagger_delay_ms";
const CLEANUP_ENABLED_PROPERTY: &str = "cleanup_enabled";
const CLEANUP_PERIOD_PROPERTY: &str = "cleanup_period_ms";

/// Immutable tunables of a cache entry.
///
/// A `Config` can only be obtained through [`Config::default`], [`Config::builder`] or
/// [`Config::from_properties`], all of which reject an enabled cleanup sweep with a zero
/// period while caching is on.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use memoflight::Config;
///
/// let config = Config::builder()
///     .ttl(Duration::from_secs(1))
///     .max_concurrent(2)
///     .stagger_delay(Duration::from_millis(50))
///     .build()?;
///
/// assert!(config.caching_enabled());
/// # Ok::<(), memoflight::Error>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(rename = "ttlMs", serialize_with = "crate::stats::serialize_millis")]
    ttl: Duration,
    max_concurrent: usize,
    #[serde(rename = "staggerDelayMs", serialize_with = "crate::stats::serialize_millis")]
    stagger_delay: Duration,
    cleanup_enabled: bool,
    #[serde(rename = "cleanupPeriodMs", serialize_with = "crate::stats::serialize_millis")]
    cleanup_period: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            stagger_delay: DEFAULT_STAGGER_DELAY,
            cleanup_enabled: true,
            cleanup_period: DEFAULT_CLEANUP_PERIOD,
        }
    }
}

impl Config {
    /// Creates a builder seeded with the default values.
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder { config: Self::default() }
    }

    /// Reads a configuration from string properties.
    ///
    /// The recognized keys are `ttl_ms`, `max_concurrent`, `stagger_delay_ms`,
    /// `cleanup_enabled` and `cleanup_period_ms`, each prefixed with `prefix` followed by a
    /// dot. A trailing dot on `prefix` is accepted, and an empty prefix selects the bare keys.
    /// Missing keys keep their default value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a present value cannot be parsed, or if the resulting
    /// configuration is invalid.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::collections::HashMap;
    /// use std::time::Duration;
    ///
    /// use memoflight::Config;
    ///
    /// let properties = HashMap::from([
    ///     ("users.ttl_ms".to_string(), "250".to_string()),
    ///     ("users.max_concurrent".to_string(), "4".to_string()),
    /// ]);
    ///
    /// let config = Config::from_properties("users", &properties)?;
    /// assert_eq!(config.ttl(), Duration::from_millis(250));
    /// assert_eq!(config.max_concurrent(), 4);
    /// # Ok::<(), memoflight::Error>(())
    /// ```
    pub fn from_properties<S: BuildHasher>(prefix: &str, properties: &HashMap<String, String, S>) -> Result<Self> {
        let reader = PropertyReader { prefix, properties };
        let mut builder = Self::builder();

        if let Some(ttl) = reader.read::<u64>(TTL_PROPERTY)? {
            builder = builder.ttl(Duration::from_millis(ttl));
        }
        if let Some(max_concurrent) = reader.read::<usize>(MAX_CONCURRENT_PROPERTY)? {
            builder = builder.max_concurrent(max_concurrent);
        }
        if let Some(stagger) = reader.read::<u64>(STAGGER_DELAY_PROPERTY)? {
            builder = builder.stagger_delay(Duration::from_millis(stagger));
        }
        if let Some(enabled) = reader.read::<bool>(CLEANUP_ENABLED_PROPERTY)? {
            builder = builder.cleanup_enabled(enabled);
        }
        if let Some(period) = reader.read::<u64>(CLEANUP_PERIOD_PROPERTY)? {
            builder = builder.cleanup_period(Duration::from_millis(period));
        }

        builder.build()
    }

    /// How long a completed result is served before it is considered stale.
    ///
    /// Zero disables caching: every call outside an in-flight fetch launches the producer.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Maximum number of simultaneous producer calls for one key. Zero means unbounded.
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Minimum spacing between two producer launches for the same key.
    #[must_use]
    pub fn stagger_delay(&self) -> Duration {
        self.stagger_delay
    }

    /// Whether a registry built with this configuration runs the background sweep.
    #[must_use]
    pub fn cleanup_enabled(&self) -> bool {
        self.cleanup_enabled
    }

    /// Period of the background sweep.
    #[must_use]
    pub fn cleanup_period(&self) -> Duration {
        self.cleanup_period
    }

    /// Returns `true` when completed results are kept and served.
    #[must_use]
    pub fn caching_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// Returns `true` when the registry should run its background sweep.
    #[must_use]
    pub fn sweep_enabled(&self) -> bool {
        self.cleanup_enabled && self.caching_enabled()
    }

    pub(crate) fn allows_another_fetch(&self, in_flight: usize) -> bool {
        self.max_concurrent == 0 || in_flight < self.max_concurrent
    }

    fn validate(self) -> Result<Self> {
        if self.sweep_enabled() && self.cleanup_period.is_zero() {
            return Err(Error::config("cleanup period must be positive when cleanup and caching are enabled"));
        }
        Ok(self)
    }
}

/// Builder for [`Config`].
#[derive(Debug, Clone)]
#[must_use]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Sets how long a completed result is served. Zero disables caching.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.config.ttl = ttl;
        self
    }

    /// Sets the maximum number of simultaneous producer calls per key. Zero means unbounded.
    pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.config.max_concurrent = max_concurrent;
        self
    }

    /// Sets the minimum spacing between producer launches for the same key.
    pub fn stagger_delay(mut self, stagger_delay: Duration) -> Self {
        self.config.stagger_delay = stagger_delay;
        self
    }

    /// Enables or disables the background sweep.
    pub fn cleanup_enabled(mut self, enabled: bool) -> Self {
        self.config.cleanup_enabled = enabled;
        self
    }

    /// Sets the period of the background sweep.
    pub fn cleanup_period(mut self, period: Duration) -> Self {
        self.config.cleanup_period = period;
        self
    }

    /// Validates and returns the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when cleanup and caching are both enabled but the cleanup
    /// period is zero.
    pub fn build(self) -> Result<Config> {
        self.config.validate()
    }
}

struct PropertyReader<'a, S> {
    prefix: &'a str,
    properties: &'a HashMap<String, String, S>,
}

impl<S: BuildHasher> PropertyReader<'_, S> {
    fn key(&self, name: &str) -> String {
        let prefix = self.prefix.trim();
        if prefix.is_empty() {
            name.to_string()
        } else if prefix.ends_with('.') {
            format!("{prefix}{name}")
        } else {
            format!("{prefix}.{name}")
        }
    }

    fn read<T: FromStr>(&self, name: &str) -> Result<Option<T>> {
        let key = self.key(name);
        self.properties
            .get(&key)
            .map(|raw| {
                raw.trim()
                    .parse::<T>()
                    .map_err(|_parse_error| Error::config(format!("property '{key}' has an invalid value '{raw}'")))
            })
            .transpose()
    }
}
