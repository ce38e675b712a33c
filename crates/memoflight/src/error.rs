// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::borrow::Cow;
use std::sync::Arc;

/// The error type producers return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A specialized `Result` type for memoflight operations that return a
/// memoflight [`Error`][enum@Error] on failure.
pub type Result<T> = std::result::Result<T, Error>;

/// An error originating in memoflight.
///
/// `AlreadyRegistered`, `UnknownKey` and `Config` are caller mistakes. `ProducerFailure`
/// carries the error raised by a wrapped producer; every caller joined on the same fetch
/// receives a clone of the same error, and [`source()`](std::error::Error::source) yields
/// the producer's error unchanged.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A cache entry is already registered under this key.
    #[error("a cache entry is already registered for key '{key}'")]
    AlreadyRegistered {
        /// The duplicate key.
        key: String,
    },

    /// No cache entry is registered under this key.
    #[error("no cache entry is registered for key '{key}'")]
    UnknownKey {
        /// The key that was looked up.
        key: String,
    },

    /// The producer of a cache entry failed.
    #[error("producer for key '{key}' failed: {source}")]
    ProducerFailure {
        /// Key of the entry whose producer failed.
        key: String,
        /// The producer's own error.
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(Cow<'static, str>),
}

impl Error {
    pub(crate) fn already_registered(key: impl Into<String>) -> Self {
        Self::AlreadyRegistered { key: key.into() }
    }

    pub(crate) fn unknown_key(key: impl Into<String>) -> Self {
        Self::UnknownKey { key: key.into() }
    }

    pub(crate) fn producer_failure(key: impl Into<String>, source: BoxError) -> Self {
        Self::ProducerFailure {
            key: key.into(),
            source: Arc::from(source),
        }
    }

    pub(crate) fn config(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Config(message.into())
    }

    /// Returns `true` if this error was raised by a producer rather than by memoflight itself.
    #[must_use]
    pub fn is_producer_failure(&self) -> bool {
        matches!(self, Self::ProducerFailure { .. })
    }

    /// Returns the error raised by the producer, if this is a producer failure.
    #[must_use]
    pub fn producer_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Self::ProducerFailure { source, .. } => Some(&**source),
            _ => None,
        }
    }
}
