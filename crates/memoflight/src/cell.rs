// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Single-assignment result slot shared by coalesced callers.

use std::fmt::Debug;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::{Error, Result};

#[derive(Clone)]
struct Settled<T> {
    outcome: Result<T>,
    completed_at: Instant,
}

/// A thread-safe, single-assignment result slot with timestamps.
///
/// Any number of tasks may [`wait`](Self::wait) on a cell; all of them are released with the
/// same outcome once it is set. A cell may supersede an older cell that has not completed
/// yet. Completing the newer cell then completes the older one with the same outcome, so
/// tasks parked on the older cell are never abandoned. The link is dropped once it has been
/// followed, so at most one predecessor is referenced per cell.
pub struct ResultCell<T> {
    started_at: Instant,
    settled: Mutex<Option<Settled<T>>>,
    notify: Notify,
    predecessor: Mutex<Option<Arc<ResultCell<T>>>>,
}

impl<T> Debug for ResultCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCell")
            .field("started_at", &self.started_at)
            .field("completed", &self.is_completed())
            .finish_non_exhaustive()
    }
}

impl<T: Clone> ResultCell<T> {
    /// Creates an empty cell, stamped with the current time as its start.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::superseding(None)
    }

    /// Creates an empty cell that supersedes `predecessor`.
    ///
    /// Only a predecessor that has not completed yet is retained.
    #[must_use]
    pub fn superseding(predecessor: Option<Arc<Self>>) -> Arc<Self> {
        Arc::new(Self {
            started_at: Instant::now(),
            settled: Mutex::new(None),
            notify: Notify::new(),
            predecessor: Mutex::new(predecessor.filter(|cell| !cell.is_completed())),
        })
    }

    /// Completes the cell with a value.
    ///
    /// Returns `true` if this call set the outcome of this cell.
    pub fn complete(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Completes the cell with an error.
    ///
    /// Returns `true` if this call set the outcome of this cell.
    pub fn fail(&self, error: Error) -> bool {
        self.settle(Err(error))
    }

    /// Sets the outcome once and forwards it to the predecessor, if still linked.
    ///
    /// A cell that already has an outcome keeps it, but a linked predecessor is still
    /// completed.
    pub fn settle(&self, outcome: Result<T>) -> bool {
        let predecessor = self.predecessor.lock().take();

        let first = {
            let mut settled = self.settled.lock();
            if settled.is_none() {
                *settled = Some(Settled {
                    outcome: outcome.clone(),
                    completed_at: Instant::now(),
                });
                true
            } else {
                false
            }
        };

        if first {
            self.notify.notify_waiters();
        }

        if let Some(predecessor) = predecessor {
            predecessor.settle(outcome);
        }

        first
    }

    /// Waits until the cell has an outcome and returns a clone of it.
    pub async fn wait(&self) -> Result<T> {
        loop {
            let mut notified = pin!(self.notify.notified());
            // Register before checking so a concurrent `settle` cannot slip in between.
            notified.as_mut().enable();

            if let Some(outcome) = self.outcome() {
                return outcome;
            }

            notified.await;
        }
    }

    /// Returns the outcome if the cell is completed, without waiting.
    #[must_use]
    pub fn outcome(&self) -> Option<Result<T>> {
        self.settled.lock().as_ref().map(|settled| settled.outcome.clone())
    }
}

impl<T> ResultCell<T> {
    /// When the cell was created, which is when its fetch was launched.
    #[must_use]
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// When the cell received its outcome, if it has one.
    #[must_use]
    pub fn completed_at(&self) -> Option<Instant> {
        self.settled.lock().as_ref().map(|settled| settled.completed_at)
    }

    /// Returns `true` once the outcome is set.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.settled.lock().is_some()
    }

    /// Returns `true` if the outcome is set and is an error.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.settled.lock().as_ref().is_some_and(|settled| settled.outcome.is_err())
    }

    /// Time elapsed since completion, or `None` while pending.
    #[must_use]
    pub fn age(&self) -> Option<Duration> {
        self.completed_at().map(|completed_at| completed_at.elapsed())
    }

    /// Time between launch and completion, or `None` while pending.
    #[must_use]
    pub fn latency(&self) -> Option<Duration> {
        self.completed_at()
            .map(|completed_at| completed_at.saturating_duration_since(self.started_at))
    }

    /// Returns `true` while a superseded cell is linked to this one.
    #[must_use]
    pub fn has_predecessor(&self) -> bool {
        self.predecessor.lock().is_some()
    }
}
