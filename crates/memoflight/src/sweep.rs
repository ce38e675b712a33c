// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Background task that evicts stale results from a registry.

use std::fmt::Debug;
use std::panic::AssertUnwindSafe;
use std::sync::Weak;
use std::time::Duration;

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::CachingEntry;

/// Controls a running sweep task.
///
/// Dropping the handle stops the task at its next wake-up; [`shutdown`](Self::shutdown) also
/// waits for it to exit.
pub(crate) struct SweepHandle {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Debug for SweepHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweepHandle")
            .field("running", &self.task.as_ref().is_some_and(|task| !task.is_finished()))
            .finish()
    }
}

impl SweepHandle {
    pub(crate) async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            // The task may already be gone, in which case there is nobody to tell.
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            // A cancelled or panicked sweep has nothing left to clean up.
            let _ = task.await;
        }
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

pub(crate) fn spawn<T>(handle: &Handle, entries: Weak<DashMap<String, CachingEntry<T>>>, period: Duration) -> SweepHandle
where
    T: Send + Sync + 'static,
{
    let (stop, stopped) = oneshot::channel();
    let task = handle.spawn(run(entries, period, stopped));

    SweepHandle {
        stop: Some(stop),
        task: Some(task),
    }
}

#[cfg_attr(test, mutants::skip)] // Mutating the loop exit conditions makes the task run forever.
async fn run<T>(entries: Weak<DashMap<String, CachingEntry<T>>>, period: Duration, mut stopped: oneshot::Receiver<()>)
where
    T: Send + Sync + 'static,
{
    let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut stopped => break,
            _ = ticks.tick() => {
                let Some(entries) = entries.upgrade() else {
                    break;
                };

                // Housekeeping must never take the task down with it.
                if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| sweep(&entries))) {
                    tracing::event!(
                        name: "memoflight.sweep.failed",
                        tracing::Level::ERROR,
                        error = panic_message(panic.as_ref()),
                    );
                }
            }
        }
    }

    tracing::event!(name: "memoflight.sweep.stopped", tracing::Level::DEBUG, "sweep stopped");
}

/// Runs one pass over `entries` and returns how many were cleared.
pub(crate) fn sweep<T>(entries: &DashMap<String, CachingEntry<T>>) -> usize {
    entries.iter().filter(|entry| entry.value().clear_if_stale()).count()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
