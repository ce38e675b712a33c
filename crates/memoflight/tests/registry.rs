// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for `Registry`.

use std::{
    io::Write,
    sync::{
        Arc, Mutex,
        atomic::{
            AtomicUsize,
            Ordering::{AcqRel, Acquire},
        },
    },
    time::Duration,
};

use memoflight::{BoxError, Config, EntryState, Error, Registry};
use tracing_subscriber::fmt::MakeWriter;

/// Captures formatted log output into a shared buffer.
#[derive(Debug, Clone, Default)]
struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    fn output(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).to_string()
    }

    fn subscriber(&self) -> impl tracing::Subscriber {
        use tracing_subscriber::layer::SubscriberExt;
        tracing_subscriber::registry().with(tracing_subscriber::fmt::layer().with_writer(self.clone()).with_ansi(false))
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogCaptureWriter {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

struct LogCaptureWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl Write for LogCaptureWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn counting_producer(counter: &Arc<AtomicUsize>) -> impl Fn() -> std::future::Ready<Result<usize, BoxError>> + Send + Sync + 'static {
    let counter = Arc::clone(counter);
    move || std::future::ready(Ok(counter.fetch_add(1, AcqRel) + 1))
}

fn no_sweep() -> Config {
    Config::builder().cleanup_enabled(false).build().unwrap()
}

#[tokio::test]
async fn get_delegates_to_registered_entry() {
    let registry = Registry::new(no_sweep()).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    registry.register_default("k", counting_producer(&counter)).unwrap();

    assert_eq!(registry.get("k").await.unwrap(), 1);
    assert_eq!(registry.get("k").await.unwrap(), 1);
    assert_eq!(counter.load(Acquire), 1);
    assert_eq!(registry.stats_for("k").unwrap().hits_from_cache, 1);
}

#[tokio::test]
async fn duplicate_registration_keeps_first_entry() {
    let registry = Registry::new(no_sweep()).unwrap();
    registry
        .register("k", no_sweep(), || async { Ok::<_, BoxError>("first") })
        .unwrap();

    let error = registry
        .register("k", no_sweep(), || async { Ok::<_, BoxError>("second") })
        .unwrap_err();

    assert!(matches!(error, Error::AlreadyRegistered { ref key } if key == "k"));
    assert_eq!(registry.get("k").await.unwrap(), "first");
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn unknown_key_is_reported() {
    let registry = Registry::<u8>::new(no_sweep()).unwrap();

    let error = registry.get("missing").await.unwrap_err();

    assert!(matches!(error, Error::UnknownKey { ref key } if key == "missing"));
    assert!(matches!(registry.stats_for("missing"), Err(Error::UnknownKey { .. })));
}

#[tokio::test]
async fn keys_are_independent() {
    let registry = Arc::new(Registry::new(no_sweep()).unwrap());
    registry
        .register_default("slow", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, BoxError>(0_u8)
        })
        .unwrap();
    registry
        .register_default("fast", || async { Ok::<_, BoxError>(1_u8) })
        .unwrap();

    let slow = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.get("slow").await })
    };
    tokio::task::yield_now().await;

    let fast = tokio::time::timeout(Duration::from_secs(1), registry.get("fast")).await;
    assert_eq!(fast.unwrap().unwrap(), 1);
    assert_eq!(registry.in_flight("slow").unwrap(), 1);

    slow.abort();
}

#[tokio::test(start_paused = true)]
async fn sweep_returns_idle_stale_entries_to_init() {
    let registry_config = Config::builder()
        .cleanup_period(Duration::from_millis(50))
        .build()
        .unwrap();
    let entry_config = Config::builder().ttl(Duration::from_millis(10)).build().unwrap();

    let registry = Registry::new(registry_config).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    registry.register("k", entry_config, counting_producer(&counter)).unwrap();

    assert_eq!(registry.get("k").await.unwrap(), 1);
    assert_eq!(registry.entry("k").unwrap().state(), EntryState::Cached);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(registry.entry("k").unwrap().state(), EntryState::Init);

    // The next call fetches anew instead of serving the old value.
    assert_eq!(registry.get("k").await.unwrap(), 2);
    assert_eq!(counter.load(Acquire), 2);
}

#[tokio::test(start_paused = true)]
async fn sweep_now_runs_a_single_pass() {
    let registry = Registry::new(no_sweep()).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    registry
        .register("stale", Config::builder().ttl(Duration::from_millis(10)).build().unwrap(), counting_producer(&counter))
        .unwrap();
    registry
        .register("fresh", Config::builder().ttl(Duration::from_secs(10)).build().unwrap(), counting_producer(&counter))
        .unwrap();

    registry.get("stale").await.unwrap();
    registry.get("fresh").await.unwrap();
    tokio::time::advance(Duration::from_millis(20)).await;

    assert_eq!(registry.sweep_now(), 1);
    assert_eq!(registry.entry("stale").unwrap().state(), EntryState::Init);
    assert_eq!(registry.entry("fresh").unwrap().state(), EntryState::Cached);
}

#[tokio::test(start_paused = true)]
async fn dropping_registry_stops_sweep() {
    let registry = Registry::<u8>::new(Config::default()).unwrap();
    drop(registry);

    // Nothing is left to keep the runtime busy; this just must not hang or panic.
    tokio::time::sleep(Duration::from_secs(30)).await;
}

#[tokio::test]
async fn stats_reset_and_json() {
    let registry = Registry::new(no_sweep()).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    registry.register_default("k", counting_producer(&counter)).unwrap();
    registry.get("k").await.unwrap();

    let json: serde_json::Value = serde_json::from_str(&registry.stats_json("k", false).unwrap()).unwrap();
    assert_eq!(json["key"], "k");
    assert_eq!(json["totalCalls"], 1);

    registry.reset_stats("k").unwrap();
    assert_eq!(registry.stats_for("k").unwrap().total_calls, 0);
}

#[tokio::test]
async fn log_stats_emits_one_event_per_entry() {
    let capture = LogCapture::default();
    let _guard = tracing::subscriber::set_default(capture.subscriber());

    let registry = Registry::new(no_sweep()).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    registry.register_default("alpha", counting_producer(&counter)).unwrap();
    registry.register_default("beta", counting_producer(&counter)).unwrap();
    registry.get("alpha").await.unwrap();

    registry.log_stats(true);

    let output = capture.output();
    assert!(output.contains("cache.key=alpha"), "{output}");
    assert!(output.contains("cache.key=beta"), "{output}");
    assert!(output.contains("\"totalCalls\":1"), "{output}");
    assert_eq!(registry.stats_for("alpha").unwrap().total_calls, 0);
}

#[tokio::test]
async fn producer_failure_is_logged() {
    let capture = LogCapture::default();
    let _guard = tracing::subscriber::set_default(capture.subscriber());

    let registry = Registry::new(no_sweep()).unwrap();
    registry
        .register_default("broken", || async { Err::<u8, BoxError>("connection refused".into()) })
        .unwrap();

    let error = registry.get("broken").await.unwrap_err();

    assert!(error.is_producer_failure());
    let output = capture.output();
    assert!(output.contains("WARN"), "{output}");
    assert!(output.contains("connection refused"), "{output}");
}
