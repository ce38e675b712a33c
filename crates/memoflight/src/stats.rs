// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-key hit counters and timing gauges.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Serialize, Serializer};

/// Counters are reset together once any of them gets this close to `u64::MAX`.
const OVERFLOW_HEADROOM: u64 = 100_000;
const LIMIT: u64 = u64::MAX - OVERFLOW_HEADROOM;

pub(crate) fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    #[expect(clippy::cast_precision_loss, reason = "sub-nanosecond precision is irrelevant for reporting")]
    let millis = duration.as_nanos() as f64 / 1_000_000.0;
    serializer.serialize_f64(millis)
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    hits_from_cache: u64,
    hits_from_in_flight: u64,
    hits_from_producer: u64,
    total_calls: u64,
    total_run_time_ns: u64,
    max_concurrent: u64,
    max_producer_latency_ns: u64,
    min_producer_latency_ns: Option<u64>,
    max_result_age_ns: u64,
    max_get_time_ns: u64,
    max_join_wait_ns: u64,
}

impl Counters {
    fn near_overflow(&self) -> bool {
        [
            self.hits_from_cache,
            self.hits_from_in_flight,
            self.hits_from_producer,
            self.total_calls,
            self.total_run_time_ns,
            self.max_concurrent,
        ]
        .into_iter()
        .any(|counter| counter > LIMIT)
    }
}

/// Collects usage statistics for one cache key.
///
/// All recording methods are serialized internally. Before each update the collector checks
/// whether any counter has come within a fixed headroom of `u64::MAX`; if so all counters are
/// reset together, which keeps their ratios meaningful in long-lived processes.
#[derive(Debug)]
pub struct StatsCollector {
    key: String,
    counters: Mutex<Counters>,
}

impl StatsCollector {
    /// Creates an empty collector for `key`.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Key the statistics belong to.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Records a call served from a fresh cached result.
    pub fn record_cache_hit(&self) {
        self.update(|c| c.hits_from_cache += 1);
    }

    /// Records a call that joined a fetch already in flight.
    pub fn record_in_flight_hit(&self) {
        self.update(|c| c.hits_from_in_flight += 1);
    }

    /// Records a call answered by a producer run it launched.
    pub fn record_producer_hit(&self) {
        self.update(|c| c.hits_from_producer += 1);
    }

    /// Records how long a joining caller waited for the fetch it joined.
    pub fn record_join_wait(&self, waited: Duration) {
        self.update(|c| c.max_join_wait_ns = c.max_join_wait_ns.max(nanos(waited)));
    }

    /// Records the timing of a completed producer invocation.
    ///
    /// `result_age` is the age of the result this run replaced, and `concurrent` is the number
    /// of producer calls running for the key when this one was launched, itself included.
    pub fn record_producer_run(&self, latency: Duration, result_age: Duration, concurrent: usize) {
        let latency = nanos(latency);
        let result_age = nanos(result_age);
        let concurrent = u64::try_from(concurrent).unwrap_or(u64::MAX);

        self.update(|c| {
            c.max_producer_latency_ns = c.max_producer_latency_ns.max(latency);
            c.min_producer_latency_ns = Some(c.min_producer_latency_ns.map_or(latency, |min| min.min(latency)));
            c.max_result_age_ns = c.max_result_age_ns.max(result_age);
            c.max_concurrent = c.max_concurrent.max(concurrent);
        });
    }

    /// Records the end of a `get` call, whichever way it was served.
    pub fn record_call(&self, elapsed: Duration) {
        let elapsed = nanos(elapsed);

        self.update(|c| {
            c.total_calls += 1;
            c.total_run_time_ns = c.total_run_time_ns.saturating_add(elapsed);
            c.max_get_time_ns = c.max_get_time_ns.max(elapsed);
        });
    }

    /// Returns a point-in-time copy of the statistics.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let c = *self.counters.lock();

        let cache_hit_ratio = if c.total_calls == 0 {
            0.0
        } else {
            #[expect(clippy::cast_precision_loss, reason = "ratio does not need full u64 precision")]
            let (hits, calls) = ((c.hits_from_cache + c.hits_from_in_flight) as f64, c.total_calls as f64);
            hits / calls
        };

        let avg_run_time = c.total_run_time_ns.checked_div(c.total_calls).unwrap_or(0);

        StatsSnapshot {
            key: self.key.clone(),
            total_calls: c.total_calls,
            hits_from_cache: c.hits_from_cache,
            hits_from_in_flight: c.hits_from_in_flight,
            hits_from_producer: c.hits_from_producer,
            cache_hit_ratio,
            max_concurrent: c.max_concurrent,
            max_producer_latency: Duration::from_nanos(c.max_producer_latency_ns),
            min_producer_latency: Duration::from_nanos(c.min_producer_latency_ns.unwrap_or(0)),
            max_result_age: Duration::from_nanos(c.max_result_age_ns),
            avg_run_time: Duration::from_nanos(avg_run_time),
            max_get_time: Duration::from_nanos(c.max_get_time_ns),
            max_join_wait: Duration::from_nanos(c.max_join_wait_ns),
        }
    }

    /// Clears every counter and gauge.
    pub fn reset(&self) {
        *self.counters.lock() = Counters::default();
    }

    fn update(&self, f: impl FnOnce(&mut Counters)) {
        let mut counters = self.counters.lock();
        if counters.near_overflow() {
            *counters = Counters::default();
        }
        f(&mut counters);
    }
}

/// A point-in-time copy of a key's statistics.
///
/// Serializes to JSON with camelCase field names; durations are rendered in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// Key the statistics belong to.
    pub key: String,
    /// Number of completed `get` calls.
    pub total_calls: u64,
    /// Calls served from a fresh cached result.
    pub hits_from_cache: u64,
    /// Calls that joined a fetch already in flight.
    pub hits_from_in_flight: u64,
    /// Calls answered by a producer run they launched.
    pub hits_from_producer: u64,
    /// `(hits_from_cache + hits_from_in_flight) / total_calls`, or zero without calls.
    pub cache_hit_ratio: f64,
    /// Highest number of simultaneous producer calls observed.
    pub max_concurrent: u64,
    /// Slowest producer invocation.
    #[serde(serialize_with = "serialize_millis")]
    pub max_producer_latency: Duration,
    /// Fastest producer invocation, zero if the producer never ran.
    #[serde(serialize_with = "serialize_millis")]
    pub min_producer_latency: Duration,
    /// Oldest result a producer run replaced.
    #[serde(serialize_with = "serialize_millis")]
    pub max_result_age: Duration,
    /// Average duration of a `get` call.
    #[serde(serialize_with = "serialize_millis")]
    pub avg_run_time: Duration,
    /// Longest `get` call.
    #[serde(serialize_with = "serialize_millis")]
    pub max_get_time: Duration,
    /// Longest time a joining caller waited.
    #[serde(serialize_with = "serialize_millis")]
    pub max_join_wait: Duration,
}

impl StatsSnapshot {
    /// Renders the snapshot as a JSON object.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|error| format!("{{\"key\":{:?},\"error\":{:?}}}", self.key, error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_collector_has_zero_ratio() {
        let stats = StatsCollector::new("k");
        let snapshot = stats.snapshot();

        assert_eq!(snapshot.key, "k");
        assert_eq!(snapshot.total_calls, 0);
        assert!(snapshot.cache_hit_ratio.abs() < f64::EPSILON);
        assert_eq!(snapshot.avg_run_time, Duration::ZERO);
        assert_eq!(snapshot.min_producer_latency, Duration::ZERO);
    }

    #[test]
    fn hit_ratio_counts_cache_and_in_flight_hits() {
        let stats = StatsCollector::new("k");

        stats.record_cache_hit();
        stats.record_in_flight_hit();
        stats.record_producer_hit();
        stats.record_producer_hit();
        stats.record_producer_run(Duration::from_millis(10), Duration::ZERO, 1);
        for _ in 0..4 {
            stats.record_call(Duration::from_millis(4));
        }

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_calls, 4);
        assert!((snapshot.cache_hit_ratio - 0.5).abs() < f64::EPSILON);
        assert_eq!(snapshot.avg_run_time, Duration::from_millis(4));
        assert_eq!(snapshot.max_get_time, Duration::from_millis(4));
    }

    #[test]
    fn producer_runs_update_gauges() {
        let stats = StatsCollector::new("k");

        stats.record_producer_run(Duration::from_millis(30), Duration::from_millis(500), 2);
        stats.record_producer_run(Duration::from_millis(10), Duration::from_millis(100), 1);
        stats.record_producer_run(Duration::from_millis(20), Duration::ZERO, 3);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.hits_from_producer, 0, "runs are timed, callers are counted");
        assert_eq!(snapshot.max_producer_latency, Duration::from_millis(30));
        assert_eq!(snapshot.min_producer_latency, Duration::from_millis(10));
        assert_eq!(snapshot.max_result_age, Duration::from_millis(500));
        assert_eq!(snapshot.max_concurrent, 3);
    }

    #[test]
    fn join_wait_keeps_maximum() {
        let stats = StatsCollector::new("k");
        stats.record_join_wait(Duration::from_millis(8));
        stats.record_join_wait(Duration::from_millis(3));

        assert_eq!(stats.snapshot().max_join_wait, Duration::from_millis(8));
    }

    #[test]
    fn reset_clears_everything() {
        let stats = StatsCollector::new("k");
        stats.record_producer_hit();
        stats.record_producer_run(Duration::from_millis(1), Duration::ZERO, 1);
        stats.record_call(Duration::from_millis(1));

        stats.reset();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_calls, 0);
        assert_eq!(snapshot.hits_from_cache, 0);
        assert_eq!(snapshot.hits_from_producer, 0);
        assert_eq!(snapshot.max_concurrent, 0);
    }

    #[test]
    fn counters_reset_together_near_overflow() {
        let stats = StatsCollector::new("k");
        {
            let mut counters = stats.counters.lock();
            counters.hits_from_cache = LIMIT + 1;
            counters.hits_from_in_flight = 5;
            counters.total_calls = 7;
        }

        stats.record_in_flight_hit();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.hits_from_cache, 0);
        assert_eq!(snapshot.hits_from_in_flight, 1);
        assert_eq!(snapshot.total_calls, 0);
    }

    #[test]
    fn counters_at_limit_are_kept() {
        let stats = StatsCollector::new("k");
        stats.counters.lock().total_calls = LIMIT;

        stats.record_cache_hit();

        assert_eq!(stats.snapshot().total_calls, LIMIT);
    }

    #[test]
    fn json_uses_camel_case_names() {
        let stats = StatsCollector::new("users");
        stats.record_cache_hit();
        stats.record_call(Duration::from_millis(2));

        let json: serde_json::Value = serde_json::from_str(&stats.snapshot().to_json()).unwrap();

        assert_eq!(json["key"], "users");
        assert_eq!(json["totalCalls"], 1);
        assert_eq!(json["hitsFromCache"], 1);
        assert_eq!(json["hitsFromInFlight"], 0);
        assert_eq!(json["hitsFromProducer"], 0);
        assert_eq!(json["cacheHitRatio"], 1.0);
        assert_eq!(json["avgRunTime"], 2.0);
        for field in ["maxConcurrent", "maxProducerLatency", "minProducerLatency", "maxResultAge"] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
    }
}
