//! Lock-free metrics collection and periodic reporting
//!
//! Counters are plain atomics updated from the dispatcher, session and
//! refresher tasks. `report()` swaps the per-interval histogram; `snapshot()`
//! (Prometheus scrapes) leaves it in place.
//!
//! NOTE: Relaxed ordering throughout. These are statistics; nothing reads
//! them to make decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Write round-trip bucket boundaries (milliseconds)
/// Buckets: ≤10, ≤20, ≤40, ≤80, ≤160, ≤320, ≤640, ≤1280, ≤2560, ≤5120, >5120 ms
const BUCKET_BOUNDS: [u64; 10] = [10, 20, 40, 80, 160, 320, 640, 1280, 2560, 5120];
const NUM_BUCKETS: usize = 11;

pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Session state values for the Prometheus gauge
pub const SESSION_STATE_IDLE: u64 = 0;
pub const SESSION_STATE_SCANNING: u64 = 1;
pub const SESSION_STATE_CONNECTING: u64 = 2;
pub const SESSION_STATE_CONNECTED: u64 = 3;
pub const SESSION_STATE_DISCONNECTING: u64 = 4;

#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].load(Ordering::Relaxed))
}

#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile).ceil() as u64;
    let mut cumulative = 0u64;

    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [10, 20, 40, 80, 160, 320, 640, 1280, 2560, 5120, 10240];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Dispatcher ticks (monotonic)
    ticks_total: AtomicU64,
    /// Ticks skipped because no fresh position was known (monotonic)
    ticks_no_position: AtomicU64,
    /// Position fixes received (monotonic)
    positions_total: AtomicU64,
    /// Steps found due (monotonic)
    steps_matched_total: AtomicU64,
    /// Matches suppressed by the repeat guard (monotonic)
    steps_suppressed_total: AtomicU64,
    /// Messages handed to the session (monotonic)
    messages_queued_total: AtomicU64,
    /// Messages rejected by the session (monotonic)
    messages_rejected_total: AtomicU64,
    /// Writes acknowledged by the peripheral (monotonic)
    messages_delivered_total: AtomicU64,
    write_failures_total: AtomicU64,
    connect_failures_total: AtomicU64,
    discovery_failures_total: AtomicU64,
    scans_started_total: AtomicU64,
    disconnects_total: AtomicU64,
    route_loads_total: AtomicU64,
    route_failures_total: AtomicU64,
    /// Current session state (see SESSION_STATE_*)
    session_state: AtomicU64,
    /// Steps in the active route
    route_steps: AtomicU64,
    /// Write+readback latency histogram (reset on report)
    write_latency_buckets: [AtomicU64; NUM_BUCKETS],
    write_latency_sum_ms: AtomicU64,
    write_latency_max_ms: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            ticks_total: AtomicU64::new(0),
            ticks_no_position: AtomicU64::new(0),
            positions_total: AtomicU64::new(0),
            steps_matched_total: AtomicU64::new(0),
            steps_suppressed_total: AtomicU64::new(0),
            messages_queued_total: AtomicU64::new(0),
            messages_rejected_total: AtomicU64::new(0),
            messages_delivered_total: AtomicU64::new(0),
            write_failures_total: AtomicU64::new(0),
            connect_failures_total: AtomicU64::new(0),
            discovery_failures_total: AtomicU64::new(0),
            scans_started_total: AtomicU64::new(0),
            disconnects_total: AtomicU64::new(0),
            route_loads_total: AtomicU64::new(0),
            route_failures_total: AtomicU64::new(0),
            session_state: AtomicU64::new(SESSION_STATE_IDLE),
            route_steps: AtomicU64::new(0),
            write_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            write_latency_sum_ms: AtomicU64::new(0),
            write_latency_max_ms: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_tick(&self) {
        self.ticks_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_tick_no_position(&self) {
        self.ticks_no_position.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_position(&self) {
        self.positions_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_step_matched(&self) {
        self.steps_matched_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_step_suppressed(&self) {
        self.steps_suppressed_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_message_queued(&self) {
        self.messages_queued_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_message_rejected(&self) {
        self.messages_rejected_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an acknowledged write with its write+readback round trip
    #[inline]
    pub fn record_delivered(&self, latency_ms: u64) {
        self.messages_delivered_total.fetch_add(1, Ordering::Relaxed);
        self.write_latency_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        self.write_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        update_atomic_max(&self.write_latency_max_ms, latency_ms);
    }

    #[inline]
    pub fn record_write_failure(&self) {
        self.write_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_connect_failure(&self) {
        self.connect_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_discovery_failure(&self) {
        self.discovery_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_scan_started(&self) {
        self.scans_started_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_disconnect(&self) {
        self.disconnects_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_route_loaded(&self, steps: usize) {
        self.route_loads_total.fetch_add(1, Ordering::Relaxed);
        self.route_steps.store(steps as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_route_failure(&self) {
        self.route_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_session_state(&self, state: u64) {
        self.session_state.store(state, Ordering::Relaxed);
    }

    pub fn session_state(&self) -> u64 {
        self.session_state.load(Ordering::Relaxed)
    }

    pub fn messages_delivered(&self) -> u64 {
        self.messages_delivered_total.load(Ordering::Relaxed)
    }

    pub fn ticks_total(&self) -> u64 {
        self.ticks_total.load(Ordering::Relaxed)
    }

    /// Snapshot all counters, resetting the per-interval latency histogram
    pub fn report(&self) -> MetricsSummary {
        self.summarize(true)
    }

    /// Snapshot all counters without touching the histogram (for scrapes)
    pub fn snapshot(&self) -> MetricsSummary {
        self.summarize(false)
    }

    fn summarize(&self, reset: bool) -> MetricsSummary {
        let (write_lat_buckets, write_lat_sum, write_lat_max_ms) = if reset {
            (
                swap_buckets(&self.write_latency_buckets),
                self.write_latency_sum_ms.swap(0, Ordering::Relaxed),
                self.write_latency_max_ms.swap(0, Ordering::Relaxed),
            )
        } else {
            (
                load_buckets(&self.write_latency_buckets),
                self.write_latency_sum_ms.load(Ordering::Relaxed),
                self.write_latency_max_ms.load(Ordering::Relaxed),
            )
        };
        let write_count: u64 = write_lat_buckets.iter().sum();
        let write_lat_avg_ms = if write_count > 0 { write_lat_sum / write_count } else { 0 };

        let interval_secs = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            if reset {
                *last = Instant::now();
            }
            elapsed.as_secs_f64()
        };

        MetricsSummary {
            interval_secs,
            ticks_total: self.ticks_total.load(Ordering::Relaxed),
            ticks_no_position: self.ticks_no_position.load(Ordering::Relaxed),
            positions_total: self.positions_total.load(Ordering::Relaxed),
            steps_matched_total: self.steps_matched_total.load(Ordering::Relaxed),
            steps_suppressed_total: self.steps_suppressed_total.load(Ordering::Relaxed),
            messages_queued_total: self.messages_queued_total.load(Ordering::Relaxed),
            messages_rejected_total: self.messages_rejected_total.load(Ordering::Relaxed),
            messages_delivered_total: self.messages_delivered_total.load(Ordering::Relaxed),
            write_failures_total: self.write_failures_total.load(Ordering::Relaxed),
            connect_failures_total: self.connect_failures_total.load(Ordering::Relaxed),
            discovery_failures_total: self.discovery_failures_total.load(Ordering::Relaxed),
            scans_started_total: self.scans_started_total.load(Ordering::Relaxed),
            disconnects_total: self.disconnects_total.load(Ordering::Relaxed),
            route_loads_total: self.route_loads_total.load(Ordering::Relaxed),
            route_failures_total: self.route_failures_total.load(Ordering::Relaxed),
            session_state: self.session_state.load(Ordering::Relaxed),
            route_steps: self.route_steps.load(Ordering::Relaxed),
            write_lat_buckets,
            write_lat_sum_ms: write_lat_sum,
            write_lat_avg_ms,
            write_lat_max_ms,
            write_lat_p99_ms: percentile_from_buckets(&write_lat_buckets, 0.99),
        }
    }
}

/// Point-in-time view produced by [`Metrics::report`]
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub interval_secs: f64,
    pub ticks_total: u64,
    pub ticks_no_position: u64,
    pub positions_total: u64,
    pub steps_matched_total: u64,
    pub steps_suppressed_total: u64,
    pub messages_queued_total: u64,
    pub messages_rejected_total: u64,
    pub messages_delivered_total: u64,
    pub write_failures_total: u64,
    pub connect_failures_total: u64,
    pub discovery_failures_total: u64,
    pub scans_started_total: u64,
    pub disconnects_total: u64,
    pub route_loads_total: u64,
    pub route_failures_total: u64,
    pub session_state: u64,
    pub route_steps: u64,
    pub write_lat_buckets: [u64; NUM_BUCKETS],
    pub write_lat_sum_ms: u64,
    pub write_lat_avg_ms: u64,
    pub write_lat_max_ms: u64,
    pub write_lat_p99_ms: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            ticks = %self.ticks_total,
            ticks_no_position = %self.ticks_no_position,
            positions = %self.positions_total,
            steps_matched = %self.steps_matched_total,
            queued = %self.messages_queued_total,
            delivered = %self.messages_delivered_total,
            write_failures = %self.write_failures_total,
            connect_failures = %self.connect_failures_total,
            session_state = %self.session_state,
            route_steps = %self.route_steps,
            write_p99_ms = %self.write_lat_p99_ms,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.ticks_total(), 0);
        assert_eq!(metrics.session_state(), SESSION_STATE_IDLE);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(10), 0);
        assert_eq!(bucket_index(11), 1);
        assert_eq!(bucket_index(5120), 9);
        assert_eq!(bucket_index(9999), 10);
    }

    #[test]
    fn test_record_delivered() {
        let metrics = Metrics::new();
        metrics.record_delivered(15);
        metrics.record_delivered(300);
        assert_eq!(metrics.messages_delivered(), 2);

        let summary = metrics.report();
        assert_eq!(summary.messages_delivered_total, 2);
        assert_eq!(summary.write_lat_buckets[1], 1);
        assert_eq!(summary.write_lat_buckets[5], 1);
        assert_eq!(summary.write_lat_avg_ms, 157);
        assert_eq!(summary.write_lat_max_ms, 300);
        assert_eq!(summary.write_lat_p99_ms, 320);
    }

    #[test]
    fn test_report_resets_histogram_only() {
        let metrics = Metrics::new();
        metrics.record_delivered(5);
        metrics.record_tick();
        let _ = metrics.report();

        let summary = metrics.report();
        assert_eq!(summary.write_lat_buckets.iter().sum::<u64>(), 0);
        assert_eq!(summary.write_lat_max_ms, 0);
        assert_eq!(summary.messages_delivered_total, 1);
        assert_eq!(summary.ticks_total, 1);
    }

    #[test]
    fn test_snapshot_keeps_histogram() {
        let metrics = Metrics::new();
        metrics.record_delivered(30);
        assert_eq!(metrics.snapshot().write_lat_buckets[2], 1);
        assert_eq!(metrics.snapshot().write_lat_sum_ms, 30);
        assert_eq!(metrics.report().write_lat_buckets[2], 1);
        assert_eq!(metrics.snapshot().write_lat_buckets[2], 0);
    }

    #[test]
    fn test_route_loaded_sets_gauge() {
        let metrics = Metrics::new();
        metrics.record_route_loaded(12);
        let summary = metrics.report();
        assert_eq!(summary.route_loads_total, 1);
        assert_eq!(summary.route_steps, 12);
    }
}
