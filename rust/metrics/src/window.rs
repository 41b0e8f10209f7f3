use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Number of log2 latency classes. Class `i` covers latencies in
/// `[2^i, 2^(i+1))` microseconds; 40 classes reach past 12 days.
const LATENCY_CLASSES: usize = 40;

/////////////////////////////////////////// WindowBucket ///////////////////////////////////////////

/// One second of recorded activity. Buckets are reused ring-style; `epoch`
/// is the absolute second the bucket currently represents, so a reader can
/// tell live data from stale data without any locking.
#[derive(Debug)]
struct WindowBucket {
    epoch: AtomicU64,
    operations: AtomicU64,
    bytes: AtomicU64,
    latency_classes: [AtomicU64; LATENCY_CLASSES],
}

impl WindowBucket {
    fn empty() -> WindowBucket {
        WindowBucket {
            epoch: AtomicU64::new(u64::MAX),
            operations: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            latency_classes: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Rotate the bucket to `epoch` if it currently represents an older
    /// second. Concurrent writers may race here; the loser's increments land
    /// in a freshly zeroed bucket, which only under-counts one event in the
    /// window and never corrupts the cumulative totals.
    fn rotate_to(&self, epoch: u64) {
        let current = self.epoch.load(Ordering::Acquire);
        if current == epoch {
            return;
        }
        if self
            .epoch
            .compare_exchange(current, epoch, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.operations.store(0, Ordering::Release);
            self.bytes.store(0, Ordering::Release);
            for class in &self.latency_classes {
                class.store(0, Ordering::Release);
            }
        }
    }
}

fn latency_class(latency: Duration) -> usize {
    let micros = latency.as_micros().max(1) as u64;
    ((63 - micros.leading_zeros()) as usize).min(LATENCY_CLASSES - 1)
}

fn class_upper_bound(class: usize) -> Duration {
    Duration::from_micros(1u64 << (class + 1))
}

////////////////////////////////////////// WindowedMetrics /////////////////////////////////////////

/// Concurrent O(1) per-event counters: cumulative totals plus a ring of
/// per-second buckets covering the configured window. Readers merge the
/// live buckets, so rates decay to zero after one idle window.
#[derive(Debug)]
pub struct WindowedMetrics {
    started: Instant,
    window_seconds: u64,
    buckets: Vec<WindowBucket>,
    total_operations: AtomicU64,
    total_bytes: AtomicU64,
    total_errors: AtomicU64,
    // Gauges for decompressed batch sizes, stored as f64 bits.
    last_batch_mb: AtomicU64,
    max_batch_mb: AtomicU64,
}

/// Point-in-time view over one window.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub total_operations: u64,
    pub total_bytes: u64,
    pub total_errors: u64,
    pub window_operations: u64,
    pub window_bytes: u64,
    pub operations_per_second: f64,
    pub bytes_per_second: f64,
    pub latency_p50: Duration,
    pub latency_p90: Duration,
    pub latency_p99: Duration,
    pub last_batch_mb: f64,
    pub max_batch_mb: f64,
}

impl WindowedMetrics {
    pub fn new(window: Duration) -> WindowedMetrics {
        let window_seconds = window.as_secs().max(1);
        // One spare bucket so the second currently being written never
        // aliases the oldest second still being read.
        let buckets = (0..window_seconds + 1)
            .map(|_| WindowBucket::empty())
            .collect();
        WindowedMetrics {
            started: Instant::now(),
            window_seconds,
            buckets,
            total_operations: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            last_batch_mb: AtomicU64::new(0f64.to_bits()),
            max_batch_mb: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn window_seconds(&self) -> u64 {
        self.window_seconds
    }

    /// Record one completed operation.
    pub fn record(&self, bytes: u64, latency: Duration) {
        self.record_at(self.now_epoch(), bytes, latency);
    }

    pub fn record_error(&self) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the decompressed size of a processed batch in MB.
    pub fn record_batch_mb(&self, mb: f64) {
        self.last_batch_mb.store(mb.to_bits(), Ordering::Relaxed);
        let mut current = f64::from_bits(self.max_batch_mb.load(Ordering::Relaxed));
        while mb > current {
            match self.max_batch_mb.compare_exchange(
                current.to_bits(),
                mb.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = f64::from_bits(observed),
            }
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot_at(self.now_epoch())
    }

    fn now_epoch(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    fn record_at(&self, epoch: u64, bytes: u64, latency: Duration) {
        self.total_operations.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
        let bucket = &self.buckets[(epoch % self.buckets.len() as u64) as usize];
        bucket.rotate_to(epoch);
        bucket.operations.fetch_add(1, Ordering::Relaxed);
        bucket.bytes.fetch_add(bytes, Ordering::Relaxed);
        bucket.latency_classes[latency_class(latency)].fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot_at(&self, now: u64) -> MetricsSnapshot {
        let oldest = now.saturating_sub(self.window_seconds - 1);
        let mut window_operations = 0u64;
        let mut window_bytes = 0u64;
        let mut merged = [0u64; LATENCY_CLASSES];
        for bucket in &self.buckets {
            let epoch = bucket.epoch.load(Ordering::Acquire);
            if epoch < oldest || epoch > now {
                continue;
            }
            window_operations += bucket.operations.load(Ordering::Relaxed);
            window_bytes += bucket.bytes.load(Ordering::Relaxed);
            for (class, counter) in bucket.latency_classes.iter().enumerate() {
                merged[class] += counter.load(Ordering::Relaxed);
            }
        }
        let seconds = self.window_seconds as f64;
        MetricsSnapshot {
            total_operations: self.total_operations.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            window_operations,
            window_bytes,
            operations_per_second: window_operations as f64 / seconds,
            bytes_per_second: window_bytes as f64 / seconds,
            latency_p50: percentile(&merged, window_operations, 0.50),
            latency_p90: percentile(&merged, window_operations, 0.90),
            latency_p99: percentile(&merged, window_operations, 0.99),
            last_batch_mb: f64::from_bits(self.last_batch_mb.load(Ordering::Relaxed)),
            max_batch_mb: f64::from_bits(self.max_batch_mb.load(Ordering::Relaxed)),
        }
    }
}

fn percentile(classes: &[u64; LATENCY_CLASSES], total: u64, q: f64) -> Duration {
    if total == 0 {
        return Duration::ZERO;
    }
    let rank = ((total as f64) * q).ceil().max(1.0) as u64;
    let mut seen = 0u64;
    for (class, &count) in classes.iter().enumerate() {
        seen += count;
        if seen >= rank {
            return class_upper_bound(class);
        }
    }
    class_upper_bound(LATENCY_CLASSES - 1)
}

///////////////////////////////////////////// Stopwatch ////////////////////////////////////////////

/// Guard that records one operation into a window when finished. Byte
/// counts can be attached as the operation progresses.
pub struct OperationTimer<'a> {
    metrics: &'a WindowedMetrics,
    started: Instant,
    bytes: u64,
}

impl<'a> OperationTimer<'a> {
    pub fn start(metrics: &'a WindowedMetrics) -> OperationTimer<'a> {
        OperationTimer {
            metrics,
            started: Instant::now(),
            bytes: 0,
        }
    }

    pub fn add_bytes(&mut self, bytes: u64) {
        self.bytes += bytes;
    }

    pub fn finish(self) {
        self.metrics.record(self.bytes, self.started.elapsed());
    }

    pub fn finish_with_error(self) {
        self.metrics.record(self.bytes, self.started.elapsed());
        self.metrics.record_error();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cumulative_counters_are_monotonic() {
        let metrics = WindowedMetrics::new(Duration::from_secs(5));
        let mut previous = 0;
        for i in 0..10 {
            metrics.record_at(0, i, Duration::from_micros(10));
            let snapshot = metrics.snapshot_at(0);
            assert!(snapshot.total_operations > previous);
            previous = snapshot.total_operations;
        }
    }

    #[test]
    fn window_rates_decay_to_zero_after_idle_window() {
        let metrics = WindowedMetrics::new(Duration::from_secs(5));
        for second in 0..5 {
            metrics.record_at(second, 100, Duration::from_micros(50));
        }
        let live = metrics.snapshot_at(4);
        assert_eq!(live.window_operations, 5);
        assert!(live.operations_per_second > 0.0);

        // One full window later with no traffic, the rate is zero but the
        // cumulative totals remain.
        let idle = metrics.snapshot_at(4 + 5);
        assert_eq!(idle.window_operations, 0);
        assert_eq!(idle.operations_per_second, 0.0);
        assert_eq!(idle.total_operations, 5);
    }

    #[test]
    fn ring_reuse_drops_expired_seconds() {
        let metrics = WindowedMetrics::new(Duration::from_secs(2));
        metrics.record_at(0, 1, Duration::from_micros(10));
        metrics.record_at(1, 1, Duration::from_micros(10));
        metrics.record_at(2, 1, Duration::from_micros(10));
        let snapshot = metrics.snapshot_at(2);
        // Window covers seconds 1..=2 only.
        assert_eq!(snapshot.window_operations, 2);
        assert_eq!(snapshot.total_operations, 3);
    }

    #[test]
    fn percentiles_track_latency_classes() {
        let metrics = WindowedMetrics::new(Duration::from_secs(5));
        for _ in 0..90 {
            metrics.record_at(0, 0, Duration::from_micros(100));
        }
        for _ in 0..10 {
            metrics.record_at(0, 0, Duration::from_millis(100));
        }
        let snapshot = metrics.snapshot_at(0);
        assert!(snapshot.latency_p50 < Duration::from_millis(1));
        assert!(snapshot.latency_p99 >= Duration::from_millis(100));
        assert!(snapshot.latency_p90 < snapshot.latency_p99);
    }

    #[test]
    fn batch_mb_gauges_track_last_and_max() {
        let metrics = WindowedMetrics::new(Duration::from_secs(5));
        metrics.record_batch_mb(12.5);
        metrics.record_batch_mb(3.25);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.last_batch_mb, 3.25);
        assert_eq!(snapshot.max_batch_mb, 12.5);
    }
}
