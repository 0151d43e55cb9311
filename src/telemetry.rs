// =============================================================================
// Telemetry — process-local counters, gauges, and latency histograms
// =============================================================================
//
// All hot-path updates are lock-free atomic increments; the registry maps are
// only written on first use of a metric name. Snapshots are serialisable and
// form the metrics boundary of the core (no exporter lives here).
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

/// Number of log-scale histogram buckets. Bucket `i` covers values in
/// `[2^i, 2^(i+1))` microseconds; the last bucket is open-ended.
const BUCKETS: usize = 32;

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// Fixed log₂-bucket histogram over microsecond values.
pub struct Histogram {
    buckets: [AtomicU64; BUCKETS],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    fn bucket_index(value_us: u64) -> usize {
        // 0 and 1 land in bucket 0; otherwise floor(log2(v)).
        let idx = 63 - value_us.max(1).leading_zeros() as usize;
        idx.min(BUCKETS - 1)
    }

    /// Record a single observation in microseconds.
    pub fn record(&self, value_us: u64) {
        self.buckets[Self::bucket_index(value_us)].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(value_us, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Mean observation in microseconds.
    pub fn mean_us(&self) -> f64 {
        let n = self.count();
        if n == 0 {
            return 0.0;
        }
        self.sum_us.load(Ordering::Relaxed) as f64 / n as f64
    }

    /// Approximate percentile (0.0..=1.0) in microseconds, reported as the
    /// upper bound of the bucket containing the target rank.
    pub fn percentile_us(&self, p: f64) -> Option<f64> {
        let n = self.count();
        if n == 0 {
            return None;
        }
        let target = ((n as f64) * p.clamp(0.0, 1.0)).ceil().max(1.0) as u64;

        let mut seen = 0u64;
        for (i, b) in self.buckets.iter().enumerate() {
            seen += b.load(Ordering::Relaxed);
            if seen >= target {
                return Some(2f64.powi(i as i32 + 1));
            }
        }
        Some(2f64.powi(BUCKETS as i32))
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            count: self.count(),
            mean_us: self.mean_us(),
            p50_us: self.percentile_us(0.50).unwrap_or(0.0),
            p99_us: self.percentile_us(0.99).unwrap_or(0.0),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Handle shared by every subsystem. Metric names are dotted lowercase, e.g.
/// `tick.out_of_order_drop`, `order.send_to_ack_us`.
pub struct Telemetry {
    counters: RwLock<HashMap<&'static str, Arc<AtomicU64>>>,
    gauges: RwLock<HashMap<&'static str, Arc<AtomicI64>>>,
    histograms: RwLock<HashMap<&'static str, Arc<Histogram>>>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
        }
    }

    fn counter_handle(&self, name: &'static str) -> Arc<AtomicU64> {
        if let Some(c) = self.counters.read().get(name) {
            return c.clone();
        }
        self.counters
            .write()
            .entry(name)
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    fn gauge_handle(&self, name: &'static str) -> Arc<AtomicI64> {
        if let Some(g) = self.gauges.read().get(name) {
            return g.clone();
        }
        self.gauges
            .write()
            .entry(name)
            .or_insert_with(|| Arc::new(AtomicI64::new(0)))
            .clone()
    }

    fn histogram_handle(&self, name: &'static str) -> Arc<Histogram> {
        if let Some(h) = self.histograms.read().get(name) {
            return h.clone();
        }
        self.histograms
            .write()
            .entry(name)
            .or_insert_with(|| Arc::new(Histogram::new()))
            .clone()
    }

    /// Increment a counter by one.
    pub fn incr(&self, name: &'static str) {
        self.counter_handle(name).fetch_add(1, Ordering::Relaxed);
    }

    /// Increment a counter by `n`.
    pub fn incr_by(&self, name: &'static str, n: u64) {
        self.counter_handle(name).fetch_add(n, Ordering::Relaxed);
    }

    /// Current counter value (0 if never touched).
    pub fn counter(&self, name: &'static str) -> u64 {
        self.counters
            .read()
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Set a gauge to an absolute value.
    pub fn set_gauge(&self, name: &'static str, value: i64) {
        self.gauge_handle(name).store(value, Ordering::Relaxed);
    }

    pub fn gauge(&self, name: &'static str) -> i64 {
        self.gauges
            .read()
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Record a histogram observation in microseconds.
    pub fn record_us(&self, name: &'static str, value_us: u64) {
        self.histogram_handle(name).record(value_us);
    }

    /// Record a `std::time::Duration` observation.
    pub fn record_duration(&self, name: &'static str, d: std::time::Duration) {
        self.record_us(name, d.as_micros() as u64);
    }

    /// Histogram percentile in microseconds, if any observations exist.
    pub fn percentile_us(&self, name: &'static str, p: f64) -> Option<f64> {
        self.histograms.read().get(name).and_then(|h| h.percentile_us(p))
    }

    /// Build a complete serialisable snapshot of all metrics.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let counters = self
            .counters
            .read()
            .iter()
            .map(|(k, v)| (k.to_string(), v.load(Ordering::Relaxed)))
            .collect();
        let gauges = self
            .gauges
            .read()
            .iter()
            .map(|(k, v)| (k.to_string(), v.load(Ordering::Relaxed)))
            .collect();
        let histograms = self
            .histograms
            .read()
            .iter()
            .map(|(k, v)| (k.to_string(), v.snapshot()))
            .collect();

        TelemetrySnapshot {
            counters,
            gauges,
            histograms,
        }
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub mean_us: f64,
    pub p50_us: f64,
    pub p99_us: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, i64>,
    pub histograms: HashMap<String, HistogramSnapshot>,
}

// =============================================================================
// Tests
// =============================================================================
