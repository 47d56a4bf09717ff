//! Service metrics.
//!
//! Counters and histograms are kept in process and rendered in the
//! Prometheus text exposition format for `GET /metrics`.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::lookup::{QueryOutcome, RecordSource};

/// Upper bounds (seconds) of the request latency histogram buckets.
const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Receiver for counters, timers and gauges.
pub trait MetricsSink: Send + Sync {
    fn record_request(&self, path: &str, elapsed: Duration);

    /// One call per resolved host, whatever the outcome.
    fn record_resolution(&self, outcome: &QueryOutcome);

    fn set_cache_size(&self, size: usize);
}

/// Sink that drops everything.
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_request(&self, _path: &str, _elapsed: Duration) {}
    fn record_resolution(&self, _outcome: &QueryOutcome) {}
    fn set_cache_size(&self, _size: usize) {}
}

#[derive(Default, Clone)]
struct Histogram {
    buckets: Vec<u64>,
    count: u64,
    sum: f64,
}

impl Histogram {
    fn observe(&mut self, value: f64) {
        if self.buckets.is_empty() {
            self.buckets = vec![0; LATENCY_BUCKETS.len()];
        }
        for (bound, slot) in LATENCY_BUCKETS.iter().zip(self.buckets.iter_mut()) {
            if value <= *bound {
                *slot += 1;
            }
        }
        self.count += 1;
        self.sum += value;
    }
}

/// In-process metrics registry.
#[derive(Default)]
pub struct Metrics {
    requests: Mutex<BTreeMap<String, Histogram>>,
    resolved_local: AtomicU64,
    resolved_remote: AtomicU64,
    queried: AtomicU64,
    cache_size: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queried_total(&self) -> u64 {
        self.queried.load(Ordering::Relaxed)
    }

    pub fn resolved_total(&self, source: RecordSource) -> u64 {
        match source {
            RecordSource::Local => self.resolved_local.load(Ordering::Relaxed),
            RecordSource::Remote => self.resolved_remote.load(Ordering::Relaxed),
        }
    }

    pub fn cache_size(&self) -> u64 {
        self.cache_size.load(Ordering::Relaxed)
    }

    pub fn request_count(&self, path: &str) -> u64 {
        self.requests
            .lock()
            .ok()
            .and_then(|r| r.get(path).map(|h| h.count))
            .unwrap_or(0)
    }

    /// Prometheus text exposition of every metric.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let requests = self
            .requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default();

        let _ = writeln!(out, "# HELP geoip_requests_total Total number of HTTP requests to the service");
        let _ = writeln!(out, "# TYPE geoip_requests_total counter");
        for (path, h) in &requests {
            let _ = writeln!(out, "geoip_requests_total{{path=\"{}\"}} {}", path, h.count);
        }

        let _ = writeln!(out, "# HELP geoip_request_time_seconds Request processing time in seconds");
        let _ = writeln!(out, "# TYPE geoip_request_time_seconds histogram");
        for (path, h) in &requests {
            for (bound, n) in LATENCY_BUCKETS.iter().zip(&h.buckets) {
                let _ = writeln!(
                    out,
                    "geoip_request_time_seconds_bucket{{path=\"{}\",le=\"{}\"}} {}",
                    path, bound, n
                );
            }
            let _ = writeln!(out, "geoip_request_time_seconds_bucket{{path=\"{}\",le=\"+Inf\"}} {}", path, h.count);
            let _ = writeln!(out, "geoip_request_time_seconds_sum{{path=\"{}\"}} {}", path, h.sum);
            let _ = writeln!(out, "geoip_request_time_seconds_count{{path=\"{}\"}} {}", path, h.count);
        }

        let _ = writeln!(out, "# HELP geoip_resolved_total Total number of successfully resolved IPs by source");
        let _ = writeln!(out, "# TYPE geoip_resolved_total counter");
        for source in [RecordSource::Local, RecordSource::Remote] {
            let _ = writeln!(out, "geoip_resolved_total{{source=\"{}\"}} {}", source, self.resolved_total(source));
        }

        let _ = writeln!(out, "# HELP geoip_queried_total Total number of IP addresses queried");
        let _ = writeln!(out, "# TYPE geoip_queried_total counter");
        let _ = writeln!(out, "geoip_queried_total {}", self.queried_total());

        let _ = writeln!(out, "# HELP geoip_local_db_size Current number of cached IPs");
        let _ = writeln!(out, "# TYPE geoip_local_db_size gauge");
        let _ = writeln!(out, "geoip_local_db_size {}", self.cache_size());

        out
    }
}

impl MetricsSink for Metrics {
    fn record_request(&self, path: &str, elapsed: Duration) {
        if let Ok(mut requests) = self.requests.lock() {
            requests
                .entry(path.to_string())
                .or_default()
                .observe(elapsed.as_secs_f64());
        }
    }

    fn record_resolution(&self, outcome: &QueryOutcome) {
        if let Some(record) = outcome.record() {
            let counter = match record.source() {
                RecordSource::Local => &self.resolved_local,
                RecordSource::Remote => &self.resolved_remote,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
        self.queried.fetch_add(1, Ordering::Relaxed);
    }

    fn set_cache_size(&self, size: usize) {
        self.cache_size.store(size as u64, Ordering::Relaxed);
    }
}

/// Records the time between creation and drop against `path`, on every exit
/// path of the enclosing scope.
pub struct RequestTimer {
    sink: Arc<dyn MetricsSink>,
    path: &'static str,
    started: Instant,
}

impl RequestTimer {
    pub fn start(sink: Arc<dyn MetricsSink>, path: &'static str) -> Self {
        Self {
            sink,
            path,
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        self.sink.record_request(self.path, self.started.elapsed());
    }
}
