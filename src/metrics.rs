//! Process-wide metrics registry.
//!
//! The one piece of state allowed to behave like a global: constructed once
//! at startup, shared as `Arc<Metrics>`, rendered by `/metrics`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use prometheus::{
    Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

pub struct Metrics {
    registry: Registry,
    started_at: Instant,

    pub ram_bytes: IntGauge,
    pub cpu_percent: Gauge,
    pub ram_trend_bytes_per_sec: Gauge,
    pub estimated_oom_seconds: Gauge,
    pub uptime_seconds: Gauge,

    pub route_latency_seconds: HistogramVec,
    pub fallback_total: IntCounterVec,
    pub admission_rejected_total: IntCounter,

    pub cache_hit_rate: Gauge,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let ram_bytes = IntGauge::with_opts(Opts::new("ram_bytes", "Instantaneous RAM used"))
            .expect("valid gauge opts");
        let cpu_percent = Gauge::with_opts(Opts::new("cpu_percent", "Instantaneous CPU usage"))
            .expect("valid gauge opts");
        let ram_trend_bytes_per_sec = Gauge::with_opts(Opts::new(
            "ram_trend_bytes_per_sec",
            "EWMA of the RAM growth rate",
        ))
        .expect("valid gauge opts");
        let estimated_oom_seconds = Gauge::with_opts(Opts::new(
            "estimated_oom_seconds",
            "Projected seconds until the RAM cap is reached (-1 when no trend)",
        ))
        .expect("valid gauge opts");
        let uptime_seconds = Gauge::with_opts(Opts::new("uptime_seconds", "Process uptime"))
            .expect("valid gauge opts");

        let route_latency_seconds = HistogramVec::new(
            HistogramOpts::new("route_latency_seconds", "End-to-end latency per route")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["route"],
        )
        .expect("valid histogram opts");
        let fallback_total = IntCounterVec::new(
            Opts::new("fallback_total", "Model loads served by a fallback"),
            &["from", "to"],
        )
        .expect("valid counter opts");
        let admission_rejected_total = IntCounter::with_opts(Opts::new(
            "admission_rejected_total",
            "Requests rejected by the health gate",
        ))
        .expect("valid counter opts");
        let cache_hit_rate = Gauge::with_opts(Opts::new(
            "cache_hit_rate",
            "Semantic cache hit ratio since startup",
        ))
        .expect("valid gauge opts");

        for collector in [
            Box::new(ram_bytes.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(cpu_percent.clone()),
            Box::new(ram_trend_bytes_per_sec.clone()),
            Box::new(estimated_oom_seconds.clone()),
            Box::new(uptime_seconds.clone()),
            Box::new(route_latency_seconds.clone()),
            Box::new(fallback_total.clone()),
            Box::new(admission_rejected_total.clone()),
            Box::new(cache_hit_rate.clone()),
        ] {
            registry.register(collector).expect("no duplicate collectors");
        }

        Self {
            registry,
            started_at: Instant::now(),
            ram_bytes,
            cpu_percent,
            ram_trend_bytes_per_sec,
            estimated_oom_seconds,
            uptime_seconds,
            route_latency_seconds,
            fallback_total,
            admission_rejected_total,
            cache_hit_rate,
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    pub fn observe_route(&self, route: &str, elapsed: Duration) {
        self.route_latency_seconds
            .with_label_values(&[route])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_fallback(&self, from: &str, to: &str) {
        self.fallback_total.with_label_values(&[from, to]).inc();
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
        let hits = self.cache_hits.load(Ordering::Relaxed) as f64;
        let total = hits + self.cache_misses.load(Ordering::Relaxed) as f64;
        self.cache_hit_rate.set(if total > 0.0 { hits / total } else { 0.0 });
    }

    /// Render the Prometheus text exposition.
    pub fn render(&self) -> String {
        self.uptime_seconds.set(self.started_at.elapsed().as_secs_f64());
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::warn!(error = %e, "metrics encoding failed");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_contains_required_series() {
        let m = Metrics::new();
        m.ram_bytes.set(1_000_000);
        m.observe_route("cascade_tier1", Duration::from_millis(120));
        m.record_fallback("expert_long", "expert_short");
        m.record_cache_lookup(true);
        m.record_cache_lookup(false);

        let text = m.render();
        assert!(text.contains("ram_bytes"));
        assert!(text.contains("route_latency_seconds"));
        assert!(text.contains("fallback_total"));
        assert!(text.contains("cache_hit_rate"));
        assert!(text.contains("uptime_seconds"));
    }

    #[test]
    fn hit_rate_tracks_lookups() {
        let m = Metrics::new();
        m.record_cache_lookup(true);
        m.record_cache_lookup(true);
        m.record_cache_lookup(false);
        assert!((m.cache_hit_rate.get() - 2.0 / 3.0).abs() < 1e-9);
    }
}
