//! Predictive health monitor.
//!
//! A single EWMA over sampled RAM usage estimates how fast memory is
//! growing and projects when the configured cap would be hit. When that ETA
//! drops below the warn threshold the monitor flips to degraded and the
//! admission gate rejects new requests with a retryable error carrying the
//! ETA. In-flight work is never cancelled; the pool's own admission
//! arithmetic stays authoritative and is never revoked from here.
//!
//! The update rule is deterministic for a given sample sequence, which is
//! what the tests drive through a scripted [`MemorySource`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tokio::sync::watch;
use tokio_stream::wrappers::IntervalStream;

use crate::error::{MindgateError, Result};
use crate::metrics::Metrics;
use crate::settings::HealthSettings;

/// One RAM/CPU observation.
#[derive(Debug, Clone, Copy)]
pub struct MemorySample {
    pub used_bytes: u64,
    pub cpu_percent: f64,
}

/// Where samples come from. Injected so tests can script a sequence.
pub trait MemorySource: Send {
    fn sample(&mut self) -> MemorySample;
}

/// Live readings via sysinfo.
pub struct SysinfoSource {
    sys: System,
}

impl SysinfoSource {
    pub fn new() -> Self {
        let sys = System::new_with_specifics(
            RefreshKind::new()
                .with_memory(MemoryRefreshKind::everything())
                .with_cpu(CpuRefreshKind::everything()),
        );
        Self { sys }
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource for SysinfoSource {
    fn sample(&mut self) -> MemorySample {
        self.sys.refresh_memory();
        self.sys.refresh_cpu_usage();
        let cpus = self.sys.cpus();
        let cpu_percent = if cpus.is_empty() {
            0.0
        } else {
            f64::from(cpus.iter().map(|c| c.cpu_usage()).sum::<f32>()) / cpus.len() as f64
        };
        MemorySample { used_bytes: self.sys.used_memory(), cpu_percent }
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Snapshot served on `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub state: String,
    pub ram_bytes: u64,
    pub trend_bytes_per_sec: f64,
    pub eta_seconds: Option<f64>,
    pub degraded: bool,
}

struct MonitorState {
    trend: f64,
    last: Option<(f64, u64)>,
    samples: usize,
    ram_bytes: u64,
    cpu_percent: f64,
    eta_seconds: Option<f64>,
    degraded: bool,
}

pub struct HealthMonitor {
    state: Mutex<MonitorState>,
    cap_bytes: u64,
    alpha: f64,
    warn_seconds: f64,
    min_samples: usize,
    metrics: Arc<Metrics>,
}

impl HealthMonitor {
    pub fn new(settings: &HealthSettings, cap_bytes: u64, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MonitorState {
                trend: 0.0,
                last: None,
                samples: 0,
                ram_bytes: 0,
                cpu_percent: 0.0,
                eta_seconds: None,
                degraded: false,
            }),
            cap_bytes,
            alpha: settings.ewma_alpha,
            warn_seconds: settings.oom_warn_seconds as f64,
            min_samples: settings.min_samples,
            metrics,
        })
    }

    /// Fold one observation into the trend. `at_seconds` is a monotonic
    /// timestamp supplied by the caller, which keeps the update rule a pure
    /// function of the sample sequence.
    pub fn observe(&self, at_seconds: f64, sample: MemorySample) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

        if let Some((last_t, last_r)) = state.last {
            let dt = at_seconds - last_t;
            if dt > 0.0 {
                let dr = sample.used_bytes as f64 - last_r as f64;
                let rate = dr / dt;
                state.trend = self.alpha * rate + (1.0 - self.alpha) * state.trend;
            }
        }
        state.last = Some((at_seconds, sample.used_bytes));
        state.samples += 1;
        state.ram_bytes = sample.used_bytes;
        state.cpu_percent = sample.cpu_percent;

        state.eta_seconds = if state.samples >= self.min_samples && state.trend > 0.0 {
            let headroom = self.cap_bytes.saturating_sub(sample.used_bytes) as f64;
            Some(headroom / state.trend)
        } else {
            None
        };

        let was_degraded = state.degraded;
        state.degraded = matches!(state.eta_seconds, Some(eta) if eta < self.warn_seconds);
        if state.degraded != was_degraded {
            if state.degraded {
                tracing::warn!(
                    eta_seconds = state.eta_seconds,
                    trend_bytes_per_sec = state.trend,
                    "memory trend predicts exhaustion, rejecting new work"
                );
            } else {
                tracing::info!("memory trend recovered, admitting again");
            }
        }

        self.metrics.ram_bytes.set(sample.used_bytes as i64);
        self.metrics.cpu_percent.set(sample.cpu_percent);
        self.metrics.ram_trend_bytes_per_sec.set(state.trend);
        self.metrics.estimated_oom_seconds.set(state.eta_seconds.unwrap_or(-1.0));
    }

    /// Admission gate. Rejects with the projected ETA while degraded;
    /// existing in-flight work is unaffected.
    pub fn admit(&self) -> Result<()> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.degraded {
            let eta_seconds = state.eta_seconds.unwrap_or(0.0);
            drop(state);
            self.metrics.admission_rejected_total.inc();
            return Err(MindgateError::AdmissionRejected { eta_seconds });
        }
        Ok(())
    }

    pub fn is_degraded(&self) -> bool {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).degraded
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        HealthSnapshot {
            state: if state.degraded { "degraded" } else { "ok" }.to_string(),
            ram_bytes: state.ram_bytes,
            trend_bytes_per_sec: state.trend,
            eta_seconds: state.eta_seconds,
            degraded: state.degraded,
        }
    }

    /// Background sampler at a fixed period; exits on shutdown.
    pub async fn run_sampler(
        self: Arc<Self>,
        mut source: Box<dyn MemorySource>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let started = std::time::Instant::now();
        let mut ticks = IntervalStream::new(tokio::time::interval(period));
        loop {
            tokio::select! {
                _ = ticks.next() => {
                    let sample = source.sample();
                    self.observe(started.elapsed().as_secs_f64(), sample);
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}
