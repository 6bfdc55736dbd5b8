use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Once;
use std::time::Instant;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Job lifecycle
    pub static ref JOBS_STARTED: IntCounter = IntCounter::new(
        "segmentation_jobs_started_total",
        "Total number of jobs picked up for execution"
    ).unwrap();

    pub static ref JOBS_FINISHED: IntCounterVec = IntCounterVec::new(
        Opts::new("segmentation_jobs_finished_total", "Jobs reaching a terminal state"),
        &["status"]
    ).unwrap();

    pub static ref JOB_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("segmentation_job_failures_total", "Job failures by error kind"),
        &["kind"]
    ).unwrap();

    pub static ref JOBS_RUNNING: IntGauge = IntGauge::new(
        "segmentation_jobs_running",
        "Jobs currently executing in this worker"
    ).unwrap();

    // Pipeline stages (in seconds)
    pub static ref STAGE_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "segmentation_stage_duration_seconds",
            "Wall time per pipeline stage in seconds"
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0]),
        &["stage"]
    ).unwrap();

    pub static ref PATCH_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "segmentation_patch_duration_seconds",
            "Model forward pass latency per sliding window in seconds"
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0])
    ).unwrap();

    pub static ref WINDOWS_PROCESSED: IntCounter = IntCounter::new(
        "segmentation_windows_processed_total",
        "Total number of sliding windows run through a model"
    ).unwrap();

    // Model cache
    pub static ref CACHE_HITS: IntCounter = IntCounter::new(
        "model_cache_hits_total",
        "Total number of model cache hits"
    ).unwrap();

    pub static ref CACHE_MISSES: IntCounter = IntCounter::new(
        "model_cache_misses_total",
        "Total number of model cache misses"
    ).unwrap();

    pub static ref CACHE_SIZE: IntGauge = IntGauge::new(
        "model_cache_entries",
        "Current number of loaded model sessions"
    ).unwrap();
}

static INIT: Once = Once::new();

/// Initialize metrics registry. Safe to call more than once.
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY.register(Box::new(JOBS_STARTED.clone())).unwrap();
        REGISTRY.register(Box::new(JOBS_FINISHED.clone())).unwrap();
        REGISTRY.register(Box::new(JOB_FAILURES.clone())).unwrap();
        REGISTRY.register(Box::new(JOBS_RUNNING.clone())).unwrap();

        REGISTRY.register(Box::new(STAGE_DURATION.clone())).unwrap();
        REGISTRY.register(Box::new(PATCH_LATENCY.clone())).unwrap();
        REGISTRY.register(Box::new(WINDOWS_PROCESSED.clone())).unwrap();

        REGISTRY.register(Box::new(CACHE_HITS.clone())).unwrap();
        REGISTRY.register(Box::new(CACHE_MISSES.clone())).unwrap();
        REGISTRY.register(Box::new(CACHE_SIZE.clone())).unwrap();

        tracing::info!("Metrics registry initialized with {} collectors", REGISTRY.gather().len());
    });
}

/// Get cache hit rate as a percentage
pub fn cache_hit_rate() -> f64 {
    let hits = CACHE_HITS.get() as f64;
    let misses = CACHE_MISSES.get() as f64;
    let total = hits + misses;

    if total == 0.0 {
        0.0
    } else {
        (hits / total) * 100.0
    }
}

/// Helper struct for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn observe_duration_seconds(&self, histogram: &Histogram) {
        let duration = self.start.elapsed();
        histogram.observe(duration.as_secs_f64());
    }

    pub fn observe_stage(&self, stage: &str) {
        self.observe_duration_seconds(&STAGE_DURATION.with_label_values(&[stage]));
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Export metrics in Prometheus format
pub fn export_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_init_is_idempotent_and_exports() {
        init_metrics();
        init_metrics();
        JOBS_FINISHED.with_label_values(&["completed"]).inc();
        let text = export_metrics();
        assert!(text.contains("segmentation_jobs_finished_total"));
    }

    #[test]
    #[serial]
    fn test_cache_hit_rate_is_percentage() {
        let rate = cache_hit_rate();
        assert!((0.0..=100.0).contains(&rate));
    }
}
