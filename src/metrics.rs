use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::time::Instant;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Scan metrics
    pub static ref SCANS_SUBMITTED: IntCounter = IntCounter::new(
        "scans_submitted_total",
        "Total number of scan submissions"
    ).unwrap();

    pub static ref SCANS_REJECTED: IntCounter = IntCounter::new(
        "scans_rejected_total",
        "Total number of submissions rejected as invalid input"
    ).unwrap();

    pub static ref SCANS_COMPLETED: IntCounter = IntCounter::new(
        "scans_completed_total",
        "Total number of scans that published a diagnosis"
    ).unwrap();

    pub static ref SCANS_DEGRADED: IntCounterVec = IntCounterVec::new(
        Opts::new("scans_degraded_total", "Total number of degraded diagnoses by fault"),
        &["reason"]
    ).unwrap();

    pub static ref SCANS_STALE_DISCARDED: IntCounter = IntCounter::new(
        "scans_stale_discarded_total",
        "Total number of scan results discarded because a newer submission arrived"
    ).unwrap();

    // Backend metrics
    pub static ref BACKEND_LOADS: IntCounter = IntCounter::new(
        "backend_load_sequences_total",
        "Total number of backend load sequences started"
    ).unwrap();

    pub static ref BACKEND_DEVICE_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("backend_device_failures_total", "Backend initialization failures by device"),
        &["device"]
    ).unwrap();

    pub static ref BACKEND_READY: IntGauge = IntGauge::new(
        "backend_ready",
        "Whether a classification backend is cached (1) or not (0)"
    ).unwrap();

    pub static ref MODEL_FETCHES: IntCounter = IntCounter::new(
        "model_fetches_total",
        "Total number of model weight downloads"
    ).unwrap();

    // Intake metrics
    pub static ref IMAGES_LIVE: IntGauge = IntGauge::new(
        "images_live",
        "Current number of staged images not yet released"
    ).unwrap();

    // Inference metrics (in seconds)
    pub static ref INFERENCE_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "inference_duration_seconds",
            "Classifier latency in seconds"
        )
        .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0])
    ).unwrap();

    pub static ref INFERENCE_TIMEOUTS: IntCounter = IntCounter::new(
        "inference_timeouts_total",
        "Total number of classifier calls that exceeded their timeout"
    ).unwrap();

    pub static ref INFERENCE_FAILURES: IntCounter = IntCounter::new(
        "inference_failures_total",
        "Total number of classifier calls that reported a fault"
    ).unwrap();
}

/// Initialize metrics registry
pub fn init_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(SCANS_SUBMITTED.clone()),
        Box::new(SCANS_REJECTED.clone()),
        Box::new(SCANS_COMPLETED.clone()),
        Box::new(SCANS_DEGRADED.clone()),
        Box::new(SCANS_STALE_DISCARDED.clone()),
        Box::new(BACKEND_LOADS.clone()),
        Box::new(BACKEND_DEVICE_FAILURES.clone()),
        Box::new(BACKEND_READY.clone()),
        Box::new(MODEL_FETCHES.clone()),
        Box::new(IMAGES_LIVE.clone()),
        Box::new(INFERENCE_LATENCY.clone()),
        Box::new(INFERENCE_TIMEOUTS.clone()),
        Box::new(INFERENCE_FAILURES.clone()),
    ];

    for collector in collectors {
        if let Err(e) = REGISTRY.register(collector) {
            tracing::warn!("Failed to register metric collector: {}", e);
        }
    }

    tracing::info!("Metrics registry initialized with {} collectors", REGISTRY.gather().len());
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

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn observe_duration_seconds(&self, histogram: &Histogram) {
        let duration = self.start.elapsed();
        histogram.observe(duration.as_secs_f64());
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
