use std::time::Duration;

use prometheus::{
    core::Collector, opts, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge,
    Registry, TextEncoder,
};

#[derive(Clone)]
pub struct AppMetrics {
    registry: Registry,
    request_total: IntCounterVec,
    generation_duration_seconds: HistogramVec,
    inflight_requests: IntGauge,
    generation_errors_total: IntCounterVec,
    stream_fragments_total: IntCounterVec,
}

pub struct InflightGuard<'a> {
    metrics: &'a AppMetrics,
}

impl AppMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let request_total = IntCounterVec::new(
            opts!(
                "chatways_http_requests_total",
                "Total HTTP requests processed"
            ),
            &["path", "method", "status", "stream"],
        )
        .expect("valid request_total metric");

        let generation_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "chatways_generation_duration_seconds",
                "Time from request acceptance until the reply or stream is complete",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
            &["engine", "stream", "outcome"],
        )
        .expect("valid generation_duration_seconds metric");

        let inflight_requests = IntGauge::new(
            "chatways_inflight_requests",
            "Current in-flight requests",
        )
        .expect("valid inflight_requests metric");

        let generation_errors_total = IntCounterVec::new(
            opts!(
                "chatways_generation_errors_total",
                "Generation failures by engine and stage"
            ),
            &["engine", "stage"],
        )
        .expect("valid generation_errors_total metric");

        let stream_fragments_total = IntCounterVec::new(
            opts!(
                "chatways_stream_fragments_total",
                "Response fragments delivered to streaming clients"
            ),
            &["engine"],
        )
        .expect("valid stream_fragments_total metric");

        let collectors: [Box<dyn Collector>; 5] = [
            Box::new(request_total.clone()),
            Box::new(generation_duration_seconds.clone()),
            Box::new(inflight_requests.clone()),
            Box::new(generation_errors_total.clone()),
            Box::new(stream_fragments_total.clone()),
        ];
        for collector in collectors {
            registry.register(collector).expect("metric names are unique");
        }

        Self {
            registry,
            request_total,
            generation_duration_seconds,
            inflight_requests,
            generation_errors_total,
            stream_fragments_total,
        }
    }

    pub fn inflight_guard(&self) -> InflightGuard<'_> {
        self.inflight_requests.inc();
        InflightGuard { metrics: self }
    }

    pub fn observe_request(&self, path: &str, method: &str, stream: bool, status: u16) {
        let status_label = status.to_string();
        self.request_total
            .with_label_values(&[path, method, &status_label, stream_label(stream)])
            .inc();
    }

    /// Records a finished generation. For streams this is called once the
    /// last fragment (or the error) has been delivered.
    pub fn observe_generation(&self, engine: &str, stream: bool, ok: bool, duration: Duration) {
        let outcome = if ok { "ok" } else { "error" };
        self.generation_duration_seconds
            .with_label_values(&[engine, stream_label(stream), outcome])
            .observe(duration.as_secs_f64());
    }

    pub fn observe_generation_error(&self, engine: &str, stage: &str) {
        self.generation_errors_total
            .with_label_values(&[engine, stage])
            .inc();
    }

    pub fn observe_fragment(&self, engine: &str) {
        self.stream_fragments_total.with_label_values(&[engine]).inc();
    }

    pub fn render(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|error| error.to_string())?;
        String::from_utf8(buffer).map_err(|error| error.to_string())
    }
}

fn stream_label(stream: bool) -> &'static str {
    if stream {
        "true"
    } else {
        "false"
    }
}

impl Default for AppMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.metrics.inflight_requests.dec();
    }
}
