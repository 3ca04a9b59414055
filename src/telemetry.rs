use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;

const DURATION_BOUNDARIES_MS: [f64; 12] = [
    10.0, 25.0, 50.0, 75.0, 100.0, 150.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

pub struct Metrics {
    request_counter: Counter<u64>,
    detection_duration: Histogram<u64>,
    detections_counter: Counter<u64>,
    // Keeps the pipeline alive if the global provider is replaced.
    _provider: SdkMeterProvider,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = SdkMeterProvider::builder().with_reader(exporter).build();

        let meter = provider.meter("object_detection");
        global::set_meter_provider(provider.clone());

        let request_counter = meter
            .u64_counter("requests_total")
            .with_description("Total number of requests")
            .build();

        let detection_duration = meter
            .u64_histogram("detection_duration_ms")
            .with_boundaries(DURATION_BOUNDARIES_MS.to_vec())
            .with_description("Duration of the detection pipeline in milliseconds")
            .build();

        let detections_counter = meter
            .u64_counter("detections_total")
            .with_description("Total number of objects returned by detection requests")
            .build();

        Ok(Metrics {
            request_counter,
            detection_duration,
            detections_counter,
            _provider: provider,
            registry,
        })
    }

    pub fn record_request(&self, route: &str) {
        let attributes = [KeyValue::new("route", route.to_string())];
        self.request_counter.add(1, &attributes);
    }

    pub fn record_detection_duration(&self, duration_ms: u64, route: &str) {
        let attributes = [KeyValue::new("route", route.to_string())];
        self.detection_duration.record(duration_ms, &attributes);
    }

    pub fn record_detections(&self, count: usize) {
        self.detections_counter.add(count as u64, &[]);
    }
}
