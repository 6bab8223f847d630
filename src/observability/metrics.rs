//! OpenTelemetry metrics.
//!
//! Key metrics:
//! - prefbox_commits_total: Counter of editor commits by mode and outcome
//! - prefbox_notifications_total: Counter of change events dispatched
//! - prefbox_yield_points_total: Counter of yield points by source
//! - prefbox_contention_failures_total: Counter of batches failed for contention

use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::metrics::{ManualReader, SdkMeterProvider};
use std::sync::OnceLock;

/// Global metrics instance.
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Prefbox metrics registry.
#[derive(Debug)]
pub struct Metrics {
    pub commits_total: Counter<u64>,
    pub notifications_total: Counter<u64>,
    pub yield_points_total: Counter<u64>,
    pub contention_failures_total: Counter<u64>,
}

impl Metrics {
    fn new(meter: &Meter) -> Self {
        Self {
            commits_total: meter
                .u64_counter("prefbox_commits_total")
                .with_description("Editor commits by mode (apply/commit) and outcome")
                .with_unit("1")
                .init(),
            notifications_total: meter
                .u64_counter("prefbox_notifications_total")
                .with_description("Change events delivered to observers")
                .with_unit("1")
                .init(),
            yield_points_total: meter
                .u64_counter("prefbox_yield_points_total")
                .with_description("Yield points reached, by source and lock release")
                .with_unit("1")
                .init(),
            contention_failures_total: meter
                .u64_counter("prefbox_contention_failures_total")
                .with_description("Batches rejected for too many operations between yield points")
                .with_unit("1")
                .init(),
        }
    }
}

/// Initialize the metrics system.
///
/// Metrics are recorded into a manual reader and not exported. Subsequent
/// calls are ignored.
pub fn init_metrics() {
    METRICS.get_or_init(|| {
        let reader = ManualReader::builder().build();
        let provider = SdkMeterProvider::builder().with_reader(reader).build();
        global::set_meter_provider(provider);

        let meter = global::meter("prefbox");
        Metrics::new(&meter)
    });
}

/// The global metrics instance, if initialized.
pub fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

/// Record an editor commit.
pub fn record_commit(mode: &'static str, success: bool) {
    if let Some(m) = METRICS.get() {
        let attrs = [
            KeyValue::new("mode", mode),
            KeyValue::new("outcome", if success { "success" } else { "failure" }),
        ];
        m.commits_total.add(1, &attrs);
    }
}

/// Record change events delivered for one dispatch.
pub fn record_notifications(delivered: usize) {
    if let Some(m) = METRICS.get() {
        m.notifications_total.add(delivered as u64, &[]);
    }
}

/// Record a yield point.
pub fn record_yield(source: &'static str, released: bool) {
    if let Some(m) = METRICS.get() {
        let attrs = [
            KeyValue::new("source", source),
            KeyValue::new("released", released),
        ];
        m.yield_points_total.add(1, &attrs);
    }
}

/// Record a batch rejected for contention.
pub fn record_contention_failure() {
    if let Some(m) = METRICS.get() {
        m.contention_failures_total.add(1, &[]);
    }
}
