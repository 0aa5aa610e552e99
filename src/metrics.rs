use metrics::{describe_counter, describe_histogram, histogram, increment_counter};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

pub const CAPTURES_TOTAL: &str = "captures_total";
pub const CAPTURES_FAILED_TOTAL: &str = "captures_failed_total";
pub const CAPTURE_DURATION_SECONDS: &str = "capture_duration_seconds";
pub const RESTORE_FAILURES_TOTAL: &str = "restore_failures_total";
pub const DETACH_FAILURES_TOTAL: &str = "detach_failures_total";
pub const CONTROL_RECONNECTS_TOTAL: &str = "control_reconnects_total";

/// Process-wide capture metrics
///
/// Values are emitted through the `metrics` facade at record time, so they
/// reach whichever recorder is installed; without one they are dropped.
pub struct Metrics {
    _private: (),
}

static METRICS: Metrics = Metrics { _private: () };

impl Metrics {
    pub fn global() -> &'static Metrics {
        &METRICS
    }

    /// Attach descriptions to every metric name for the installed recorder.
    pub fn describe(&self) {
        describe_counter!(CAPTURES_TOTAL, "Full-page captures that produced a PNG");
        describe_counter!(CAPTURES_FAILED_TOTAL, "Full-page captures that failed");
        describe_histogram!(
            CAPTURE_DURATION_SECONDS,
            "Wall time of the capture pipeline, attach to detach"
        );
        describe_counter!(
            RESTORE_FAILURES_TOTAL,
            "Viewport restorations that failed after an override"
        );
        describe_counter!(DETACH_FAILURES_TOTAL, "Detach calls that failed and were ignored");
        describe_counter!(
            CONTROL_RECONNECTS_TOTAL,
            "Connection attempts made by the control channel"
        );
    }

    pub fn record_capture(&self, duration: Duration, success: bool) {
        if success {
            increment_counter!(CAPTURES_TOTAL);
        } else {
            increment_counter!(CAPTURES_FAILED_TOTAL);
        }
        histogram!(CAPTURE_DURATION_SECONDS, duration.as_secs_f64());
    }

    pub fn record_restore_failure(&self) {
        increment_counter!(RESTORE_FAILURES_TOTAL);
    }

    pub fn record_detach_failure(&self) {
        increment_counter!(DETACH_FAILURES_TOTAL);
    }

    pub fn record_control_reconnect(&self) {
        increment_counter!(CONTROL_RECONNECTS_TOTAL);
    }
}

pub struct PrometheusExporter {
    port: u16,
}

impl PrometheusExporter {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub fn address(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    /// Install the Prometheus recorder and serve `/metrics` on the configured port.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), Box<dyn std::error::Error>> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(self.address())
            .install()?;
        Metrics::global().describe();

        info!("Serving Prometheus metrics on {}", self.address());
        Ok(())
    }
}
