use tracing::{debug, warn};

/// Receives breadcrumbs and reportable errors from the link and session layers
pub trait TelemetrySink: Send + Sync {
    /// A notable event, e.g. `link.connected`
    fn breadcrumb(&self, category: &str, message: &str);

    /// An error worth reporting upstream
    fn error(&self, category: &str, message: &str);
}

/// Forwards telemetry to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn breadcrumb(&self, category: &str, message: &str) {
        debug!(target: "coasterlink::telemetry", category, "{}", message);
    }

    fn error(&self, category: &str, message: &str) {
        warn!(target: "coasterlink::telemetry", category, "{}", message);
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn breadcrumb(&self, _category: &str, _message: &str) {}

    fn error(&self, _category: &str, _message: &str) {}
}
