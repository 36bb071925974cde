use prometheus::{
    Encoder, Gauge, Histogram, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::env;

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "tg_wireprobe".to_string());

    // === Send loop ===

    pub static ref CYCLES_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("cycles_total", "Total number of send cycles started")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref CADENCE_OVERRUNS_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("cadence_overruns_total", "Cycles whose call took at least the cadence interval")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref CALL_OUTCOMES_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("call_outcomes_total", "Number of calls by outcome")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["outcome"]  // success or a FailureKind label
        ).unwrap();

    pub static ref CALL_DURATION_SECONDS: Histogram =
        Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "call_duration_seconds",
                "End-to-end call latencies in seconds."
            ).namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    // === Tracing client ===

    pub static ref CONNECTIONS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("connections_total", "Connections obtained for calls")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["kind"]  // new, reused
        ).unwrap();

    // === Log hub ===

    pub static ref LOG_EVENTS_DROPPED: IntCounterVec =
        IntCounterVec::new(
            Opts::new("log_events_dropped_total", "Log events dropped because a queue was full")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["stage"]  // intake, subscriber
        ).unwrap();

    pub static ref LOG_SUBSCRIBERS: Gauge =
        Gauge::with_opts(
            Opts::new("log_subscribers", "Number of live log stream subscribers")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();
}

/// Registers all metrics with the given registry.
pub fn register_metrics(registry: &Registry) -> Result<(), prometheus::Error> {
    registry.register(Box::new(CYCLES_TOTAL.clone()))?;
    registry.register(Box::new(CADENCE_OVERRUNS_TOTAL.clone()))?;
    registry.register(Box::new(CALL_OUTCOMES_TOTAL.clone()))?;
    registry.register(Box::new(CALL_DURATION_SECONDS.clone()))?;
    registry.register(Box::new(CONNECTIONS_TOTAL.clone()))?;
    registry.register(Box::new(LOG_EVENTS_DROPPED.clone()))?;
    registry.register(Box::new(LOG_SUBSCRIBERS.clone()))?;
    Ok(())
}

/// Encodes the registry in the Prometheus text format.
pub fn gather_metrics_string(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::from("# ERROR ENCODING METRICS");
    }
    String::from_utf8(buffer).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Metrics output was not UTF-8");
        String::from("# ERROR ENCODING METRICS TO UTF-8")
    })
}

/// Content type of [`gather_metrics_string`] output.
pub fn metrics_content_type() -> String {
    TextEncoder::new().format_type().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_into_fresh_registry() {
        let registry = Registry::new();
        register_metrics(&registry).unwrap();
        CYCLES_TOTAL.inc();
        CALL_OUTCOMES_TOTAL.with_label_values(&["success"]).inc();
        let text = gather_metrics_string(&registry);
        assert!(text.contains("tg_wireprobe_cycles_total"));
        assert!(text.contains("tg_wireprobe_call_outcomes_total"));
    }

    #[test]
    fn double_registration_fails() {
        let registry = Registry::new();
        register_metrics(&registry).unwrap();
        assert!(register_metrics(&registry).is_err());
    }
}
