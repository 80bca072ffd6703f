use prometheus::{Encoder, IntCounter, IntGauge, Opts, TextEncoder};
use tracing::warn;

fn counter(name: &str, help: &str, stream: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(name, help).const_label("stream", stream.to_string()))
        .expect("valid metric opts for chart-sync counter")
}

fn gauge(name: &str, help: &str, stream: &str) -> IntGauge {
    IntGauge::with_opts(Opts::new(name, help).const_label("stream", stream.to_string()))
        .expect("valid metric opts for chart-sync gauge")
}

fn register(collectors: Vec<Box<dyn prometheus::core::Collector>>) {
    let registry = prometheus::default_registry();
    for metric in collectors {
        if let Err(e) = registry.register(metric) {
            warn!("Failed to register chart-sync metric: {}", e);
        }
    }
}

/// Encode every metric in the default registry in the Prometheus text format.
pub fn gather() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[derive(Clone)]
pub struct RelayMetrics {
    pub cycles: IntCounter,
    pub cycle_failures: IntCounter,
    pub published: IntCounter,
    pub publish_failures: IntCounter,
    pub backfills: IntCounter,
    /// Unix seconds of the last clean cycle
    pub watermark: IntGauge,
}

impl RelayMetrics {
    pub fn new(stream: &str) -> Self {
        let metrics = Self {
            cycles: counter(
                "chart_sync_relay_cycles_total",
                "Completed relay poll cycles",
                stream,
            ),
            cycle_failures: counter(
                "chart_sync_relay_cycle_failures_total",
                "Relay poll cycles aborted before the watermark write",
                stream,
            ),
            published: counter(
                "chart_sync_relay_published_total",
                "Change notifications published to the broker",
                stream,
            ),
            publish_failures: counter(
                "chart_sync_relay_publish_failures_total",
                "Change notifications the broker rejected",
                stream,
            ),
            backfills: counter(
                "chart_sync_relay_backfills_total",
                "Crash-recovery backfills run after finding the dirty bit set",
                stream,
            ),
            watermark: gauge(
                "chart_sync_relay_watermark_seconds",
                "Unix time of the last clean relay cycle",
                stream,
            ),
        };

        register(vec![
            Box::new(metrics.cycles.clone()),
            Box::new(metrics.cycle_failures.clone()),
            Box::new(metrics.published.clone()),
            Box::new(metrics.publish_failures.clone()),
            Box::new(metrics.backfills.clone()),
            Box::new(metrics.watermark.clone()),
        ]);

        metrics
    }
}

#[derive(Clone)]
pub struct ConsumerMetrics {
    pub merged: IntCounter,
    pub skipped: IntCounter,
    pub failed: IntCounter,
    pub watermark: IntGauge,
}

impl ConsumerMetrics {
    pub fn new(stream: &str) -> Self {
        let metrics = Self {
            merged: counter(
                "chart_sync_consumer_merged_total",
                "Records merged into the notes target",
                stream,
            ),
            skipped: counter(
                "chart_sync_consumer_skipped_total",
                "Records skipped as ineligible for merge",
                stream,
            ),
            failed: counter(
                "chart_sync_consumer_failed_total",
                "Messages left unacknowledged after a processing error",
                stream,
            ),
            watermark: gauge(
                "chart_sync_consumer_watermark_seconds",
                "Unix time of the last successful merge",
                stream,
            ),
        };

        register(vec![
            Box::new(metrics.merged.clone()),
            Box::new(metrics.skipped.clone()),
            Box::new(metrics.failed.clone()),
            Box::new(metrics.watermark.clone()),
        ]);

        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_exports_registered_stream_metrics() {
        let metrics = RelayMetrics::new("gather_test");
        metrics.published.inc_by(3);

        let text = gather().unwrap();

        assert!(text.contains("# TYPE chart_sync_relay_published_total counter"));
        assert!(text.contains(r#"chart_sync_relay_published_total{stream="gather_test"} 3"#));
        assert!(text.contains(r#"chart_sync_relay_watermark_seconds{stream="gather_test"} 0"#));
    }
}
