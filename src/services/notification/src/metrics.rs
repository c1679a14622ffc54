//! Metrics collection module for notification service
//!
//! Prometheus collectors for:
//! - Incoming `notify` requests by event type and outcome
//! - Per-channel delivery outcomes and latency
//! - Retry scheduler and dead-letter queue activity
//! - Batch flushes and live real-time connections

use crate::error::{NotificationError, Result};
use crate::config::MetricsConfig;
use fileshare_shared::{DeliveryResult, DispatchStatus};

use prometheus::core::Collector;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::Arc;
use tracing::info;

/// Metrics collector for the notification service
#[derive(Clone)]
pub struct NotificationMetrics {
    registry: Arc<Registry>,

    // Counters
    requests_total: IntCounterVec,
    deliveries_total: IntCounterVec,
    retries_total: IntCounterVec,
    dead_letters_total: IntCounterVec,
    events_ingested_total: IntCounterVec,
    batches_flushed_total: IntCounter,
    batched_items_total: IntCounter,

    // Gauges
    realtime_connections: IntGauge,

    // Histograms
    delivery_duration: HistogramVec,
}

fn register<C: Collector + Clone + 'static>(registry: &Registry, collector: &C, name: &str) -> Result<()> {
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| NotificationError::internal(format!("Failed to register {}: {}", name, e)))
}

fn counter_vec(config: &MetricsConfig, name: &str, help: &str, labels: &[&str]) -> Result<IntCounterVec> {
    IntCounterVec::new(Opts::new(name, help).namespace(&config.namespace), labels)
        .map_err(|e| NotificationError::internal(format!("Failed to create {} counter: {}", name, e)))
}

impl NotificationMetrics {
    /// Create a new metrics collector with its own registry
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        info!("Initializing notification metrics");

        let registry = Registry::new();

        let requests_total = counter_vec(
            config,
            "notification_requests_total",
            "Notify requests by event type and dispatch status",
            &["event_type", "status"],
        )?;
        let deliveries_total = counter_vec(
            config,
            "deliveries_total",
            "Channel deliveries by outcome",
            &["channel", "outcome"],
        )?;
        let retries_total = counter_vec(
            config,
            "retries_total",
            "Scheduled notification retries by outcome",
            &["outcome"],
        )?;
        let dead_letters_total = counter_vec(
            config,
            "dead_letters_total",
            "Dead-letter queue activity by outcome",
            &["outcome"],
        )?;
        let events_ingested_total = counter_vec(
            config,
            "events_ingested_total",
            "Inbound events by outcome",
            &["outcome"],
        )?;

        let batches_flushed_total = IntCounter::with_opts(
            Opts::new("batches_flushed_total", "Batch windows closed").namespace(&config.namespace),
        )
        .map_err(|e| NotificationError::internal(format!("Failed to create batches_flushed counter: {}", e)))?;

        let batched_items_total = IntCounter::with_opts(
            Opts::new("batched_items_total", "Events folded into batch windows")
                .namespace(&config.namespace),
        )
        .map_err(|e| NotificationError::internal(format!("Failed to create batched_items counter: {}", e)))?;

        let realtime_connections = IntGauge::with_opts(
            Opts::new("realtime_connections", "Live real-time connections").namespace(&config.namespace),
        )
        .map_err(|e| NotificationError::internal(format!("Failed to create realtime_connections gauge: {}", e)))?;

        let delivery_duration = HistogramVec::new(
            HistogramOpts::new(
                "delivery_duration_seconds",
                "Time taken to deliver on one channel, including channel-level retries",
            )
            .namespace(&config.namespace)
            .buckets(config.histogram_buckets.clone()),
            &["channel", "outcome"],
        )
        .map_err(|e| {
            NotificationError::internal(format!("Failed to create delivery_duration histogram: {}", e))
        })?;

        register(&registry, &requests_total, "requests_total")?;
        register(&registry, &deliveries_total, "deliveries_total")?;
        register(&registry, &retries_total, "retries_total")?;
        register(&registry, &dead_letters_total, "dead_letters_total")?;
        register(&registry, &events_ingested_total, "events_ingested_total")?;
        register(&registry, &batches_flushed_total, "batches_flushed_total")?;
        register(&registry, &batched_items_total, "batched_items_total")?;
        register(&registry, &realtime_connections, "realtime_connections")?;
        register(&registry, &delivery_duration, "delivery_duration")?;

        info!("Notification metrics initialized successfully");

        Ok(Self {
            registry: Arc::new(registry),
            requests_total,
            deliveries_total,
            retries_total,
            dead_letters_total,
            events_ingested_total,
            batches_flushed_total,
            batched_items_total,
            realtime_connections,
            delivery_duration,
        })
    }

    pub fn record_request(&self, event_type: &str, status: DispatchStatus) {
        let status = match status {
            DispatchStatus::Sent => "sent",
            DispatchStatus::Failed => "failed",
            DispatchStatus::Queued => "queued",
            DispatchStatus::Suppressed => "suppressed",
        };
        self.requests_total.with_label_values(&[event_type, status]).inc();
    }

    /// Record one per-channel delivery result
    pub fn record_delivery(&self, result: &DeliveryResult) {
        let outcome = if result.success { "success" } else { "failed" };
        let channel = result.channel.as_str();

        self.deliveries_total.with_label_values(&[channel, outcome]).inc();
        self.delivery_duration
            .with_label_values(&[channel, outcome])
            .observe(result.duration_ms as f64 / 1000.0);
    }

    /// `succeeded`, `rescheduled` or `exhausted`
    pub fn record_retry(&self, outcome: &str) {
        self.retries_total.with_label_values(&[outcome]).inc();
    }

    /// `enqueued`, `recovered`, `rescheduled` or `exhausted`
    pub fn record_dead_letter(&self, outcome: &str) {
        self.dead_letters_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_dead_letters_purged(&self, count: usize) {
        self.dead_letters_total
            .with_label_values(&["purged"])
            .inc_by(count as u64);
    }

    /// `accepted`, `malformed`, `skipped` or `rewound`
    pub fn record_ingested(&self, outcome: &str) {
        self.events_ingested_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_batch_item(&self) {
        self.batched_items_total.inc();
    }

    pub fn record_batch_flushed(&self) {
        self.batches_flushed_total.inc();
    }

    pub fn set_realtime_connections(&self, count: usize) {
        self.realtime_connections.set(count as i64);
    }

    /// Get Prometheus registry for metrics endpoint
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Export metrics in Prometheus format
    pub fn export_metrics(&self) -> Result<String> {
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        encoder
            .encode_to_string(&metric_families)
            .map_err(|e| NotificationError::internal(format!("Failed to encode metrics: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fileshare_shared::NotificationChannel;

    fn create_test_config() -> MetricsConfig {
        MetricsConfig {
            enabled: true,
            namespace: "test_notification_service".to_string(),
            histogram_buckets: vec![0.001, 0.01, 0.1, 1.0, 10.0],
        }
    }

    #[test]
    fn test_metrics_creation() {
        assert!(NotificationMetrics::new(&create_test_config()).is_ok());
        // each collector owns its registry, so a second instance must not clash
        assert!(NotificationMetrics::new(&create_test_config()).is_ok());
    }

    #[test]
    fn test_export_contains_recorded_values() {
        let metrics = NotificationMetrics::new(&create_test_config()).unwrap();

        metrics.record_request("file.uploaded", DispatchStatus::Sent);
        metrics.record_delivery(&DeliveryResult::success(NotificationChannel::Email));
        metrics.record_delivery(&DeliveryResult::failure(NotificationChannel::Sms, "disabled"));
        metrics.record_retry("exhausted");
        metrics.set_realtime_connections(3);

        let exported = metrics.export_metrics().unwrap();
        assert!(exported.contains(
            "test_notification_service_notification_requests_total{event_type=\"file.uploaded\",status=\"sent\"} 1"
        ));
        assert!(exported.contains(
            "test_notification_service_deliveries_total{channel=\"sms\",outcome=\"failed\"} 1"
        ));
        assert!(exported.contains("test_notification_service_realtime_connections 3"));
    }
}
