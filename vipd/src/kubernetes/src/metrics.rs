use prometheus::{opts, IntCounterVec, IntGauge, Registry};

use crate::config::DEFAULT_METRICS_NAMESPACE;

#[derive(Debug, Clone)]
pub struct Metrics {
    /// count_service_watch_event, labelled by watch event type.
    pub watch_events: IntCounterVec,
    pub host_failures: IntCounterVec,
    pub active_services: IntGauge,
}

impl Metrics {
    pub fn new(namespace: &str) -> Self {
        let watch_events = IntCounterVec::new(
            opts!(
                "service_watch_event_total",
                "Total count of service watch events",
            )
            .namespace(namespace),
            &["type"],
        )
        .unwrap();
        let host_failures = IntCounterVec::new(
            opts!(
                "host_program_failures_total",
                "Failures programming addresses or advertisements on the host",
            )
            .namespace(namespace),
            &["operation"],
        )
        .unwrap();
        let active_services = IntGauge::with_opts(
            opts!("active_services", "Number of services with a live actor")
                .namespace(namespace),
        )
        .unwrap();
        Metrics {
            watch_events,
            host_failures,
            active_services,
        }
    }

    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.watch_events.clone()))?;
        registry.register(Box::new(self.host_failures.clone()))?;
        registry.register(Box::new(self.active_services.clone()))?;
        Ok(self)
    }

    pub fn watch_event(&self, event_type: &str) {
        self.watch_events.with_label_values(&[event_type]).inc()
    }

    pub fn host_failure(&self, operation: &str) {
        self.host_failures.with_label_values(&[operation]).inc()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new(DEFAULT_METRICS_NAMESPACE)
    }
}
