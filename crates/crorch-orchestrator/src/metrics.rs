//! ---
//! crorch_section: "03-persistence-logging"
//! crorch_subsection: "module"
//! crorch_type: "source"
//! crorch_scope: "code"
//! crorch_description: "Prometheus instruments for lifecycle requests and callbacks."
//! crorch_version: "v0.1.0"
//! crorch_owner: "platform"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use prometheus::{
    exponential_buckets, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};

use crate::reporter::DeliveryOutcome;
use crate::result::LifecycleStatus;

/// Shared registry type used by the daemon and the dispatcher.
pub type SharedRegistry = Arc<Registry>;

pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Render every metric family in the prometheus text format.
pub fn render(registry: &Registry) -> Result<String> {
    TextEncoder::new()
        .encode_to_string(&registry.gather())
        .context("failed to encode metrics")
}

/// Content type of [`render`] output.
pub fn content_type() -> &'static str {
    prometheus::TEXT_FORMAT
}

#[derive(Clone)]
pub struct OrchestratorMetrics {
    pub requests: IntCounterVec,
    pub duration: Histogram,
    pub timeouts: IntCounter,
    pub deliveries: IntCounterVec,
}

impl OrchestratorMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let requests = IntCounterVec::new(
            Opts::new(
                "crorch_lifecycle_requests_total",
                "Lifecycle requests by resource type, request type and terminal status",
            ),
            &["resource_type", "request_type", "status"],
        )?;
        let duration = Histogram::with_opts(
            HistogramOpts::new(
                "crorch_lifecycle_duration_seconds",
                "Wall-clock time from request receipt to terminal result",
            )
            .buckets(exponential_buckets(0.05, 2.0, 16)?),
        )?;
        let timeouts = IntCounter::with_opts(Opts::new(
            "crorch_handler_timeouts_total",
            "Handlers that overran their budget",
        ))?;
        let deliveries = IntCounterVec::new(
            Opts::new(
                "crorch_callback_deliveries_total",
                "Callback deliveries by outcome",
            ),
            &["outcome"],
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(timeouts.clone()))?;
        registry.register(Box::new(deliveries.clone()))?;

        Ok(Self {
            requests,
            duration,
            timeouts,
            deliveries,
        })
    }

    pub fn record_request(
        &self,
        resource_type: &str,
        request_type: &str,
        status: LifecycleStatus,
        elapsed: Duration,
    ) {
        self.requests
            .with_label_values(&[resource_type, request_type, status.as_str()])
            .inc();
        self.duration.observe(elapsed.as_secs_f64());
    }

    pub fn record_timeout(&self) {
        self.timeouts.inc();
    }

    pub fn record_delivery(&self, outcome: &DeliveryOutcome) {
        self.deliveries
            .with_label_values(&[outcome.label()])
            .inc();
    }
}

impl std::fmt::Debug for OrchestratorMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorMetrics")
            .field("timeouts", &self.timeouts.get())
            .finish_non_exhaustive()
    }
}
