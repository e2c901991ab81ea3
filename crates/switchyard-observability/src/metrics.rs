//! Metrics collection with Prometheus
//!
//! This module provides Prometheus metrics for Switchyard:
//! - Dispatch counts by subsystem, strategy and outcome
//! - Dispatch latency histograms
//! - Failover counts per node
//! - Connection health gauges
//! - Authorization decisions

use prometheus::{CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Aggregate classification of one dispatch, used as a metric label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Success,
    PartiallyExecuted,
    NotFound,
    BusinessError,
    Failed,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Success => "success",
            DispatchOutcome::PartiallyExecuted => "partially_executed",
            DispatchOutcome::NotFound => "not_found",
            DispatchOutcome::BusinessError => "business_error",
            DispatchOutcome::Failed => "failed",
        }
    }
}

/// Metrics collector for Switchyard
#[derive(Clone)]
pub struct Metrics {
    /// Prometheus registry
    registry: Arc<Registry>,

    /// Dispatches by subsystem, strategy and outcome
    pub dispatch_total: CounterVec,
    /// End-to-end dispatch duration
    pub dispatch_duration_seconds: HistogramVec,
    /// Candidates abandoned after a transport error
    pub failover_total: CounterVec,
    /// Connection health (1=up, 0=down)
    pub connection_up: GaugeVec,
    /// Authorization decisions by outcome
    pub auth_decisions_total: CounterVec,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let dispatch_total = CounterVec::new(
            Opts::new("switchyard_dispatch_total", "Total number of dispatched calls"),
            &["subsystem", "strategy", "outcome"],
        )?;

        let dispatch_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "switchyard_dispatch_duration_seconds",
                "Dispatch duration in seconds, including failover attempts",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["subsystem"],
        )?;

        let failover_total = CounterVec::new(
            Opts::new(
                "switchyard_failover_total",
                "Candidates skipped after a transport error",
            ),
            &["subsystem", "node"],
        )?;

        let connection_up = GaugeVec::new(
            Opts::new("switchyard_connection_up", "Connection health (1=up, 0=down)"),
            &["tenant", "subsystem", "node"],
        )?;

        let auth_decisions_total = CounterVec::new(
            Opts::new(
                "switchyard_auth_decisions_total",
                "Authorization decisions by outcome",
            ),
            &["outcome"],
        )?;

        registry.register(Box::new(dispatch_total.clone()))?;
        registry.register(Box::new(dispatch_duration_seconds.clone()))?;
        registry.register(Box::new(failover_total.clone()))?;
        registry.register(Box::new(connection_up.clone()))?;
        registry.register(Box::new(auth_decisions_total.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            dispatch_total,
            dispatch_duration_seconds,
            failover_total,
            connection_up,
            auth_decisions_total,
        })
    }

    /// Get the Prometheus registry for exporting metrics
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a finished dispatch
    pub fn record_dispatch(
        &self,
        subsystem: &str,
        strategy: &str,
        outcome: DispatchOutcome,
        duration_secs: f64,
    ) {
        self.dispatch_total
            .with_label_values(&[subsystem, strategy, outcome.as_str()])
            .inc();
        self.dispatch_duration_seconds
            .with_label_values(&[subsystem])
            .observe(duration_secs);
    }

    /// Record a failover away from `node`
    pub fn record_failover(&self, subsystem: &str, node: &str) {
        self.failover_total
            .with_label_values(&[subsystem, node])
            .inc();
    }

    /// Update the health gauge of a connection
    pub fn set_connection_up(&self, tenant: &str, subsystem: &str, node: &str, up: bool) {
        self.connection_up
            .with_label_values(&[tenant, subsystem, node])
            .set(if up { 1.0 } else { 0.0 });
    }

    /// Record an authorization decision ("allowed", "unauthorized", ...)
    pub fn record_auth_decision(&self, outcome: &str) {
        self.auth_decisions_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn gather_text(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
