//! Background health prober
//!
//! Down connections are normally retried lazily, when every member of their
//! pool is Down. The prober brings them back sooner by probing each Down
//! connection on a fixed interval and marking it Up once it answers. When
//! given the routing state it also sweeps expired route bindings each round.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::registry::ConnectionRegistry;
use crate::resolver::RoutingState;

/// Result of one probing round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeReport {
    pub probed: usize,
    pub recovered: usize,
}

pub struct HealthProber {
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    routing: Option<Arc<RoutingState>>,
}

impl HealthProber {
    pub fn new(registry: Arc<ConnectionRegistry>, interval: Duration) -> Self {
        Self {
            registry,
            interval,
            routing: None,
        }
    }

    /// Also clear expired route bindings on every round
    pub fn with_routing_state(mut self, routing: Arc<RoutingState>) -> Self {
        self.routing = Some(routing);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Probe every Down connection once
    pub async fn probe_once(&self) -> ProbeReport {
        let down: Vec<_> = self
            .registry
            .snapshot_all()
            .into_iter()
            .flat_map(|pool| pool.members().to_vec())
            .filter(|member| !member.is_up())
            .collect();

        let probes = down.iter().map(|member| async move {
            let outcome = member.connection().probe().await;
            (member, outcome)
        });

        let mut report = ProbeReport {
            probed: down.len(),
            recovered: 0,
        };
        for (member, outcome) in join_all(probes).await {
            match outcome {
                Ok(()) => {
                    self.registry.record_success(member);
                    report.recovered += 1;
                }
                Err(err) => {
                    tracing::debug!(
                        pool = %member.pool_key(),
                        node = member.node_id(),
                        error = %err,
                        "Probe failed"
                    );
                }
            }
        }
        report
    }

    /// Run the prober until the returned handle is aborted
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(interval_secs = self.interval.as_secs(), "Health prober started");

            loop {
                ticker.tick().await;
                if let Some(routing) = &self.routing {
                    routing.clear_expired_bindings();
                }
                let report = self.probe_once().await;
                if report.probed > 0 {
                    tracing::debug!(
                        probed = report.probed,
                        recovered = report.recovered,
                        "Probe round finished"
                    );
                }
            }
        })
    }
}
