//! Dispatch engine
//!
//! Executes one call against a (tenant, subsystem) pool: takes a snapshot,
//! asks the resolver for candidates, then either walks them sequentially
//! with failover on transport errors or broadcasts to all of them at once.
//!
//! Nothing is spawned. Broadcast sub-calls are polled together on the
//! caller's task, so dropping the dispatch future aborts every outstanding
//! call and no further candidate is tried.

use dashmap::DashMap;
use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use switchyard_core::{Error, Event, Result, Subsystem, Tenant};
use switchyard_observability::{DispatchOutcome, Metrics};
use tracing::Instrument;

use crate::gateway::MethodTable;
use crate::merge::{MergePolicy, NodeReply};
use crate::registry::{ConnectionHandle, ConnectionPool, ConnectionRegistry, PoolKey};
use crate::resolver::{RouteResolver, RoutingProfile, RoutingState, Strategy};

/// Routes calls to backend pools
pub struct DispatchEngine {
    registry: Arc<ConnectionRegistry>,
    resolver: RouteResolver,
    default_tenant: Tenant,
    default_strategy: Strategy,
    profiles: DashMap<PoolKey, RoutingProfile>,
    methods: Arc<MethodTable>,
    metrics: Option<Arc<Metrics>>,
    prevent_loop: bool,
}

impl DispatchEngine {
    pub fn new(registry: Arc<ConnectionRegistry>, state: Arc<RoutingState>, default_tenant: Tenant) -> Self {
        Self {
            registry,
            resolver: RouteResolver::new(state),
            default_tenant,
            default_strategy: Strategy::Default,
            profiles: DashMap::new(),
            methods: Arc::new(MethodTable::builtin()),
            metrics: None,
            prevent_loop: false,
        }
    }

    /// Strategy used by pools without a routing profile
    pub fn with_default_strategy(mut self, strategy: Strategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    /// Method table providing per-method merge policies
    pub fn with_methods(mut self, methods: Arc<MethodTable>) -> Self {
        self.methods = methods;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Serve events already forwarded by a dispatcher (`*subsys:
    /// *dispatchers`) from the internal node instead of routing them again
    pub fn with_prevent_loop(mut self, prevent_loop: bool) -> Self {
        self.prevent_loop = prevent_loop;
        self
    }

    /// Set the strategy of a (tenant, subsystem) pool, keeping its ratio
    pub fn set_strategy(&self, tenant: &Tenant, subsystem: Subsystem, strategy: Strategy) {
        self.profiles
            .entry(PoolKey::new(tenant.clone(), subsystem))
            .and_modify(|profile| profile.strategy = strategy)
            .or_insert_with(|| RoutingProfile::new(strategy));
    }

    /// Set the full routing profile of a (tenant, subsystem) pool
    pub fn set_profile(&self, tenant: &Tenant, subsystem: Subsystem, profile: RoutingProfile) {
        self.profiles
            .insert(PoolKey::new(tenant.clone(), subsystem), profile);
    }

    /// Routing profile in effect for a (tenant, subsystem) pool
    pub fn profile_for(&self, tenant: &Tenant, subsystem: Subsystem) -> RoutingProfile {
        self.profiles
            .get(&PoolKey::new(tenant.clone(), subsystem))
            .map(|profile| *profile)
            .unwrap_or_else(|| RoutingProfile::new(self.default_strategy))
    }

    /// Strategy in effect for a (tenant, subsystem) pool
    pub fn strategy_for(&self, tenant: &Tenant, subsystem: Subsystem) -> Strategy {
        self.profile_for(tenant, subsystem).strategy
    }

    /// Remove a node from its pool and forget the routes bound to it
    pub fn deregister(&self, tenant: &Tenant, subsystem: Subsystem, node_id: &str) -> bool {
        let removed = self.registry.deregister(tenant, subsystem, node_id);
        if removed {
            let key = PoolKey::new(tenant.clone(), subsystem);
            let unbound = self.resolver.state().unbind_node(&key, node_id);
            tracing::debug!(pool = %key, node = node_id, unbound, "Dropped route bindings");
        }
        removed
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn resolver(&self) -> &RouteResolver {
        &self.resolver
    }

    pub fn methods(&self) -> &Arc<MethodTable> {
        &self.methods
    }

    pub fn default_tenant(&self) -> &Tenant {
        &self.default_tenant
    }

    /// Dispatch one call.
    ///
    /// Returns the backend reply, a business error verbatim, `NotFound` when
    /// no node could be reached, or `PartiallyExecuted` when a broadcast
    /// reached only part of the pool.
    pub async fn dispatch(
        &self,
        event: &Event,
        subsystem: Subsystem,
        route_id: Option<&str>,
        method: &str,
        args: &Value,
    ) -> Result<Value> {
        let tenant = Tenant::or_default(Some(event.tenant.as_str()), &self.default_tenant);
        let profile = self.profile_for(&tenant, subsystem);
        let strategy = profile.strategy;
        let started = Instant::now();

        let span = tracing::debug_span!(
            "dispatch",
            tenant = %tenant,
            subsystem = %subsystem,
            method,
            strategy = %strategy,
            event_id = %event.id,
        );

        let result: Result<Value> = async {
            if !event.should_dispatch()? || (self.prevent_loop && event.is_from_dispatcher()) {
                return self.dispatch_internal(&tenant, subsystem, method, args).await;
            }

            let pool = self.registry.pool(&tenant, subsystem)?;
            let candidates = self.resolver.resolve_profile(&pool, &profile, route_id)?;
            tracing::debug!(candidates = candidates.len(), "Resolved candidates");

            if strategy.is_broadcast() {
                self.broadcast(&pool, candidates, method, args).await
            } else {
                self.sequential(&pool, candidates, route_id, method, args).await
            }
        }
        .instrument(span)
        .await;

        self.record(subsystem, strategy, &result, started);
        result
    }

    /// Loop-protected event: skip routing and use the pool's in-process node
    async fn dispatch_internal(
        &self,
        tenant: &Tenant,
        subsystem: Subsystem,
        method: &str,
        args: &Value,
    ) -> Result<Value> {
        let pool = self.registry.pool(tenant, subsystem)?;
        let internal = pool
            .members()
            .iter()
            .find(|member| member.info().internal)
            .ok_or(Error::NotFound)?;

        tracing::debug!(node = internal.node_id(), "Routing disabled, using internal connection");
        internal.call(method, args).await
    }

    async fn sequential(
        &self,
        pool: &ConnectionPool,
        candidates: Vec<Arc<ConnectionHandle>>,
        route_id: Option<&str>,
        method: &str,
        args: &Value,
    ) -> Result<Value> {
        for conn in candidates {
            tracing::debug!(node = conn.node_id(), "Attempting call");

            match conn.call(method, args).await {
                Ok(reply) => {
                    self.registry.record_success(&conn);
                    if let Some(route_id) = route_id.filter(|id| !id.is_empty()) {
                        self.resolver.state().bind(pool.key(), route_id, conn.node_id());
                    }
                    return Ok(reply);
                }
                Err(err) if err.should_failover() => {
                    self.registry.record_failure(&conn);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_failover(pool.subsystem().as_str(), conn.node_id());
                    }
                    tracing::warn!(
                        node = conn.node_id(),
                        error = %err,
                        "Node unreachable, trying next candidate"
                    );
                }
                Err(err) => {
                    // The node answered, so it is healthy
                    self.registry.mark_up(&conn);
                    return Err(err);
                }
            }
        }

        tracing::warn!(pool = %pool.key(), "No reachable node");
        Err(Error::NotFound)
    }

    async fn broadcast(
        &self,
        pool: &ConnectionPool,
        candidates: Vec<Arc<ConnectionHandle>>,
        method: &str,
        args: &Value,
    ) -> Result<Value> {
        let calls = candidates.into_iter().map(|conn| async move {
            let outcome = conn.call(method, args).await;
            (conn, outcome)
        });
        let outcomes = join_all(calls).await;

        let mut tally = BroadcastTally::default();
        for (conn, outcome) in outcomes {
            match outcome {
                Ok(reply) => {
                    self.registry.record_success(&conn);
                    tally.succeeded.push(NodeReply::new(conn.node_id(), reply));
                }
                Err(err) => {
                    if err.should_failover() {
                        self.registry.record_failure(&conn);
                        if let Some(metrics) = &self.metrics {
                            metrics.record_failover(pool.subsystem().as_str(), conn.node_id());
                        }
                    } else {
                        self.registry.mark_up(&conn);
                    }
                    tracing::warn!(node = conn.node_id(), error = %err, "Broadcast call failed");
                    tally.failed.push((conn.node_id().to_string(), err));
                }
            }
        }

        tally.into_result(&self.methods.merge_policy(method))
    }

    fn record(&self, subsystem: Subsystem, strategy: Strategy, result: &Result<Value>, started: Instant) {
        let outcome = match result {
            Ok(_) => DispatchOutcome::Success,
            Err(Error::PartiallyExecuted { .. }) => DispatchOutcome::PartiallyExecuted,
            Err(Error::NotFound) => DispatchOutcome::NotFound,
            Err(Error::Business(_)) => DispatchOutcome::BusinessError,
            Err(_) => DispatchOutcome::Failed,
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_dispatch(
                subsystem.as_str(),
                strategy.as_str(),
                outcome,
                started.elapsed().as_secs_f64(),
            );
        }
    }
}

/// Outcomes of one broadcast, in candidate order
#[derive(Debug, Default)]
pub struct BroadcastTally {
    pub succeeded: Vec<NodeReply>,
    pub failed: Vec<(String, Error)>,
}

impl BroadcastTally {
    /// Aggregate the outcomes into the caller-visible result
    pub fn into_result(self, merge: &MergePolicy) -> Result<Value> {
        if self.failed.is_empty() {
            if self.succeeded.is_empty() {
                return Err(Error::NotFound);
            }
            return Ok(merge.merge(self.succeeded));
        }

        if self.succeeded.is_empty() {
            if self.failed.iter().all(|(_, err)| err.should_failover()) {
                return Err(Error::NotFound);
            }
            let first = &self.failed[0].1;
            if self.failed.iter().all(|(_, err)| err == first) {
                return Err(first.clone());
            }
            let details: Vec<String> = self
                .failed
                .iter()
                .map(|(node, err)| format!("{}: {}", node, err))
                .collect();
            return Err(Error::DispatchFailed(details.join("; ")));
        }

        let failed_nodes = self.failed.into_iter().map(|(node, _)| node).collect();
        Err(Error::PartiallyExecuted {
            reply: Box::new(merge.merge(self.succeeded)),
            failed_nodes,
        })
    }
}
