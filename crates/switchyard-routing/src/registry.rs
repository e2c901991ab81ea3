//! Connection Registry
//!
//! Owns, per (tenant, subsystem), the ordered set of backend connections and
//! their health. The registry is the only writer of membership and health;
//! readers take a [`ConnectionPool`] snapshot once per dispatch and keep
//! working on it while nodes join, leave or change state.
//!
//! Health is tracked lazily: a transport failure marks a connection Down, a
//! later successful call or probe marks it Up again. Down connections stay
//! members until they are explicitly deregistered.

use dashmap::DashMap;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use switchyard_core::{Connection, ConnectionInfo, Error, Result, Subsystem, Tenant};
use switchyard_observability::Metrics;

/// Health state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Up = 0,
    Down = 1,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            1 => ConnectionState::Down,
            _ => ConnectionState::Up,
        }
    }
}

/// Identifies one connection pool
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub tenant: Tenant,
    pub subsystem: Subsystem,
}

impl PoolKey {
    pub fn new(tenant: Tenant, subsystem: Subsystem) -> Self {
        Self { tenant, subsystem }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tenant, self.subsystem)
    }
}

/// Snapshot of a connection's health counters
#[derive(Debug, Clone)]
pub struct ConnectionHealth {
    pub state: ConnectionState,
    pub success_count: u64,
    pub failure_count: u64,
    pub time_since_last_success: Option<Duration>,
    pub time_since_last_failure: Option<Duration>,
}

/// A registered backend connection together with its health
pub struct ConnectionHandle {
    info: ConnectionInfo,
    pool: PoolKey,
    connection: Arc<dyn Connection>,
    /// Registration order, breaks weight ties
    seq: u64,
    state: AtomicU8,
    /// Calls currently awaiting a reply
    in_flight: AtomicUsize,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    last_success: RwLock<Option<Instant>>,
    last_failure: RwLock<Option<Instant>>,
}

impl ConnectionHandle {
    fn new(info: ConnectionInfo, pool: PoolKey, connection: Arc<dyn Connection>, seq: u64) -> Self {
        Self {
            info,
            pool,
            connection,
            seq,
            state: AtomicU8::new(ConnectionState::Up as u8),
            in_flight: AtomicUsize::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            last_success: RwLock::new(None),
            last_failure: RwLock::new(None),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.info.node_id
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn pool_key(&self) -> &PoolKey {
        &self.pool
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::Acquire))
    }

    pub fn is_up(&self) -> bool {
        self.state() == ConnectionState::Up
    }

    /// Number of calls to this node still awaiting a reply
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Forward a call to the backend node
    pub async fn call(&self, method: &str, args: &Value) -> Result<Value> {
        let _load = InFlightGuard::enter(&self.in_flight);
        self.connection.call(method, args).await
    }

    /// Swap the state, returning the previous one
    fn set_state(&self, state: ConnectionState) -> ConnectionState {
        ConnectionState::from(self.state.swap(state as u8, Ordering::AcqRel))
    }

    fn record_success(&self) {
        self.success_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(1))
            })
            .ok();
        *self
            .last_success
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Instant::now());
    }

    fn record_failure(&self) {
        self.failure_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(1))
            })
            .ok();
        *self
            .last_failure
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Instant::now());
    }

    /// Current health counters
    pub fn health(&self) -> ConnectionHealth {
        ConnectionHealth {
            state: self.state(),
            success_count: self.success_count.load(Ordering::Acquire),
            failure_count: self.failure_count.load(Ordering::Acquire),
            time_since_last_success: self
                .last_success
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .map(|instant| instant.elapsed()),
            time_since_last_failure: self
                .last_failure
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .map(|instant| instant.elapsed()),
        }
    }
}

/// Counts one call as in flight until dropped, so cancelled calls are
/// released too
struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("node_id", &self.info.node_id)
            .field("pool", &self.pool)
            .field("weight", &self.info.weight)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Immutable, ordered snapshot of one (tenant, subsystem) pool.
///
/// Members are ordered by weight (highest first), ties in registration order.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    key: PoolKey,
    members: Vec<Arc<ConnectionHandle>>,
}

impl ConnectionPool {
    /// A pool with no members
    pub fn empty(key: PoolKey) -> Self {
        Self {
            key,
            members: Vec::new(),
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn tenant(&self) -> &Tenant {
        &self.key.tenant
    }

    pub fn subsystem(&self) -> Subsystem {
        self.key.subsystem
    }

    pub fn members(&self) -> &[Arc<ConnectionHandle>] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members currently Up, in pool order
    pub fn up_members(&self) -> Vec<Arc<ConnectionHandle>> {
        self.members.iter().filter(|m| m.is_up()).cloned().collect()
    }

    /// Find a member by node ID
    pub fn get(&self, node_id: &str) -> Option<&Arc<ConnectionHandle>> {
        self.members.iter().find(|m| m.node_id() == node_id)
    }
}

/// Registry of all connection pools
pub struct ConnectionRegistry {
    pools: DashMap<PoolKey, Vec<Arc<ConnectionHandle>>>,
    next_seq: AtomicU64,
    metrics: Option<Arc<Metrics>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            pools: DashMap::new(),
            next_seq: AtomicU64::new(0),
            metrics: None,
        }
    }

    /// Report health transitions to a metrics collector
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Add a node to the pool of (tenant, subsystem).
    ///
    /// Registering a node ID that is already a member replaces its handle,
    /// keeping its position among equal weights; the new handle starts Up.
    pub fn register(
        &self,
        tenant: &Tenant,
        subsystem: Subsystem,
        info: ConnectionInfo,
        connection: Arc<dyn Connection>,
    ) -> Arc<ConnectionHandle> {
        let key = PoolKey::new(tenant.clone(), subsystem);
        let mut members = self.pools.entry(key.clone()).or_default();

        let existing = members.iter().position(|m| m.node_id() == info.node_id);
        let seq = match existing {
            Some(index) => members[index].seq,
            None => self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        let handle = Arc::new(ConnectionHandle::new(info, key.clone(), connection, seq));

        match existing {
            Some(index) => members[index] = handle.clone(),
            None => members.push(handle.clone()),
        }
        members.sort_by(|a, b| b.info.weight.cmp(&a.info.weight).then(a.seq.cmp(&b.seq)));
        drop(members);

        tracing::debug!(
            pool = %key,
            node = handle.node_id(),
            weight = handle.info.weight,
            replaced = existing.is_some(),
            "Registered connection"
        );
        self.report_state(&handle);
        handle
    }

    /// Remove a node from a pool. Returns whether it was a member.
    ///
    /// The pool itself disappears with its last member.
    pub fn deregister(&self, tenant: &Tenant, subsystem: Subsystem, node_id: &str) -> bool {
        let key = PoolKey::new(tenant.clone(), subsystem);
        let (removed, now_empty) = match self.pools.get_mut(&key) {
            Some(mut members) => {
                let before = members.len();
                members.retain(|m| m.node_id() != node_id);
                (members.len() != before, members.is_empty())
            }
            None => return false,
        };

        if now_empty {
            self.pools.remove_if(&key, |_, members| members.is_empty());
        }
        if removed {
            tracing::debug!(pool = %key, node = node_id, "Deregistered connection");
        }
        removed
    }

    /// Snapshot of the pool for (tenant, subsystem).
    ///
    /// Fails with `NotFound` when the tenant has no node for the subsystem.
    pub fn pool(&self, tenant: &Tenant, subsystem: Subsystem) -> Result<ConnectionPool> {
        let key = PoolKey::new(tenant.clone(), subsystem);
        let members = self
            .pools
            .get(&key)
            .map(|members| members.clone())
            .unwrap_or_default();

        if members.is_empty() {
            return Err(Error::NotFound);
        }
        Ok(ConnectionPool { key, members })
    }

    /// Snapshots of every pool, sorted by key for stable output
    pub fn snapshot_all(&self) -> Vec<ConnectionPool> {
        let mut pools: Vec<ConnectionPool> = self
            .pools
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| ConnectionPool {
                key: entry.key().clone(),
                members: entry.value().clone(),
            })
            .collect();
        pools.sort_by(|a, b| {
            (&a.key.tenant, a.key.subsystem).cmp(&(&b.key.tenant, b.key.subsystem))
        });
        pools
    }

    /// Mark a connection Down; it stops being a routing candidate while
    /// other members are Up
    pub fn mark_down(&self, conn: &ConnectionHandle) {
        if conn.set_state(ConnectionState::Down) == ConnectionState::Up {
            tracing::warn!(pool = %conn.pool, node = conn.node_id(), "Connection marked down");
            self.report_state(conn);
        }
    }

    /// Mark a connection Up again
    pub fn mark_up(&self, conn: &ConnectionHandle) {
        if conn.set_state(ConnectionState::Up) == ConnectionState::Down {
            tracing::info!(pool = %conn.pool, node = conn.node_id(), "Connection back up");
            self.report_state(conn);
        }
    }

    /// The node answered: count it and bring it Up
    pub fn record_success(&self, conn: &ConnectionHandle) {
        conn.record_success();
        self.mark_up(conn);
    }

    /// The node could not be reached: count it and take it Down
    pub fn record_failure(&self, conn: &ConnectionHandle) {
        conn.record_failure();
        self.mark_down(conn);
    }

    /// Health counters of one pool member
    pub fn health(&self, tenant: &Tenant, subsystem: Subsystem, node_id: &str) -> Option<ConnectionHealth> {
        let key = PoolKey::new(tenant.clone(), subsystem);
        self.pools
            .get(&key)?
            .iter()
            .find(|m| m.node_id() == node_id)
            .map(|m| m.health())
    }

    /// Number of registered pools
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    fn report_state(&self, conn: &ConnectionHandle) {
        if let Some(metrics) = &self.metrics {
            metrics.set_connection_up(
                conn.pool.tenant.as_str(),
                conn.pool.subsystem.as_str(),
                conn.node_id(),
                conn.is_up(),
            );
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullConnection;

    #[async_trait::async_trait]
    impl Connection for NullConnection {
        async fn call(&self, _method: &str, _args: &Value) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    fn tenant() -> Tenant {
        Tenant::new("cgrates.org").unwrap()
    }

    fn register(registry: &ConnectionRegistry, info: ConnectionInfo) -> Arc<ConnectionHandle> {
        registry.register(&tenant(), Subsystem::Core, info, Arc::new(NullConnection))
    }

    fn node_ids(pool: &ConnectionPool) -> Vec<&str> {
        pool.members().iter().map(|m| m.node_id()).collect()
    }

    #[test]
    fn test_missing_pool_is_not_found() {
        let registry = ConnectionRegistry::new();
        let err = registry.pool(&tenant(), Subsystem::Core).unwrap_err();
        assert_eq!(err, Error::NotFound);
    }

    #[test]
    fn test_pool_keeps_registration_order_for_equal_weights() {
        let registry = ConnectionRegistry::new();
        register(&registry, ConnectionInfo::new("a"));
        register(&registry, ConnectionInfo::new("b"));
        register(&registry, ConnectionInfo::new("c"));

        let pool = registry.pool(&tenant(), Subsystem::Core).unwrap();
        assert_eq!(node_ids(&pool), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_pool_orders_by_weight() {
        let registry = ConnectionRegistry::new();
        register(&registry, ConnectionInfo::new("low").with_weight(10));
        register(&registry, ConnectionInfo::new("high").with_weight(30));
        register(&registry, ConnectionInfo::new("mid").with_weight(20));

        let pool = registry.pool(&tenant(), Subsystem::Core).unwrap();
        assert_eq!(node_ids(&pool), vec!["high", "mid", "low"]);
    }

    #[test]
    fn test_pools_are_scoped_by_tenant_and_subsystem() {
        let registry = ConnectionRegistry::new();
        register(&registry, ConnectionInfo::new("a"));

        assert!(registry.pool(&tenant(), Subsystem::Rates).is_err());
        let other = Tenant::new("itsyscom.com").unwrap();
        assert!(registry.pool(&other, Subsystem::Core).is_err());
        assert_eq!(registry.pool_count(), 1);
    }

    #[test]
    fn test_reregister_replaces_handle_in_place() {
        let registry = ConnectionRegistry::new();
        register(&registry, ConnectionInfo::new("a"));
        let old_b = register(&registry, ConnectionInfo::new("b"));
        register(&registry, ConnectionInfo::new("c"));
        registry.mark_down(&old_b);

        let new_b = register(&registry, ConnectionInfo::new("b"));
        let pool = registry.pool(&tenant(), Subsystem::Core).unwrap();
        assert_eq!(node_ids(&pool), vec!["a", "b", "c"]);
        assert!(new_b.is_up());
        assert!(Arc::ptr_eq(pool.get("b").unwrap(), &new_b));
    }

    #[test]
    fn test_deregister_removes_member_and_empty_pool() {
        let registry = ConnectionRegistry::new();
        register(&registry, ConnectionInfo::new("a"));
        register(&registry, ConnectionInfo::new("b"));

        assert!(registry.deregister(&tenant(), Subsystem::Core, "a"));
        assert!(!registry.deregister(&tenant(), Subsystem::Core, "a"));
        let pool = registry.pool(&tenant(), Subsystem::Core).unwrap();
        assert_eq!(node_ids(&pool), vec!["b"]);

        assert!(registry.deregister(&tenant(), Subsystem::Core, "b"));
        assert_eq!(
            registry.pool(&tenant(), Subsystem::Core).unwrap_err(),
            Error::NotFound
        );
        assert_eq!(registry.pool_count(), 0);
    }

    #[test]
    fn test_snapshot_survives_concurrent_mutation() {
        let registry = ConnectionRegistry::new();
        register(&registry, ConnectionInfo::new("a"));
        register(&registry, ConnectionInfo::new("b"));

        let snapshot = registry.pool(&tenant(), Subsystem::Core).unwrap();
        registry.deregister(&tenant(), Subsystem::Core, "a");
        register(&registry, ConnectionInfo::new("c"));

        assert_eq!(node_ids(&snapshot), vec!["a", "b"]);
        let fresh = registry.pool(&tenant(), Subsystem::Core).unwrap();
        assert_eq!(node_ids(&fresh), vec!["b", "c"]);
    }

    #[test]
    fn test_down_members_stay_registered() {
        let registry = ConnectionRegistry::new();
        let a = register(&registry, ConnectionInfo::new("a"));
        register(&registry, ConnectionInfo::new("b"));

        registry.mark_down(&a);
        let pool = registry.pool(&tenant(), Subsystem::Core).unwrap();
        assert_eq!(pool.len(), 2);
        let up: Vec<_> = pool.up_members().iter().map(|m| m.node_id().to_string()).collect();
        assert_eq!(up, vec!["b"]);

        registry.mark_up(&a);
        assert_eq!(pool.up_members().len(), 2);
    }

    #[test]
    fn test_health_counters() {
        let registry = ConnectionRegistry::new();
        let a = register(&registry, ConnectionInfo::new("a"));

        registry.record_failure(&a);
        let health = a.health();
        assert_eq!(health.state, ConnectionState::Down);
        assert_eq!(health.failure_count, 1);
        assert!(health.time_since_last_failure.is_some());
        assert!(health.time_since_last_success.is_none());

        registry.record_success(&a);
        registry.record_success(&a);
        let health = registry.health(&tenant(), Subsystem::Core, "a").unwrap();
        assert_eq!(health.state, ConnectionState::Up);
        assert_eq!(health.success_count, 2);
        assert_eq!(health.failure_count, 1);
        assert!(registry.health(&tenant(), Subsystem::Core, "zz").is_none());
    }

    #[test]
    fn test_state_transitions_update_metrics() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let registry = ConnectionRegistry::new().with_metrics(metrics.clone());
        let a = register(&registry, ConnectionInfo::new("a"));
        let gauge = metrics
            .connection_up
            .with_label_values(&["cgrates.org", "*core", "a"]);
        assert_eq!(gauge.get(), 1.0);

        registry.mark_down(&a);
        assert_eq!(gauge.get(), 0.0);
        registry.mark_up(&a);
        assert_eq!(gauge.get(), 1.0);
    }

    #[test]
    fn test_snapshot_all_is_sorted() {
        let registry = ConnectionRegistry::new();
        registry.register(
            &tenant(),
            Subsystem::Rates,
            ConnectionInfo::new("r1"),
            Arc::new(NullConnection),
        );
        register(&registry, ConnectionInfo::new("c1"));

        let pools = registry.snapshot_all();
        let subsystems: Vec<_> = pools.iter().map(|p| p.subsystem()).collect();
        assert_eq!(subsystems, vec![Subsystem::Core, Subsystem::Rates]);
    }

    #[test]
    fn test_concurrent_registration() {
        let registry = Arc::new(ConnectionRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for j in 0..25 {
                        registry.register(
                            &tenant(),
                            Subsystem::Core,
                            ConnectionInfo::new(format!("n{}-{}", i, j)),
                            Arc::new(NullConnection),
                        );
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let pool = registry.pool(&tenant(), Subsystem::Core).unwrap();
        assert_eq!(pool.len(), 200);
    }

    struct HangingConnection;

    #[async_trait::async_trait]
    impl Connection for HangingConnection {
        async fn call(&self, _method: &str, _args: &Value) -> Result<Value> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_in_flight_released_on_completion_and_cancel() {
        let registry = ConnectionRegistry::new();
        let args = Value::Null;

        let quick = register(&registry, ConnectionInfo::new("quick"));
        quick.call("CoreSv1.Ping", &args).await.unwrap();
        assert_eq!(quick.in_flight(), 0);

        let hanging = registry.register(
            &tenant(),
            Subsystem::Rates,
            ConnectionInfo::new("hanging"),
            Arc::new(HangingConnection),
        );
        let mut call = Box::pin(hanging.call("CoreSv1.Sleep", &args));
        let timed_out = tokio::time::timeout(Duration::from_millis(20), &mut call).await;
        assert!(timed_out.is_err());
        assert_eq!(hanging.in_flight(), 1);

        drop(call);
        assert_eq!(hanging.in_flight(), 0);
    }
}
