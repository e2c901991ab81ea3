//! Route resolution
//!
//! Turns a pool snapshot plus a strategy into the ordered candidate list a
//! dispatch will try. Resolution never performs I/O; the only shared state
//! it touches is the per-pool round-robin cursor and the sticky route
//! bindings held in [`RoutingState`].
//!
//! ## Strategies
//!
//! - `*default`: pool order (weight, then registration order)
//! - `*random`: uniformly shuffled per call
//! - `*round_robin`: pool order rotated by a per-pool cursor
//! - `*broadcast`: every candidate, called in parallel by the dispatcher
//! - `*internal`: in-process nodes first, then pool order
//!
//! ## Load ratios
//!
//! When a pool has a default ratio, or any member carries its own, the
//! strategy order is re-sorted (stably) by in-flight calls divided by ratio,
//! so the least loaded node goes first. A ratio of zero removes the node
//! from the list and a negative ratio makes it always count as idle.
//! Broadcast calls every node and is never reordered.
//!
//! ## Sticky routes
//!
//! A call carrying a route ID is sent to the node bound to that ID for as
//! long as the node stays Up. Bindings are keyed by (tenant, subsystem,
//! route ID), so the same token routes independently per subsystem. With a
//! TTL set, expired bindings are swept at most once per TTL period.
//!
//! ```rust
//! use switchyard_routing::Strategy;
//!
//! let strategy: Strategy = "*round_robin".parse().unwrap();
//! assert_eq!(strategy, Strategy::RoundRobin);
//! assert!("*fastest".parse::<Strategy>().is_err());
//! ```

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use switchyard_core::{Error, Result};

use crate::registry::{ConnectionHandle, ConnectionPool, PoolKey};

/// Candidate ordering strategy of a (tenant, subsystem) pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Strategy {
    #[default]
    #[serde(rename = "*default", alias = "*weight", alias = "*first")]
    Default,
    #[serde(rename = "*random")]
    Random,
    #[serde(rename = "*round_robin")]
    RoundRobin,
    #[serde(rename = "*broadcast")]
    Broadcast,
    #[serde(rename = "*internal")]
    Internal,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Default => "*default",
            Strategy::Random => "*random",
            Strategy::RoundRobin => "*round_robin",
            Strategy::Broadcast => "*broadcast",
            Strategy::Internal => "*internal",
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Strategy::Broadcast)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "*default" | "*weight" | "*first" => Ok(Strategy::Default),
            "*random" => Ok(Strategy::Random),
            "*round_robin" => Ok(Strategy::RoundRobin),
            "*broadcast" => Ok(Strategy::Broadcast),
            "*internal" => Ok(Strategy::Internal),
            other => Err(Error::Config(format!("unsupported strategy: <{}>", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BindingKey {
    pool: PoolKey,
    route_id: String,
}

#[derive(Debug, Clone)]
struct RouteBinding {
    node_id: String,
    bound_at: Instant,
}

/// Strategy plus optional default load ratio of one pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoutingProfile {
    pub strategy: Strategy,
    pub default_ratio: Option<i64>,
}

impl RoutingProfile {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            default_ratio: None,
        }
    }

    pub fn with_default_ratio(mut self, ratio: i64) -> Self {
        self.default_ratio = Some(ratio);
        self
    }
}

impl From<Strategy> for RoutingProfile {
    fn from(strategy: Strategy) -> Self {
        Self::new(strategy)
    }
}

/// Shared mutable routing state: round-robin cursors and sticky bindings
pub struct RoutingState {
    cursors: DashMap<PoolKey, Arc<AtomicUsize>>,
    bindings: DashMap<BindingKey, RouteBinding>,
    binding_ttl: Option<Duration>,
    created: Instant,
    /// Milliseconds after `created` of the last expiry sweep
    last_sweep_ms: AtomicU64,
}

impl RoutingState {
    /// Create routing state. Bindings never expire when `binding_ttl` is `None`.
    pub fn new(binding_ttl: Option<Duration>) -> Self {
        Self {
            cursors: DashMap::new(),
            bindings: DashMap::new(),
            binding_ttl,
            created: Instant::now(),
            last_sweep_ms: AtomicU64::new(0),
        }
    }

    pub fn binding_ttl(&self) -> Option<Duration> {
        self.binding_ttl
    }

    /// Advance the cursor of a pool, returning its previous position
    fn next_cursor(&self, key: &PoolKey) -> usize {
        let counter = self
            .cursors
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone();

        // Wraps at usize::MAX
        counter.fetch_add(1, Ordering::AcqRel)
    }

    fn is_live(&self, binding: &RouteBinding) -> bool {
        match self.binding_ttl {
            Some(ttl) => binding.bound_at.elapsed() < ttl,
            None => true,
        }
    }

    /// Node currently bound to a route ID, if the binding is still live
    pub fn binding(&self, pool: &PoolKey, route_id: &str) -> Option<String> {
        let key = BindingKey {
            pool: pool.clone(),
            route_id: route_id.to_string(),
        };
        let live = self
            .bindings
            .get(&key)
            .filter(|binding| self.is_live(binding))
            .map(|binding| binding.node_id.clone());
        if live.is_none() {
            self.bindings.remove_if(&key, |_, binding| !self.is_live(binding));
        }
        live
    }

    /// Bind a route ID to a node, replacing any previous binding
    pub fn bind(&self, pool: &PoolKey, route_id: &str, node_id: &str) {
        self.sweep_if_due();
        let key = BindingKey {
            pool: pool.clone(),
            route_id: route_id.to_string(),
        };
        self.bindings.insert(
            key,
            RouteBinding {
                node_id: node_id.to_string(),
                bound_at: Instant::now(),
            },
        );
    }

    /// Forget a route binding
    pub fn unbind(&self, pool: &PoolKey, route_id: &str) -> bool {
        let key = BindingKey {
            pool: pool.clone(),
            route_id: route_id.to_string(),
        };
        self.bindings.remove(&key).is_some()
    }

    /// Drop every binding of a pool that points at `node_id`
    pub fn unbind_node(&self, pool: &PoolKey, node_id: &str) -> usize {
        let before = self.bindings.len();
        self.bindings
            .retain(|key, binding| key.pool != *pool || binding.node_id != node_id);
        before.saturating_sub(self.bindings.len())
    }

    /// Drop bindings whose TTL has passed, returning how many went
    pub fn clear_expired_bindings(&self) -> usize {
        if self.binding_ttl.is_none() {
            return 0;
        }
        let before = self.bindings.len();
        self.bindings.retain(|_, binding| self.is_live(binding));
        let removed = before.saturating_sub(self.bindings.len());
        if removed > 0 {
            tracing::debug!(removed, "Expired route bindings cleared");
        }
        removed
    }

    /// Sweep expired bindings when a full TTL has passed since the last sweep.
    /// Must not be called while holding a guard into `bindings`.
    fn sweep_if_due(&self) {
        let Some(ttl) = self.binding_ttl else {
            return;
        };
        let now = self.created.elapsed().as_millis() as u64;
        let last = self.last_sweep_ms.load(Ordering::Acquire);
        if now.saturating_sub(last) < ttl.as_millis() as u64 {
            return;
        }
        if self
            .last_sweep_ms
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.clear_expired_bindings();
        }
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    /// Resolve the node for a route ID against the candidate list, binding
    /// the first candidate when the ID is new or its node is unusable.
    /// Returns the index of the chosen node in `candidates`.
    fn pin(&self, pool: &PoolKey, route_id: &str, candidates: &[Arc<ConnectionHandle>]) -> usize {
        self.sweep_if_due();
        let key = BindingKey {
            pool: pool.clone(),
            route_id: route_id.to_string(),
        };
        let fresh = |candidates: &[Arc<ConnectionHandle>]| RouteBinding {
            node_id: candidates[0].node_id().to_string(),
            bound_at: Instant::now(),
        };

        match self.bindings.entry(key) {
            Entry::Occupied(mut entry) => {
                let bound = entry.get();
                let position = candidates
                    .iter()
                    .position(|c| c.node_id() == bound.node_id && c.is_up());
                match position {
                    Some(index) if self.is_live(bound) => index,
                    _ => {
                        tracing::debug!(
                            route_id,
                            previous = %bound.node_id,
                            node = candidates[0].node_id(),
                            "Rebinding route"
                        );
                        entry.insert(fresh(candidates));
                        0
                    }
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(fresh(candidates));
                0
            }
        }
    }
}

impl Default for RoutingState {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Produces ordered candidate lists from pool snapshots
pub struct RouteResolver {
    state: Arc<RoutingState>,
}

impl RouteResolver {
    pub fn new(state: Arc<RoutingState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<RoutingState> {
        &self.state
    }

    /// Ordered candidates for one dispatch.
    ///
    /// Up members are preferred; when none is Up every member is returned so
    /// a recovered node gets retried. The list is cut after the first
    /// blocking node. A route ID moves its bound node to the front, except
    /// for broadcast which always calls every candidate.
    pub fn resolve(
        &self,
        pool: &ConnectionPool,
        strategy: Strategy,
        route_id: Option<&str>,
    ) -> Result<Vec<Arc<ConnectionHandle>>> {
        self.resolve_profile(pool, &RoutingProfile::new(strategy), route_id)
    }

    /// Like [`resolve`](Self::resolve), applying the profile's default load
    /// ratio to members without their own
    pub fn resolve_profile(
        &self,
        pool: &ConnectionPool,
        profile: &RoutingProfile,
        route_id: Option<&str>,
    ) -> Result<Vec<Arc<ConnectionHandle>>> {
        let strategy = profile.strategy;
        if pool.is_empty() {
            return Err(Error::NotFound);
        }

        let mut candidates = pool.up_members();
        if candidates.is_empty() {
            candidates = pool.members().to_vec();
        }

        match strategy {
            Strategy::Default | Strategy::Broadcast => {}
            Strategy::Random => candidates.shuffle(&mut rand::rng()),
            Strategy::RoundRobin => {
                let offset = self.state.next_cursor(pool.key()) % candidates.len();
                candidates.rotate_left(offset);
            }
            Strategy::Internal => {
                let (mut internal, external): (Vec<_>, Vec<_>) =
                    candidates.into_iter().partition(|c| c.info().internal);
                internal.extend(external);
                candidates = internal;
            }
        }

        if !strategy.is_broadcast() {
            candidates = order_by_load(candidates, profile.default_ratio);
            if candidates.is_empty() {
                return Err(Error::NotFound);
            }
        }

        if let Some(route_id) = route_id.filter(|id| !id.is_empty())
            && !strategy.is_broadcast()
        {
            let index = self.state.pin(pool.key(), route_id, &candidates);
            if index > 0 {
                let bound = candidates.remove(index);
                candidates.insert(0, bound);
            }
        }

        if let Some(blocker) = candidates.iter().position(|c| c.info().blocking) {
            candidates.truncate(blocker + 1);
        }

        Ok(candidates)
    }
}

/// Stable sort by in-flight load over ratio. Pools with no ratio at all
/// keep their order.
fn order_by_load(
    candidates: Vec<Arc<ConnectionHandle>>,
    default_ratio: Option<i64>,
) -> Vec<Arc<ConnectionHandle>> {
    let balanced = default_ratio.is_some() || candidates.iter().any(|c| c.info().ratio.is_some());
    if !balanced {
        return candidates;
    }
    let default_ratio = default_ratio.unwrap_or(1);

    let mut costed: Vec<(u64, Arc<ConnectionHandle>)> = candidates
        .into_iter()
        .filter_map(|conn| {
            let ratio = conn.info().ratio.unwrap_or(default_ratio);
            let cost = match ratio {
                0 => return None,
                r if r < 0 => 0,
                r => conn.in_flight() as u64 / r as u64,
            };
            Some((cost, conn))
        })
        .collect();
    costed.sort_by_key(|(cost, _)| *cost);
    costed.into_iter().map(|(_, conn)| conn).collect()
}
