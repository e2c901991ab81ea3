//! Inbound API surface
//!
//! Every exposed method goes through [`Gateway::invoke`]: the method table
//! says which subsystem serves it and how broadcast replies are merged, the
//! authorizer checks the caller once, and the dispatch engine does the rest.
//! Replies and errors come back exactly as the engine produced them.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use switchyard_core::{Error, Event, Result, Subsystem, Tenant};
use tokio::task::JoinHandle;

use crate::auth::Authorizer;
use crate::dispatcher::DispatchEngine;
use crate::merge::MergePolicy;

/// Where a method is served and how its broadcast replies merge
#[derive(Debug, Clone)]
pub struct MethodSpec {
    pub subsystem: Subsystem,
    pub merge: MergePolicy,
}

impl MethodSpec {
    pub fn new(subsystem: Subsystem) -> Self {
        Self {
            subsystem,
            merge: MergePolicy::LastWriter,
        }
    }

    pub fn with_merge(mut self, merge: MergePolicy) -> Self {
        self.merge = merge;
        self
    }
}

/// Method name to [`MethodSpec`] lookup
#[derive(Debug, Clone, Default)]
pub struct MethodTable {
    methods: HashMap<String, MethodSpec>,
}

impl MethodTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Table seeded with the platform's built-in methods
    pub fn builtin() -> Self {
        use MergePolicy::{Collect, LastWriter, Union};
        use Subsystem::*;

        let builtin = [
            ("CoreSv1.Ping", Core, LastWriter),
            ("CoreSv1.Status", Core, Collect),
            ("CoreSv1.Sleep", Core, LastWriter),
            ("AttributeSv1.Ping", Attributes, LastWriter),
            ("AttributeSv1.GetAttributeForEvent", Attributes, LastWriter),
            ("AttributeSv1.ProcessEvent", Attributes, LastWriter),
            ("ChargerSv1.Ping", Chargers, LastWriter),
            ("ChargerSv1.GetChargersForEvent", Chargers, LastWriter),
            ("ChargerSv1.ProcessEvent", Chargers, LastWriter),
            ("SessionSv1.Ping", Sessions, LastWriter),
            ("SessionSv1.AuthorizeEvent", Sessions, LastWriter),
            ("SessionSv1.InitiateSession", Sessions, LastWriter),
            ("SessionSv1.UpdateSession", Sessions, LastWriter),
            ("SessionSv1.TerminateSession", Sessions, LastWriter),
            ("SessionSv1.ProcessCDR", Sessions, LastWriter),
            ("SessionSv1.GetActiveSessions", Sessions, Union),
            ("CDRsV1.Ping", Cdrs, LastWriter),
            ("CDRsV1.ProcessEvent", Cdrs, LastWriter),
            ("RateSv1.Ping", Rates, LastWriter),
            ("RateSv1.CostForEvent", Rates, LastWriter),
            ("StatSv1.Ping", Stats, LastWriter),
            ("StatSv1.ProcessEvent", Stats, Union),
            ("StatSv1.GetQueueIDs", Stats, Union),
            ("StatSv1.GetQueueStringMetrics", Stats, LastWriter),
            ("ThresholdSv1.Ping", Thresholds, LastWriter),
            ("ThresholdSv1.ProcessEvent", Thresholds, Union),
            ("ThresholdSv1.GetThresholdIDs", Thresholds, Union),
            ("TrendSv1.Ping", Trends, LastWriter),
            ("TrendSv1.GetTrend", Trends, LastWriter),
            ("TrendSv1.GetScheduledTrends", Trends, Union),
            ("RankingSv1.Ping", Rankings, LastWriter),
            ("RankingSv1.GetRanking", Rankings, LastWriter),
            ("RankingSv1.GetSchedule", Rankings, Union),
            ("ResourceSv1.Ping", Resources, LastWriter),
            ("ResourceSv1.AuthorizeResources", Resources, LastWriter),
            ("ResourceSv1.AllocateResources", Resources, LastWriter),
            ("ResourceSv1.ReleaseResources", Resources, LastWriter),
            ("RouteSv1.Ping", Routes, LastWriter),
            ("RouteSv1.GetRoutes", Routes, LastWriter),
            ("AccountSv1.Ping", Accounts, LastWriter),
            ("AccountSv1.AccountsForEvent", Accounts, LastWriter),
            ("AccountSv1.MaxAbstracts", Accounts, LastWriter),
            ("AccountSv1.DebitAbstracts", Accounts, LastWriter),
            ("ActionSv1.Ping", Actions, LastWriter),
            ("ActionSv1.ScheduleActions", Actions, LastWriter),
            ("ActionSv1.ExecuteActions", Actions, LastWriter),
            ("EeSv1.Ping", Ees, LastWriter),
            ("EeSv1.ProcessEvent", Ees, Union),
            ("AdminSv1.Ping", Admins, LastWriter),
            ("CacheSv1.Ping", Caches, LastWriter),
            ("CacheSv1.Clear", Caches, LastWriter),
            ("CacheSv1.ReloadCache", Caches, LastWriter),
            ("CacheSv1.GetItemIDs", Caches, Union),
            ("ReplicatorSv1.Ping", Replicator, LastWriter),
        ];

        let methods = builtin
            .into_iter()
            .map(|(name, subsystem, merge)| {
                (name.to_string(), MethodSpec::new(subsystem).with_merge(merge))
            })
            .collect();
        Self { methods }
    }

    /// Add or replace a method
    pub fn insert(&mut self, method: impl Into<String>, spec: MethodSpec) {
        self.methods.insert(method.into(), spec);
    }

    pub fn get(&self, method: &str) -> Option<&MethodSpec> {
        self.methods.get(method)
    }

    /// Merge policy of a method, last writer for unknown ones
    pub fn merge_policy(&self, method: &str) -> MergePolicy {
        self.methods
            .get(method)
            .map(|spec| spec.merge.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Methods served by a subsystem, sorted by name
    pub fn methods_for(&self, subsystem: Subsystem) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .methods
            .iter()
            .filter(|(_, spec)| spec.subsystem == subsystem)
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }
}

/// Entry point for inbound calls
pub struct Gateway {
    engine: Arc<DispatchEngine>,
    authorizer: Arc<Authorizer>,
    prober: Option<JoinHandle<()>>,
}

impl Gateway {
    pub fn new(engine: Arc<DispatchEngine>, authorizer: Arc<Authorizer>) -> Self {
        Self {
            engine,
            authorizer,
            prober: None,
        }
    }

    /// Tie a running health prober to the gateway; it stops when the
    /// gateway is dropped
    pub fn with_prober(mut self, prober: JoinHandle<()>) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn has_prober(&self) -> bool {
        self.prober.is_some()
    }

    pub fn engine(&self) -> &Arc<DispatchEngine> {
        &self.engine
    }

    pub fn authorizer(&self) -> &Arc<Authorizer> {
        &self.authorizer
    }

    /// Authorize and dispatch one call
    pub async fn invoke(&self, method: &str, mut event: Event, args: &Value) -> Result<Value> {
        let spec = self
            .engine
            .methods()
            .get(method)
            .ok_or_else(|| Error::UnsupportedMethod(method.to_string()))?;
        let subsystem = spec.subsystem;

        if event.tenant.is_empty() {
            event.tenant = self.engine.default_tenant().to_string();
        }

        if self.authorizer.is_enabled() {
            let tenant = Tenant::or_default(Some(event.tenant.as_str()), self.engine.default_tenant());
            let at = event.time.unwrap_or_else(Utc::now);
            self.authorizer
                .authorize(method, &tenant, event.api_key(), at)
                .await?;
        }

        self.engine
            .dispatch(&event, subsystem, event.route_id(), method, args)
            .await
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        if let Some(prober) = self.prober.take() {
            prober.abort();
        }
    }
}
