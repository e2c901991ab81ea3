//! API-key authorization
//!
//! Before a call is routed, the caller's API key is resolved to an
//! [`AuthProfile`] listing the methods it may invoke and, optionally, the
//! window in which the key is valid. Profiles come from a
//! [`PermissionService`] and are cached per (tenant, API key) for a bounded
//! time. Only positive lookups are cached; unknown keys and lookup failures
//! are asked again on the next call.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchyard_core::{Error, Result, Tenant};
use switchyard_observability::Metrics;

/// Wildcard granting every method
pub const ANY_METHOD: &str = "*any";

/// Set of permitted method names.
///
/// Entries are exact names (`CoreSv1.Ping`), a service wildcard
/// (`CoreSv1.*`) or [`ANY_METHOD`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodSet {
    exact: HashSet<String>,
    prefixes: Vec<String>,
    any: bool,
}

impl MethodSet {
    /// Parse a `;`-separated list such as `"CoreSv1.Ping;CoreSv1.Status"`
    pub fn parse(list: &str) -> Self {
        list.split(';').collect()
    }

    pub fn contains(&self, method: &str) -> bool {
        self.any
            || self.exact.contains(method)
            || self.prefixes.iter().any(|prefix| method.starts_with(prefix.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        !self.any && self.exact.is_empty() && self.prefixes.is_empty()
    }
}

impl<S: AsRef<str>> FromIterator<S> for MethodSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = MethodSet::default();
        for entry in iter {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            if entry == ANY_METHOD {
                set.any = true;
            } else if let Some(service) = entry.strip_suffix('*') {
                set.prefixes.push(service.to_string());
            } else {
                set.exact.insert(entry.to_string());
            }
        }
        set
    }
}

/// Validity window of an API key; open bounds are unlimited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationWindow {
    #[serde(default)]
    pub activation_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expiry_time: Option<DateTime<Utc>>,
}

impl ActivationWindow {
    /// Active from `activation_time` (inclusive) until `expiry_time` (exclusive)
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.activation_time.is_none_or(|start| at >= start)
            && self.expiry_time.is_none_or(|end| at < end)
    }
}

/// Permissions attached to one API key
#[derive(Debug, Clone, PartialEq)]
pub struct AuthProfile {
    pub tenant: Tenant,
    pub api_key: String,
    pub methods: MethodSet,
    pub activation: Option<ActivationWindow>,
}

impl AuthProfile {
    pub fn new(tenant: Tenant, api_key: impl Into<String>, methods: MethodSet) -> Self {
        Self {
            tenant,
            api_key: api_key.into(),
            methods,
            activation: None,
        }
    }

    pub fn with_activation(mut self, window: ActivationWindow) -> Self {
        self.activation = Some(window);
        self
    }

    /// Check a call against this profile
    pub fn permits(&self, method: &str, at: DateTime<Utc>) -> Result<()> {
        if let Some(window) = &self.activation
            && !window.is_active_at(at)
        {
            return Err(Error::Unauthorized);
        }
        if !self.methods.contains(method) {
            return Err(Error::Unauthorized);
        }
        Ok(())
    }
}

/// Source of API-key profiles
#[async_trait]
pub trait PermissionService: Send + Sync {
    /// Look up the profile of an API key; `Error::NotFound` when unknown
    async fn auth_profile(&self, tenant: &Tenant, api_key: &str) -> Result<AuthProfile>;
}

/// Profiles held in memory, typically loaded from configuration
#[derive(Debug, Default)]
pub struct StaticPermissions {
    profiles: HashMap<(Tenant, String), AuthProfile>,
}

impl StaticPermissions {
    pub fn new(profiles: impl IntoIterator<Item = AuthProfile>) -> Self {
        let profiles = profiles
            .into_iter()
            .map(|profile| ((profile.tenant.clone(), profile.api_key.clone()), profile))
            .collect();
        Self { profiles }
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[async_trait]
impl PermissionService for StaticPermissions {
    async fn auth_profile(&self, tenant: &Tenant, api_key: &str) -> Result<AuthProfile> {
        self.profiles
            .get(&(tenant.clone(), api_key.to_string()))
            .cloned()
            .ok_or(Error::NotFound)
    }
}

struct CachedProfile {
    profile: AuthProfile,
    cached_at: Instant,
}

/// Gatekeeper run once per inbound call
pub struct Authorizer {
    service: Option<Arc<dyn PermissionService>>,
    cache: DashMap<(Tenant, String), CachedProfile>,
    cache_ttl: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl Authorizer {
    /// Authorizer that permits everything
    pub fn disabled() -> Self {
        Self {
            service: None,
            cache: DashMap::new(),
            cache_ttl: Duration::ZERO,
            metrics: None,
        }
    }

    /// Authorizer backed by a permission service. A zero TTL disables caching.
    pub fn new(service: Arc<dyn PermissionService>, cache_ttl: Duration) -> Self {
        Self {
            service: Some(service),
            cache: DashMap::new(),
            cache_ttl,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.service.is_some()
    }

    /// Decide whether `api_key` may call `method` at time `at`
    pub async fn authorize(
        &self,
        method: &str,
        tenant: &Tenant,
        api_key: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let Some(service) = &self.service else {
            return Ok(());
        };

        let result = match api_key.filter(|key| !key.is_empty()) {
            None => Err(Error::MandatoryFieldMissing("ApiKey".to_string())),
            Some(api_key) => match self.profile(service.as_ref(), tenant, api_key).await {
                Ok(profile) => profile.permits(method, at),
                Err(err) => Err(err),
            },
        };

        self.record(&result);
        if let Err(err) = &result {
            tracing::debug!(tenant = %tenant, method, error = %err, "Call rejected");
        }
        result
    }

    /// Drop a cached profile so the next call asks the service again
    pub fn invalidate(&self, tenant: &Tenant, api_key: &str) {
        self.cache.remove(&(tenant.clone(), api_key.to_string()));
    }

    pub fn cached_profiles(&self) -> usize {
        self.cache.len()
    }

    async fn profile(
        &self,
        service: &dyn PermissionService,
        tenant: &Tenant,
        api_key: &str,
    ) -> Result<AuthProfile> {
        let key = (tenant.clone(), api_key.to_string());
        if let Some(cached) = self.cache.get(&key)
            && cached.cached_at.elapsed() < self.cache_ttl
        {
            return Ok(cached.profile.clone());
        }

        let profile = service.auth_profile(tenant, api_key).await?;
        if !self.cache_ttl.is_zero() {
            self.cache.insert(
                key,
                CachedProfile {
                    profile: profile.clone(),
                    cached_at: Instant::now(),
                },
            );
        }
        Ok(profile)
    }

    fn record(&self, result: &Result<()>) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        let outcome = match result {
            Ok(()) => "allowed",
            Err(Error::Unauthorized) => "unauthorized",
            Err(Error::NotFound) => "unknown_key",
            Err(Error::MandatoryFieldMissing(_)) => "missing_key",
            Err(_) => "error",
        };
        metrics.record_auth_decision(outcome);
    }
}
