//! Gateway configuration
//!
//! Loaded from YAML (default) or TOML depending on the file extension, then
//! overlaid with `SWITCHYARD_*` environment variables.
//!
//! ```yaml
//! default_tenant: cgrates.org
//! routing:
//!   default_strategy: "*default"
//!   route_binding_ttl_secs: 3600
//!   profiles:
//!     - tenant: cgrates.org
//!       subsystem: "*caches"
//!       strategy: "*broadcast"
//! authorization:
//!   enabled: true
//!   profiles:
//!     - tenant: cgrates.org
//!       api_key: ses12345
//!       methods: ["CoreSv1.Ping", "SessionSv1.*"]
//! nodes:
//!   - id: engine1
//!     address: 127.0.0.1:2012
//!     subsystems: ["*core", "*caches"]
//!     weight: 20
//!     ratio: 2
//! prober:
//!   interval_secs: 30
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::{Connection, ConnectionInfo, Subsystem, Tenant};
use switchyard_observability::{LoggingConfig, Metrics};

use crate::auth::{ActivationWindow, AuthProfile, Authorizer, MethodSet, StaticPermissions};
use crate::dispatcher::DispatchEngine;
use crate::gateway::{Gateway, MethodSpec, MethodTable};
use crate::merge::MergePolicy;
use crate::prober::HealthProber;
use crate::registry::ConnectionRegistry;
use crate::resolver::{RoutingProfile, RoutingState, Strategy};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Tenant applied to calls that carry none
    #[serde(default = "default_tenant")]
    pub default_tenant: String,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub authorization: AuthorizationConfig,

    #[serde(default)]
    pub nodes: Vec<NodeConfig>,

    /// Extra method table entries, overriding built-in ones
    #[serde(default)]
    pub methods: Vec<MethodConfig>,

    #[serde(default)]
    pub prober: ProberConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub default_strategy: Strategy,

    /// Lifetime of sticky route bindings; unset keeps them forever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_binding_ttl_secs: Option<u64>,

    #[serde(default)]
    pub profiles: Vec<RoutingProfileConfig>,

    /// Serve events forwarded by another dispatcher from the internal node
    #[serde(default)]
    pub prevent_loop: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingProfileConfig {
    pub tenant: String,
    pub subsystem: Subsystem,
    pub strategy: Strategy,

    /// Load ratio for members without their own; enables load ordering
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_ratio: Option<i64>,
}

impl RoutingProfileConfig {
    fn to_profile(&self) -> RoutingProfile {
        RoutingProfile {
            strategy: self.strategy,
            default_ratio: self.default_ratio,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    #[serde(default)]
    pub profiles: Vec<AuthProfileConfig>,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cache_ttl_secs: default_cache_ttl_secs(),
            profiles: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthProfileConfig {
    pub tenant: String,
    pub api_key: String,
    pub methods: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_time: Option<DateTime<Utc>>,
}

impl AuthProfileConfig {
    fn to_profile(&self) -> Result<AuthProfile, ConfigError> {
        let tenant = parse_tenant(&self.tenant)?;
        let mut profile = AuthProfile::new(tenant, &self.api_key, self.methods.iter().collect::<MethodSet>());
        if self.activation_time.is_some() || self.expiry_time.is_some() {
            profile = profile.with_activation(ActivationWindow {
                activation_time: self.activation_time,
                expiry_time: self.expiry_time,
            });
        }
        Ok(profile)
    }
}

/// A backend node and the pools it joins
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,

    /// Transport address, interpreted by the connector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Owning tenant; the default tenant when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,

    pub subsystems: Vec<Subsystem>,

    #[serde(default)]
    pub weight: u32,

    #[serde(default)]
    pub blocking: bool,

    #[serde(default)]
    pub internal: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratio: Option<i64>,
}

impl NodeConfig {
    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            node_id: self.id.clone(),
            weight: self.weight,
            blocking: self.blocking,
            internal: self.internal,
            ratio: self.ratio,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodConfig {
    pub name: String,
    pub subsystem: Subsystem,
    /// `last-writer`, `union` or `collect`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProberConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_probe_interval_secs")]
    pub interval_secs: u64,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_probe_interval_secs(),
        }
    }
}

impl ProberConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_tenant: default_tenant(),
            logging: LoggingConfig::default(),
            routing: RoutingConfig::default(),
            authorization: AuthorizationConfig::default(),
            nodes: Vec::new(),
            methods: Vec::new(),
            prober: ProberConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;

        if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            Self::from_toml_str(&contents)
        } else {
            Self::from_yaml_str(&contents)
        }
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Merge environment variables into config (env vars take precedence)
    pub fn merge_env(&mut self) {
        if let Ok(val) = std::env::var("SWITCHYARD_DEFAULT_TENANT")
            && !val.trim().is_empty()
        {
            self.default_tenant = val;
        }

        if let Ok(val) = std::env::var("SWITCHYARD_LOG_LEVEL") {
            self.logging.level = val;
        }
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_tenant(&self.default_tenant)?;

        let mut nodes = HashSet::new();
        for node in &self.nodes {
            if node.id.trim().is_empty() {
                return Err(ConfigError::Invalid("node id cannot be empty".to_string()));
            }
            if node.subsystems.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "node '{}' serves no subsystem",
                    node.id
                )));
            }
            let tenant = self.node_tenant(node)?;
            for subsystem in &node.subsystems {
                if !nodes.insert((tenant.clone(), *subsystem, node.id.as_str())) {
                    return Err(ConfigError::Invalid(format!(
                        "node '{}' registered twice for {} in tenant {}",
                        node.id, subsystem, tenant
                    )));
                }
            }
        }

        for profile in &self.routing.profiles {
            parse_tenant(&profile.tenant)?;
        }

        for profile in &self.authorization.profiles {
            if profile.api_key.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "authorization profile for tenant {} has an empty api_key",
                    profile.tenant
                )));
            }
            if let (Some(start), Some(end)) = (profile.activation_time, profile.expiry_time)
                && end <= start
            {
                return Err(ConfigError::Invalid(format!(
                    "api key '{}' expires before it activates",
                    profile.api_key
                )));
            }
            parse_tenant(&profile.tenant)?;
        }

        for method in &self.methods {
            if method.name.trim().is_empty() {
                return Err(ConfigError::Invalid("method name cannot be empty".to_string()));
            }
            if let Some(merge) = &method.merge {
                merge
                    .parse::<MergePolicy>()
                    .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            }
        }

        if self.prober.enabled && self.prober.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "prober interval must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    pub fn default_tenant(&self) -> Result<Tenant, ConfigError> {
        parse_tenant(&self.default_tenant)
    }

    pub fn route_binding_ttl(&self) -> Option<Duration> {
        self.routing.route_binding_ttl_secs.map(Duration::from_secs)
    }

    fn node_tenant(&self, node: &NodeConfig) -> Result<Tenant, ConfigError> {
        match &node.tenant {
            Some(tenant) => parse_tenant(tenant),
            None => self.default_tenant(),
        }
    }

    /// Built-in methods plus the configured ones
    pub fn method_table(&self) -> Result<MethodTable, ConfigError> {
        let mut table = MethodTable::builtin();
        for method in &self.methods {
            let merge = match &method.merge {
                Some(merge) => merge
                    .parse::<MergePolicy>()
                    .map_err(|e| ConfigError::Invalid(e.to_string()))?,
                None => MergePolicy::default(),
            };
            table.insert(
                method.name.clone(),
                MethodSpec::new(method.subsystem).with_merge(merge),
            );
        }
        Ok(table)
    }

    /// Authorizer over the configured API-key profiles
    pub fn authorizer(&self) -> Result<Authorizer, ConfigError> {
        if !self.authorization.enabled {
            return Ok(Authorizer::disabled());
        }
        let profiles = self
            .authorization
            .profiles
            .iter()
            .map(AuthProfileConfig::to_profile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Authorizer::new(
            Arc::new(StaticPermissions::new(profiles)),
            Duration::from_secs(self.authorization.cache_ttl_secs),
        ))
    }

    /// Register every configured node, building connections with `connect`.
    /// Returns the number of pool memberships created.
    pub fn register_nodes<F>(&self, registry: &ConnectionRegistry, mut connect: F) -> Result<usize, ConfigError>
    where
        F: FnMut(&NodeConfig) -> Arc<dyn Connection>,
    {
        let mut registered = 0;
        for node in &self.nodes {
            let tenant = self.node_tenant(node)?;
            let connection = connect(node);
            for subsystem in &node.subsystems {
                registry.register(&tenant, *subsystem, node.connection_info(), connection.clone());
                registered += 1;
            }
        }
        Ok(registered)
    }

    /// Dispatch engine with the configured strategies and method table
    pub fn build_engine(
        &self,
        registry: Arc<ConnectionRegistry>,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<DispatchEngine, ConfigError> {
        let state = Arc::new(RoutingState::new(self.route_binding_ttl()));
        let mut engine = DispatchEngine::new(registry, state, self.default_tenant()?)
            .with_default_strategy(self.routing.default_strategy)
            .with_methods(Arc::new(self.method_table()?))
            .with_prevent_loop(self.routing.prevent_loop);
        if let Some(metrics) = metrics {
            engine = engine.with_metrics(metrics);
        }

        for profile in &self.routing.profiles {
            engine.set_profile(&parse_tenant(&profile.tenant)?, profile.subsystem, profile.to_profile());
        }
        Ok(engine)
    }

    /// Health prober over `registry`, unless probing is disabled
    pub fn build_prober(&self, registry: Arc<ConnectionRegistry>) -> Option<HealthProber> {
        self.prober
            .enabled
            .then(|| HealthProber::new(registry, self.prober.interval()))
    }

    /// Gateway wired from this configuration.
    ///
    /// When probing is enabled and a tokio runtime is running, the prober is
    /// spawned and lives as long as the gateway.
    pub fn build_gateway(
        &self,
        registry: Arc<ConnectionRegistry>,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Gateway, ConfigError> {
        let mut authorizer = self.authorizer()?;
        if let Some(metrics) = &metrics {
            authorizer = authorizer.with_metrics(metrics.clone());
        }
        let engine = Arc::new(self.build_engine(registry.clone(), metrics)?);
        let mut gateway = Gateway::new(engine.clone(), Arc::new(authorizer));

        if let Some(prober) = self.build_prober(registry) {
            if tokio::runtime::Handle::try_current().is_ok() {
                let prober = prober.with_routing_state(engine.resolver().state().clone());
                gateway = gateway.with_prober(prober.spawn());
            } else {
                tracing::warn!("No tokio runtime, health prober not started");
            }
        }
        Ok(gateway)
    }
}

fn parse_tenant(name: &str) -> Result<Tenant, ConfigError> {
    Tenant::new(name).map_err(|e| ConfigError::Invalid(e.to_string()))
}

fn default_tenant() -> String {
    "cgrates.org".to_string()
}

fn default_cache_ttl_secs() -> u64 {
    60
}

fn default_probe_interval_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}
