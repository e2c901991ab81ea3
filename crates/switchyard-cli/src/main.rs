//! Switchyard CLI
//!
//! Offline tooling for Switchyard configurations: validate a file, preview
//! the candidate order a call would get, and check an API key's permissions.

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use switchyard_core::{Connection, Error, Result, Subsystem, Tenant, TransportErrorKind};
use switchyard_observability::init_logging;
use switchyard_routing::{ConnectionRegistry, GatewayConfig};

#[derive(Parser)]
#[command(name = "switchyard")]
#[command(about = "Switchyard - Multi-tenant RPC dispatch gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file and print a summary
    Check {
        /// Path to the configuration file (YAML or TOML)
        config: PathBuf,

        /// Print the parsed configuration as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },
    /// Show the candidate order of consecutive calls to a pool
    Resolve {
        config: PathBuf,

        #[arg(long)]
        tenant: Option<String>,

        /// Subsystem tag, e.g. "*core"
        #[arg(long)]
        subsystem: String,

        /// Sticky route token
        #[arg(long)]
        route_id: Option<String>,

        /// Number of consecutive resolutions to show
        #[arg(long, default_value = "1")]
        count: usize,
    },
    /// Check whether an API key may call a method
    Authorize {
        config: PathBuf,

        #[arg(long)]
        tenant: Option<String>,

        #[arg(long, env = "SWITCHYARD_API_KEY")]
        api_key: String,

        #[arg(long)]
        method: String,

        /// Evaluate at this RFC 3339 time instead of now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
}

/// Stand-in for nodes when no call is ever made
struct OfflineConnection;

#[async_trait::async_trait]
impl Connection for OfflineConnection {
    async fn call(&self, _method: &str, _args: &Value) -> Result<Value> {
        Err(Error::transport(TransportErrorKind::Unreachable, "offline"))
    }
}

fn load_config(path: &Path) -> anyhow::Result<GatewayConfig> {
    // Expand tilde in paths
    let path = PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).to_string());
    let mut config = GatewayConfig::from_file(&path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    config.merge_env();
    config.validate()?;

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("Warning: {}", e);
    }
    Ok(config)
}

fn resolve_tenant(config: &GatewayConfig, tenant: Option<&str>) -> anyhow::Result<Tenant> {
    let default = config.default_tenant()?;
    Ok(Tenant::or_default(tenant, &default))
}

fn check(config: &GatewayConfig, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
        return Ok(());
    }

    let registry = ConnectionRegistry::new();
    let memberships = config.register_nodes(&registry, |_| Arc::new(OfflineConnection))?;
    let methods = config.method_table()?;

    println!("Configuration OK");
    println!("  default tenant:   {}", config.default_tenant);
    println!("  default strategy: {}", config.routing.default_strategy);
    println!("  nodes:            {} ({} pool memberships)", config.nodes.len(), memberships);
    println!("  methods:          {}", methods.len());
    println!(
        "  authorization:    {}",
        if config.authorization.enabled {
            format!("enabled, {} keys", config.authorization.profiles.len())
        } else {
            "disabled".to_string()
        }
    );
    println!(
        "  prober:           {}",
        if config.prober.enabled {
            format!("every {}s", config.prober.interval_secs)
        } else {
            "disabled".to_string()
        }
    );

    for pool in registry.snapshot_all() {
        let members: Vec<String> = pool
            .members()
            .iter()
            .map(|m| {
                let mut label = format!("{}(w={})", m.node_id(), m.info().weight);
                if m.info().blocking {
                    label.push_str("[blocking]");
                }
                if m.info().internal {
                    label.push_str("[internal]");
                }
                if let Some(ratio) = m.info().ratio {
                    label.push_str(&format!("[ratio={}]", ratio));
                }
                label
            })
            .collect();
        println!("  pool {}: {}", pool.key(), members.join(", "));
    }
    Ok(())
}

fn resolve(
    config: &GatewayConfig,
    tenant: Option<&str>,
    subsystem: &str,
    route_id: Option<&str>,
    count: usize,
) -> anyhow::Result<()> {
    let tenant = resolve_tenant(config, tenant)?;
    let subsystem: Subsystem = subsystem.parse()?;

    let registry = Arc::new(ConnectionRegistry::new());
    config.register_nodes(&registry, |_| Arc::new(OfflineConnection))?;
    let engine = config.build_engine(registry.clone(), None)?;
    let profile = engine.profile_for(&tenant, subsystem);

    let pool = registry.pool(&tenant, subsystem)?;
    println!("{} using {}", pool.key(), profile.strategy);
    for call in 1..=count {
        let candidates = engine.resolver().resolve_profile(&pool, &profile, route_id)?;
        let ids: Vec<&str> = candidates.iter().map(|c| c.node_id()).collect();
        println!("  call {}: {}", call, ids.join(" -> "));
    }
    Ok(())
}

async fn authorize(
    config: &GatewayConfig,
    tenant: Option<&str>,
    api_key: &str,
    method: &str,
    at: Option<DateTime<Utc>>,
) -> anyhow::Result<()> {
    let tenant = resolve_tenant(config, tenant)?;
    let authorizer = config.authorizer()?;
    if !authorizer.is_enabled() {
        println!("authorization disabled: every call is permitted");
        return Ok(());
    }

    let at = at.unwrap_or_else(Utc::now);
    match authorizer.authorize(method, &tenant, Some(api_key), at).await {
        Ok(()) => println!("ALLOWED {} for {} at {}", method, tenant, at.to_rfc3339()),
        Err(err) => {
            println!("DENIED {} for {}: {}", method, tenant, err);
            std::process::exit(1);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config, json } => {
            let config = load_config(&config)?;
            check(&config, json)?;
        }
        Commands::Resolve {
            config,
            tenant,
            subsystem,
            route_id,
            count,
        } => {
            let config = load_config(&config)?;
            resolve(&config, tenant.as_deref(), &subsystem, route_id.as_deref(), count)?;
        }
        Commands::Authorize {
            config,
            tenant,
            api_key,
            method,
            at,
        } => {
            let config = load_config(&config)?;
            tracing::debug!(method = %method, "Checking API key");
            authorize(&config, tenant.as_deref(), &api_key, &method, at).await?;
        }
    }

    Ok(())
}
