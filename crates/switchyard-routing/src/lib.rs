//! Switchyard Routing Engine
//!
//! This crate provides the routing logic for Switchyard:
//! - Connection registry with per-pool health
//! - Route resolution strategies and sticky route bindings
//! - Dispatch engine with failover and broadcast
//! - API-key authorization
//! - Gateway entry point driven by a method table

pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod gateway;
pub mod merge;
pub mod prober;
pub mod registry;
pub mod resolver;

// Re-export commonly used types
pub use auth::{ActivationWindow, AuthProfile, Authorizer, MethodSet, PermissionService, StaticPermissions};
pub use config::{ConfigError, GatewayConfig, NodeConfig};
pub use dispatcher::{BroadcastTally, DispatchEngine};
pub use gateway::{Gateway, MethodSpec, MethodTable};
pub use merge::{MergePolicy, NodeReply, ReplyMerger};
pub use prober::{HealthProber, ProbeReport};
pub use registry::{ConnectionHandle, ConnectionHealth, ConnectionPool, ConnectionRegistry, ConnectionState, PoolKey};
pub use resolver::{RouteResolver, RoutingProfile, RoutingState, Strategy};
