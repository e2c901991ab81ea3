//! Switchyard Core Types and Traits
//!
//! This crate provides the fundamental types and traits used throughout Switchyard:
//! - Tenant and event types carried by every dispatched call
//! - Subsystem tags naming backend capability groups
//! - The `Connection` abstraction over one backend node
//! - Core error types and their string classification

pub mod connection;
pub mod error;
pub mod event;
pub mod subsystem;
pub mod tenant;

pub use connection::{Connection, ConnectionInfo};
pub use error::{Error, Result, TransportErrorKind};
pub use event::Event;
pub use subsystem::Subsystem;
pub use tenant::Tenant;
