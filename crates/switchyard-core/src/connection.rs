//! Connection trait definitions

use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Method used by the default health probe
pub const PING_METHOD: &str = "CoreSv1.Ping";

/// Opaque RPC handle to one backend node.
///
/// Implementations must classify failures: a node that could not be reached
/// returns `Error::Transport`, anything the node itself answered is returned
/// as-is. The dispatcher only fails over on the former.
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    /// Invoke `method` on the node
    async fn call(&self, method: &str, args: &Value) -> Result<Value>;

    /// Check that the node answers. Used to bring Down connections back Up.
    async fn probe(&self) -> Result<()> {
        self.call(PING_METHOD, &Value::Null).await.map(|_| ())
    }
}

/// Static attributes of a registered connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Node identity, unique within a pool
    pub node_id: String,
    /// Higher weights sort first in the pool
    #[serde(default)]
    pub weight: u32,
    /// Nodes ordered after a blocking node are not tried
    #[serde(default)]
    pub blocking: bool,
    /// Node lives in the same process as the dispatcher
    #[serde(default)]
    pub internal: bool,
    /// Load share of the node; turns on least-loaded ordering for its pool.
    /// Zero excludes the node, a negative ratio never counts its load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratio: Option<i64>,
}

impl ConnectionInfo {
    /// Create info for a node with default attributes
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            weight: 0,
            blocking: false,
            internal: false,
            ratio: None,
        }
    }

    /// Set the weight
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Mark the node as blocking
    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }

    /// Mark the node as in-process
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Set the load ratio
    pub fn with_ratio(mut self, ratio: i64) -> Self {
        self.ratio = Some(ratio);
        self
    }
}
