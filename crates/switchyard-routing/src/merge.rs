//! Broadcast reply merging
//!
//! A broadcast call collects one reply per node that answered. How those
//! replies fold into the single value returned to the caller depends on the
//! method, so each method carries a [`MergePolicy`].

use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use switchyard_core::{Error, Result};

/// A successful reply from one node
#[derive(Debug, Clone, PartialEq)]
pub struct NodeReply {
    pub node_id: String,
    pub reply: Value,
}

impl NodeReply {
    pub fn new(node_id: impl Into<String>, reply: Value) -> Self {
        Self {
            node_id: node_id.into(),
            reply,
        }
    }
}

/// Caller-supplied merge for methods whose replies need custom folding
pub trait ReplyMerger: Send + Sync {
    /// Fold the replies, given in candidate order
    fn merge(&self, replies: Vec<NodeReply>) -> Value;
}

/// How broadcast replies are combined
#[derive(Clone, Default)]
pub enum MergePolicy {
    /// The reply of the last candidate that answered
    #[default]
    LastWriter,
    /// Objects are unioned key by key (later candidates win), arrays are
    /// concatenated, anything else falls back to the last writer
    Union,
    /// An object mapping each node ID to its reply
    Collect,
    Custom(Arc<dyn ReplyMerger>),
}

impl MergePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergePolicy::LastWriter => "last-writer",
            MergePolicy::Union => "union",
            MergePolicy::Collect => "collect",
            MergePolicy::Custom(_) => "custom",
        }
    }

    /// Fold replies into one value; no replies yields `null`
    pub fn merge(&self, replies: Vec<NodeReply>) -> Value {
        match self {
            MergePolicy::LastWriter => replies
                .into_iter()
                .last()
                .map(|r| r.reply)
                .unwrap_or(Value::Null),
            MergePolicy::Union => replies
                .into_iter()
                .fold(Value::Null, |acc, r| union(acc, r.reply)),
            MergePolicy::Collect => Value::Object(
                replies
                    .into_iter()
                    .map(|r| (r.node_id, r.reply))
                    .collect::<Map<String, Value>>(),
            ),
            MergePolicy::Custom(merger) => merger.merge(replies),
        }
    }
}

fn union(acc: Value, next: Value) -> Value {
    match (acc, next) {
        (Value::Object(mut merged), Value::Object(next)) => {
            merged.extend(next);
            Value::Object(merged)
        }
        (Value::Array(mut merged), Value::Array(next)) => {
            merged.extend(next);
            Value::Array(merged)
        }
        (_, next) => next,
    }
}

impl fmt::Debug for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "last-writer" => Ok(MergePolicy::LastWriter),
            "union" => Ok(MergePolicy::Union),
            "collect" => Ok(MergePolicy::Collect),
            other => Err(Error::Config(format!("unknown merge policy: <{}>", other))),
        }
    }
}
