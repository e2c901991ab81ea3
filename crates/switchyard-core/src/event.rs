//! Dispatched event
//!
//! An `Event` is the routing envelope of one inbound call: the tenant it
//! belongs to, the call's fields and the options steering dispatch (API key,
//! route affinity token, loop protection).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::{Error, Result};

/// Option carrying the caller's API key
pub const OPT_API_KEY: &str = "*apiKey";
/// Option carrying the sticky route affinity token
pub const OPT_ROUTE_ID: &str = "*routeID";
/// Option that disables routing when set to false (loop protection)
pub const OPT_DISPATCHERS: &str = "*dispatchers";
/// Option naming the subsystem that emitted the event
pub const OPT_SUBSYS: &str = "*subsys";
/// `*subsys` value stamped on events a dispatcher forwards
pub const SUBSYS_DISPATCHERS: &str = "*dispatchers";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Tenant name, empty when the caller did not supply one
    #[serde(default)]
    pub tenant: String,
    pub id: String,
    #[serde(default)]
    pub fields: HashMap<String, Value>,
    #[serde(default)]
    pub options: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
}

impl Event {
    /// Create an event with a fresh random ID
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            id: uuid::Uuid::new_v4().to_string(),
            fields: HashMap::new(),
            options: HashMap::new(),
            time: None,
        }
    }

    /// Set the event ID
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Add an event field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Add a dispatch option
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Set the API key option
    pub fn with_api_key(self, api_key: impl Into<String>) -> Self {
        self.with_option(OPT_API_KEY, api_key.into())
    }

    /// Set the route affinity option
    pub fn with_route_id(self, route_id: impl Into<String>) -> Self {
        self.with_option(OPT_ROUTE_ID, route_id.into())
    }

    /// Set the event time
    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    /// API key supplied by the caller, if any
    pub fn api_key(&self) -> Option<&str> {
        self.string_option(OPT_API_KEY)
    }

    /// Route affinity token supplied by the caller, if any
    pub fn route_id(&self) -> Option<&str> {
        self.string_option(OPT_ROUTE_ID)
    }

    /// Whether the event should go through routing at all.
    ///
    /// Defaults to true. Accepts a boolean or a `"true"`/`"false"` string.
    pub fn should_dispatch(&self) -> Result<bool> {
        match self.options.get(OPT_DISPATCHERS) {
            None | Some(Value::Null) => Ok(true),
            Some(Value::Bool(flag)) => Ok(*flag),
            Some(Value::String(s)) => s.parse::<bool>().map_err(|_| {
                Error::Serialization(format!("cannot convert {:?} to bool", s))
            }),
            Some(other) => Err(Error::Serialization(format!(
                "cannot convert {} to bool",
                other
            ))),
        }
    }

    /// Subsystem that emitted the event, if stated
    pub fn subsys(&self) -> Option<&str> {
        self.string_option(OPT_SUBSYS)
    }

    /// Whether another dispatcher already forwarded this event
    pub fn is_from_dispatcher(&self) -> bool {
        self.subsys() == Some(SUBSYS_DISPATCHERS)
    }

    fn string_option(&self, key: &str) -> Option<&str> {
        self.options
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}
