//! Subsystem tags
//!
//! Every backend node serves one or more subsystems and every dispatched
//! method belongs to exactly one of them. Each (tenant, subsystem) pair owns
//! its own connection pool.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Backend capability group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Subsystem {
    #[serde(rename = "*core")]
    Core,
    #[serde(rename = "*attributes")]
    Attributes,
    #[serde(rename = "*chargers")]
    Chargers,
    #[serde(rename = "*sessions")]
    Sessions,
    #[serde(rename = "*cdrs")]
    Cdrs,
    #[serde(rename = "*rates")]
    Rates,
    #[serde(rename = "*stats")]
    Stats,
    #[serde(rename = "*thresholds")]
    Thresholds,
    #[serde(rename = "*trends")]
    Trends,
    #[serde(rename = "*rankings")]
    Rankings,
    #[serde(rename = "*resources")]
    Resources,
    #[serde(rename = "*routes")]
    Routes,
    #[serde(rename = "*accounts")]
    Accounts,
    #[serde(rename = "*actions")]
    Actions,
    #[serde(rename = "*ees")]
    Ees,
    #[serde(rename = "*admins")]
    Admins,
    #[serde(rename = "*caches")]
    Caches,
    #[serde(rename = "*replicator")]
    Replicator,
}

impl Subsystem {
    pub const ALL: [Subsystem; 18] = [
        Subsystem::Core,
        Subsystem::Attributes,
        Subsystem::Chargers,
        Subsystem::Sessions,
        Subsystem::Cdrs,
        Subsystem::Rates,
        Subsystem::Stats,
        Subsystem::Thresholds,
        Subsystem::Trends,
        Subsystem::Rankings,
        Subsystem::Resources,
        Subsystem::Routes,
        Subsystem::Accounts,
        Subsystem::Actions,
        Subsystem::Ees,
        Subsystem::Admins,
        Subsystem::Caches,
        Subsystem::Replicator,
    ];

    /// Tag as used in configuration and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Subsystem::Core => "*core",
            Subsystem::Attributes => "*attributes",
            Subsystem::Chargers => "*chargers",
            Subsystem::Sessions => "*sessions",
            Subsystem::Cdrs => "*cdrs",
            Subsystem::Rates => "*rates",
            Subsystem::Stats => "*stats",
            Subsystem::Thresholds => "*thresholds",
            Subsystem::Trends => "*trends",
            Subsystem::Rankings => "*rankings",
            Subsystem::Resources => "*resources",
            Subsystem::Routes => "*routes",
            Subsystem::Accounts => "*accounts",
            Subsystem::Actions => "*actions",
            Subsystem::Ees => "*ees",
            Subsystem::Admins => "*admins",
            Subsystem::Caches => "*caches",
            Subsystem::Replicator => "*replicator",
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Subsystem {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Subsystem::ALL
            .iter()
            .copied()
            .find(|subsystem| subsystem.as_str() == s)
            .ok_or_else(|| Error::Config(format!("unknown subsystem: <{}>", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subsystem_round_trips_through_tag() {
        for subsystem in Subsystem::ALL {
            assert_eq!(subsystem.as_str().parse::<Subsystem>().unwrap(), subsystem);
        }
    }

    #[test]
    fn test_unknown_subsystem_rejected() {
        let err = "*cores".parse::<Subsystem>().unwrap_err();
        assert!(err.to_string().contains("*cores"));
        assert!("core".parse::<Subsystem>().is_err());
        assert!("*Core".parse::<Subsystem>().is_err());
    }

    #[test]
    fn test_subsystem_serde_matches_display() {
        let json = serde_json::to_string(&Subsystem::Trends).unwrap();
        assert_eq!(json, "\"*trends\"");
        let parsed: Subsystem = serde_json::from_str("\"*ees\"").unwrap();
        assert_eq!(parsed, Subsystem::Ees);
    }
}
