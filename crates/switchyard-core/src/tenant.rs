//! Tenant identity for multi-tenancy support

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Namespace isolating configuration, profiles and connections.
///
/// Tenants are plain strings such as `cgrates.org`. A call that arrives
/// without one is dispatched under the deployment's default tenant, see
/// [`Tenant::or_default`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tenant(String);

impl Tenant {
    /// Create a tenant, rejecting blank names
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::Config("tenant name cannot be empty".to_string()));
        }
        Ok(Self(name))
    }

    /// Resolve the tenant of a call: the supplied one when non-empty,
    /// otherwise the configured default
    pub fn or_default(supplied: Option<&str>, default: &Tenant) -> Tenant {
        match supplied {
            Some(name) if !name.is_empty() => Tenant(name.to_string()),
            _ => default.clone(),
        }
    }

    /// Get the tenant name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Tenant {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl AsRef<str> for Tenant {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_creation() {
        let tenant = Tenant::new("cgrates.org").unwrap();
        assert_eq!(tenant.as_str(), "cgrates.org");
        assert_eq!(tenant.to_string(), "cgrates.org");
    }

    #[test]
    fn test_tenant_rejects_blank() {
        assert!(Tenant::new("").is_err());
        assert!(Tenant::new("   ").is_err());
        assert!("".parse::<Tenant>().is_err());
    }

    #[test]
    fn test_tenant_default_fill() {
        let default = Tenant::new("cgrates.org").unwrap();
        assert_eq!(Tenant::or_default(None, &default), default);
        assert_eq!(Tenant::or_default(Some(""), &default), default);
        assert_eq!(
            Tenant::or_default(Some("itsyscom.com"), &default).as_str(),
            "itsyscom.com"
        );
    }

    #[test]
    fn test_tenant_serde_is_transparent() {
        let tenant = Tenant::new("cgrates.org").unwrap();
        assert_eq!(serde_json::to_string(&tenant).unwrap(), "\"cgrates.org\"");
        let parsed: Tenant = serde_json::from_str("\"cgrates.org\"").unwrap();
        assert_eq!(parsed, tenant);
    }
}
