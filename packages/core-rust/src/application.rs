//! Tenant and application identifiers.
//!
//! An [`ApplicationId`] is the key for generation tracking and delayed-response
//! grouping. The reserved [`ApplicationId::global`] id collects wildcard
//! subscribers that must observe every application's changes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Name of a tenant owning zero or more applications.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantName(String);

impl TenantName {
    /// Tenant used when a host is not registered with any tenant.
    pub const DEFAULT: &'static str = "default";

    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn default_name() -> Self {
        Self::new(Self::DEFAULT)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a deployed application: tenant + application name + instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApplicationId {
    pub tenant: TenantName,
    pub application: String,
    pub instance: String,
}

/// Error returned when parsing `tenant:application:instance` text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid application id '{input}': expected tenant:application:instance")]
pub struct ParseApplicationIdError {
    pub input: String,
}

impl ApplicationId {
    const GLOBAL_TENANT: &'static str = "hosted-vespa";
    const GLOBAL_APPLICATION: &'static str = "routing";
    const DEFAULT_NAME: &'static str = "default";

    #[must_use]
    pub fn new(
        tenant: TenantName,
        application: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            tenant,
            application: application.into(),
            instance: instance.into(),
        }
    }

    /// The reserved wildcard application that receives every broadcast drain.
    #[must_use]
    pub fn global() -> Self {
        Self::new(
            TenantName::new(Self::GLOBAL_TENANT),
            Self::GLOBAL_APPLICATION,
            Self::DEFAULT_NAME,
        )
    }

    /// `default:default:default`, the fallback for unregistered hosts.
    #[must_use]
    pub fn default_application() -> Self {
        Self::new(
            TenantName::default_name(),
            Self::DEFAULT_NAME,
            Self::DEFAULT_NAME,
        )
    }

    #[must_use]
    pub fn is_global(&self) -> bool {
        *self == Self::global()
    }

    /// Short prefix used in log lines, e.g. `tenant 'foo', app 'bar.default': `.
    #[must_use]
    pub fn log_prefix(&self) -> String {
        format!(
            "tenant '{}', app '{}.{}': ",
            self.tenant, self.application, self.instance
        )
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.tenant, self.application, self.instance)
    }
}

impl FromStr for ApplicationId {
    type Err = ParseApplicationIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseApplicationIdError {
            input: s.to_string(),
        };
        let mut parts = s.split(':');
        let (Some(tenant), Some(application), Some(instance), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(err());
        };
        if tenant.is_empty() || application.is_empty() || instance.is_empty() {
            return Err(err());
        }
        Ok(Self::new(TenantName::new(tenant), application, instance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_agree() {
        let id = ApplicationId::new(TenantName::new("t1"), "music", "prod");
        assert_eq!(id.to_string(), "t1:music:prod");
        assert_eq!("t1:music:prod".parse::<ApplicationId>().unwrap(), id);
    }

    #[test]
    fn parse_rejects_wrong_arity_and_empty_parts() {
        assert!("t1:music".parse::<ApplicationId>().is_err());
        assert!("t1:music:prod:extra".parse::<ApplicationId>().is_err());
        assert!("t1::prod".parse::<ApplicationId>().is_err());
    }

    #[test]
    fn global_is_distinct_from_default() {
        assert!(ApplicationId::global().is_global());
        assert!(!ApplicationId::default_application().is_global());
        assert_ne!(ApplicationId::global(), ApplicationId::default_application());
    }

    #[test]
    fn log_prefix_names_tenant_and_app() {
        let id = ApplicationId::new(TenantName::new("t1"), "music", "prod");
        assert_eq!(id.log_prefix(), "tenant 't1', app 'music.prod': ");
    }
}
