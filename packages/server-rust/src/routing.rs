//! Host to tenant and application routing.
//!
//! A tenant owns a set of hosts. Within a tenant, a host may be assigned to
//! a specific application; otherwise it is served by the tenant's default
//! application.

use std::collections::HashSet;

use cfgsync_core::{ApplicationId, TenantName};
use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::RoutingError;
use crate::traits::TenantRouter;

#[derive(Debug, Default)]
pub struct HostRegistry {
    tenant_hosts: DashMap<String, TenantName>,
    application_hosts: DashMap<String, ApplicationId>,
    tenant_defaults: DashMap<TenantName, ApplicationId>,
}

impl HostRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails if any of `hosts` already belongs to another tenant.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::HostInUse`] naming the first conflicting host.
    pub fn verify_hosts_available(
        &self,
        tenant: &TenantName,
        hosts: &[String],
    ) -> Result<(), RoutingError> {
        for hostname in hosts {
            if let Some(owner) = self.tenant_hosts.get(hostname) {
                if owner.value() != tenant {
                    return Err(RoutingError::HostInUse {
                        hostname: hostname.clone(),
                        owner: owner.value().clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Replaces the hosts owned by `tenant`.
    ///
    /// # Errors
    ///
    /// Fails without changing anything if a host belongs to another tenant.
    pub fn hosts_updated(
        &self,
        tenant: &TenantName,
        hosts: &[String],
    ) -> Result<(), RoutingError> {
        self.verify_hosts_available(tenant, hosts)?;
        let keep: HashSet<&String> = hosts.iter().collect();
        self.tenant_hosts
            .retain(|host, owner| owner != tenant || keep.contains(host));
        self.application_hosts
            .retain(|host, app| app.tenant != *tenant || keep.contains(host));
        for host in hosts {
            self.tenant_hosts.insert(host.clone(), tenant.clone());
        }
        debug!(tenant = %tenant, hosts = hosts.len(), "Tenant hosts updated");
        Ok(())
    }

    /// Routes `hosts` to `application`, claiming them for its tenant.
    ///
    /// # Errors
    ///
    /// Fails without changing anything if a host belongs to another tenant.
    pub fn update_application_hosts(
        &self,
        application: &ApplicationId,
        hosts: &[String],
    ) -> Result<(), RoutingError> {
        self.verify_hosts_available(&application.tenant, hosts)?;
        for host in hosts {
            self.tenant_hosts
                .insert(host.clone(), application.tenant.clone());
            self.application_hosts
                .insert(host.clone(), application.clone());
        }
        Ok(())
    }

    /// Application serving hosts of its tenant that have no specific route.
    pub fn set_tenant_default(&self, application: ApplicationId) {
        self.tenant_defaults
            .insert(application.tenant.clone(), application);
    }

    pub fn remove_application(&self, application: &ApplicationId) {
        self.application_hosts.retain(|_, app| app != application);
        self.tenant_defaults
            .remove_if(&application.tenant, |_, default| default == application);
    }

    /// Tenant owning `hostname`.
    #[must_use]
    pub fn tenant_of(&self, hostname: &str) -> Option<TenantName> {
        self.tenant_hosts.get(hostname).map(|t| t.value().clone())
    }

    #[must_use]
    pub fn host_count(&self) -> usize {
        self.tenant_hosts.len()
    }
}

impl TenantRouter for HostRegistry {
    fn resolve_application(&self, hostname: &str) -> Option<ApplicationId> {
        if let Some(application) = self.application_hosts.get(hostname) {
            return Some(application.value().clone());
        }
        let tenant = self.tenant_of(hostname)?;
        self.tenant_defaults.get(&tenant).map(|a| a.value().clone())
    }

    fn remove_tenant(&self, tenant: &TenantName) {
        self.tenant_hosts.retain(|_, owner| owner != tenant);
        self.application_hosts.retain(|_, app| app.tenant != *tenant);
        self.tenant_defaults.remove(tenant);
        info!(tenant = %tenant, "Tenant removed from host routing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    fn app(tenant: &str, name: &str) -> ApplicationId {
        ApplicationId::new(TenantName::new(tenant), name, "default")
    }

    #[test]
    fn routes_specific_then_default() {
        let registry = HostRegistry::new();
        let t1 = TenantName::new("t1");
        registry.hosts_updated(&t1, &hosts(&["h1", "h2"])).unwrap();
        registry.set_tenant_default(app("t1", "main"));
        registry
            .update_application_hosts(&app("t1", "search"), &hosts(&["h2"]))
            .unwrap();

        assert_eq!(registry.resolve_application("h1"), Some(app("t1", "main")));
        assert_eq!(registry.resolve_application("h2"), Some(app("t1", "search")));
        assert_eq!(registry.resolve_application("h3"), None);
    }

    #[test]
    fn hosts_cannot_be_shared_between_tenants() {
        let registry = HostRegistry::new();
        let t1 = TenantName::new("t1");
        let t2 = TenantName::new("t2");
        registry.hosts_updated(&t1, &hosts(&["h1"])).unwrap();

        let err = registry
            .hosts_updated(&t2, &hosts(&["h2", "h1"]))
            .unwrap_err();
        assert_eq!(
            err,
            RoutingError::HostInUse {
                hostname: "h1".into(),
                owner: t1.clone()
            }
        );
        assert_eq!(registry.tenant_of("h2"), None);
        assert!(registry.verify_hosts_available(&t1, &hosts(&["h1"])).is_ok());
    }

    #[test]
    fn updating_tenant_hosts_drops_old_ones() {
        let registry = HostRegistry::new();
        let t1 = TenantName::new("t1");
        registry.hosts_updated(&t1, &hosts(&["h1", "h2"])).unwrap();
        registry.hosts_updated(&t1, &hosts(&["h2", "h3"])).unwrap();
        assert_eq!(registry.tenant_of("h1"), None);
        assert_eq!(registry.host_count(), 2);
    }

    #[test]
    fn remove_tenant_and_application() {
        let registry = HostRegistry::new();
        let t1 = TenantName::new("t1");
        registry
            .update_application_hosts(&app("t1", "a"), &hosts(&["h1"]))
            .unwrap();
        registry
            .update_application_hosts(&app("t2", "b"), &hosts(&["h2"]))
            .unwrap();
        registry.set_tenant_default(app("t1", "a"));

        registry.remove_application(&app("t1", "a"));
        assert_eq!(registry.resolve_application("h1"), None);

        registry.remove_tenant(&t1);
        assert_eq!(registry.tenant_of("h1"), None);
        assert_eq!(registry.resolve_application("h2"), Some(app("t2", "b")));
    }
}
