//! Name-to-service table with `"Service.Method"` resolution.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::service::{MethodType, Service};

/// Registered services, keyed by name.
///
/// All access goes through the methods below; the map itself is never
/// handed out.
#[derive(Debug, Default)]
pub struct Registry {
    services: RwLock<HashMap<String, Arc<Service>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service. Fails if the name is taken.
    pub fn register(&self, service: Service) -> Result<()> {
        let mut services = self.services.write();
        if services.contains_key(service.name()) {
            return Err(Error::DuplicateService(service.name().to_string()));
        }
        tracing::info!(
            service = service.name(),
            methods = service.methods().count(),
            "register service"
        );
        services.insert(service.name().to_string(), Arc::new(service));
        Ok(())
    }

    /// Resolve `"Service.Method"`, splitting on the last `.`.
    pub fn resolve(&self, service_method: &str) -> Result<(Arc<Service>, Arc<MethodType>)> {
        let (service_name, method_name) = service_method
            .rsplit_once('.')
            .ok_or_else(|| Error::IllFormedName(service_method.to_string()))?;

        let service = self
            .services
            .read()
            .get(service_name)
            .cloned()
            .ok_or_else(|| Error::ServiceNotFound(service_name.to_string()))?;

        let method = service
            .method(method_name)
            .cloned()
            .ok_or_else(|| Error::MethodNotFound(method_name.to_string()))?;

        Ok((service, method))
    }

    /// Snapshot of all services, sorted by name.
    pub fn services(&self) -> Vec<Arc<Service>> {
        let mut services: Vec<_> = self.services.read().values().cloned().collect();
        services.sort_by(|a, b| a.name().cmp(b.name()));
        services
    }

    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
