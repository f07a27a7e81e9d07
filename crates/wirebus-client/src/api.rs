//! # API Registry
//!
//! Process-local map of the APIs this process serves or fires events for.
//! Lookups vastly outnumber registrations, hence the read-write lock.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use wirebus_types::{ApiDefinition, BusError};

#[derive(Default)]
pub struct ApiRegistry {
    apis: RwLock<HashMap<String, Arc<ApiDefinition>>>,
}

impl ApiRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an API. Each name may be registered once per process.
    pub fn add(&self, api: ApiDefinition) -> Result<Arc<ApiDefinition>, BusError> {
        let mut apis = self.apis.write();
        if apis.contains_key(api.name()) {
            return Err(BusError::DuplicateApi(api.name().to_string()));
        }
        let api = Arc::new(api);
        apis.insert(api.name().to_string(), api.clone());
        info!(
            "[Registry] Registered API '{}' ({} rpcs, {} events)",
            api.name(),
            api.rpcs().len(),
            api.events().len()
        );
        Ok(api)
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<ApiDefinition>, BusError> {
        self.apis
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BusError::ApiNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.apis.read().contains_key(name)
    }

    /// Registered API names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.apis.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.apis.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.apis.read().is_empty()
    }
}
