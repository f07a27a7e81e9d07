//! Shared schema storage.
//!
//! Every process publishes the schemas of the APIs it registers with a TTL
//! and keeps them alive while it runs. A schema that is not refreshed
//! disappears once its owner is gone.

use crate::error::SchemaError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use wirebus_types::ApiDefinition;

/// Storage for published API schemas.
#[async_trait]
pub trait SchemaStore: Send + Sync + 'static {
    /// Publish or refresh a schema for `ttl`.
    async fn store(&self, api: &ApiDefinition, ttl: Duration) -> Result<(), SchemaError>;

    /// Fetch one schema if it is currently published.
    async fn load(&self, api_name: &str) -> Result<Option<ApiDefinition>, SchemaError>;

    /// Fetch every currently published schema.
    async fn load_all(&self) -> Result<Vec<ApiDefinition>, SchemaError>;

    fn describe(&self) -> String;
}

/// Process-local schema store.
///
/// Share one instance between several clients through an `Arc` to model a
/// bus in tests.
#[derive(Debug, Default)]
pub struct InMemorySchemaStore {
    entries: RwLock<HashMap<String, (ApiDefinition, Instant)>>,
}

impl InMemorySchemaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self, name: &str, now: Instant) -> Option<ApiDefinition> {
        self.entries
            .read()
            .get(name)
            .filter(|(_, expires)| *expires > now)
            .map(|(api, _)| api.clone())
    }
}

#[async_trait]
impl SchemaStore for InMemorySchemaStore {
    async fn store(&self, api: &ApiDefinition, ttl: Duration) -> Result<(), SchemaError> {
        self.entries
            .write()
            .insert(api.name().to_string(), (api.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn load(&self, api_name: &str) -> Result<Option<ApiDefinition>, SchemaError> {
        Ok(self.live(api_name, Instant::now()))
    }

    async fn load_all(&self) -> Result<Vec<ApiDefinition>, SchemaError> {
        let now = Instant::now();
        let mut entries = self.entries.write();
        entries.retain(|_, (_, expires)| *expires > now);
        let mut apis: Vec<_> = entries.values().map(|(api, _)| api.clone()).collect();
        apis.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(apis)
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}
