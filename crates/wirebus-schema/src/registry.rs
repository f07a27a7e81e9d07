//! # Schema Registry
//!
//! Holds the schemas of APIs registered by this process (local) and of APIs
//! published by others (remote). Local schemas are pushed to the shared
//! store and kept alive by the monitor. Remote schemas are pulled on demand
//! and re-read from the store once they are older than a third of the TTL,
//! so a newer version published by the owner replaces them.

use crate::error::SchemaError;
use crate::json_schema::to_json_schema;
use crate::store::SchemaStore;
use crate::validate::{check_parameter_names, validate_kwargs};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use wirebus_types::{ApiDefinition, EventDeclaration, Kwargs};

/// Default lifetime of a published schema.
pub const DEFAULT_SCHEMA_TTL: Duration = Duration::from_secs(60);

/// A schema owned by another process.
#[derive(Debug, Clone)]
struct RemoteSchema {
    api: ApiDefinition,
    fetched: Instant,
    /// Loaded from a schema file. Kept when the store has no copy.
    pinned: bool,
}

pub struct SchemaRegistry {
    store: Arc<dyn SchemaStore>,
    ttl: Duration,
    local: RwLock<BTreeMap<String, ApiDefinition>>,
    remote: RwLock<BTreeMap<String, RemoteSchema>>,
}

impl SchemaRegistry {
    pub fn new(store: Arc<dyn SchemaStore>) -> Self {
        Self::with_ttl(store, DEFAULT_SCHEMA_TTL)
    }

    pub fn with_ttl(store: Arc<dyn SchemaStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            local: RwLock::new(BTreeMap::new()),
            remote: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Age after which a remote schema is read from the store again.
    fn max_remote_age(&self) -> Duration {
        self.ttl / 3
    }

    /// Record a locally served API and publish it.
    pub async fn register(&self, api: &ApiDefinition) -> Result<(), SchemaError> {
        self.local.write().insert(api.name().to_string(), api.clone());
        self.remote.write().remove(api.name());
        self.store.store(api, self.ttl).await?;
        info!("[Schema] Published schema for '{}'", api.name());
        Ok(())
    }

    pub fn is_local(&self, api_name: &str) -> bool {
        self.local.read().contains_key(api_name)
    }

    /// Schema already held in memory, without touching the store.
    pub fn cached(&self, api_name: &str) -> Option<ApiDefinition> {
        if let Some(api) = self.local.read().get(api_name) {
            return Some(api.clone());
        }
        self.remote.read().get(api_name).map(|entry| entry.api.clone())
    }

    /// Schema for `api_name`. Remote schemas past their age are fetched from
    /// the store again.
    pub async fn get(&self, api_name: &str) -> Result<ApiDefinition, SchemaError> {
        if let Some(api) = self.local.read().get(api_name) {
            return Ok(api.clone());
        }
        let cached = self.remote.read().get(api_name).cloned();
        match cached {
            Some(entry) if entry.fetched.elapsed() < self.max_remote_age() => Ok(entry.api),
            Some(entry) => match self.reload(api_name).await {
                Ok(api) => Ok(api),
                Err(SchemaError::Store(reason)) => {
                    warn!(
                        "[Schema] Could not refresh '{}', using cached copy: {}",
                        api_name, reason
                    );
                    Ok(entry.api)
                }
                Err(e) => Err(e),
            },
            None => self.reload(api_name).await,
        }
    }

    /// Read `api_name` from the store, replacing the cached copy. A schema
    /// the store no longer holds is forgotten unless it came from a file.
    pub async fn reload(&self, api_name: &str) -> Result<ApiDefinition, SchemaError> {
        let loaded = self.store.load(api_name).await?;
        let mut remote = self.remote.write();
        match loaded {
            Some(api) => {
                debug!("[Schema] Fetched schema for '{}'", api_name);
                let pinned = remote.get(api_name).is_some_and(|entry| entry.pinned);
                remote.insert(
                    api_name.to_string(),
                    RemoteSchema {
                        api: api.clone(),
                        fetched: Instant::now(),
                        pinned,
                    },
                );
                Ok(api)
            }
            None => match remote.get_mut(api_name) {
                Some(entry) if entry.pinned => {
                    entry.fetched = Instant::now();
                    Ok(entry.api.clone())
                }
                _ => {
                    if remote.remove(api_name).is_some() {
                        debug!("[Schema] Schema for '{}' lapsed", api_name);
                    }
                    Err(SchemaError::NotFound(api_name.to_string()))
                }
            },
        }
    }

    /// Run `check` against the schema of `api_name`. A remote schema that
    /// fails the check is fetched once more, since its owner may have
    /// published a newer version.
    async fn check_against<T>(
        &self,
        api_name: &str,
        check: impl Fn(&ApiDefinition) -> Result<T, SchemaError>,
    ) -> Result<T, SchemaError> {
        let api = self.get(api_name).await?;
        match check(&api) {
            Err(err) if is_conflict(&err) && !self.is_local(api_name) => {
                match self.reload(api_name).await {
                    Ok(fresh) if fresh != api => check(&fresh),
                    _ => Err(err),
                }
            }
            result => result,
        }
    }

    pub async fn validate_call(
        &self,
        api_name: &str,
        method: &str,
        kwargs: &Kwargs,
    ) -> Result<(), SchemaError> {
        self.check_against(api_name, |api| {
            let rpc = api.rpc(method).ok_or_else(|| SchemaError::UnknownProcedure {
                api: api_name.to_string(),
                method: method.to_string(),
            })?;
            validate_kwargs(api_name, method, &rpc.parameters, kwargs)
        })
        .await
    }

    pub async fn validate_event(
        &self,
        api_name: &str,
        event: &str,
        kwargs: &Kwargs,
    ) -> Result<(), SchemaError> {
        self.check_against(api_name, |api| {
            let declaration = declared_event(api, api_name, event)?;
            validate_kwargs(api_name, event, &declaration.parameters, kwargs)
        })
        .await
    }

    /// Declaration of `api_name.event`.
    pub async fn event_declaration(
        &self,
        api_name: &str,
        event: &str,
    ) -> Result<EventDeclaration, SchemaError> {
        self.check_against(api_name, |api| declared_event(api, api_name, event).cloned())
            .await
    }

    /// Check a procedure handler's parameter names against the schema.
    pub async fn check_rpc_handler(
        &self,
        api_name: &str,
        method: &str,
        parameter_names: &[&str],
    ) -> Result<(), SchemaError> {
        self.check_against(api_name, |api| {
            let rpc = api.rpc(method).ok_or_else(|| SchemaError::UnknownProcedure {
                api: api_name.to_string(),
                method: method.to_string(),
            })?;
            check_parameter_names(api_name, method, &rpc.parameters, parameter_names)
        })
        .await
    }

    /// Check an event listener's parameter names against the schema.
    pub async fn check_event_handler(
        &self,
        api_name: &str,
        event: &str,
        parameter_names: &[&str],
    ) -> Result<(), SchemaError> {
        self.check_against(api_name, |api| {
            let declaration = declared_event(api, api_name, event)?;
            check_parameter_names(api_name, event, &declaration.parameters, parameter_names)
        })
        .await
    }

    /// Names of every known API, local and remote.
    pub fn api_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.local.read().keys().cloned().collect();
        for name in self.remote.read().keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names.sort();
        names
    }

    /// Re-publish local schemas and reload remote ones from the store.
    /// Remote schemas the store no longer holds are dropped, except those
    /// loaded from a file.
    pub async fn refresh(&self) -> Result<(), SchemaError> {
        let local: Vec<ApiDefinition> = self.local.read().values().cloned().collect();
        for api in &local {
            self.store.store(api, self.ttl).await?;
        }

        let published = self.store.load_all().await?;
        let now = Instant::now();
        let mut remote = self.remote.write();
        let mut fresh: BTreeMap<String, RemoteSchema> = remote
            .iter()
            .filter(|(_, entry)| entry.pinned)
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect();
        for api in published {
            if local.iter().any(|l| l.name() == api.name()) {
                continue;
            }
            let pinned = fresh.contains_key(api.name());
            fresh.insert(
                api.name().to_string(),
                RemoteSchema {
                    api,
                    fetched: now,
                    pinned,
                },
            );
        }
        let dropped = remote.keys().filter(|name| !fresh.contains_key(*name)).count();
        *remote = fresh;
        debug!(
            "[Schema] Refreshed {} local and {} remote schemas, {} lapsed",
            local.len(),
            remote.len(),
            dropped
        );
        Ok(())
    }

    /// Keep schemas fresh until shutdown. Refreshes at a third of the TTL so
    /// a schema never lapses while its owner is alive.
    pub async fn run_monitor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = (self.ttl / 3).max(Duration::from_millis(100));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!("[Schema] Refresh failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("[Schema] Monitor stopped");
                        return;
                    }
                }
            }
        }
    }

    /// Load schema documents from a file, or from every `.json` file in a
    /// directory. A document holds one API or an array of them. Loaded
    /// schemas are treated as remote.
    pub async fn load_local(&self, path: impl AsRef<Path>) -> Result<Vec<String>, SchemaError> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await.map_err(|e| io_err(path, e))?;

        let files = if metadata.is_dir() {
            let mut files = Vec::new();
            let mut dir = tokio::fs::read_dir(path).await.map_err(|e| io_err(path, e))?;
            while let Some(entry) = dir.next_entry().await.map_err(|e| io_err(path, e))? {
                let file = entry.path();
                if file.extension().is_some_and(|ext| ext == "json") {
                    files.push(file);
                }
            }
            files.sort();
            files
        } else {
            vec![path.to_path_buf()]
        };

        let mut loaded = Vec::new();
        for file in files {
            let raw = tokio::fs::read_to_string(&file).await.map_err(|e| io_err(&file, e))?;
            for api in parse_document(&file, &raw)? {
                loaded.push(api.name().to_string());
                self.remote.write().insert(
                    api.name().to_string(),
                    RemoteSchema {
                        api,
                        fetched: Instant::now(),
                        pinned: true,
                    },
                );
            }
        }
        info!("[Schema] Loaded {} schemas from {}", loaded.len(), path.display());
        Ok(loaded)
    }

    /// Write every known schema to `path` as a JSON array.
    pub async fn dump(&self, path: impl AsRef<Path>) -> Result<(), SchemaError> {
        let path = path.as_ref();
        let raw = serde_json::to_string_pretty(&self.definitions()).map_err(|e| SchemaError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        tokio::fs::write(path, raw).await.map_err(|e| io_err(path, e))
    }

    /// JSON Schema documents for every known API, keyed by API name.
    pub fn to_json_schema(&self) -> Value {
        let docs: serde_json::Map<String, Value> = self
            .definitions()
            .iter()
            .map(|api| (api.name().to_string(), to_json_schema(api)))
            .collect();
        Value::Object(docs)
    }

    /// Every known schema, local ones taking precedence, sorted by name.
    pub fn definitions(&self) -> Vec<ApiDefinition> {
        let mut all: BTreeMap<String, ApiDefinition> = self
            .remote
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.api.clone()))
            .collect();
        all.extend(self.local.read().clone());
        all.into_values().collect()
    }
}

fn declared_event<'a>(
    api: &'a ApiDefinition,
    api_name: &str,
    event: &str,
) -> Result<&'a EventDeclaration, SchemaError> {
    api.event(event).ok_or_else(|| SchemaError::UnknownEvent {
        api: api_name.to_string(),
        event: event.to_string(),
    })
}

/// Errors a newer version of the schema could resolve.
fn is_conflict(err: &SchemaError) -> bool {
    matches!(
        err,
        SchemaError::Mismatch { .. }
            | SchemaError::UnknownProcedure { .. }
            | SchemaError::UnknownEvent { .. }
            | SchemaError::HandlerMismatch { .. }
    )
}

fn io_err(path: &Path, source: std::io::Error) -> SchemaError {
    SchemaError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn parse_document(path: &Path, raw: &str) -> Result<Vec<ApiDefinition>, SchemaError> {
    let parse_err = |e: serde_json::Error| SchemaError::Parse {
        path: path.display().to_string(),
        reason: e.to_string(),
    };
    let value: Value = serde_json::from_str(raw).map_err(parse_err)?;
    if value.is_array() {
        serde_json::from_value(value).map_err(parse_err)
    } else {
        Ok(vec![serde_json::from_value(value).map_err(parse_err)?])
    }
}
