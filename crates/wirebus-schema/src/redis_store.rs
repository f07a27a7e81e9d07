//! Redis-backed schema store.
//!
//! Each schema lives under `schema:<api>` with a TTL; the set `schemas`
//! indexes the names. Stale names are removed from the index on read.

use crate::error::SchemaError;
use crate::store::SchemaStore;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, warn};
use wirebus_types::ApiDefinition;

const INDEX_KEY: &str = "schemas";

fn schema_key(api_name: &str) -> String {
    format!("schema:{api_name}")
}

fn store_err(err: redis::RedisError) -> SchemaError {
    SchemaError::Store(err.to_string())
}

pub struct RedisSchemaStore {
    conn: ConnectionManager,
    url: String,
}

impl RedisSchemaStore {
    pub async fn connect(url: &str) -> Result<Self, SchemaError> {
        let client = redis::Client::open(url).map_err(store_err)?;
        let conn = ConnectionManager::new(client).await.map_err(store_err)?;
        debug!("[Schema] Connected schema store");
        Ok(Self {
            conn,
            url: url.to_string(),
        })
    }

    fn parse(api_name: &str, raw: &str) -> Result<ApiDefinition, SchemaError> {
        serde_json::from_str(raw).map_err(|e| SchemaError::Parse {
            path: schema_key(api_name),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl SchemaStore for RedisSchemaStore {
    async fn store(&self, api: &ApiDefinition, ttl: Duration) -> Result<(), SchemaError> {
        let raw = serde_json::to_string(api).map_err(|e| SchemaError::Store(e.to_string()))?;
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(schema_key(api.name()))
            .arg(raw)
            .arg("PX")
            .arg(ttl_ms)
            .ignore()
            .sadd(INDEX_KEY, api.name())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn load(&self, api_name: &str) -> Result<Option<ApiDefinition>, SchemaError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(schema_key(api_name)).await.map_err(store_err)?;
        raw.map(|raw| Self::parse(api_name, &raw)).transpose()
    }

    async fn load_all(&self) -> Result<Vec<ApiDefinition>, SchemaError> {
        let mut conn = self.conn.clone();
        let mut names: Vec<String> = conn.smembers(INDEX_KEY).await.map_err(store_err)?;
        names.sort();

        let mut apis = Vec::with_capacity(names.len());
        for name in names {
            let raw: Option<String> = conn.get(schema_key(&name)).await.map_err(store_err)?;
            match raw {
                Some(raw) => match Self::parse(&name, &raw) {
                    Ok(api) => apis.push(api),
                    Err(e) => warn!("[Schema] Skipping unreadable schema: {}", e),
                },
                None => {
                    let _: () = conn.srem(INDEX_KEY, &name).await.map_err(store_err)?;
                    debug!("[Schema] Dropped expired schema '{}' from index", name);
                }
            }
        }
        Ok(apis)
    }

    fn describe(&self) -> String {
        redact(&self.url)
    }
}

fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}://***{}", &url[..scheme], &url[at..])
        }
        _ => url.to_string(),
    }
}
