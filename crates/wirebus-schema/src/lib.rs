//! # Wirebus Schema
//!
//! Every API on the bus publishes its schema so that callers and listeners
//! in other processes can validate arguments before sending them and can
//! check handlers against the declaration before serving.
//!
//! ```text
//! register(api) ──► local ──► SchemaStore (TTL, kept alive by run_monitor)
//!                                  │
//! get(api) ◄── remote cache ◄──────┘
//! ```

pub mod error;
pub mod json_schema;
pub mod registry;
pub mod store;
pub mod validate;

#[cfg(feature = "redis")]
pub mod redis_store;

pub use error::SchemaError;
pub use json_schema::to_json_schema;
pub use registry::{SchemaRegistry, DEFAULT_SCHEMA_TTL};
pub use store::{InMemorySchemaStore, SchemaStore};
pub use validate::{check_parameter_names, validate_kwargs};

#[cfg(feature = "redis")]
pub use redis_store::RedisSchemaStore;
