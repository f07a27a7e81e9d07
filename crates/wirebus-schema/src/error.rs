//! Schema registry errors.

use thiserror::Error;
use wirebus_types::BusError;

#[derive(Debug, Error)]
pub enum SchemaError {
    /// No schema is known for the API, locally or in the shared store.
    #[error("No schema found for API '{0}'")]
    NotFound(String),

    /// The API does not declare the procedure.
    #[error("API '{api}' has no procedure '{method}'")]
    UnknownProcedure { api: String, method: String },

    /// The API does not declare the event.
    #[error("API '{api}' has no event '{event}'")]
    UnknownEvent { api: String, event: String },

    /// Arguments do not match the declared parameters.
    #[error("Arguments for {api}.{member} do not match schema: {reason}")]
    Mismatch {
        api: String,
        member: String,
        reason: String,
    },

    /// A handler's parameters differ from the declaration.
    #[error("Handler for {api}.{member} takes {actual:?}, schema declares {expected:?}")]
    HandlerMismatch {
        api: String,
        member: String,
        expected: Vec<String>,
        actual: Vec<String>,
    },

    /// The shared store failed.
    #[error("Schema store error: {0}")]
    Store(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A schema document could not be parsed.
    #[error("Invalid schema document {path}: {reason}")]
    Parse { path: String, reason: String },
}

impl From<SchemaError> for BusError {
    fn from(err: SchemaError) -> Self {
        match err {
            SchemaError::NotFound(api) => BusError::ApiNotFound(api),
            SchemaError::UnknownProcedure { api, method } => {
                BusError::UnknownProcedure { api, method }
            }
            SchemaError::UnknownEvent { api, event } => BusError::UnknownEvent { api, event },
            SchemaError::Mismatch { api, member, reason } => {
                BusError::SchemaMismatch { api, member, reason }
            }
            SchemaError::HandlerMismatch {
                api,
                member,
                expected,
                actual,
            } => BusError::HandlerMismatch {
                api,
                member,
                expected,
                actual,
            },
            SchemaError::Store(reason) => BusError::Config(format!("schema store: {reason}")),
            err @ (SchemaError::Io { .. } | SchemaError::Parse { .. }) => {
                BusError::Config(err.to_string())
            }
        }
    }
}
