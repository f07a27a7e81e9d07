//! # Error Types
//!
//! The error taxonomy surfaced by the bus.

use thiserror::Error;

/// Errors raised by a transport implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The connection to the broker dropped or could not be established.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The transport handle was closed by its owner.
    #[error("Transport is closed")]
    Closed,

    /// The broker rejected a command.
    #[error("Broker error: {0}")]
    Broker(String),

    /// The consumer group, or the channel holding it, no longer exists.
    /// Happens after a channel expired.
    #[error("Consumer group missing: {0}")]
    GroupMissing(String),

    /// A consumer loop gave up reconnecting.
    #[error("Gave up after {attempts} reconnection attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

impl TransportError {
    /// Whether a consumer loop should reconnect and try again. A missing
    /// group is recreated when the subscription restarts.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionLost(_) | Self::GroupMissing(_))
    }
}

/// Errors returned by the bus client surface.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    /// No result arrived within the caller's deadline.
    #[error("Timed out after {timeout_ms}ms waiting for {api}.{method}")]
    Timeout {
        api: String,
        method: String,
        timeout_ms: u64,
    },

    /// The remote handler failed.
    #[error("Remote error from {api}.{method}: {kind}: {message}")]
    RemoteError {
        api: String,
        method: String,
        kind: String,
        message: String,
    },

    /// Arguments do not match the registered schema.
    #[error("Schema mismatch for {api}.{member}: {reason}")]
    SchemaMismatch {
        api: String,
        member: String,
        reason: String,
    },

    /// The API is unknown to this process and to the schema registry.
    #[error("API not found: {0}")]
    ApiNotFound(String),

    /// The API has already been registered in this process.
    #[error("API already registered: {0}")]
    DuplicateApi(String),

    /// The API exists but does not declare the procedure.
    #[error("Unknown procedure {api}.{method}")]
    UnknownProcedure { api: String, method: String },

    /// The API exists but does not declare the event.
    #[error("Unknown event {api}.{event}")]
    UnknownEvent { api: String, event: String },

    /// The API name is not a valid dotted namespace.
    #[error("Invalid API name '{name}': {reason}")]
    InvalidApiName { name: String, reason: String },

    /// An API definition is internally inconsistent.
    #[error("Invalid API definition: {0}")]
    InvalidDefinition(String),

    /// A handler's parameter names do not match the declared signature.
    #[error("Handler for {api}.{member} takes {actual:?}, declared {expected:?}")]
    HandlerMismatch {
        api: String,
        member: String,
        expected: Vec<String>,
        actual: Vec<String>,
    },

    /// Another process already serves this API exclusively.
    #[error("API {api} is already served by {holder}")]
    ApiAlreadyServed { api: String, holder: String },

    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A message could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The client is shutting down or has been stopped.
    #[error("Bus client is shut down")]
    Shutdown,

    /// A background loop crashed.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl BusError {
    /// Stable error kind, used when an error crosses the wire in a result.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "Timeout",
            Self::RemoteError { .. } => "RemoteError",
            Self::SchemaMismatch { .. } => "SchemaMismatch",
            Self::ApiNotFound(_) => "ApiNotFound",
            Self::DuplicateApi(_) => "DuplicateApi",
            Self::UnknownProcedure { .. } => "UnknownProcedure",
            Self::UnknownEvent { .. } => "UnknownEvent",
            Self::InvalidApiName { .. } => "InvalidApiName",
            Self::InvalidDefinition(_) => "InvalidDefinition",
            Self::HandlerMismatch { .. } => "HandlerMismatch",
            Self::ApiAlreadyServed { .. } => "ApiAlreadyServed",
            Self::Transport(_) => "TransportError",
            Self::Codec(_) => "CodecError",
            Self::Config(_) => "ConfigError",
            Self::Shutdown => "Shutdown",
            Self::Internal(_) => "InternalError",
        }
    }
}
