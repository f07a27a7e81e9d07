//! # Wire Messages
//!
//! Calls, results and events as they travel over the transport. All messages
//! are JSON objects keyed by field name so that keyword arguments and
//! correlation ids survive process and language boundaries.

use crate::errors::BusError;
use crate::ids::{EntryId, MessageId};
use crate::PROTOCOL_VERSION;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Keyword arguments of a call or event.
pub type Kwargs = serde_json::Map<String, Value>;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A request to invoke `api_name.procedure_name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallMessage {
    pub version: u16,
    pub id: MessageId,
    pub api_name: String,
    pub procedure_name: String,
    pub kwargs: Kwargs,
    /// Channel the result must be published to.
    pub reply_to: String,
    pub timestamp_ms: u64,
    /// The caller stops waiting after this instant.
    pub deadline_ms: u64,
}

impl CallMessage {
    pub fn new(
        api_name: impl Into<String>,
        procedure_name: impl Into<String>,
        kwargs: Kwargs,
        reply_to: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let timestamp_ms = now_ms();
        Self {
            version: PROTOCOL_VERSION,
            id: MessageId::new(),
            api_name: api_name.into(),
            procedure_name: procedure_name.into(),
            kwargs,
            reply_to: reply_to.into(),
            timestamp_ms,
            deadline_ms: timestamp_ms.saturating_add(timeout.as_millis() as u64),
        }
    }

    pub fn canonical_name(&self) -> String {
        format!("{}.{}", self.api_name, self.procedure_name)
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms > self.deadline_ms
    }
}

/// Error details carried back to a caller when the handler failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteErrorInfo {
    pub kind: String,
    pub message: String,
}

/// Outcome of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum CallOutcome {
    Ok(Value),
    Error(RemoteErrorInfo),
}

/// The answer to a [`CallMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub version: u16,
    pub id: MessageId,
    pub call_id: MessageId,
    pub outcome: CallOutcome,
    pub timestamp_ms: u64,
}

impl ResultMessage {
    pub fn success(call: &CallMessage, value: Value) -> Self {
        Self::with_outcome(call, CallOutcome::Ok(value))
    }

    pub fn failure(
        call: &CallMessage,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::with_outcome(
            call,
            CallOutcome::Error(RemoteErrorInfo {
                kind: kind.into(),
                message: message.into(),
            }),
        )
    }

    fn with_outcome(call: &CallMessage, outcome: CallOutcome) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id: MessageId::new(),
            call_id: call.id,
            outcome,
            timestamp_ms: now_ms(),
        }
    }
}

/// A fired event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub version: u16,
    pub id: MessageId,
    pub api_name: String,
    pub event_name: String,
    pub kwargs: Kwargs,
    pub timestamp_ms: u64,
    /// Stream position, assigned by the transport on delivery.
    #[serde(skip)]
    pub position: Option<EntryId>,
}

impl EventMessage {
    pub fn new(api_name: impl Into<String>, event_name: impl Into<String>, kwargs: Kwargs) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id: MessageId::new(),
            api_name: api_name.into(),
            event_name: event_name.into(),
            kwargs,
            timestamp_ms: now_ms(),
            position: None,
        }
    }

    #[must_use]
    pub fn with_position(mut self, position: EntryId) -> Self {
        self.position = Some(position);
        self
    }

    pub fn canonical_name(&self) -> String {
        format!("{}.{}", self.api_name, self.event_name)
    }
}

/// Encode a message for the transport.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, BusError> {
    Ok(serde_json::to_vec(message)?)
}

/// Decode a message received from the transport.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, BusError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Convert a serializable struct into keyword arguments.
///
/// Fails unless the value serializes to a JSON object.
pub fn to_kwargs<T: Serialize>(value: &T) -> Result<Kwargs, BusError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(BusError::Codec(format!(
            "keyword arguments must be an object, got {other}"
        ))),
    }
}

/// Rebuild a typed struct from keyword arguments.
pub fn from_kwargs<T: DeserializeOwned>(kwargs: Kwargs) -> Result<T, BusError> {
    Ok(serde_json::from_value(Value::Object(kwargs))?)
}
