//! Listener registrations and their consumer-side handler.

use crate::events::handler::EventHandler;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, warn};
use wirebus_schema::{SchemaError, SchemaRegistry};
use wirebus_telemetry::{metric_inc, EVENTS_FAILED, EVENTS_PROCESSED};
use wirebus_transport::{Disposition, EntryHandler, StartPosition, StreamEntry};
use wirebus_types::{decode, EntryId, EventMessage, MessageId};

/// Options for one listener registration.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenOptions {
    /// Listener group within the service. Processes of a service sharing a
    /// group split its events; distinct groups each see every event.
    pub group: String,
    pub start: StartPosition,
    pub concurrency: usize,
    /// Move events that fail this many times to the dead letter channel.
    pub max_deliveries: Option<u32>,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            group: "default".to_string(),
            start: StartPosition::Latest,
            concurrency: 1,
            max_deliveries: None,
        }
    }
}

impl ListenOptions {
    pub fn group(name: impl Into<String>) -> Self {
        Self {
            group: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn start(mut self, start: StartPosition) -> Self {
        self.start = start;
        self
    }

    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn max_deliveries(mut self, max: u32) -> Self {
        self.max_deliveries = Some(max);
        self
    }
}

/// Proof that an event reached the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventReceipt {
    pub id: MessageId,
    pub position: EntryId,
}

/// A handler subscribed to a set of events under one group.
#[derive(Clone)]
pub(crate) struct ListenerRegistration {
    /// `(api, event)` pairs.
    pub events: Vec<(String, String)>,
    pub handler: Arc<dyn EventHandler>,
    pub options: ListenOptions,
}

/// Delivers stream entries to an [`EventHandler`].
pub(crate) struct EventListener {
    wanted: HashSet<(String, String)>,
    handler: Arc<dyn EventHandler>,
    schema: Option<Arc<SchemaRegistry>>,
}

impl EventListener {
    /// `schema` is the registry incoming events are validated against, if
    /// they are validated at all.
    pub(crate) fn new(
        registration: &ListenerRegistration,
        schema: Option<Arc<SchemaRegistry>>,
    ) -> Self {
        Self {
            wanted: registration.events.iter().cloned().collect(),
            handler: registration.handler.clone(),
            schema,
        }
    }

    /// Only an argument mismatch rejects an event. Events whose schema is
    /// unavailable are delivered as they are.
    async fn check(&self, schema: &SchemaRegistry, event: &EventMessage) -> Result<(), String> {
        match schema
            .validate_event(&event.api_name, &event.event_name, &event.kwargs)
            .await
        {
            Err(e @ SchemaError::Mismatch { .. }) => Err(e.to_string()),
            Err(e) => {
                debug!(
                    event = %event.canonical_name(),
                    error = %e,
                    "Delivering event unvalidated"
                );
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }
}

#[async_trait]
impl EntryHandler for EventListener {
    async fn handle(&self, entry: &StreamEntry) -> Disposition {
        let event = match decode::<EventMessage>(&entry.payload) {
            Ok(event) => event.with_position(entry.id),
            Err(e) => {
                warn!(
                    channel = %entry.channel,
                    id = %entry.id,
                    error = %e,
                    "Discarding undecodable event"
                );
                return Disposition::Ack;
            }
        };

        // Streams shared by a whole API carry events this listener did not ask for.
        if !self
            .wanted
            .contains(&(event.api_name.clone(), event.event_name.clone()))
        {
            return Disposition::Ack;
        }

        let (api, event_name) = (event.api_name.clone(), event.event_name.clone());
        let labels = [api.as_str(), event_name.as_str()];
        if let Some(schema) = &self.schema {
            if let Err(reason) = self.check(schema, &event).await {
                error!(
                    event = %event.canonical_name(),
                    id = %entry.id,
                    %reason,
                    "Discarding invalid event"
                );
                metric_inc!(EVENTS_FAILED, &labels);
                return Disposition::Ack;
            }
        }

        let name = event.canonical_name();
        match self.handler.handle(event).await {
            Ok(()) => {
                metric_inc!(EVENTS_PROCESSED, &labels);
                debug!(event = %name, id = %entry.id, "Handled event");
                Disposition::Ack
            }
            Err(e) => {
                metric_inc!(EVENTS_FAILED, &labels);
                warn!(
                    event = %name,
                    id = %entry.id,
                    deliveries = entry.delivery_count,
                    error = %format!("{e:#}"),
                    "Event handler failed, will redeliver"
                );
                Disposition::Retry
            }
        }
    }
}
