//! Channel and consumer-group naming.
//!
//! Every process on a bus must agree on these names, so they live here
//! rather than in the transport or client.

use serde::{Deserialize, Serialize};

/// How events are laid out over streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamLayout {
    /// One stream per API. Listeners skip events they did not ask for.
    #[default]
    PerApi,
    /// One stream per event.
    PerEvent,
}

/// Consumer group used by every process serving an API.
pub const RPC_GROUP: &str = "rpc";

/// Consumer group used by a process for its own results channel.
pub const RESULTS_GROUP: &str = "results";

/// Channel carrying calls for `api`.
pub fn rpc_queue(api: &str) -> String {
    format!("{api}:rpc_queue")
}

/// Channel carrying results addressed to one process.
pub fn results_channel(service: &str, process: &str) -> String {
    format!("{service}.{process}:results")
}

/// Channel carrying `api.event`.
pub fn event_stream(layout: StreamLayout, api: &str, event: &str) -> String {
    match layout {
        StreamLayout::PerApi => format!("{api}.*:stream"),
        StreamLayout::PerEvent => format!("{api}.{event}:stream"),
    }
}

/// Channel receiving entries that exceeded their delivery limit.
pub fn dead_letter_channel(channel: &str) -> String {
    format!("{channel}:dead")
}

/// Consumer group names are scoped to the owning service.
pub fn consumer_group(service: &str, group: &str) -> String {
    format!("{service}-{group}")
}

/// Lease key held by a process serving `api` exclusively.
pub fn rpc_lease(api: &str) -> String {
    format!("rpc_lease:{api}")
}
