//! # wirebus Test Suite
//!
//! Scenarios where several bus processes share one broker and one schema
//! store, the way separate OS processes share a Redis instance.
//!
//! ```text
//! tests/src/
//! ├── cluster.rs        # Shared broker, process factory, polling helpers
//! └── integration/
//!     ├── rpc_flows.rs      # Calls, results, timeouts, serving modes
//!     ├── event_flows.rs    # Fan-out, redelivery, reclaim, layouts
//!     ├── schema_flows.rs   # Validation on both sides, schema sharing
//!     └── resilience.rs     # Outages, retries, shutdown
//! ```
//!
//! ```bash
//! cargo test -p wirebus-tests
//! cargo bench -p wirebus-tests
//! ```
