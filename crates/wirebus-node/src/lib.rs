//! # wirebus Node
//!
//! The `wirebus` binary: one OS process attached to the bus.
//!
//! - `cli` - Command line arguments
//! - `runtime` - Startup, serving and shutdown of a process
//! - `signals` - Termination signal handling
//! - `demo` - Example image, store and dashboard services
//! - `internal` - The `internal.metrics` API

pub mod cli;
pub mod demo;
pub mod internal;
pub mod runtime;
pub mod signals;

pub use cli::{Cli, Command, DumpSchemaArgs, RunArgs};
pub use runtime::{dump_schema, load_config, Node, StartHook, START_HOOK_TIMEOUT};
