//! Command line interface.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "wirebus", version, about = "Run a process attached to the bus")]
pub struct Cli {
    /// Service this process belongs to.
    #[arg(long, global = true)]
    pub service_name: Option<String>,

    /// Name of this process, unique within the service.
    #[arg(long, global = true)]
    pub process_name: Option<String>,

    /// JSON configuration file.
    #[arg(long, short = 'c', env = "WIREBUS_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level or filter directive, overriding the environment.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve registered APIs and listeners until interrupted.
    Run(RunArgs),
    /// Write every known schema as JSON.
    DumpSchema(DumpSchemaArgs),
}

#[derive(Debug, Clone, Default, Args)]
pub struct RunArgs {
    /// Only handle events; do not answer RPC calls.
    #[arg(long, short = 'E', conflicts_with = "schema")]
    pub events_only: bool,

    /// Load schemas from a file or directory instead of waiting for the
    /// schema store to provide them.
    #[arg(long, short = 'm', value_name = "FILE_OR_DIRECTORY")]
    pub schema: Option<PathBuf>,

    /// Start the image, store and dashboard example services.
    #[arg(long)]
    pub demo: bool,
}

#[derive(Debug, Clone, Default, Args)]
pub struct DumpSchemaArgs {
    /// Output file. Defaults to stdout.
    #[arg(long, short = 'o')]
    pub out: Option<PathBuf>,

    /// Include the example service APIs.
    #[arg(long)]
    pub demo: bool,
}
