//! # wirebus
//!
//! ```text
//! wirebus [--service-name S] [--process-name P] [--config FILE] [--log-level L]
//!     run [--events-only] [--schema FILE_OR_DIR] [--demo]
//!     dump-schema [--out FILE] [--demo]
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::info;
use wirebus_node::{dump_schema, load_config, Cli, Command, Node};
use wirebus_telemetry::{init_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let mut telemetry = TelemetryConfig::from_env().for_service(&config.service_name);
    if let Some(level) = &cli.log_level {
        telemetry.log_level = level.clone();
    }
    let metrics_enabled = telemetry.metrics_enabled;
    let _telemetry = init_telemetry(telemetry).await?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        service = %config.service_name,
        process = %config.process_name,
        "Starting wirebus"
    );

    match cli.command {
        Command::Run(args) => {
            Node::new(config, args)
                .with_internal_metrics(metrics_enabled)
                .run()
                .await
        }
        Command::DumpSchema(args) => dump_schema(config, args).await,
    }
}
