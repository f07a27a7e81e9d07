//! # Node Runtime
//!
//! ## Startup Sequence
//!
//! 1. Connect to the transport and schema store (fails fast)
//! 2. Load local schemas given with `--schema`
//! 3. Install the demo services and the `internal.metrics` API
//! 4. Run the `before_server_start` hook
//! 5. Start the bus loops and wait for them or a shutdown signal
//! 6. Stop the bus within the configured grace period

use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};
use wirebus_client::{BusClient, BusConfig};

use crate::cli::{Cli, DumpSchemaArgs, RunArgs};
use crate::{demo, internal, signals};

/// How long the `before_server_start` hook may take.
pub const START_HOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs once the bus is connected and before any loop starts.
pub type StartHook = Box<dyn FnOnce(BusClient) -> BoxFuture<'static, Result<()>> + Send>;

/// Load the bus configuration, applying command line overrides last.
pub fn load_config(cli: &Cli) -> Result<BusConfig> {
    let mut config =
        BusConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(service) = &cli.service_name {
        config.service_name = service.clone();
    }
    if let Some(process) = &cli.process_name {
        config.process_name = process.clone();
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// One bus process.
pub struct Node {
    config: BusConfig,
    args: RunArgs,
    internal_metrics: bool,
    hook: Option<StartHook>,
}

impl Node {
    pub fn new(config: BusConfig, args: RunArgs) -> Self {
        Self {
            config,
            args,
            internal_metrics: false,
            hook: None,
        }
    }

    /// Serve `internal.metrics` from this process.
    #[must_use]
    pub fn with_internal_metrics(mut self, enabled: bool) -> Self {
        self.internal_metrics = enabled;
        self
    }

    #[must_use]
    pub fn before_server_start<F, Fut>(mut self, hook: F) -> Self
    where
        F: FnOnce(BusClient) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.hook = Some(Box::new(move |bus| hook(bus).boxed()));
        self
    }

    /// Run until SIGINT/SIGTERM or a fatal loop error.
    pub async fn run(self) -> Result<()> {
        self.run_until(signals::wait_for_shutdown_signal()).await
    }

    /// Run until `shutdown` resolves or a fatal loop error.
    pub async fn run_until<S>(self, shutdown: S) -> Result<()>
    where
        S: Future<Output = std::io::Result<()>>,
    {
        let bus = BusClient::create(self.config.clone())
            .await
            .context("Failed to connect to the bus")?;
        info!(
            service = %bus.config().service_name,
            process = %bus.config().process_name,
            transport = %bus.transport().describe(),
            "Connected to the bus"
        );
        let grace = bus.config().stop_grace();

        let outcome = self.serve(&bus, shutdown).await;
        if let Err(e) = bus.stop(grace).await {
            warn!(error = %e, "Error while stopping the bus");
        }
        match &outcome {
            Ok(()) => info!("Shutdown complete"),
            Err(e) => warn!(error = %format!("{e:#}"), "Node stopped with an error"),
        }
        outcome
    }

    async fn serve<S>(self, bus: &BusClient, shutdown: S) -> Result<()>
    where
        S: Future<Output = std::io::Result<()>>,
    {
        if let Some(path) = &self.args.schema {
            let names = bus
                .schema()
                .load_local(path)
                .await
                .with_context(|| format!("Failed to load schema from {}", path.display()))?;
            info!(path = %path.display(), apis = ?names, "Loaded local schema");
        }

        if self.args.demo {
            demo::install(bus).await.context("Failed to install demo services")?;
        }
        if self.internal_metrics && !self.args.events_only {
            internal::install(bus).await.context("Failed to install internal.metrics")?;
        }

        if let Some(hook) = self.hook {
            info!("Running before_server_start hook");
            tokio::time::timeout(START_HOOK_TIMEOUT, hook(bus.clone()))
                .await
                .map_err(|_| {
                    anyhow!(
                        "before_server_start hook did not finish within {}s",
                        START_HOOK_TIMEOUT.as_secs()
                    )
                })?
                .context("before_server_start hook failed")?;
        }

        let events_only = self.args.events_only;
        let runner = bus.clone();
        let mut loops = tokio::spawn(async move {
            if events_only {
                runner.run_events_only().await
            } else {
                runner.run().await
            }
        });
        info!(events_only, "Bus is running");

        let traffic = self.args.demo.then(|| {
            let bus = bus.clone();
            tokio::spawn(async move {
                if let Err(e) = demo::drive_traffic(bus, !events_only).await {
                    warn!(error = %e, "Demo traffic failed");
                }
            })
        });

        tokio::pin!(shutdown);
        let outcome = tokio::select! {
            joined = &mut loops => loop_outcome(joined),
            signal = &mut shutdown => {
                signal.context("Failed to listen for shutdown signals")?;
                info!("Shutdown requested");
                bus.stop(bus.config().stop_grace()).await?;
                loop_outcome(loops.await)
            }
        };

        if let Some(traffic) = traffic {
            traffic.abort();
        }
        outcome
    }
}

fn loop_outcome(
    joined: Result<Result<(), wirebus_client::BusError>, tokio::task::JoinError>,
) -> Result<()> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(anyhow::Error::new(e).context("Bus loops failed")),
        Err(e) => Err(anyhow!("Bus task crashed: {e}")),
    }
}

/// Print or write every schema known to the bus.
pub async fn dump_schema(config: BusConfig, args: DumpSchemaArgs) -> Result<()> {
    let bus = BusClient::create(config)
        .await
        .context("Failed to connect to the bus")?;
    if args.demo {
        demo::register_apis(&bus).await?;
    }
    bus.schema().refresh().await.context("Failed to read the schema store")?;

    match &args.out {
        Some(path) => {
            bus.schema().dump(path).await?;
            info!(path = %path.display(), "Wrote schema");
        }
        None => {
            let json = serde_json::to_string_pretty(&bus.schema().definitions())?;
            println!("{json}");
        }
    }
    bus.stop(Duration::ZERO).await?;
    Ok(())
}
