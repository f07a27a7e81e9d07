//! # Bus Client
//!
//! One [`BusClient`] per process. It owns the transport connection, the
//! registered APIs and listener registrations, and the loops serving them.
//!
//! ## Lifecycle
//!
//! 1. `connect()` opens the transport and schema store and starts the
//!    results loop, so a process that only calls other APIs never needs
//!    `run()`.
//! 2. `register_api`, `bind_rpc` and `listen` declare what the process does.
//! 3. `run()` starts one loop per served API and per listener registration
//!    plus the schema monitor, and blocks until `stop()` or a fatal error.
//! 4. `stop(grace)` signals every loop, waits up to `grace` for in-flight
//!    handlers, aborts the rest and closes the transport.

use crate::api::ApiRegistry;
use crate::config::{BusConfig, RpcServingMode};
use crate::events::listener::{EventListener, ListenerRegistration};
use crate::events::{EventHandler, EventReceipt, ListenOptions};
use crate::rpc::results::{ResultListener, RpcCaller};
use crate::rpc::server::{serve, RpcServer, ServeLease};
use crate::rpc::{cleanup_task, PendingCallStore, RpcHandler};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use wirebus_schema::{
    check_parameter_names, InMemorySchemaStore, SchemaError, SchemaRegistry, SchemaStore,
};
use wirebus_telemetry::{metric_inc, EVENTS_FIRED};
use wirebus_transport::{ConsumerConfig, StartPosition, StreamConsumer, Transport};
use wirebus_types::channels::{
    consumer_group, event_stream, results_channel, rpc_lease, rpc_queue, RESULTS_GROUP, RPC_GROUP,
};
use wirebus_types::{encode, ApiDefinition, ApiName, BusError, CallMessage, EventMessage, Kwargs};

/// How often abandoned pending calls are swept.
const PENDING_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Handlers processing results concurrently.
const RESULT_CONCURRENCY: usize = 4;

/// Handle to a process's bus connection. Cloning is cheap; all clones share
/// one connection.
#[derive(Clone)]
pub struct BusClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: BusConfig,
    transport: Arc<dyn Transport>,
    schema: Arc<SchemaRegistry>,
    apis: ApiRegistry,
    bindings: RwLock<HashMap<String, HashMap<String, Arc<dyn RpcHandler>>>>,
    /// APIs served without the exclusive lease whatever the serving mode.
    competing: RwLock<HashSet<String>>,
    listeners: Mutex<Vec<ListenerRegistration>>,
    pending: Arc<PendingCallStore>,
    caller: RpcCaller,
    reply_to: String,
    shutdown_tx: watch::Sender<bool>,
    running_tx: watch::Sender<bool>,
    ready_tx: watch::Sender<bool>,
    grace: Mutex<Duration>,
    background: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

/// Builder for [`BusClient`], allowing an injected transport or schema store.
pub struct BusClientBuilder {
    config: BusConfig,
    transport: Option<Arc<dyn Transport>>,
    schema_store: Option<Arc<dyn SchemaStore>>,
}

impl BusClientBuilder {
    /// Use an existing transport instead of connecting to `transport_url`.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use an existing schema store instead of opening `schema_url`.
    #[must_use]
    pub fn schema_store(mut self, store: Arc<dyn SchemaStore>) -> Self {
        self.schema_store = Some(store);
        self
    }

    pub async fn connect(self) -> Result<BusClient, BusError> {
        let config = self.config;
        config.validate()?;

        let transport = match self.transport {
            Some(transport) => {
                transport.open().await?;
                transport
            }
            None => {
                wirebus_transport::connect(&config.transport_url, config.max_stream_length).await?
            }
        };
        let store = match self.schema_store {
            Some(store) => store,
            None => open_schema_store(config.schema_url()).await?,
        };
        let schema = Arc::new(SchemaRegistry::with_ttl(store, config.schema_ttl()));

        let reply_to = results_channel(&config.service_name, &config.process_name);
        transport
            .ensure_group(&reply_to, RESULTS_GROUP, StartPosition::Latest)
            .await?;

        let pending = Arc::new(PendingCallStore::new());
        let (shutdown_tx, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            caller: RpcCaller::new(transport.clone(), pending.clone()),
            grace: Mutex::new(config.stop_grace()),
            config,
            transport,
            schema,
            apis: ApiRegistry::new(),
            bindings: RwLock::new(HashMap::new()),
            competing: RwLock::new(HashSet::new()),
            listeners: Mutex::new(Vec::new()),
            pending,
            reply_to,
            shutdown_tx,
            running_tx: watch::channel(false).0,
            ready_tx: watch::channel(false).0,
            background: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        });
        inner.start_background();

        info!(
            service = %inner.config.service_name,
            process = %inner.config.process_name,
            transport = %inner.transport.describe(),
            "Bus client connected"
        );
        Ok(BusClient { inner })
    }
}

async fn open_schema_store(url: &str) -> Result<Arc<dyn SchemaStore>, BusError> {
    let scheme = url.split("://").next().unwrap_or_default();
    match scheme {
        "memory" => Ok(Arc::new(InMemorySchemaStore::new())),
        #[cfg(feature = "redis")]
        "redis" | "rediss" => Ok(Arc::new(wirebus_schema::RedisSchemaStore::connect(url).await?)),
        other => Err(BusError::Config(format!(
            "unsupported schema store scheme '{other}'"
        ))),
    }
}

/// Renew the expiry of this process's results channel at a third of `ttl`.
/// Once the process is gone the channel and its group expire.
async fn keep_results_alive(
    transport: Arc<dyn Transport>,
    channel: String,
    ttl: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval((ttl / 3).max(Duration::from_millis(10)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = transport.expire(&channel, ttl).await {
                    debug!(%channel, error = %e, "Cannot renew results channel expiry");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

impl Inner {
    fn consumer_config(&self, channels: Vec<String>, group: &str) -> ConsumerConfig {
        let settings = &self.config.consumer;
        let mut config = ConsumerConfig::new(channels, group, self.config.process_name.as_str());
        config.batch_size = settings.batch_size;
        config.block = settings.block();
        config.retry_delay = settings.retry_delay();
        config.claim_timeout = settings.claim_timeout();
        config.backoff = settings.backoff();
        config.max_reconnect_attempts = settings.max_reconnect_attempts();
        config
    }

    /// Start the results loop, the pending call sweep and the results
    /// channel keep-alive.
    fn start_background(&self) {
        let mut config = self.consumer_config(vec![self.reply_to.clone()], RESULTS_GROUP);
        config.claim_timeout = None;
        config.concurrency = RESULT_CONCURRENCY;
        // Only used when the channel expired and its group is recreated;
        // everything in a fresh results channel belongs to this process.
        config.start = StartPosition::Beginning;
        let consumer = StreamConsumer::new(self.transport.clone(), config);
        let listener = Arc::new(ResultListener::new(self.pending.clone()));
        let shutdown = self.shutdown_tx.subscribe();

        let results = tokio::spawn(async move {
            if let Err(e) = consumer.run(listener, shutdown).await {
                error!(error = %e, "Results loop stopped, calls will time out");
            }
        });
        let sweep = tokio::spawn(cleanup_task(
            self.pending.clone(),
            PENDING_SWEEP_INTERVAL,
            self.shutdown_tx.subscribe(),
        ));
        let keep_alive = tokio::spawn(keep_results_alive(
            self.transport.clone(),
            self.reply_to.clone(),
            self.config.result_ttl(),
            self.shutdown_tx.subscribe(),
        ));
        self.background.lock().extend([results, sweep, keep_alive]);
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(BusError::Shutdown);
        }
        Ok(())
    }

    /// Spawn every loop `run` owns. Groups are created before this returns,
    /// so entries published afterwards reach them.
    async fn start_loops(
        &self,
        serve_rpcs: bool,
        tasks: &mut JoinSet<Result<(), BusError>>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), BusError> {
        let mut served = 0;
        if serve_rpcs {
            let bindings: Vec<_> = self
                .bindings
                .read()
                .iter()
                .map(|(api, handlers)| (api.clone(), handlers.clone()))
                .collect();
            for (api_name, handlers) in bindings {
                let api = self.apis.resolve(&api_name)?;
                let queue = rpc_queue(&api_name);
                self.transport
                    .ensure_group(&queue, RPC_GROUP, StartPosition::Beginning)
                    .await?;

                let mut config = self.consumer_config(vec![queue], RPC_GROUP);
                config.start = StartPosition::Beginning;
                config.concurrency = self.config.rpc_worker_limit;
                let consumer = StreamConsumer::new(self.transport.clone(), config);
                let server = RpcServer::new(
                    api,
                    handlers,
                    self.transport.clone(),
                    self.config.validate_incoming,
                    self.config.result_ttl(),
                );
                let exclusive = self.config.rpc_serving_mode == RpcServingMode::Exclusive
                    && !self.competing.read().contains(&api_name);
                let lease = exclusive.then(|| ServeLease {
                    key: rpc_lease(&api_name),
                    holder: format!("{}.{}", self.config.service_name, self.config.process_name),
                    ttl: self.config.rpc_lease_ttl(),
                });
                tasks.spawn(serve(server, consumer, lease, shutdown.clone()));
                served += 1;
            }
        }

        let registrations = self.listeners.lock().clone();
        for registration in &registrations {
            let mut channels: Vec<String> = Vec::new();
            for (api, event) in &registration.events {
                let channel = event_stream(self.config.stream_layout, api, event);
                if !channels.contains(&channel) {
                    channels.push(channel);
                }
            }
            let group = consumer_group(&self.config.service_name, &registration.options.group);
            for channel in &channels {
                self.transport
                    .ensure_group(channel, &group, registration.options.start)
                    .await?;
            }

            let mut config = self.consumer_config(channels, &group);
            config.start = registration.options.start;
            config.concurrency = registration.options.concurrency.max(1);
            config.max_deliveries = registration.options.max_deliveries;
            let consumer = StreamConsumer::new(self.transport.clone(), config);
            let schema = self.config.validate_incoming.then(|| self.schema.clone());
            let listener = Arc::new(EventListener::new(registration, schema));
            let shutdown = shutdown.clone();
            tasks.spawn(async move { Ok(consumer.run(listener, shutdown).await?) });
        }

        let schema = self.schema.clone();
        let monitor_shutdown = shutdown.clone();
        tasks.spawn(async move {
            schema.run_monitor(monitor_shutdown).await;
            Ok(())
        });

        info!(
            apis = served,
            listeners = registrations.len(),
            "Bus loops started"
        );
        Ok(())
    }
}

impl BusClient {
    pub fn builder(config: BusConfig) -> BusClientBuilder {
        BusClientBuilder {
            config,
            transport: None,
            schema_store: None,
        }
    }

    /// Connect using only `config`.
    pub async fn create(config: BusConfig) -> Result<Self, BusError> {
        Self::builder(config).connect().await
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn schema(&self) -> &Arc<SchemaRegistry> {
        &self.inner.schema
    }

    pub fn apis(&self) -> &ApiRegistry {
        &self.inner.apis
    }

    pub fn pending_calls(&self) -> &PendingCallStore {
        &self.inner.pending
    }

    /// Channel this process receives results on.
    pub fn reply_to(&self) -> &str {
        &self.inner.reply_to
    }

    /// Register an API served or fired by this process and publish its schema.
    pub async fn register_api(&self, api: ApiDefinition) -> Result<(), BusError> {
        self.inner.ensure_open()?;
        let api = self.inner.apis.add(api)?;
        self.inner.schema.register(&api).await?;
        Ok(())
    }

    /// Bind the handler for `api.method`. The API must be registered by this
    /// process and the handler's parameters must match the signature.
    pub async fn bind_rpc(
        &self,
        api: &str,
        method: &str,
        handler: Arc<dyn RpcHandler>,
    ) -> Result<(), BusError> {
        let definition = self.inner.apis.resolve(api)?;
        let signature = definition.rpc(method).ok_or_else(|| BusError::UnknownProcedure {
            api: api.to_string(),
            method: method.to_string(),
        })?;
        let names = handler.parameter_names();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        check_parameter_names(api, method, &signature.parameters, &names)?;

        let replaced = self
            .inner
            .bindings
            .write()
            .entry(api.to_string())
            .or_default()
            .insert(method.to_string(), handler)
            .is_some();
        if replaced {
            warn!(api, method, "Replaced existing procedure handler");
        } else {
            debug!(api, method, "Bound procedure handler");
        }
        Ok(())
    }

    /// Serve `api` in compete mode even when this process serves its other
    /// APIs exclusively. Every process may then take calls for it.
    pub fn serve_competing(&self, api: &str) {
        self.inner.competing.write().insert(api.to_string());
    }

    /// Call `api.method` with the configured default timeout.
    pub async fn call(&self, api: &str, method: &str, kwargs: Kwargs) -> Result<Value, BusError> {
        self.call_with_timeout(api, method, kwargs, self.inner.config.rpc_timeout())
            .await
    }

    /// Call `api.method` and wait up to `timeout` for its result.
    pub async fn call_with_timeout(
        &self,
        api: &str,
        method: &str,
        kwargs: Kwargs,
        timeout: Duration,
    ) -> Result<Value, BusError> {
        ApiName::parse(api)?;
        self.inner.ensure_open()?;

        if self.inner.config.validate_outgoing {
            match self.inner.schema.validate_call(api, method, &kwargs).await {
                Ok(()) => {}
                Err(SchemaError::NotFound(_) | SchemaError::Store(_))
                    if !self.inner.config.strict_validation =>
                {
                    debug!(api, method, "No schema available, sending call unvalidated");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let call = CallMessage::new(api, method, kwargs, self.inner.reply_to.as_str(), timeout);
        self.inner.caller.call(call, timeout).await
    }

    /// Fire `api.event`. Returns once the transport has stored the event,
    /// whether or not anyone listens.
    pub async fn fire(
        &self,
        api: &str,
        event: &str,
        kwargs: Kwargs,
    ) -> Result<EventReceipt, BusError> {
        ApiName::parse(api)?;
        self.inner.ensure_open()?;

        if self.inner.config.validate_outgoing {
            self.inner.schema.validate_event(api, event, &kwargs).await?;
        } else {
            self.inner.schema.event_declaration(api, event).await?;
        }

        let message = EventMessage::new(api, event, kwargs);
        let channel = event_stream(self.inner.config.stream_layout, api, event);
        let position = self.inner.transport.publish(&channel, &encode(&message)?).await?;

        metric_inc!(EVENTS_FIRED, &[api, event]);
        debug!(event = %message.canonical_name(), %position, "Fired event");
        Ok(EventReceipt {
            id: message.id,
            position,
        })
    }

    /// Subscribe `handler` to the given `(api, event)` pairs. The
    /// subscription starts with the next `run()`.
    pub async fn listen(
        &self,
        events: &[(&str, &str)],
        handler: Arc<dyn EventHandler>,
        options: ListenOptions,
    ) -> Result<(), BusError> {
        self.inner.ensure_open()?;
        if events.is_empty() {
            return Err(BusError::Config("listen needs at least one event".into()));
        }
        let group = &options.group;
        if group.is_empty() || group.contains(':') || group.chars().any(char::is_whitespace) {
            return Err(BusError::Config(format!("invalid listener group '{group}'")));
        }
        if *self.inner.running_tx.borrow() {
            return Err(BusError::Config(
                "listeners must be registered before run()".into(),
            ));
        }

        let names = handler.parameter_names();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        for (api, event) in events {
            ApiName::parse(*api)?;
            self.inner.schema.check_event_handler(api, event, &names).await?;
        }

        let mut listeners = self.inner.listeners.lock();
        if listeners.iter().any(|l| l.options.group == options.group) {
            return Err(BusError::Config(format!(
                "listener group '{}' is already registered",
                options.group
            )));
        }
        info!(
            group = %options.group,
            events = ?events,
            "Registered listener"
        );
        listeners.push(ListenerRegistration {
            events: events
                .iter()
                .map(|(api, event)| (api.to_string(), event.to_string()))
                .collect(),
            handler,
            options,
        });
        Ok(())
    }

    /// Helper bound to one API name.
    pub fn api(&self, name: impl Into<String>) -> ApiHandle {
        ApiHandle {
            client: self.clone(),
            api: name.into(),
        }
    }

    /// Serve bound APIs and listeners until `stop()` or a fatal loop error.
    pub async fn run(&self) -> Result<(), BusError> {
        self.run_loops(true).await
    }

    /// Like [`run`](Self::run) but without serving RPCs.
    pub async fn run_events_only(&self) -> Result<(), BusError> {
        self.run_loops(false).await
    }

    /// Resolves once `run()` has started every loop.
    pub async fn wait_ready(&self) {
        let mut ready = self.inner.ready_tx.subscribe();
        let _ = ready.wait_for(|ready| *ready).await;
    }

    async fn run_loops(&self, serve_rpcs: bool) -> Result<(), BusError> {
        self.inner.ensure_open()?;
        if self.inner.running_tx.send_replace(true) {
            return Err(BusError::Config("bus client is already running".into()));
        }

        let (loop_tx, loop_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        if let Err(e) = self.inner.start_loops(serve_rpcs, &mut tasks, &loop_rx).await {
            error!(error = %e, "Bus failed to start");
            let _ = loop_tx.send(true);
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
            self.inner.running_tx.send_replace(false);
            return Err(e);
        }
        self.inner.ready_tx.send_replace(true);

        let mut shutdown = self.inner.shutdown_tx.subscribe();
        let outcome = loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break Ok(()),
                Some(joined) = tasks.join_next() => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(error = %e, "Bus loop failed");
                        break Err(e);
                    }
                    Err(e) => {
                        error!(error = %e, "Bus loop crashed");
                        break Err(BusError::Internal(e.to_string()));
                    }
                },
            }
        };

        let _ = loop_tx.send(true);
        let grace = *self.inner.grace.lock();
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                if let Ok(Err(e)) = joined {
                    debug!(error = %e, "Loop ended with error during shutdown");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                grace_ms = grace.as_millis() as u64,
                "Aborting loops that outlived the grace period"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        self.inner.ready_tx.send_replace(false);
        self.inner.running_tx.send_replace(false);
        info!("Bus stopped");
        outcome
    }

    /// Stop every loop, giving in-flight handlers up to `grace` to finish,
    /// then close the transport. Later calls return immediately.
    pub async fn stop(&self, grace: Duration) -> Result<(), BusError> {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(grace_ms = grace.as_millis() as u64, "Stopping bus client");
        *self.inner.grace.lock() = grace;
        self.inner.shutdown_tx.send_replace(true);

        let mut running = self.inner.running_tx.subscribe();
        let _ = running.wait_for(|active| !*active).await;

        let handles: Vec<JoinHandle<()>> = self.inner.background.lock().drain(..).collect();
        for mut handle in handles {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                handle.abort();
            }
        }

        self.inner.transport.close().await?;
        Ok(())
    }
}

/// A [`BusClient`] bound to one API, so calls read `bus.api("image").call("resize", ..)`.
#[derive(Clone)]
pub struct ApiHandle {
    client: BusClient,
    api: String,
}

impl ApiHandle {
    pub fn name(&self) -> &str {
        &self.api
    }

    pub async fn call(&self, method: &str, kwargs: Kwargs) -> Result<Value, BusError> {
        self.client.call(&self.api, method, kwargs).await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        kwargs: Kwargs,
        timeout: Duration,
    ) -> Result<Value, BusError> {
        self.client
            .call_with_timeout(&self.api, method, kwargs, timeout)
            .await
    }

    pub async fn fire(&self, event: &str, kwargs: Kwargs) -> Result<EventReceipt, BusError> {
        self.client.fire(&self.api, event, kwargs).await
    }
}
