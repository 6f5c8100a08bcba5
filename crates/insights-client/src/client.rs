use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use mcac_core::{
    config::{Configuration, NodeIdentity},
    filtering::Channel,
    insight::Insight,
    lifecycle::{DaemonLifecycle, EventSink, ProcessState, truncate_socket_path},
    metrics::{Metric, MetricListener, TimeUnit},
};
use tokio::{
    runtime::{Handle, Runtime},
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at},
};

use crate::{
    ClientError,
    clean::clean,
    encoder::{EncoderContext, Emitter, metric_emitter},
    rate_limit::RateLimitedLog,
    registry::{ChannelRegistry, RegisteredMetric},
    sampler::{BATCH_SIZE, SamplerTask},
    transport::{ResponseCounters, Transport, Watermarks},
    wire::{Command, CommandSink},
};

const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

static EVENT_QUEUE_FULL: RateLimitedLog = RateLimitedLog::new(Duration::from_secs(30));

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub socket_path: PathBuf,
    pub identity: NodeIdentity,
    pub rate_unit: TimeUnit,
    pub duration_unit: TimeUnit,
    pub health_check_interval: Duration,
    pub batch_size: usize,
    pub watermarks: Watermarks,
    /// Events waiting to be written before `report_event` starts failing.
    pub event_queue_size: usize,
}

impl ClientOptions {
    /// Paths longer than the unix socket limit are cropped the way the daemon crops them.
    pub fn new(socket_path: impl Into<PathBuf>, identity: NodeIdentity) -> Self {
        Self {
            socket_path: truncate_socket_path(&socket_path.into()),
            identity,
            rate_unit: TimeUnit::Seconds,
            duration_unit: TimeUnit::Microseconds,
            health_check_interval: Duration::from_secs(30),
            batch_size: BATCH_SIZE,
            watermarks: Watermarks::default(),
            event_queue_size: 1024,
        }
    }
}

/// Forwards metrics and events to the daemon's socket and keeps the daemon alive.
///
/// Producers only touch the routing tables; every socket write happens on the client's
/// own runtime.
pub struct TelemetryClient {
    options: ClientOptions,
    supervisor: Arc<dyn DaemonLifecycle>,
    config: watch::Sender<Arc<Configuration>>,
    registry: Arc<ChannelRegistry>,
    counters: Arc<ResponseCounters>,
    failed_health_checks: Arc<AtomicU64>,
    running: Mutex<Option<Running>>,
    events: RwLock<Option<EventPath>>,
}

struct Running {
    runtime: Runtime,
    transport: Arc<Mutex<Transport>>,
    events: mpsc::Sender<Command>,
    period: watch::Sender<Duration>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Running {
    fn shutdown(self) {
        let Running {
            runtime,
            transport,
            shutdown,
            tasks,
            ..
        } = self;

        shutdown.send_replace(true);
        runtime.block_on(async {
            for task in tasks {
                if let Err(err) = task.await {
                    log::warn!("Insights task failed: {err}");
                }
            }
        });

        transport
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .close();
        runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    }
}

#[derive(Clone)]
struct EventPath {
    events: mpsc::Sender<Command>,
    connected: Arc<AtomicBool>,
}

impl TelemetryClient {
    pub fn new(
        options: ClientOptions,
        supervisor: Arc<dyn DaemonLifecycle>,
        config: Arc<Configuration>,
    ) -> Self {
        let (config, _) = watch::channel(config);
        Self {
            options,
            supervisor,
            config,
            registry: Arc::new(ChannelRegistry::new()),
            counters: Arc::default(),
            failed_health_checks: Arc::default(),
            running: Mutex::new(None),
            events: RwLock::new(None),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.options.socket_path
    }

    pub fn config(&self) -> Arc<Configuration> {
        self.config.borrow().clone()
    }

    pub fn is_started(&self) -> bool {
        self.lock_running().is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.event_path()
            .is_some_and(|path| path.connected.load(Ordering::Acquire))
    }

    pub fn failed_health_checks(&self) -> u64 {
        self.failed_health_checks.load(Ordering::Relaxed)
    }

    pub fn successful_responses(&self) -> u64 {
        self.counters.successes()
    }

    pub fn error_responses(&self) -> u64 {
        self.counters.errors()
    }

    pub fn channel_of(&self, raw_name: &str) -> Option<Channel> {
        self.registry.channel_of(raw_name)
    }

    pub fn metric_count(&self, channel: Channel) -> usize {
        self.registry.len(channel)
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn event_path(&self) -> Option<EventPath> {
        self.events
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    fn set_event_path(&self, path: Option<EventPath>) {
        *self.events.write().unwrap_or_else(|err| err.into_inner()) = path;
    }

    /// Starts the daemon, connects to it and schedules sampling and health checks.
    pub fn start(&self) -> Result<(), ClientError> {
        let mut running = self.lock_running();
        if running.is_some() {
            return Err(ClientError::AlreadyStarted);
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("insights")
            .enable_all()
            .build()
            .map_err(ClientError::Runtime)?;

        let config = self.config();
        let state = self.supervisor.start(&self.options.socket_path, &config);
        log::info!("Collectd start state: {state}");

        let mut transport = Transport::new(
            &self.options.socket_path,
            self.options.watermarks,
            self.counters.clone(),
            runtime.handle().clone(),
        );
        if let Err(err) = transport.connect() {
            log::warn!(
                "Unable to connect to collectd at {}, retrying on next health check: {err}",
                self.options.socket_path.display()
            );
        }
        let connected = transport.connected_flag();
        let transport = Arc::new(Mutex::new(transport));

        let (period_tx, period_rx) = watch::channel(config.sampling_interval());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(self.options.event_queue_size.max(1));

        let sampler = SamplerTask {
            registry: self.registry.clone(),
            transport: transport.clone(),
            context: EncoderContext::new(
                &self.options.identity,
                config.metric_sampling_interval_in_seconds,
                self.options.rate_unit,
                self.options.duration_unit,
            ),
            batch_size: self.options.batch_size,
            config: self.config.subscribe(),
            period: period_rx,
            shutdown: shutdown_rx.clone(),
        };
        let health = HealthTask {
            supervisor: self.supervisor.clone(),
            transport: transport.clone(),
            socket_path: self.options.socket_path.clone(),
            config: self.config.subscribe(),
            failed: self.failed_health_checks.clone(),
            every: self.options.health_check_interval,
            shutdown: shutdown_rx.clone(),
        };
        let writer = EventWriter {
            events: events_rx,
            transport: transport.clone(),
            shutdown: shutdown_rx,
        };

        let tasks = vec![
            runtime.spawn(sampler.run()),
            runtime.spawn(health.run()),
            runtime.spawn(writer.run()),
        ];

        self.set_event_path(Some(EventPath {
            events: events_tx.clone(),
            connected,
        }));
        *running = Some(Running {
            runtime,
            transport,
            events: events_tx,
            period: period_tx,
            shutdown: shutdown_tx,
            tasks,
        });
        log::info!("Insights client started");
        Ok(())
    }

    /// Stops the timers, closes the socket, shuts the runtime down and stops the daemon,
    /// in this order.
    ///
    /// Blocks until the client tasks are done. From inside another tokio runtime the
    /// teardown runs on a scoped thread, so the caller's worker is blocked meanwhile.
    pub fn close(&self) -> Result<(), ClientError> {
        let mut running = self.lock_running();
        let Some(stopping) = running.take() else {
            return Err(ClientError::AlreadyStopped);
        };
        self.set_event_path(None);

        if Handle::try_current().is_ok() {
            thread::scope(|scope| {
                scope.spawn(move || stopping.shutdown());
            });
        } else {
            stopping.shutdown();
        }
        // nothing samples anymore
        self.registry.take_retired();

        let state = self.supervisor.stop();
        log::info!("Insights client stopped, collectd state: {state}");
        Ok(())
    }

    /// Routes `metric` and starts sampling it. Replaces any metric of the same name.
    pub fn report_metric(&self, raw_name: &str, metric: Metric) -> Channel {
        self.register_emitter(raw_name, metric_emitter(raw_name, metric))
    }

    /// Routes a custom emitter under `raw_name`.
    pub fn register_emitter(&self, raw_name: &str, emit: Emitter) -> Channel {
        let config = self.config();
        let metric = RegisteredMetric {
            name: clean(raw_name),
            emit,
        };
        let channel = self.registry.register(raw_name, metric, &config.filtering_rules);
        log::trace!("Registered {raw_name} on {channel}");
        channel
    }

    /// Unregisters `raw_name`. Its last value is written on the next sampling cycle, if
    /// the client is started.
    pub fn remove_metric(&self, raw_name: &str) {
        let running = self.lock_running();
        self.registry.remove(raw_name);
        if running.is_none() {
            self.registry.take_retired();
        }
    }

    /// Applies a new configuration snapshot.
    pub fn reconfigure(&self, old: &Configuration, new: Arc<Configuration>) {
        self.config.send_replace(new.clone());

        if old.filtering_rules != new.filtering_rules {
            log::info!("Filtering rules changed, re-routing metrics");
            self.registry.refresh(&new.filtering_rules);
        }

        let running = self.lock_running();
        let Some(running) = running.as_ref() else {
            return;
        };

        if self.supervisor.reload_plugin(&new) == ProcessState::Started {
            if let Err(err) = running.events.try_send(Command::ReloadInsights) {
                log::warn!("Unable to request insights reload: {err}");
            }
        }

        if old.metric_sampling_interval_in_seconds != new.metric_sampling_interval_in_seconds
            || old.upload_interval_in_seconds != new.upload_interval_in_seconds
        {
            log::info!(
                "Sampling every {}s with an upload interval of {}s",
                new.metric_sampling_interval_in_seconds,
                new.upload_interval_in_seconds
            );
            running.period.send_replace(new.sampling_interval());
        }
    }
}

impl EventSink for TelemetryClient {
    /// Queues the event for an immediate write and flush.
    fn report_event(&self, insight: &Insight) -> bool {
        let json = match insight.to_json() {
            Ok(json) => json,
            Err(err) => {
                log::warn!("Error serializing insight {}: {err}", insight.metadata.name);
                return false;
            }
        };

        let Some(path) = self.event_path() else {
            return false;
        };
        if !path.connected.load(Ordering::Acquire) {
            return false;
        }

        match path.events.try_send(Command::PutInsight(json)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                if EVENT_QUEUE_FULL.should_log() {
                    log::warn!("Event queue full, dropping insights");
                }
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

impl MetricListener for TelemetryClient {
    fn on_metric_added(&self, name: &str, metric: &Metric) {
        self.report_metric(name, metric.clone());
    }

    fn on_metric_removed(&self, name: &str) {
        self.remove_metric(name);
    }
}

/// One health check. A failed check counts as a failure and restarts the daemon.
///
/// Returns whether the daemon was healthy.
pub fn health_tick(
    supervisor: &dyn DaemonLifecycle,
    socket_path: &Path,
    config: &Configuration,
    failed: &AtomicU64,
) -> bool {
    if supervisor.health_check() {
        return true;
    }
    failed.fetch_add(1, Ordering::Relaxed);
    log::warn!("Collectd health check failed, restarting it");
    let state = supervisor.start(socket_path, config);
    log::info!("Collectd start state: {state}");
    false
}

struct HealthTask {
    supervisor: Arc<dyn DaemonLifecycle>,
    transport: Arc<Mutex<Transport>>,
    socket_path: PathBuf,
    config: watch::Receiver<Arc<Configuration>>,
    failed: Arc<AtomicU64>,
    every: Duration,
    shutdown: watch::Receiver<bool>,
}

impl HealthTask {
    async fn run(mut self) {
        let mut interval = interval_at(Instant::now() + self.every, self.every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => self.check().await,
                _ = self.shutdown.changed() => break,
            }
        }
        log::debug!("Health checks stopped");
    }

    async fn check(&mut self) {
        let supervisor = self.supervisor.clone();
        let socket_path = self.socket_path.clone();
        let config = self.config.borrow().clone();
        let failed = self.failed.clone();
        let checked = tokio::task::spawn_blocking(move || {
            health_tick(supervisor.as_ref(), &socket_path, &config, &failed)
        })
        .await;
        if let Err(err) = checked {
            log::warn!("Health check failed to run: {err}");
        }

        let mut transport = self.transport.lock().unwrap_or_else(|err| err.into_inner());
        if !transport.is_connected() {
            if let Err(err) = transport.connect() {
                log::debug!("Unable to connect to collectd: {err}");
            }
        }
    }
}

struct EventWriter {
    events: mpsc::Receiver<Command>,
    transport: Arc<Mutex<Transport>>,
    shutdown: watch::Receiver<bool>,
}

impl EventWriter {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.events.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    let mut transport = self.transport.lock().unwrap_or_else(|err| err.into_inner());
                    if transport.send(command) {
                        transport.flush();
                    }
                }
                _ = self.shutdown.changed() => break,
            }
        }
        log::debug!("Event writer stopped");
    }
}
