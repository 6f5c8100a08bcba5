use std::{sync::Arc, thread, time::Duration};

use anyhow::{Context, Result};
use insights_client::{ClientOptions, TelemetryClient};
use mcac_core::{
    config::{ConfigSource, Configuration},
    insight::Insight,
    lifecycle::{DaemonLifecycle, EventSink},
    metrics::{FnGauge, GaugeValue, Metric, MetricRegistry},
};
use tokio::sync::watch;

const STARTUP_EVENT_ATTEMPTS: u32 = 3;
const STARTUP_EVENT_DELAY: Duration = Duration::from_secs(1);

/// Composition point of the agent: owns the configuration snapshots and hands them to the
/// client and, through it, to the supervisor.
pub struct Orchestrator {
    source: Box<dyn ConfigSource>,
    config: watch::Sender<Arc<Configuration>>,
    client: Arc<TelemetryClient>,
    registry: Arc<MetricRegistry>,
    startup_event_attempts: u32,
    startup_event_delay: Duration,
}

impl Orchestrator {
    /// Loads the first configuration snapshot. Fails when it cannot be loaded.
    pub fn new(
        source: Box<dyn ConfigSource>,
        supervisor: Arc<dyn DaemonLifecycle>,
        options: ClientOptions,
    ) -> Result<Self> {
        let config = Arc::new(source.load().context("loading configuration")?);
        log::trace!("Configuration: {config:?}");

        let client = Arc::new(TelemetryClient::new(options, supervisor, config.clone()));
        let registry = Arc::new(MetricRegistry::new());
        registry.add_listener(client.clone());
        register_client_metrics(&registry, &client);

        let (config, _) = watch::channel(config);
        Ok(Self {
            source,
            config,
            client,
            registry,
            startup_event_attempts: STARTUP_EVENT_ATTEMPTS,
            startup_event_delay: STARTUP_EVENT_DELAY,
        })
    }

    pub fn with_startup_event_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.startup_event_attempts = attempts.max(1);
        self.startup_event_delay = delay;
        self
    }

    pub fn config(&self) -> Arc<Configuration> {
        self.config.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Configuration>> {
        self.config.subscribe()
    }

    pub fn client(&self) -> &Arc<TelemetryClient> {
        &self.client
    }

    /// Registry producers publish their metrics in.
    pub fn registry(&self) -> &Arc<MetricRegistry> {
        &self.registry
    }

    pub fn start(&self) -> Result<()> {
        self.client.start().context("starting insights client")?;

        if !report_with_retry(
            self.client.as_ref(),
            &Insight::client_started(),
            self.startup_event_attempts,
            self.startup_event_delay,
        ) {
            log::warn!("Unable to report the insights client start");
        }
        Ok(())
    }

    /// Reloads the configuration. On failure the current snapshot stays in place.
    ///
    /// Returns whether the configuration changed.
    pub fn reload(&self) -> Result<bool> {
        let new = self.source.load().context("reloading configuration")?;
        let old = self.config();
        if *old == new {
            log::info!("Configuration unchanged");
            return Ok(false);
        }

        let new = Arc::new(new);
        self.config.send_replace(new.clone());
        self.client.reconfigure(&old, new);
        log::info!("Configuration reloaded");
        Ok(true)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.client.close().context("stopping insights client")
    }
}

/// Reports `insight`, trying up to `attempts` times `delay` apart.
pub fn report_with_retry(
    sink: &dyn EventSink,
    insight: &Insight,
    attempts: u32,
    delay: Duration,
) -> bool {
    for attempt in 1..=attempts {
        if sink.report_event(insight) {
            return true;
        }
        if attempt < attempts {
            thread::sleep(delay);
        }
    }
    false
}

fn register_client_metrics(registry: &MetricRegistry, client: &Arc<TelemetryClient>) {
    let gauges: [(&str, fn(&TelemetryClient) -> u64); 3] = [
        ("mcac.insights_client.failed_health_checks", TelemetryClient::failed_health_checks),
        ("mcac.insights_client.successful_responses", TelemetryClient::successful_responses),
        ("mcac.insights_client.error_responses", TelemetryClient::error_responses),
    ];
    for (name, read) in gauges {
        let client = Arc::downgrade(client);
        let gauge = FnGauge(move || {
            let value = client.upgrade().map(|client| read(&client)).unwrap_or(0);
            GaugeValue::Integer(value as i64)
        });
        registry.register(name, Metric::Gauge(Arc::new(gauge)));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct FlakySink {
        calls: AtomicUsize,
        succeed_at: usize,
    }

    impl EventSink for FlakySink {
        fn report_event(&self, _insight: &Insight) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= self.succeed_at
        }
    }

    #[test]
    fn retries_startup_event() {
        let sink = FlakySink {
            calls: AtomicUsize::new(0),
            succeed_at: 2,
        };
        assert!(report_with_retry(&sink, &Insight::client_started(), 3, Duration::ZERO));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);

        let sink = FlakySink {
            calls: AtomicUsize::new(0),
            succeed_at: 10,
        };
        assert!(!report_with_retry(&sink, &Insight::client_started(), 3, Duration::ZERO));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    }
}
