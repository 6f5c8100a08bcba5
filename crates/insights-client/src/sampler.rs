//! Periodic sampling of the registered metrics.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use mcac_core::{config::Configuration, filtering::Channel};
use tokio::{
    sync::watch,
    time::{Instant, MissedTickBehavior, interval_at},
};

use crate::{
    encoder::EncoderContext,
    registry::{ChannelRegistry, RegisteredMetric},
    transport::Transport,
    wire::{CommandSink, EmitKind},
};

/// Commands written between two flushes of a sampling cycle.
pub const BATCH_SIZE: usize = 256;

/// Number of sampling ticks between two insight ticks.
pub fn insight_every(sampling_interval: Duration, metric_update_gap_in_seconds: u64) -> u64 {
    let sampling = sampling_interval.as_secs().max(1);
    (metric_update_gap_in_seconds / sampling).max(1)
}

/// Counts written commands and flushes each time a batch fills up.
pub struct Batch<'a> {
    sink: &'a mut dyn CommandSink,
    size: usize,
    pending: usize,
}

impl<'a> Batch<'a> {
    pub fn new(sink: &'a mut dyn CommandSink, size: usize) -> Self {
        Self {
            sink,
            size: size.max(1),
            pending: 0,
        }
    }

    pub fn write(&mut self, ctx: &EncoderContext, metric: &RegisteredMetric, kind: EmitKind) {
        self.pending += (metric.emit)(&mut *self.sink, ctx, kind);
        if self.pending >= self.size {
            self.sink.flush();
            self.pending = 0;
        }
    }

    /// Flushes what is left. Returns whether anything was pending.
    pub fn finish(self) -> bool {
        if self.pending > 0 {
            self.sink.flush();
            true
        } else {
            false
        }
    }
}

pub fn write_group<'m>(
    batch: &mut Batch<'_>,
    ctx: &EncoderContext,
    metrics: impl IntoIterator<Item = &'m RegisteredMetric>,
    kind: EmitKind,
) {
    for metric in metrics {
        batch.write(ctx, metric, kind);
    }
}

/// One sampling cycle: final values of removed metrics, then the unrestricted and the
/// restricted channels.
pub fn sample_once(
    registry: &ChannelRegistry,
    sink: &mut dyn CommandSink,
    ctx: &EncoderContext,
    tick: u64,
    insight_every: u64,
    batch_size: usize,
) {
    let mut batch = Batch::new(sink, batch_size);

    for retired in registry.take_retired() {
        batch.write(ctx, &retired.metric, retired.kind);
    }

    let kind = if tick % insight_every.max(1) == 0 {
        EmitKind::Sample
    } else {
        EmitKind::InsightFiltered
    };
    write_group(&mut batch, ctx, &registry.metrics(Channel::Unrestricted), kind);
    write_group(
        &mut batch,
        ctx,
        &registry.metrics(Channel::Restricted),
        EmitKind::InsightFiltered,
    );

    batch.finish();
}

pub(crate) struct SamplerTask {
    pub registry: Arc<ChannelRegistry>,
    pub transport: Arc<Mutex<Transport>>,
    pub context: EncoderContext,
    pub batch_size: usize,
    pub config: watch::Receiver<Arc<Configuration>>,
    /// Restarts the timer with a new period.
    pub period: watch::Receiver<Duration>,
    pub shutdown: watch::Receiver<bool>,
}

impl SamplerTask {
    pub async fn run(mut self) {
        let mut tick: u64 = 0;
        'timer: loop {
            let period = *self.period.borrow_and_update();
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            log::debug!("Sampling metrics every {period:?}");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.sample(tick);
                        tick = tick.wrapping_add(1);
                    }
                    changed = self.period.changed() => {
                        if changed.is_err() {
                            break 'timer;
                        }
                        continue 'timer;
                    }
                    _ = self.shutdown.changed() => break 'timer,
                }
            }
        }
        log::debug!("Sampler stopped");
    }

    fn sample(&mut self, tick: u64) {
        let every = {
            let config = self.config.borrow();
            insight_every(config.sampling_interval(), config.metric_update_gap_in_seconds())
        };
        self.context.interval = self.config.borrow().metric_sampling_interval_in_seconds;

        let mut transport = self.transport.lock().unwrap_or_else(|err| err.into_inner());
        sample_once(
            &self.registry,
            &mut *transport,
            &self.context,
            tick,
            every,
            self.batch_size,
        );
    }
}
