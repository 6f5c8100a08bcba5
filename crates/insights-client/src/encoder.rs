//! Conversion of metric values into wire commands.

use std::{borrow::Cow, collections::BTreeMap, sync::Arc, time::Duration};

use lazy_static::lazy_static;
use mcac_core::{
    config::NodeIdentity,
    insight::{
        HistogramData, Insight, InsightError, InsightType, MeterData, RateStats, SamplingStats,
        TimerData,
    },
    metrics::{
        BucketLayout, Counter, Gauge, GaugeValue, Histogram, Meter, Metric, Snapshot, TimeUnit,
        Timer,
        estimated_histogram::{
            DECAYING_BUCKET_COUNT, EstimatedHistogram, HistogramError, INPUT_BUCKET_COUNT,
            bucket_offsets,
        },
    },
};

use crate::{
    clean::clean,
    rate_limit::RateLimitedLog,
    wire::{Command, CommandSink, EmitKind, FILTER_INSIGHTS_TAG, Value, put_val},
};

/// Upper bounds of the exported latency buckets in microseconds. They must match the
/// `micros` type of the daemon's types.db.
const LATENCY_OFFSETS_MICROS: [i64; 25] = [
    35, 60, 103, 179, 310, 535, 924, 1597, 2759, 4768, 8239, 14237, 24601, 42510, 73457, 126934,
    219342, 379022, 654949, 1131752, 1955666, 3379391, 5839588, 10090808, 17436917,
];

const INF_BUCKET: &str = "bucket_inf";

lazy_static! {
    static ref INPUT_OFFSETS: Vec<i64> = bucket_offsets(INPUT_BUCKET_COUNT);
    static ref DECAYING_OFFSETS: Vec<i64> = bucket_offsets(DECAYING_BUCKET_COUNT);
}

static BUCKET_MISMATCH: RateLimitedLog = RateLimitedLog::new(Duration::from_secs(60 * 60));
static GAUGE_OVERFLOW: RateLimitedLog = RateLimitedLog::new(Duration::from_secs(60 * 60));

/// Writes one metric to a sink and returns the number of commands produced.
pub type Emitter = Arc<dyn Fn(&mut dyn CommandSink, &EncoderContext, EmitKind) -> usize + Send + Sync>;

/// Everything the encoder needs besides the metric itself.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderContext {
    /// Address the daemon files the values under.
    pub host: String,
    /// Sampling interval in seconds.
    pub interval: u64,
    pub rate_unit: TimeUnit,
    pub duration_unit: TimeUnit,
    pub global_tags: BTreeMap<String, String>,
}

impl EncoderContext {
    pub fn new(
        identity: &NodeIdentity,
        interval: u64,
        rate_unit: TimeUnit,
        duration_unit: TimeUnit,
    ) -> Self {
        let global_tags = BTreeMap::from([
            ("host".to_string(), identity.host.clone()),
            ("cluster".to_string(), identity.cluster.clone()),
            ("datacenter".to_string(), identity.datacenter.clone()),
            ("rack".to_string(), identity.rack.clone()),
        ]);
        Self {
            host: identity.host.clone(),
            interval,
            rate_unit,
            duration_unit,
            global_tags,
        }
    }

    fn convert_rate(&self, rate: f64) -> f64 {
        rate * self.rate_unit.to_seconds(1) as f64
    }

    fn convert_duration(&self, duration: f64) -> f64 {
        duration / self.duration_unit.to_nanos(1) as f64
    }
}

/// Emitter bound to `metric`, reporting under the cleaned form of `name`.
pub fn metric_emitter(name: &str, metric: Metric) -> Emitter {
    let name = clean(name);
    Arc::new(
        move |sink: &mut dyn CommandSink, ctx: &EncoderContext, kind: EmitKind| {
            encode_metric(sink, ctx, &name, &metric, kind)
        },
    )
}

pub fn encode_metric(
    sink: &mut dyn CommandSink,
    ctx: &EncoderContext,
    name: &str,
    metric: &Metric,
    kind: EmitKind,
) -> usize {
    match metric {
        Metric::Counter(counter) => write_counter(sink, ctx, name, counter.as_ref(), kind),
        Metric::Gauge(gauge) => write_gauge(sink, ctx, name, gauge.as_ref(), kind),
        Metric::Histogram(histogram) => write_histogram(sink, ctx, name, histogram.as_ref(), kind),
        Metric::Meter(meter) => write_meter(sink, ctx, name, meter.as_ref(), kind),
        Metric::Timer(timer) => write_timer(sink, ctx, name, timer.as_ref(), kind),
    }
}

fn send_insight(sink: &mut dyn CommandSink, name: &str, insight: Result<Insight, InsightError>) -> usize {
    match insight.and_then(|insight| insight.to_json()) {
        Ok(json) => {
            sink.send(Command::PutInsight(json));
            sink.flush();
            1
        }
        Err(err) => {
            log::warn!("Error encoding insight for {name}: {err}");
            0
        }
    }
}

fn write_counter(
    sink: &mut dyn CommandSink,
    ctx: &EncoderContext,
    name: &str,
    counter: &dyn Counter,
    kind: EmitKind,
) -> usize {
    sink.send(put_val(
        &ctx.host,
        name,
        "counter",
        ctx.interval,
        kind.tags(),
        &[Value::Int(counter.count())],
    ));
    1
}

fn write_gauge(
    sink: &mut dyn CommandSink,
    ctx: &EncoderContext,
    name: &str,
    gauge: &dyn Gauge,
    kind: EmitKind,
) -> usize {
    let value = match gauge.value() {
        GaugeValue::Integer(value) => Value::Int(value),
        GaugeValue::Float(value) => Value::Float(value),
        GaugeValue::Buckets(buckets) => return write_gauge_buckets(sink, ctx, name, &buckets, kind),
        GaugeValue::Other(value) => {
            log::trace!("Value not a number {name} {value}");
            return 0;
        }
    };
    sink.send(put_val(&ctx.host, name, "gauge", ctx.interval, kind.tags(), &[value]));
    1
}

/// Gauges exposing estimated-histogram buckets are reported as histograms.
fn write_gauge_buckets(
    sink: &mut dyn CommandSink,
    ctx: &EncoderContext,
    name: &str,
    buckets: &[i64],
    kind: EmitKind,
) -> usize {
    if buckets.is_empty() {
        log::trace!("Gauge {name} was empty, ignoring");
        return 0;
    }

    let histogram = EstimatedHistogram::from_buckets(buckets);
    let (stats, p90) = match bucket_stats(&histogram) {
        Ok(stats) => stats,
        Err(err) => {
            if GAUGE_OVERFLOW.should_log() {
                log::info!("Cannot report gauge {name} as histogram: {err}");
            }
            return 0;
        }
    };

    let count = histogram.count();
    sink.send(histogram_command(ctx, name, count, stats.min as f64, stats.max as f64, &stats, p90));
    let mut sent = 1;

    if !kind.is_insight_filtered() {
        let data = HistogramData {
            count: count.max(0) as u64,
            sampling_stats: stats,
        };
        sent += send_insight(
            sink,
            name,
            Insight::metric(name, InsightType::Histogram, ctx.global_tags.clone(), &data),
        );
    }
    sent
}

fn bucket_stats(histogram: &EstimatedHistogram) -> Result<(SamplingStats, f64), HistogramError> {
    let percentile = |p: f64| histogram.percentile(p).map(|value| value as f64);
    let stats = SamplingStats {
        min: histogram.min(),
        max: histogram.max(),
        mean: histogram.mean()? as f64,
        median: percentile(0.5)?,
        p75: percentile(0.75)?,
        p95: percentile(0.95)?,
        p98: percentile(0.98)?,
        p99: percentile(0.99)?,
        p999: percentile(0.999)?,
        std_dev: -1.0,
    };
    Ok((stats, percentile(0.9)?))
}

fn histogram_command(
    ctx: &EncoderContext,
    name: &str,
    count: i64,
    min: f64,
    max: f64,
    stats: &SamplingStats,
    p90: f64,
) -> Command {
    put_val(
        &ctx.host,
        name,
        "histogram",
        ctx.interval,
        FILTER_INSIGHTS_TAG,
        &[
            Value::Int(count),
            Value::Float(max),
            Value::Float(stats.mean),
            Value::Float(min),
            Value::Float(stats.std_dev),
            Value::Float(stats.median),
            Value::Float(stats.p75),
            Value::Float(p90),
            Value::Float(stats.p95),
            Value::Float(stats.p98),
            Value::Float(stats.p99),
            Value::Float(stats.p999),
        ],
    )
}

fn meter_command(ctx: &EncoderContext, name: &str, count: u64, rates: &RateStats) -> Command {
    put_val(
        &ctx.host,
        name,
        "meter",
        ctx.interval,
        FILTER_INSIGHTS_TAG,
        &[
            Value::Int(count as i64),
            Value::Float(rates.mean_rate),
            Value::Float(rates.m1_rate),
            Value::Float(rates.m5_rate),
            Value::Float(rates.m15_rate),
        ],
    )
}

/// Histograms are not time based: values are reported unconverted.
fn write_histogram(
    sink: &mut dyn CommandSink,
    ctx: &EncoderContext,
    name: &str,
    histogram: &dyn Histogram,
    kind: EmitKind,
) -> usize {
    let snapshot = histogram.snapshot();
    let count = histogram.count();
    let stats = SamplingStats {
        min: snapshot.min(),
        max: snapshot.max(),
        mean: snapshot.mean(),
        median: snapshot.median(),
        p75: snapshot.p75(),
        p95: snapshot.p95(),
        p98: snapshot.p98(),
        p99: snapshot.p99(),
        p999: snapshot.p999(),
        std_dev: -1.0,
    };

    sink.send(histogram_command(
        ctx,
        name,
        count as i64,
        stats.min as f64,
        stats.max as f64,
        &stats,
        snapshot.value(0.9),
    ));
    let mut sent = 1;

    if !kind.is_insight_filtered() {
        let data = HistogramData {
            count,
            sampling_stats: stats,
        };
        sent += send_insight(
            sink,
            name,
            Insight::metric(name, InsightType::Histogram, ctx.global_tags.clone(), &data),
        );
    }
    sent
}

fn rate_stats<M: Meter + ?Sized>(ctx: &EncoderContext, meter: &M) -> RateStats {
    RateStats {
        m1_rate: ctx.convert_rate(meter.one_minute_rate()),
        m5_rate: ctx.convert_rate(meter.five_minute_rate()),
        m15_rate: ctx.convert_rate(meter.fifteen_minute_rate()),
        mean_rate: ctx.convert_rate(meter.mean_rate()),
    }
}

fn write_meter(
    sink: &mut dyn CommandSink,
    ctx: &EncoderContext,
    name: &str,
    meter: &dyn Meter,
    kind: EmitKind,
) -> usize {
    let rates = rate_stats(ctx, meter);
    let count = meter.count();

    sink.send(meter_command(ctx, name, count, &rates));
    let mut sent = 1;

    if !kind.is_insight_filtered() {
        let data = MeterData {
            count,
            rate_stats: rates,
            rate_unit: ctx.rate_unit.to_string(),
        };
        sent += send_insight(
            sink,
            name,
            Insight::metric(name, InsightType::Meter, ctx.global_tags.clone(), &data),
        );
    }
    sent
}

fn write_timer(
    sink: &mut dyn CommandSink,
    ctx: &EncoderContext,
    name: &str,
    timer: &dyn Timer,
    kind: EmitKind,
) -> usize {
    let snapshot = timer.snapshot();
    let count = timer.count();
    let rates = rate_stats(ctx, timer);

    let duration = |value: f64| ctx.convert_duration(value);
    let stats = SamplingStats {
        min: duration(snapshot.min() as f64) as i64,
        max: duration(snapshot.max() as f64) as i64,
        mean: duration(snapshot.mean()),
        median: duration(snapshot.median()),
        p75: duration(snapshot.p75()),
        p95: duration(snapshot.p95()),
        p98: duration(snapshot.p98()),
        p99: duration(snapshot.p99()),
        p999: duration(snapshot.p999()),
        std_dev: duration(snapshot.std_dev()),
    };

    sink.send(histogram_command(
        ctx,
        name,
        count as i64,
        duration(snapshot.min() as f64),
        duration(snapshot.max() as f64),
        &stats,
        duration(snapshot.value(0.9)),
    ));
    sink.send(meter_command(ctx, name, count, &rates));
    let mut sent = 2;

    let mut bucket_tags = ctx.global_tags.clone();
    if write_prometheus_timer(sink, ctx, name, count, snapshot.as_ref(), &mut bucket_tags) {
        sent += 1;
    }

    if !kind.is_insight_filtered() {
        let data = TimerData {
            count,
            sampling_stats: stats,
            rate_stats: rates,
            rate_unit: ctx.rate_unit.to_string(),
            duration_unit: ctx.duration_unit.to_string(),
        };
        sent += send_insight(
            sink,
            name,
            Insight::metric(name, InsightType::Timer, bucket_tags, &data),
        );
    }
    sent
}

fn latency_bucket_name(index: usize) -> String {
    format!("bucket_{}", LATENCY_OFFSETS_MICROS[index])
}

/// Writes the timer as cumulative latency buckets (`micros` type), the way Prometheus
/// histograms are built. Bucket values are also recorded in `bucket_tags`.
///
/// Returns false when the snapshot's values cannot be mapped to bucket offsets.
fn write_prometheus_timer(
    sink: &mut dyn CommandSink,
    ctx: &EncoderContext,
    name: &str,
    count: u64,
    snapshot: &dyn Snapshot,
    bucket_tags: &mut BTreeMap<String, String>,
) -> bool {
    let values = snapshot.values();
    let offsets: Cow<'_, [i64]> = match snapshot.bucket_layout() {
        BucketLayout::Offsets(offsets) => Cow::Owned(offsets),
        BucketLayout::DecayingReservoir => Cow::Borrowed(DECAYING_OFFSETS.as_slice()),
        BucketLayout::Unknown => Cow::Borrowed(INPUT_OFFSETS.as_slice()),
    };

    if values.len() != offsets.len() {
        if BUCKET_MISMATCH.should_log() {
            log::info!(
                "Not able to get buckets for {name}: {} values for {} offsets",
                values.len(),
                offsets.len()
            );
        }
        return false;
    }

    let mut fields = Vec::with_capacity(LATENCY_OFFSETS_MICROS.len() + 3);
    fields.push(Value::Int(count as i64));
    // sum derived from the mean
    fields.push(Value::Float(snapshot.mean() * count as f64));

    let mut output_index = 0;
    let mut cumulative = 0i64;
    for (offset, value) in offsets.iter().zip(values.iter()) {
        if output_index < LATENCY_OFFSETS_MICROS.len()
            && *offset > LATENCY_OFFSETS_MICROS[output_index] * 1000
        {
            fields.push(Value::Int(cumulative));
            bucket_tags.insert(latency_bucket_name(output_index), cumulative.to_string());
            output_index += 1;
        }
        cumulative += value;
    }

    // remaining buckets and the inf bucket hold the total
    while output_index <= LATENCY_OFFSETS_MICROS.len() {
        fields.push(Value::Int(cumulative));
        output_index += 1;
    }
    bucket_tags.insert(INF_BUCKET.to_string(), cumulative.to_string());

    sink.send(put_val(
        &ctx.host,
        name,
        "micros",
        ctx.interval,
        FILTER_INSIGHTS_TAG,
        &fields,
    ));
    true
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};

    use mcac_core::metrics::{AtomicCounter, FnGauge};

    use super::*;

    /// Sink recording every command and flush.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub commands: Vec<Command>,
        pub flushes: usize,
    }

    impl CommandSink for RecordingSink {
        fn send(&mut self, command: Command) -> bool {
            self.commands.push(command);
            true
        }

        fn flush(&mut self) {
            self.flushes += 1;
        }
    }

    impl RecordingSink {
        pub(crate) fn lines(&self) -> Vec<String> {
            self.commands.iter().map(Command::encode).collect()
        }
    }

    pub(crate) fn context() -> EncoderContext {
        let identity = NodeIdentity {
            host: "10.0.0.1".to_string(),
            datacenter: "dc1".to_string(),
            rack: "rack1".to_string(),
            cluster: "cluster1".to_string(),
        };
        EncoderContext::new(&identity, 30, TimeUnit::Seconds, TimeUnit::Microseconds)
    }

    struct FixedSnapshot {
        values: Vec<i64>,
        layout: BucketLayout,
    }

    impl Snapshot for FixedSnapshot {
        fn value(&self, quantile: f64) -> f64 {
            quantile * 1_000_000.0
        }

        fn values(&self) -> Vec<i64> {
            self.values.clone()
        }

        fn min(&self) -> i64 {
            1_000
        }

        fn max(&self) -> i64 {
            2_000_000
        }

        fn mean(&self) -> f64 {
            500_000.0
        }

        fn std_dev(&self) -> f64 {
            3_000.0
        }

        fn bucket_layout(&self) -> BucketLayout {
            self.layout.clone()
        }
    }

    struct FixedTimer {
        count: AtomicI64,
        layout: BucketLayout,
        values: Vec<i64>,
    }

    impl Meter for FixedTimer {
        fn count(&self) -> u64 {
            self.count.load(Ordering::Relaxed) as u64
        }

        fn mean_rate(&self) -> f64 {
            1.0
        }

        fn one_minute_rate(&self) -> f64 {
            2.0
        }

        fn five_minute_rate(&self) -> f64 {
            3.0
        }

        fn fifteen_minute_rate(&self) -> f64 {
            4.0
        }
    }

    impl Timer for FixedTimer {
        fn snapshot(&self) -> Box<dyn Snapshot> {
            Box::new(FixedSnapshot {
                values: self.values.clone(),
                layout: self.layout.clone(),
            })
        }
    }

    fn timer(layout: BucketLayout, values: Vec<i64>) -> Metric {
        Metric::Timer(Arc::new(FixedTimer {
            count: AtomicI64::new(6),
            layout,
            values,
        }))
    }

    #[test]
    fn counter_uses_emission_tags() {
        let counter = Arc::new(AtomicCounter::new());
        counter.add(7);
        let emitter = metric_emitter("Table.ReadCount", Metric::Counter(counter));

        let mut sink = RecordingSink::default();
        assert_eq!(emitter(&mut sink, &context(), EmitKind::InsightFiltered), 1);
        assert_eq!(
            sink.lines(),
            vec!["PUTVAL 10.0.0.1/mcac-table.read_count/counter interval=30 mcac_filtered=true N:7\n"]
        );
    }

    #[test]
    fn gauge_values() {
        let mut sink = RecordingSink::default();
        let ctx = context();

        let gauge = Metric::Gauge(Arc::new(FnGauge(|| GaugeValue::Float(1.5))));
        assert_eq!(encode_metric(&mut sink, &ctx, "g", &gauge, EmitKind::Sample), 1);
        assert_eq!(sink.lines()[0], "PUTVAL 10.0.0.1/mcac-g/gauge interval=30  N:1.5\n");

        let text = Metric::Gauge(Arc::new(FnGauge(|| GaugeValue::Other("n/a".to_string()))));
        assert_eq!(encode_metric(&mut sink, &ctx, "t", &text, EmitKind::Sample), 0);

        let empty = Metric::Gauge(Arc::new(FnGauge(|| GaugeValue::Buckets(Vec::new()))));
        assert_eq!(encode_metric(&mut sink, &ctx, "e", &empty, EmitKind::Sample), 0);
        assert_eq!(sink.commands.len(), 1);
    }

    #[test]
    fn bucket_gauge_is_reported_as_histogram() {
        let mut sink = RecordingSink::default();
        let gauge = Metric::Gauge(Arc::new(FnGauge(|| GaugeValue::Buckets(vec![0, 2, 0, 2, 0]))));

        assert_eq!(encode_metric(&mut sink, &context(), "sizes", &gauge, EmitKind::Sample), 2);
        let lines = sink.lines();
        assert_eq!(
            lines[0],
            "PUTVAL 10.0.0.1/mcac-sizes/histogram interval=30 mcac_filtered=true N:4:4:3:2:-1:2:4:4:4:4:4:4\n"
        );
        assert!(lines[1].starts_with("PUTINSIGHT "));
        assert!(lines[1].contains(r#""insightType":"HISTOGRAM""#));
        assert_eq!(sink.flushes, 1);

        let overflowed = Metric::Gauge(Arc::new(FnGauge(|| GaugeValue::Buckets(vec![1, 1]))));
        assert_eq!(
            encode_metric(&mut sink, &context(), "o", &overflowed, EmitKind::Sample),
            0
        );
    }

    #[test]
    fn timer_writes_histogram_meter_and_buckets() {
        let metric = timer(
            BucketLayout::Offsets(vec![10_000, 50_000, 100_000]),
            vec![1, 2, 3],
        );
        let mut sink = RecordingSink::default();
        assert_eq!(
            encode_metric(&mut sink, &context(), "latency", &metric, EmitKind::InsightFiltered),
            3
        );

        let lines = sink.lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with(
            "PUTVAL 10.0.0.1/mcac-latency/histogram interval=30 mcac_filtered=true N:6:2000:500:1:3:500:750:900:"
        ));
        assert_eq!(
            lines[1],
            "PUTVAL 10.0.0.1/mcac-latency/meter interval=30 mcac_filtered=true N:6:1:2:3:4\n"
        );

        let micros = lines[2].trim_end().rsplit(' ').next().unwrap();
        let fields: Vec<&str> = micros.trim_start_matches("N:").split(':').collect();
        assert_eq!(fields.len(), 2 + 26);
        assert_eq!(&fields[..5], &["6", "3000000", "1", "3", "6"]);
        assert!(fields[5..].iter().all(|field| *field == "6"));
        assert_eq!(sink.flushes, 0);
    }

    #[test]
    fn timer_insight_carries_bucket_tags() {
        let metric = timer(
            BucketLayout::Offsets(vec![10_000, 50_000, 100_000]),
            vec![1, 2, 3],
        );
        let mut sink = RecordingSink::default();
        assert_eq!(
            encode_metric(&mut sink, &context(), "latency", &metric, EmitKind::Sample),
            4
        );

        let Command::PutInsight(json) = &sink.commands[3] else {
            panic!("expected an insight, got {:?}", sink.commands[3]);
        };
        let insight = Insight::from_json(json).unwrap();
        assert_eq!(insight.metadata.insight_type, InsightType::Timer);
        assert_eq!(insight.metadata.tags["bucket_35"], "1");
        assert_eq!(insight.metadata.tags["bucket_60"], "3");
        assert_eq!(insight.metadata.tags["bucket_inf"], "6");
        assert_eq!(insight.metadata.tags["datacenter"], "dc1");
        assert_eq!(insight.data.unwrap()["durationUnit"], "MICROSECONDS");
    }

    #[test]
    fn mismatched_buckets_skip_prometheus_encoding() {
        let metric = timer(BucketLayout::Unknown, vec![1, 2, 3]);
        let mut sink = RecordingSink::default();
        assert_eq!(
            encode_metric(&mut sink, &context(), "latency", &metric, EmitKind::InsightFiltered),
            2
        );
    }
}
