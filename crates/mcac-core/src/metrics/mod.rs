//! Metric model shared by producers and the telemetry client.
//!
//! Producers expose their metrics through the [`Counter`], [`Gauge`], [`Histogram`],
//! [`Meter`] and [`Timer`] traits and publish them in a [`MetricRegistry`]. Consumers
//! attach a [`MetricListener`] to the registry to be told when metrics appear or go away.

use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

use strum::{Display, EnumString};

pub mod estimated_histogram;
pub mod registry;

pub use estimated_histogram::EstimatedHistogram;
pub use registry::{MetricListener, MetricRegistry};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    #[default]
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    fn nanos(self) -> u64 {
        match self {
            TimeUnit::Nanoseconds => 1,
            TimeUnit::Microseconds => 1_000,
            TimeUnit::Milliseconds => 1_000_000,
            TimeUnit::Seconds => 1_000_000_000,
            TimeUnit::Minutes => 60_000_000_000,
            TimeUnit::Hours => 3_600_000_000_000,
            TimeUnit::Days => 86_400_000_000_000,
        }
    }

    /// Whole nanoseconds in `duration` units.
    pub fn to_nanos(self, duration: u64) -> u64 {
        duration.saturating_mul(self.nanos())
    }

    /// Whole seconds in `duration` units, truncated.
    pub fn to_seconds(self, duration: u64) -> u64 {
        duration.saturating_mul(self.nanos()) / TimeUnit::Seconds.nanos()
    }
}

pub trait Counter: Send + Sync {
    fn count(&self) -> i64;
}

#[derive(Debug, Clone, PartialEq)]
pub enum GaugeValue {
    Integer(i64),
    Float(f64),
    /// Raw estimated-histogram bucket counts, overflow bucket last.
    Buckets(Vec<i64>),
    /// Anything that is not a number.
    Other(String),
}

pub trait Gauge: Send + Sync {
    fn value(&self) -> GaugeValue;
}

/// How the values of a [`Snapshot`] map to bucket upper bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketLayout {
    /// Values are bucket counts for these offsets.
    Offsets(Vec<i64>),
    /// Values are bucket counts of a decaying reservoir with the default decaying
    /// offsets.
    DecayingReservoir,
    /// The layout is unknown; input histogram offsets are assumed.
    Unknown,
}

pub trait Snapshot: Send {
    fn value(&self, quantile: f64) -> f64;

    fn values(&self) -> Vec<i64>;

    fn min(&self) -> i64;

    fn max(&self) -> i64;

    fn mean(&self) -> f64;

    fn std_dev(&self) -> f64;

    fn bucket_layout(&self) -> BucketLayout {
        BucketLayout::Unknown
    }

    fn median(&self) -> f64 {
        self.value(0.5)
    }

    fn p75(&self) -> f64 {
        self.value(0.75)
    }

    fn p95(&self) -> f64 {
        self.value(0.95)
    }

    fn p98(&self) -> f64 {
        self.value(0.98)
    }

    fn p99(&self) -> f64 {
        self.value(0.99)
    }

    fn p999(&self) -> f64 {
        self.value(0.999)
    }
}

pub trait Histogram: Send + Sync {
    fn count(&self) -> u64;

    fn snapshot(&self) -> Box<dyn Snapshot>;
}

/// Rates are expressed in events per second.
pub trait Meter: Send + Sync {
    fn count(&self) -> u64;

    fn mean_rate(&self) -> f64;

    fn one_minute_rate(&self) -> f64;

    fn five_minute_rate(&self) -> f64;

    fn fifteen_minute_rate(&self) -> f64;
}

/// A meter of events with a histogram of their durations in nanoseconds.
pub trait Timer: Meter {
    fn snapshot(&self) -> Box<dyn Snapshot>;
}

#[derive(Clone)]
pub enum Metric {
    Counter(Arc<dyn Counter>),
    Gauge(Arc<dyn Gauge>),
    Histogram(Arc<dyn Histogram>),
    Meter(Arc<dyn Meter>),
    Timer(Arc<dyn Timer>),
}

impl Metric {
    pub fn kind(&self) -> &'static str {
        match self {
            Metric::Counter(_) => "counter",
            Metric::Gauge(_) => "gauge",
            Metric::Histogram(_) => "histogram",
            Metric::Meter(_) => "meter",
            Metric::Timer(_) => "timer",
        }
    }
}

impl std::fmt::Debug for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Metric::{}", self.kind())
    }
}

#[derive(Debug, Default)]
pub struct AtomicCounter {
    value: AtomicI64,
}

impl AtomicCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: i64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }
}

impl Counter for AtomicCounter {
    fn count(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge reading its value from a closure.
pub struct FnGauge<F>(pub F);

impl<F> Gauge for FnGauge<F>
where
    F: Fn() -> GaugeValue + Send + Sync,
{
    fn value(&self) -> GaugeValue {
        (self.0)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_unit_conversions() {
        assert_eq!(TimeUnit::Seconds.to_seconds(1), 1);
        assert_eq!(TimeUnit::Minutes.to_seconds(1), 60);
        assert_eq!(TimeUnit::Microseconds.to_seconds(1), 0);
        assert_eq!(TimeUnit::Microseconds.to_nanos(1), 1_000);
        assert_eq!(TimeUnit::Microseconds.to_string(), "MICROSECONDS");
        assert_eq!("seconds".parse::<TimeUnit>(), Ok(TimeUnit::Seconds));
    }

    #[test]
    fn counter_and_gauge() {
        let counter = AtomicCounter::new();
        counter.inc();
        counter.add(41);
        assert_eq!(counter.count(), 42);

        let gauge = FnGauge(|| GaugeValue::Float(0.5));
        assert_eq!(gauge.value(), GaugeValue::Float(0.5));
    }
}
