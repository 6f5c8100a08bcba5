//! Client side of the metrics collection agent.
//!
//! [`TelemetryClient`] keeps a routing table of metric emitters, samples them on a timer
//! and writes the result, together with structured events, to the unix socket of the
//! collectd daemon managed through a [`DaemonLifecycle`](mcac_core::lifecycle::DaemonLifecycle).
//!
//! Names are routed with the filtering rules of the current configuration, evaluated on
//! both the raw and the [`clean`]ed name:
//!
//! - unrestricted metrics are sent on every tick and reach insights on insight ticks;
//! - restricted metrics are always sent insight-filtered;
//! - denied metrics are never sent.

use thiserror::Error;

pub mod clean;
pub mod client;
pub mod encoder;
pub mod rate_limit;
pub mod registry;
pub mod routing;
pub mod sampler;
pub mod transport;
pub mod wire;

pub use clean::clean;
pub use client::{ClientOptions, TelemetryClient, health_tick};
pub use encoder::{EncoderContext, Emitter, metric_emitter};
pub use rate_limit::RateLimitedLog;
pub use transport::Watermarks;
pub use wire::{Command, CommandSink, EmitKind};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("insights client already started")]
    AlreadyStarted,
    #[error("insights client already stopped")]
    AlreadyStopped,
    #[error("building insights runtime")]
    Runtime(#[source] std::io::Error),
}
