//! Metrics collection agent for Apache Cassandra nodes.
//!
//! The agent runs next to the database and forwards its metrics and structured events
//! ("insights") to a bundled collectd daemon:
//!
//! - the [supervisor](collectd_supervisor::ProcessSupervisor) renders the daemon's
//!   configuration, launches it and keeps it alive;
//! - the [client](insights_client::TelemetryClient) filters, samples and writes metrics and
//!   events to the daemon's unix socket;
//! - the [orchestrator](crate::orchestrator::Orchestrator) loads the configuration and
//!   propagates every reload to both.
//!
//! The `mcac-agent` binary wires them together and reacts to signals: `SIGHUP` reloads
//! the configuration file, `SIGINT` and `SIGTERM` stop the agent.
//!
//! ```sh
//! mcac-agent --config /etc/mcac/metric-collector.yaml --cluster prod --datacenter dc1
//! ```

pub mod cli;
pub mod orchestrator;
pub mod utils;

pub mod metadata {
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}

/// Init logger. We log from info level and above.
/// If RUST_LOG is set, we assume the user wants to debug something
/// and use env_logger default behaviour.
pub fn init_logger(override_log_level: Option<log::LevelFilter>) {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
    } else {
        let level_filter = override_log_level.unwrap_or(log::LevelFilter::Info);

        env_logger::builder().filter_level(level_filter).init();
    }
}
