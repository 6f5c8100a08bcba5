use std::sync::Arc;

use anyhow::{Context, Result};
use collectd_supervisor::{ProcessSupervisor, SupervisorOptions, TemplateRenderer, default_socket_path};
use insights_client::ClientOptions;
use mcac::{
    cli::{self, AgentOpts},
    orchestrator::Orchestrator,
    utils::report_error,
};
use signal_hook::{
    consts::{SIGHUP, SIGINT, SIGTERM},
    iterator::Signals,
};

fn main() {
    // Parse cli and handle clap errors
    let options = cli::parse_from_args();

    mcac::init_logger(options.verbosity);

    match run(&options) {
        Ok(_) => std::process::exit(0),
        Err(e) => {
            report_error(&e);
            std::process::exit(1);
        }
    }
}

fn run(options: &AgentOpts) -> Result<()> {
    log::trace!("Agent options: {:?}", options);

    let identity = options.identity();
    let socket_path = options
        .external_daemon_socket
        .clone()
        .unwrap_or_else(default_socket_path);

    let renderer = TemplateRenderer::new().context("loading collectd templates")?;
    let supervisor = Arc::new(ProcessSupervisor::new(
        SupervisorOptions {
            identity: identity.clone(),
            external_daemon: options.external_daemon_socket.is_some(),
            ..Default::default()
        },
        Box::new(renderer),
    ));

    let mut client_options = ClientOptions::new(socket_path, identity);
    client_options.rate_unit = options.rate_unit;
    client_options.duration_unit = options.duration_unit;

    let orchestrator = Orchestrator::new(
        Box::new(options.config_source()),
        supervisor,
        client_options,
    )?;

    let mut signals =
        Signals::new([SIGINT, SIGTERM, SIGHUP]).context("error setting signal handler")?;

    orchestrator.start()?;
    log::info!(
        "Agent started, collectd socket {}",
        orchestrator.client().socket_path().display()
    );

    for signal in signals.forever() {
        match signal {
            SIGHUP => {
                log::trace!("SIGHUP received");
                if let Err(err) = orchestrator.reload() {
                    report_error(&err);
                }
            }
            _ => {
                log::trace!("Signal {signal} received");
                break;
            }
        }
    }

    log::info!("Terminating agent...");
    orchestrator.shutdown()
}
