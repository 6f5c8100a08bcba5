use std::{ffi::OsString, path::PathBuf};

use clap::Parser;
use mcac_core::{
    config::{ConfigError, ConfigSource, Configuration, NodeIdentity, YamlConfigSource},
    metrics::TimeUnit,
};

pub const NAME: &str = "mcac-agent";

#[derive(Parser, Debug, Clone)]
#[clap(name = NAME)]
#[clap(about = "Metrics collection agent for Apache Cassandra", version = crate::metadata::VERSION)]
pub struct AgentOpts {
    /// Configuration file, reloaded on SIGHUP.
    #[clap(long)]
    pub config: PathBuf,
    /// Log level, ignored when RUST_LOG is set.
    #[clap(long)]
    pub verbosity: Option<log::LevelFilter>,
    /// Address reported by the daemon. Defaults to the host name.
    #[clap(long)]
    pub host: Option<String>,
    #[clap(long, default_value = "")]
    pub datacenter: String,
    #[clap(long, default_value = "")]
    pub rack: String,
    #[clap(long, default_value = "")]
    pub cluster: String,
    /// Overrides `collectd_root` of the configuration file.
    #[clap(long)]
    pub collectd_root: Option<PathBuf>,
    /// Socket of a collectd managed outside the agent. No daemon is launched.
    #[clap(long)]
    pub external_daemon_socket: Option<PathBuf>,
    #[clap(long, default_value_t = TimeUnit::Seconds)]
    pub rate_unit: TimeUnit,
    #[clap(long, default_value_t = TimeUnit::Microseconds)]
    pub duration_unit: TimeUnit,
}

impl AgentOpts {
    pub fn identity(&self) -> NodeIdentity {
        let host = self
            .host
            .clone()
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned());
        NodeIdentity {
            host,
            datacenter: self.datacenter.clone(),
            rack: self.rack.clone(),
            cluster: self.cluster.clone(),
        }
    }

    pub fn config_source(&self) -> CliConfigSource {
        CliConfigSource {
            file: YamlConfigSource::new(&self.config),
            collectd_root: self.collectd_root.clone(),
        }
    }
}

pub fn parse_from_args() -> AgentOpts {
    parse_from(std::env::args_os())
}

pub fn parse_from<I, T>(args: I) -> AgentOpts
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    AgentOpts::try_parse_from(args).unwrap_or_else(|e| e.exit())
}

/// Configuration file with the command line overrides applied on every load.
#[derive(Debug, Clone)]
pub struct CliConfigSource {
    file: YamlConfigSource,
    collectd_root: Option<PathBuf>,
}

impl ConfigSource for CliConfigSource {
    fn load(&self) -> Result<Configuration, ConfigError> {
        let mut config = self.file.load()?;
        if let Some(root) = &self.collectd_root {
            config.collectd_root = Some(root.clone());
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::{ffi::OsStr, io::Write};

    use super::*;

    #[test]
    fn parses_flags() {
        let opts = AgentOpts::try_parse_from([
            NAME,
            "--config",
            "/etc/mcac.yaml",
            "--verbosity",
            "debug",
            "--host",
            "10.0.0.1",
            "--cluster",
            "c1",
            "--rate-unit",
            "minutes",
        ])
        .unwrap();

        assert_eq!(opts.verbosity, Some(log::LevelFilter::Debug));
        assert_eq!(opts.rate_unit, TimeUnit::Minutes);
        assert_eq!(opts.duration_unit, TimeUnit::Microseconds);
        assert_eq!(opts.identity().host, "10.0.0.1");
        assert_eq!(opts.identity().cluster, "c1");
        assert!(opts.external_daemon_socket.is_none());
        assert!(AgentOpts::try_parse_from([NAME]).is_err());
    }

    #[test]
    fn collectd_root_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "collectd_root: /opt/from-file").unwrap();

        let args: [&OsStr; 5] = [
            NAME.as_ref(),
            "--config".as_ref(),
            file.path().as_os_str(),
            "--collectd-root".as_ref(),
            "/opt/collectd".as_ref(),
        ];
        let opts = AgentOpts::try_parse_from(args).unwrap();
        let config = opts.config_source().load().unwrap();
        assert_eq!(config.collectd_root, Some(PathBuf::from("/opt/collectd")));
    }
}
