use std::{
    fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use hyper::Uri;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::filtering::FilteringRule;

/// Insights need at least one set of metrics every five minutes, whatever the upload
/// interval is.
pub const MAX_METRIC_UPDATE_GAP_IN_SECONDS: u64 = 5 * 60;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading configuration file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing configuration")]
    Parse(#[from] serde_yaml::Error),
    #[error("{value} is not a valid value for field {field}: {err}")]
    InvalidValue {
        field: String,
        value: String,
        err: String,
    },
}

/// Agent configuration.
///
/// Instances are never mutated after loading: a reload produces a new value which
/// replaces the previous snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Configuration {
    pub collectd_root: Option<PathBuf>,
    pub log_dir: PathBuf,
    pub data_dir: PathBuf,
    pub data_dir_max_size_in_mb: u64,
    pub metric_sampling_interval_in_seconds: u64,
    pub upload_interval_in_seconds: u64,
    pub upload_url: String,
    pub insights_upload_enabled: bool,
    pub insights_streaming_enabled: bool,
    pub write_to_disk_enabled: bool,
    pub insights_token: Option<String>,
    pub filtering_rules: Vec<FilteringRule>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            collectd_root: None,
            log_dir: PathBuf::from("/tmp/mcac/log"),
            data_dir: PathBuf::from("/tmp/mcac/data"),
            data_dir_max_size_in_mb: 5000,
            metric_sampling_interval_in_seconds: 30,
            upload_interval_in_seconds: MAX_METRIC_UPDATE_GAP_IN_SECONDS,
            upload_url: "http://localhost".to_string(),
            insights_upload_enabled: false,
            insights_streaming_enabled: false,
            write_to_disk_enabled: true,
            insights_token: None,
            filtering_rules: Vec::new(),
        }
    }
}

impl Configuration {
    /// Parses and validates a YAML document.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: Configuration = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.metric_sampling_interval_in_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "metric_sampling_interval_in_seconds".to_string(),
                value: "0".to_string(),
                err: "must be greater than zero".to_string(),
            });
        }
        self.upload_endpoint()?;
        Ok(())
    }

    pub fn sampling_interval(&self) -> Duration {
        Duration::from_secs(self.metric_sampling_interval_in_seconds)
    }

    /// Shortest time between two insight emissions of the same metric.
    pub fn metric_update_gap_in_seconds(&self) -> u64 {
        self.upload_interval_in_seconds
            .min(MAX_METRIC_UPDATE_GAP_IN_SECONDS)
    }

    pub fn is_upload_enabled(&self) -> bool {
        self.insights_upload_enabled || self.insights_streaming_enabled
    }

    pub fn upload_endpoint(&self) -> Result<UploadEndpoint, ConfigError> {
        UploadEndpoint::parse(&self.upload_url)
    }
}

/// Destination of uploaded insights, split out of `upload_url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadEndpoint {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub is_ssl: bool,
}

impl UploadEndpoint {
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let invalid = |err: &str| ConfigError::InvalidValue {
            field: "upload_url".to_string(),
            value: url.to_string(),
            err: err.to_string(),
        };

        let uri: Uri = url.parse().map_err(|err: hyper::http::uri::InvalidUri| {
            invalid(&err.to_string())
        })?;

        let is_ssl = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            Some(other) => return Err(invalid(&format!("unsupported scheme {other}"))),
            None => return Err(invalid("missing scheme")),
        };
        let host = uri
            .host()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| invalid("missing host"))?
            .to_string();
        let port = uri.port_u16().unwrap_or(if is_ssl { 443 } else { 80 });

        Ok(Self {
            host,
            port,
            path: uri.path().to_string(),
            is_ssl,
        })
    }
}

/// Identity of the node the agent runs on, rendered into the daemon configuration and
/// attached to insights as global tags.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeIdentity {
    pub host: String,
    pub datacenter: String,
    pub rack: String,
    pub cluster: String,
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (cluster {}, datacenter {}, rack {})",
            self.host, self.cluster, self.datacenter, self.rack
        )
    }
}

/// Producer of configuration snapshots.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<Configuration, ConfigError>;
}

/// Reads the configuration from a YAML file on every [`ConfigSource::load`].
#[derive(Debug, Clone)]
pub struct YamlConfigSource {
    path: PathBuf,
}

impl YamlConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for YamlConfigSource {
    fn load(&self) -> Result<Configuration, ConfigError> {
        log::debug!("Loading settings from {}", self.path.display());
        let text = fs::read_to_string(&self.path).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        Configuration::from_yaml(&text)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::filtering::{Policy, Scope};

    #[test]
    fn empty_document_uses_defaults() {
        let config = Configuration::from_yaml("{}").unwrap();
        assert_eq!(config, Configuration::default());
        assert_eq!(config.metric_sampling_interval_in_seconds, 30);
        assert!(config.write_to_disk_enabled);
        assert!(!config.is_upload_enabled());
    }

    #[test]
    fn parse_full_document() {
        let config = Configuration::from_yaml(
            r#"
collectd_root: /opt/mcac/collectd
log_dir: /var/log/mcac
data_dir: /var/lib/mcac
data_dir_max_size_in_mb: 100
metric_sampling_interval_in_seconds: 10
upload_interval_in_seconds: 3600
upload_url: https://insights.example.com/api
insights_streaming_enabled: true
insights_token: secret
filtering_rules:
  - policy: deny
    pattern: org.apache.cassandra.metrics.Table
    scope: global
  - policy: allow
    pattern: Table.LiveSSTableCount
    scope: datalog
"#,
        )
        .unwrap();

        assert_eq!(config.collectd_root, Some(PathBuf::from("/opt/mcac/collectd")));
        assert_eq!(config.metric_update_gap_in_seconds(), 300);
        assert!(config.is_upload_enabled());
        assert_eq!(config.insights_token.as_deref(), Some("secret"));
        assert_eq!(config.filtering_rules.len(), 2);
        assert_eq!(config.filtering_rules[0].policy(), Policy::Deny);
        assert_eq!(config.filtering_rules[1].scope(), Scope::Restricted);

        let endpoint = config.upload_endpoint().unwrap();
        assert_eq!(
            endpoint,
            UploadEndpoint {
                host: "insights.example.com".to_string(),
                port: 443,
                path: "/api".to_string(),
                is_ssl: true,
            }
        );
    }

    #[test]
    fn short_upload_interval_is_the_update_gap() {
        let config = Configuration {
            upload_interval_in_seconds: 60,
            ..Default::default()
        };
        assert_eq!(config.metric_update_gap_in_seconds(), 60);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = Configuration::from_yaml("metric_sampling_interval: 10\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn invalid_rule_fails_loading() {
        let err = Configuration::from_yaml(
            "filtering_rules:\n  - policy: maybe\n    pattern: x\n    scope: global\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn zero_sampling_interval_is_invalid() {
        let err = Configuration::from_yaml("metric_sampling_interval_in_seconds: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field, .. } if field == "metric_sampling_interval_in_seconds"));
    }

    #[test]
    fn upload_url_is_validated() {
        assert!(UploadEndpoint::parse("ftp://example.com").is_err());
        assert!(UploadEndpoint::parse("/just/a/path").is_err());

        let endpoint = UploadEndpoint::parse("http://example.com:8080").unwrap();
        assert_eq!(endpoint.port, 8080);
        assert!(!endpoint.is_ssl);
        assert_eq!(endpoint.path, "/");
    }

    #[test]
    fn yaml_source_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "upload_interval_in_seconds: 120").unwrap();

        let source = YamlConfigSource::new(file.path());
        let config = source.load().unwrap();
        assert_eq!(config.upload_interval_in_seconds, 120);

        let missing = YamlConfigSource::new(file.path().with_extension("missing"));
        assert!(matches!(missing.load(), Err(ConfigError::Io { .. })));
    }
}
