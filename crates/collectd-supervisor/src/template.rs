use std::{borrow::Cow, collections::HashMap};

use crate::{DaemonConfig, SupervisorError, UploadConfig};

const DAEMON_TEMPLATE: &str = include_str!("../templates/collectd.conf.leon");
const UPLOAD_TEMPLATE: &str = include_str!("../templates/insights.conf.leon");

/// Produces the text of the daemon's configuration files.
pub trait ConfigRenderer: Send + Sync {
    fn render_daemon_config(&self, config: &DaemonConfig) -> Result<String, SupervisorError>;

    fn render_upload_config(&self, config: &UploadConfig) -> Result<String, SupervisorError>;
}

/// [`ConfigRenderer`] backed by the bundled leon templates.
pub struct TemplateRenderer {
    daemon: leon::Template<'static>,
    upload: leon::Template<'static>,
}

impl TemplateRenderer {
    pub fn new() -> Result<Self, SupervisorError> {
        Ok(Self {
            daemon: leon::Template::parse(DAEMON_TEMPLATE)
                .map_err(|err| SupervisorError::TemplateParse("collectd", err))?,
            upload: leon::Template::parse(UPLOAD_TEMPLATE)
                .map_err(|err| SupervisorError::TemplateParse("insights", err))?,
        })
    }
}

fn path_value(path: &std::path::Path) -> Cow<'_, str> {
    path.to_string_lossy()
}

impl ConfigRenderer for TemplateRenderer {
    fn render_daemon_config(&self, config: &DaemonConfig) -> Result<String, SupervisorError> {
        let mut values = HashMap::new();

        values.insert("hostname", Cow::from(config.identity.host.as_str()));
        values.insert("cluster", config.identity.cluster.as_str().into());
        values.insert("data_center", config.identity.datacenter.as_str().into());
        values.insert("rack", config.identity.rack.as_str().into());
        values.insert("collectd_root", path_value(&config.root));
        values.insert("log_dir", path_value(&config.log_dir));
        values.insert("socket_file", path_value(&config.socket_path));
        values.insert(
            "insights_config_file",
            path_value(&config.upload_config_file),
        );

        self.daemon
            .render(&values)
            .map_err(|err| SupervisorError::TemplateRender("collectd", err))
    }

    fn render_upload_config(&self, config: &UploadConfig) -> Result<String, SupervisorError> {
        let mut values = HashMap::new();

        values.insert("upload_enabled", Cow::from(config.upload_enabled.to_string()));
        values.insert("streaming_enabled", config.streaming_enabled.to_string().into());
        values.insert(
            "write_to_disk_enabled",
            config.write_to_disk_enabled.to_string().into(),
        );
        values.insert("host", config.host.as_deref().unwrap_or_default().into());
        values.insert("port", config.port.to_string().into());
        values.insert("http_path", config.http_path.as_str().into());
        values.insert("is_ssl", config.is_ssl.to_string().into());
        values.insert("ca_cert_file", path_value(&config.ca_cert_file));
        values.insert("token", config.token.as_deref().unwrap_or_default().into());
        values.insert(
            "upload_interval_sec",
            config.upload_interval_sec.to_string().into(),
        );
        values.insert(
            "metric_update_gap_sec",
            config.metric_update_gap_sec.to_string().into(),
        );
        values.insert(
            "max_data_dir_size_bytes",
            config.max_data_dir_size_bytes.to_string().into(),
        );
        values.insert("data_dir", path_value(&config.data_dir));

        self.upload
            .render(&values)
            .map_err(|err| SupervisorError::TemplateRender("insights", err))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use mcac_core::config::NodeIdentity;

    use super::*;

    #[test]
    fn templates_parse() {
        assert!(TemplateRenderer::new().is_ok())
    }

    #[test]
    fn daemon_template_fill() {
        let renderer = TemplateRenderer::new().unwrap();
        let config = DaemonConfig {
            root: PathBuf::from("/opt/mcac/collectd"),
            log_dir: PathBuf::from("/var/log/mcac"),
            socket_path: PathBuf::from("/tmp/ds-1.sock"),
            pid_file: PathBuf::from("/var/log/mcac/ds-collectd.pid"),
            config_file: PathBuf::from("/tmp/ds-collectd-1.conf"),
            upload_config_file: PathBuf::from("/tmp/ds-collectd-insights-1.conf"),
            identity: NodeIdentity {
                host: "10.0.0.1".to_string(),
                datacenter: "dc1".to_string(),
                rack: "r1".to_string(),
                cluster: "Test Cluster".to_string(),
            },
        };

        let text = renderer.render_daemon_config(&config).unwrap();
        assert!(text.contains("Hostname \"10.0.0.1\""));
        assert!(text.contains("SocketFile \"/tmp/ds-1.sock\""));
        assert!(text.contains("MetaData \"cluster\" \"Test Cluster\""));
        assert!(text.contains("Include \"/tmp/ds-collectd-insights-1.conf\""));
    }

    #[test]
    fn upload_template_fill() {
        let renderer = TemplateRenderer::new().unwrap();
        let config = UploadConfig {
            upload_enabled: true,
            streaming_enabled: false,
            write_to_disk_enabled: true,
            host: None,
            port: 443,
            http_path: "/".to_string(),
            is_ssl: true,
            upload_interval_sec: 300,
            metric_update_gap_sec: 300,
            max_data_dir_size_bytes: 5_000_000_000,
            token: Some("abc".to_string()),
            data_dir: PathBuf::from("/var/lib/mcac"),
            ca_cert_file: PathBuf::from(crate::CA_CERT_FILE),
        };

        let text = renderer.render_upload_config(&config).unwrap();
        assert!(text.contains("UploadEnabled true"));
        assert!(text.contains("Host \"\""));
        assert!(text.contains("Token \"abc\""));
        assert!(text.contains("MaxDataDirSizeBytes 5000000000"));
    }
}
