use std::{
    net::ToSocketAddrs,
    path::{Path, PathBuf},
};

use mcac_core::config::Configuration;

use crate::{SupervisorError, ensure_writable_dir};

/// CA bundle shipped with the daemon, relative to its root.
pub const CA_CERT_FILE: &str = "etc/ssl/certs/ca-certificates.crt";

const MIN_DATA_DIR_SIZE_BYTES: u64 = 1 << 20;

/// Settings of the daemon's insights plugin: where and how often to upload, and how much
/// to keep on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadConfig {
    /// True when either upload or streaming is enabled.
    pub upload_enabled: bool,
    pub streaming_enabled: bool,
    pub write_to_disk_enabled: bool,
    /// `None` when uploading is enabled but the host does not resolve.
    pub host: Option<String>,
    pub port: u16,
    pub http_path: String,
    pub is_ssl: bool,
    pub upload_interval_sec: u64,
    pub metric_update_gap_sec: u64,
    pub max_data_dir_size_bytes: u64,
    pub token: Option<String>,
    pub data_dir: PathBuf,
    pub ca_cert_file: PathBuf,
}

impl UploadConfig {
    pub fn from_configuration(config: &Configuration) -> Result<Self, SupervisorError> {
        let endpoint = config.upload_endpoint()?;
        let upload_enabled = config.is_upload_enabled();

        let max_data_dir_size_bytes = config.data_dir_max_size_in_mb.saturating_mul(1_000_000);
        if max_data_dir_size_bytes <= MIN_DATA_DIR_SIZE_BYTES {
            return Err(SupervisorError::InvalidValue {
                field: "data_dir_max_size_in_mb",
                value: config.data_dir_max_size_in_mb.to_string(),
                err: "size must be > 1mb".to_string(),
            });
        }

        let host = if upload_enabled && !resolves(&endpoint.host, endpoint.port) {
            log::warn!(
                "Insights upload host {} cannot be resolved, uploads will not be attempted",
                endpoint.host
            );
            None
        } else {
            Some(endpoint.host)
        };

        Ok(Self {
            upload_enabled,
            streaming_enabled: config.insights_streaming_enabled,
            write_to_disk_enabled: config.write_to_disk_enabled,
            host,
            port: endpoint.port,
            http_path: endpoint.path,
            is_ssl: endpoint.is_ssl,
            upload_interval_sec: config.upload_interval_in_seconds,
            metric_update_gap_sec: config.metric_update_gap_in_seconds(),
            max_data_dir_size_bytes,
            token: config.insights_token.clone(),
            data_dir: ensure_writable_dir("dataDir", &config.data_dir)?,
            ca_cert_file: Path::new(CA_CERT_FILE).to_path_buf(),
        })
    }
}

fn resolves(host: &str, port: u16) -> bool {
    (host, port)
        .to_socket_addrs()
        .map(|mut addrs| addrs.next().is_some())
        .unwrap_or(false)
}
