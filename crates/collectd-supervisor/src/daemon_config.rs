use std::{
    fs::{self, Permissions},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use mcac_core::{config::NodeIdentity, lifecycle::truncate_socket_path};
use tempfile::NamedTempFile;

use crate::{SupervisorError, ensure_writable_dir};

const PID_FILE_NAME: &str = "ds-collectd.pid";

/// Settings rendered into the daemon's main configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub root: PathBuf,
    pub log_dir: PathBuf,
    pub socket_path: PathBuf,
    pub pid_file: PathBuf,
    pub config_file: PathBuf,
    pub upload_config_file: PathBuf,
    pub identity: NodeIdentity,
}

impl DaemonConfig {
    pub fn builder() -> DaemonConfigBuilder {
        DaemonConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct DaemonConfigBuilder {
    root: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    socket_path: Option<PathBuf>,
    config_file: Option<PathBuf>,
    upload_config_file: Option<PathBuf>,
    identity: NodeIdentity,
}

impl DaemonConfigBuilder {
    pub fn with_root(mut self, root: &Path) -> Result<Self, SupervisorError> {
        if !root.is_dir() {
            return Err(SupervisorError::MissingRoot(root.to_path_buf()));
        }
        let root = std::path::absolute(root)
            .map_err(|err| SupervisorError::io(format!("resolving {}", root.display()), err))?;
        self.root = Some(root);
        Ok(self)
    }

    /// The directory is created if missing.
    pub fn with_log_dir(mut self, log_dir: &Path) -> Result<Self, SupervisorError> {
        self.log_dir = Some(ensure_writable_dir("logDir", log_dir)?);
        Ok(self)
    }

    pub fn with_socket_path(mut self, socket_path: &Path) -> Self {
        self.socket_path = Some(truncate_socket_path(socket_path));
        self
    }

    pub fn with_config_files(mut self, config_file: &Path, upload_config_file: &Path) -> Self {
        self.config_file = Some(config_file.to_path_buf());
        self.upload_config_file = Some(upload_config_file.to_path_buf());
        self
    }

    pub fn with_identity(mut self, identity: NodeIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn build(self) -> Result<DaemonConfig, SupervisorError> {
        let missing = |field: &'static str| SupervisorError::InvalidValue {
            field,
            value: String::new(),
            err: "required".to_string(),
        };

        let log_dir = self.log_dir.ok_or_else(|| missing("log_dir"))?;
        Ok(DaemonConfig {
            root: self.root.ok_or_else(|| missing("collectd_root"))?,
            pid_file: log_dir.join(PID_FILE_NAME),
            log_dir,
            socket_path: self.socket_path.ok_or_else(|| missing("socket_path"))?,
            config_file: self.config_file.ok_or_else(|| missing("config_file"))?,
            upload_config_file: self
                .upload_config_file
                .ok_or_else(|| missing("upload_config_file"))?,
            identity: self.identity,
        })
    }
}

/// Configuration file readable and writable by the owner only, removed when dropped.
#[derive(Debug)]
pub(crate) struct GeneratedFile {
    file: NamedTempFile,
}

impl GeneratedFile {
    pub(crate) fn create(prefix: &str) -> Result<Self, SupervisorError> {
        let file = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".conf")
            .permissions(Permissions::from_mode(0o600))
            .tempfile()
            .map_err(|err| SupervisorError::io(format!("creating {prefix}*.conf"), err))?;
        Ok(Self { file })
    }

    pub(crate) fn path(&self) -> &Path {
        self.file.path()
    }

    pub(crate) fn write(&self, contents: &str) -> Result<(), SupervisorError> {
        fs::write(self.path(), contents)
            .map_err(|err| SupervisorError::io(format!("writing {}", self.path().display()), err))
    }
}
