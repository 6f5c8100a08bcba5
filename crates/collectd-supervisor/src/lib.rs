//! Supervision of the collectd daemon that receives the agent's metrics and insights.
//!
//! [`ProcessSupervisor`] locates the daemon shipped next to the agent, renders its two
//! configuration files (the daemon configuration and the insights upload
//! configuration), launches it through its wrapper script and tracks it through the PID
//! file the wrapper writes. Failures never escape as errors: they are reported as
//! [`ProcessState`](mcac_core::lifecycle::ProcessState) transitions and retried by the
//! client's health check.

use std::{
    io,
    path::{Path, PathBuf},
};

use nix::unistd::{AccessFlags, access};
use thiserror::Error;

mod daemon_config;
mod pid;
mod supervisor;
mod template;
mod upload_config;

pub use daemon_config::{DaemonConfig, DaemonConfigBuilder};
pub use mcac_core::lifecycle::{MAX_SOCKET_NAME, truncate_socket_path};
pub use pid::{DAEMON_NAME, find_daemon_pid};
pub use supervisor::{ProcessSupervisor, SupervisorOptions};
pub use template::{ConfigRenderer, TemplateRenderer};
pub use upload_config::{CA_CERT_FILE, UploadConfig};

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("collectd root missing {0}")]
    MissingRoot(PathBuf),
    #[error("{what} not writable {path}")]
    NotWritable { what: &'static str, path: PathBuf },
    #[error("{value} is not a valid value for field {field}: {err}")]
    InvalidValue {
        field: &'static str,
        value: String,
        err: String,
    },
    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("error parsing the {0} template")]
    TemplateParse(&'static str, #[source] leon::ParseError),
    #[error("error filling the {0} template")]
    TemplateRender(&'static str, #[source] leon::RenderError),
    #[error(transparent)]
    Config(#[from] mcac_core::config::ConfigError),
}

impl SupervisorError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        SupervisorError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Default socket location: a fresh name in the temporary directory.
pub fn default_socket_path() -> PathBuf {
    let name = format!("ds-{}.sock", uuid::Uuid::new_v4().simple());
    truncate_socket_path(&std::env::temp_dir().join(name))
}

/// Creates `path` if missing and checks the current user can write into it.
pub(crate) fn ensure_writable_dir(what: &'static str, path: &Path) -> Result<PathBuf, SupervisorError> {
    std::fs::create_dir_all(path)
        .map_err(|err| SupervisorError::io(format!("creating {what} {}", path.display()), err))?;

    if access(path, AccessFlags::W_OK).is_err() {
        return Err(SupervisorError::NotWritable {
            what,
            path: path.to_path_buf(),
        });
    }

    std::path::absolute(path)
        .map_err(|err| SupervisorError::io(format!("resolving {what} {}", path.display()), err))
}
