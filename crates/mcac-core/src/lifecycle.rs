//! Seams between the telemetry client, the daemon supervisor and event producers.

use std::{
    ffi::OsStr,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

use strum::Display;

use crate::{config::Configuration, insight::Insight};

/// Longest unix socket path accepted by the daemon, see unix(7).
pub const MAX_SOCKET_NAME: usize = 103;

/// Crops `path` to [`MAX_SOCKET_NAME`] bytes, logging a warning when it had to.
pub fn truncate_socket_path(path: &Path) -> PathBuf {
    let bytes = path.as_os_str().as_bytes();
    if bytes.len() <= MAX_SOCKET_NAME {
        return path.to_path_buf();
    }

    let cropped = PathBuf::from(OsStr::from_bytes(&bytes[..MAX_SOCKET_NAME]));
    log::warn!(
        "The unix socket ({}) path is greater than the unix standard limit, cropping to {}",
        path.display(),
        cropped.display()
    );
    cropped
}

/// State of the supervised daemon process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    /// Never started.
    #[default]
    Init,
    /// Last operation failed in a way that leaves the process state unclear.
    Unknown,
    /// PID confirmed alive.
    Started,
    /// Explicitly terminated.
    Stopped,
    /// Executable missing, not executable, or never came up.
    Broken,
}

/// Lifecycle of the external daemon the client talks to.
///
/// Every method reports failures as a state transition, never as an error.
pub trait DaemonLifecycle: Send + Sync {
    fn start(&self, socket_path: &Path, config: &Configuration) -> ProcessState;

    fn health_check(&self) -> bool;

    fn stop(&self) -> ProcessState;

    /// Regenerates the upload configuration of a running daemon.
    fn reload_plugin(&self, config: &Configuration) -> ProcessState;

    fn state(&self) -> ProcessState;
}

/// Receiver of structured events.
pub trait EventSink: Send + Sync {
    /// Returns false when the event could not be delivered.
    fn report_event(&self, insight: &Insight) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_socket_path_is_truncated_to_limit() {
        let long = PathBuf::from(format!("/tmp/{}.sock", "s".repeat(150)));
        let truncated = truncate_socket_path(&long);
        assert_eq!(truncated.as_os_str().len(), MAX_SOCKET_NAME);
        assert!(long.as_os_str().as_bytes().starts_with(truncated.as_os_str().as_bytes()));

        let short = PathBuf::from("/tmp/ds.sock");
        assert_eq!(truncate_socket_path(&short), short);
    }
}
