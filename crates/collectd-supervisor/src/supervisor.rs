use std::{
    path::{Path, PathBuf},
    process::Command,
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant},
};

use mcac_core::{
    config::{Configuration, NodeIdentity},
    lifecycle::{DaemonLifecycle, ProcessState},
};
use nix::{
    sys::signal::{Signal, kill},
    unistd::{AccessFlags, Pid, access},
};

use crate::{
    ConfigRenderer, DaemonConfig, SupervisorError, UploadConfig, daemon_config::GeneratedFile,
    pid::find_daemon_pid,
};

const WRAPPER: &str = "usr/sbin/collectd_wrapper";

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub identity: NodeIdentity,
    /// The daemon is managed out-of-band: never spawn it and always report it healthy.
    pub external_daemon: bool,
    /// How long to wait for the PID file after launching the daemon.
    pub pid_wait: Duration,
    pub pid_poll_interval: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            identity: NodeIdentity::default(),
            external_daemon: false,
            pid_wait: Duration::from_secs(5),
            pid_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Owner of the daemon process.
///
/// All operations are serialized through one lock. The generated configuration files
/// live as long as the supervisor and are removed when it is dropped.
pub struct ProcessSupervisor {
    options: SupervisorOptions,
    renderer: Box<dyn ConfigRenderer>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    tracked: Tracked,
    daemon_config: Option<DaemonConfig>,
    files: Option<GeneratedFiles>,
}

#[derive(Default)]
struct Tracked {
    state: ProcessState,
    pid: Option<i32>,
}

struct GeneratedFiles {
    daemon: GeneratedFile,
    upload: GeneratedFile,
}

impl GeneratedFiles {
    fn create() -> Result<Self, SupervisorError> {
        Ok(Self {
            daemon: GeneratedFile::create("ds-collectd-")?,
            upload: GeneratedFile::create("ds-collectd-insights-")?,
        })
    }
}

impl Tracked {
    fn stop(&mut self) -> ProcessState {
        let pid = match self.pid {
            Some(pid) if self.state != ProcessState::Stopped => pid,
            _ => return self.state,
        };

        self.state = match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => {
                log::info!("Stopped collectd (pid {pid})");
                ProcessState::Stopped
            }
            Err(err) => {
                log::error!("Error stopping collectd (pid {pid}): {err}");
                ProcessState::Unknown
            }
        };
        self.pid = None;
        self.state
    }

    /// Looks the daemon up through its PID file. A tracked daemon whose PID file
    /// disappeared is stopped.
    fn find_pid(&mut self, pid_file: &Path) -> Option<i32> {
        if !pid_file.exists() {
            if self.pid.is_some() {
                log::warn!(
                    "PID file {} is gone, stopping tracked collectd",
                    pid_file.display()
                );
                self.stop();
            }
            return None;
        }
        find_daemon_pid(pid_file)
    }
}

impl ProcessSupervisor {
    pub fn new(options: SupervisorOptions, renderer: Box<dyn ConfigRenderer>) -> Self {
        Self {
            options,
            renderer,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn pid(&self) -> Option<i32> {
        self.lock().tracked.pid
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn daemon_root(config: &Configuration) -> Option<PathBuf> {
        if let Some(root) = &config.collectd_root {
            return Some(root.clone());
        }
        let exe = std::env::current_exe().ok()?;
        Some(exe.parent()?.join("collectd"))
    }

    fn find_executable(root: &Path) -> Option<PathBuf> {
        let wrapper = root.join(WRAPPER);
        if !wrapper.is_file() {
            log::error!("collectd wrapper missing: {}", wrapper.display());
            return None;
        }
        if access(&wrapper, AccessFlags::X_OK).is_err() {
            log::error!("collectd wrapper not executable: {}", wrapper.display());
            return None;
        }
        Some(wrapper)
    }

    fn try_start(
        &self,
        inner: &mut Inner,
        socket_path: &Path,
        config: &Configuration,
    ) -> Result<ProcessState, SupervisorError> {
        let root = match Self::daemon_root(config) {
            Some(root) if root.is_dir() => root,
            root => {
                log::error!(
                    "collectd root missing {}",
                    root.unwrap_or_default().display()
                );
                return Ok(ProcessState::Broken);
            }
        };

        if inner.files.is_none() {
            inner.files = Some(GeneratedFiles::create()?);
        }
        let Inner {
            tracked,
            daemon_config: current_config,
            files: Some(files),
        } = inner
        else {
            return Ok(ProcessState::Unknown);
        };

        let daemon_config = DaemonConfig::builder()
            .with_root(&root)?
            .with_log_dir(&config.log_dir)?
            .with_socket_path(socket_path)
            .with_config_files(files.daemon.path(), files.upload.path())
            .with_identity(self.options.identity.clone())
            .build()?;

        if let Some(pid) = tracked.find_pid(&daemon_config.pid_file) {
            log::info!("Stopping previous collectd instance (pid {pid})");
            tracked.pid = Some(pid);
            tracked.state = ProcessState::Started;
            tracked.stop();
        }

        let Some(executable) = Self::find_executable(&daemon_config.root) else {
            *current_config = Some(daemon_config);
            return Ok(ProcessState::Broken);
        };

        files
            .daemon
            .write(&self.renderer.render_daemon_config(&daemon_config)?)?;
        let upload_config = UploadConfig::from_configuration(config)?;
        files
            .upload
            .write(&self.renderer.render_upload_config(&upload_config)?)?;

        log::info!("Starting collectd with {}", daemon_config.config_file.display());
        let output = Command::new(&executable)
            .arg("-C")
            .arg(&daemon_config.config_file)
            .arg("-P")
            .arg(&daemon_config.pid_file)
            .env("BASEDIR", &daemon_config.root)
            .env("LD_PRELOAD", "")
            .env("DYLD_INSERT_LIBRARIES", "")
            .output()
            .map_err(|err| SupervisorError::io(format!("running {}", executable.display()), err))?;

        let pid_file = daemon_config.pid_file.clone();
        *current_config = Some(daemon_config);

        if !output.status.success() {
            for line in String::from_utf8_lossy(&output.stderr).lines() {
                log::error!("{line}");
            }
            log::error!("Exit code {:?}", output.status.code());
            return Ok(ProcessState::Unknown);
        }

        let deadline = Instant::now() + self.options.pid_wait;
        loop {
            if let Some(pid) = tracked.find_pid(&pid_file) {
                log::info!("collectd started (pid {pid})");
                tracked.pid = Some(pid);
                return Ok(ProcessState::Started);
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(self.options.pid_poll_interval);
        }

        log::error!("collectd did not start within {:?}", self.options.pid_wait);
        Ok(ProcessState::Broken)
    }
}

impl DaemonLifecycle for ProcessSupervisor {
    fn start(&self, socket_path: &Path, config: &Configuration) -> ProcessState {
        let mut inner = self.lock();

        if self.options.external_daemon {
            log::info!("collectd is managed externally, using {}", socket_path.display());
            inner.tracked.state = ProcessState::Started;
            inner.tracked.pid = None;
            return ProcessState::Started;
        }

        let state = match self.try_start(&mut inner, socket_path, config) {
            Ok(state) => state,
            Err(err) => {
                log::error!("Error starting collectd: {err}");
                ProcessState::Unknown
            }
        };
        inner.tracked.state = state;
        state
    }

    fn health_check(&self) -> bool {
        if self.options.external_daemon {
            return true;
        }

        let mut inner = self.lock();
        let Inner {
            tracked,
            daemon_config,
            ..
        } = &mut *inner;

        let (Some(pid), Some(daemon_config)) = (tracked.pid, daemon_config.as_ref()) else {
            return false;
        };
        if tracked.state != ProcessState::Started {
            return false;
        }

        tracked.find_pid(&daemon_config.pid_file) == Some(pid)
    }

    fn stop(&self) -> ProcessState {
        self.lock().tracked.stop()
    }

    fn reload_plugin(&self, config: &Configuration) -> ProcessState {
        let mut inner = self.lock();
        if inner.tracked.state != ProcessState::Started {
            log::trace!("not reloading, plugin is not started");
            return inner.tracked.state;
        }
        let Some(files) = inner.files.as_ref() else {
            return inner.tracked.state;
        };

        log::info!("Generating new insights upload config");
        let result = UploadConfig::from_configuration(config)
            .and_then(|upload| self.renderer.render_upload_config(&upload))
            .and_then(|text| files.upload.write(&text));
        if let Err(err) = result {
            log::error!("Error reloading: {err}");
            inner.tracked.state = ProcessState::Unknown;
        }

        log::debug!("Insights reloaded {}", inner.tracked.state);
        inner.tracked.state
    }

    fn state(&self) -> ProcessState {
        self.lock().tracked.state
    }
}
