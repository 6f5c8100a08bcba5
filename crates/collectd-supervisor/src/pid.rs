use std::{fs, path::Path};

use procfs::process::Process;

/// Substring expected in the command line of the daemon process.
pub const DAEMON_NAME: &str = "collectd";

/// Reads the PID file and returns the PID if it belongs to a live daemon process.
pub fn find_daemon_pid(pid_file: &Path) -> Option<i32> {
    let contents = fs::read_to_string(pid_file).ok()?;
    let pid = match contents.lines().next().map(str::trim).map(str::parse::<i32>) {
        Some(Ok(pid)) if pid > 0 => pid,
        _ => {
            log::debug!("Invalid pid file {}", pid_file.display());
            return None;
        }
    };

    if is_daemon_process(pid) {
        Some(pid)
    } else {
        log::debug!("Process {pid} from {} is not {DAEMON_NAME}", pid_file.display());
        None
    }
}

fn is_daemon_process(pid: i32) -> bool {
    let Ok(process) = Process::new(pid) else {
        return false;
    };
    match process.cmdline() {
        Ok(cmdline) => cmdline.join(" ").to_lowercase().contains(DAEMON_NAME),
        Err(err) => {
            log::debug!("Cannot read command line of {pid}: {err}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_or_invalid_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("ds-collectd.pid");
        assert_eq!(find_daemon_pid(&pid_file), None);

        fs::write(&pid_file, "not a pid\n").unwrap();
        assert_eq!(find_daemon_pid(&pid_file), None);
    }

    #[test]
    fn live_process_with_other_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("ds-collectd.pid");
        let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        fs::write(&pid_file, format!("{}\n", child.id())).unwrap();
        assert_eq!(find_daemon_pid(&pid_file), None);
        child.kill().unwrap();
        child.wait().unwrap();
    }
}
