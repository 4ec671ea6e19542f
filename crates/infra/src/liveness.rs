//! PID-file liveness marker for the worker pool.
//!
//! The marker doubles as an exclusion token (one pool per data directory) and
//! as the address for `worker stop`, which delivers SIGTERM to the recorded PID.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use queuectl_core::{QueueError, QueueResult};
use tracing::{debug, info, warn};

/// Result of asking a running pool to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// SIGTERM was delivered to this PID.
    Signalled(u32),
    /// No marker present.
    NotRunning,
    /// The marker named a process that no longer exists; it was removed.
    StaleMarkerRemoved(u32),
}

#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the marker exclusively and record the current PID.
    ///
    /// An existing marker is left untouched and reported as `AlreadyRunning`.
    pub fn acquire(&self) -> QueueResult<PidGuard> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(&self.path, e))?;
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(QueueError::AlreadyRunning {
                    path: self.path.clone(),
                    pid: self.read_pid(),
                });
            }
            Err(e) => return Err(io_error(&self.path, e)),
        };

        let pid = std::process::id();
        let guard = PidGuard {
            path: self.path.clone(),
            released: false,
        };
        // On write failure the guard drops and removes the half-written marker.
        writeln!(file, "{pid}").map_err(|e| io_error(&self.path, e))?;
        debug!(path = %self.path.display(), pid, "liveness marker acquired");
        Ok(guard)
    }

    /// PID recorded in the marker, if present and well formed.
    pub fn read_pid(&self) -> Option<u32> {
        fs::read_to_string(&self.path).ok()?.trim().parse().ok()
    }

    pub fn is_present(&self) -> bool {
        self.path.exists()
    }

    /// Marker present and naming a live process.
    pub fn is_running(&self) -> bool {
        self.read_pid().is_some_and(is_process_alive)
    }

    /// Send SIGTERM to the recorded pool and return without waiting.
    pub fn signal_stop(&self) -> QueueResult<StopOutcome> {
        if !self.is_present() {
            return Ok(StopOutcome::NotRunning);
        }
        let Some(pid) = self.read_pid() else {
            return Err(QueueError::storage(format!(
                "liveness marker {} does not contain a valid pid",
                self.path.display()
            )));
        };

        if !is_process_alive(pid) {
            warn!(pid, path = %self.path.display(), "removing stale liveness marker");
            remove_marker(&self.path)?;
            return Ok(StopOutcome::StaleMarkerRemoved(pid));
        }

        send_sigterm(pid)?;
        info!(pid, "stop signal sent to worker pool");
        Ok(StopOutcome::Signalled(pid))
    }
}

/// Removes the marker when released or dropped.
#[derive(Debug)]
pub struct PidGuard {
    path: PathBuf,
    released: bool,
}

impl PidGuard {
    pub fn release(mut self) -> QueueResult<()> {
        self.released = true;
        remove_marker(&self.path)?;
        debug!(path = %self.path.display(), "liveness marker released");
        Ok(())
    }
}

impl Drop for PidGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = remove_marker(&self.path) {
                warn!(error = %e, "failed to remove liveness marker");
            }
        }
    }
}

fn remove_marker(path: &Path) -> QueueResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_error(path, e)),
    }
}

fn io_error(path: &Path, e: std::io::Error) -> QueueError {
    QueueError::storage(format!("{}: {e}", path.display()))
}

/// Probe with signal 0. EPERM still means the process exists.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    true
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> QueueResult<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| QueueError::validation(format!("invalid pid {pid}")))?;
    kill(Pid::from_raw(raw), Signal::SIGTERM)
        .map_err(|e| QueueError::storage(format!("failed to signal pid {pid}: {e}")))
}

#[cfg(not(unix))]
fn send_sigterm(pid: u32) -> QueueResult<()> {
    Err(QueueError::validation(format!(
        "stopping pid {pid} is only supported on unix"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(dir: &tempfile::TempDir) -> PidFile {
        PidFile::new(dir.path().join("run").join("queuectl.pid"))
    }

    #[test]
    fn acquire_writes_pid_and_release_removes() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = marker(&dir);

        let guard = pid_file.acquire().unwrap();
        assert!(pid_file.is_present());
        assert_eq!(pid_file.read_pid(), Some(std::process::id()));
        assert!(pid_file.is_running());

        guard.release().unwrap();
        assert!(!pid_file.is_present());
    }

    #[test]
    fn second_acquire_is_refused_and_marker_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = marker(&dir);
        let _guard = pid_file.acquire().unwrap();

        match pid_file.acquire() {
            Err(QueueError::AlreadyRunning { pid, .. }) => {
                assert_eq!(pid, Some(std::process::id()))
            }
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
        assert_eq!(pid_file.read_pid(), Some(std::process::id()));
    }

    #[test]
    fn guard_drop_removes_marker() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = marker(&dir);
        {
            let _guard = pid_file.acquire().unwrap();
        }
        assert!(!pid_file.is_present());
        assert!(pid_file.acquire().is_ok());
    }

    #[test]
    fn stop_without_marker_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(marker(&dir).signal_stop().unwrap(), StopOutcome::NotRunning);
    }

    #[cfg(unix)]
    #[test]
    fn stop_removes_stale_marker() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = marker(&dir);
        fs::create_dir_all(pid_file.path().parent().unwrap()).unwrap();
        // Above the default pid_max, so never a live process.
        fs::write(pid_file.path(), "99999999\n").unwrap();

        assert!(!pid_file.is_running());
        assert_eq!(
            pid_file.signal_stop().unwrap(),
            StopOutcome::StaleMarkerRemoved(99_999_999)
        );
        assert!(!pid_file.is_present());
    }

    #[test]
    fn garbage_marker_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = marker(&dir);
        fs::create_dir_all(pid_file.path().parent().unwrap()).unwrap();
        fs::write(pid_file.path(), "not a pid").unwrap();

        assert_eq!(pid_file.read_pid(), None);
        assert!(pid_file.signal_stop().is_err());
    }
}
