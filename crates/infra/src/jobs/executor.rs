//! Command execution through the host shell.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Exit status 0
    Succeeded,
    /// Non-zero exit, or terminated by a signal (`None`)
    Exited(Option<i32>),
    /// The shell could not be spawned
    SpawnFailed(String),
    /// Killed after exceeding the command timeout
    TimedOut(Duration),
    /// Killed because the pool's shutdown grace expired
    Killed,
}

/// Result of one command execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    /// Captured stdout followed by stderr
    pub output: String,
}

impl ExecutionResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Succeeded,
            output: output.into(),
        }
    }

    pub fn failure(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Exited(Some(exit_code)),
            output: output.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Succeeded
    }

    /// One-line reason for logs; `None` on success.
    pub fn failure_reason(&self) -> Option<String> {
        match &self.status {
            ExecutionStatus::Succeeded => None,
            ExecutionStatus::Exited(Some(code)) => Some(format!("exit status {code}")),
            ExecutionStatus::Exited(None) => Some("terminated by signal".to_string()),
            ExecutionStatus::SpawnFailed(e) => Some(format!("failed to spawn: {e}")),
            ExecutionStatus::TimedOut(after) => Some(format!("timed out after {after:?}")),
            ExecutionStatus::Killed => Some("killed during shutdown".to_string()),
        }
    }
}

/// Runs a job's command line.
///
/// `kill` is cancelled by the pool manager when the shutdown grace expires;
/// implementations must stop the command promptly once it fires.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &str, kill: &CancellationToken) -> ExecutionResult;
}

/// Executes commands with `sh -c`, capturing combined output.
///
/// No sandboxing: the command runs with the worker's privileges.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
    timeout: Option<Duration>,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            timeout: None,
        }
    }
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, command: &str, kill: &CancellationToken) -> ExecutionResult {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a kill reaches everything the command started.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(shell = %self.shell, error = %e, "failed to spawn command");
                return ExecutionResult {
                    status: ExecutionStatus::SpawnFailed(e.to_string()),
                    output: String::new(),
                };
            }
        };

        let stdout = child.stdout.take().map(|out| tokio::spawn(read_all(out)));
        let stderr = child.stderr.take().map(|err| tokio::spawn(read_all(err)));

        let timeout = self.timeout;
        let deadline = async move {
            match timeout {
                Some(after) => tokio::time::sleep(after).await,
                None => std::future::pending::<()>().await,
            }
        };

        let interrupted = tokio::select! {
            waited = child.wait() => match waited {
                Ok(status) => {
                    let mut output = collect(stdout).await;
                    output.push_str(&collect(stderr).await);
                    let status = if status.success() {
                        ExecutionStatus::Succeeded
                    } else {
                        ExecutionStatus::Exited(status.code())
                    };
                    return ExecutionResult { status, output };
                }
                Err(e) => ExecutionStatus::SpawnFailed(e.to_string()),
            },
            _ = deadline => {
                let after = timeout.unwrap_or_default();
                debug!(timeout = ?after, "command timed out, killing");
                ExecutionStatus::TimedOut(after)
            }
            _ = kill.cancelled() => {
                debug!("shutdown grace expired, killing command");
                ExecutionStatus::Killed
            }
        };

        kill_process_group(&mut child);
        if let Err(e) = child.wait().await {
            warn!(error = %e, "failed to reap killed command");
        }
        for reader in [stdout, stderr].into_iter().flatten() {
            reader.abort();
        }

        ExecutionResult {
            status: interrupted,
            output: String::new(),
        }
    }
}

async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        debug!(error = %e, "failed to read command output");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn collect(reader: Option<JoinHandle<String>>) -> String {
    match reader {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    }
}

/// SIGKILL the command's whole process group, then the shell itself.
fn kill_process_group(child: &mut Child) {
    #[cfg(unix)]
    if let Some(raw) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Err(e) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
            debug!(pid = raw, error = %e, "failed to kill process group");
        }
    }
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "failed to kill command");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[tokio::test]
    async fn zero_exit_is_success_with_output() {
        let result = ShellExecutor::new()
            .execute("echo hello; echo oops 1>&2", &CancellationToken::new())
            .await;
        assert!(result.is_success());
        assert!(result.output.contains("hello"));
        assert!(result.output.contains("oops"));
        assert_eq!(result.failure_reason(), None);
    }

    #[tokio::test]
    async fn non_zero_exit_is_failure() {
        let result = ShellExecutor::new().execute("exit 3", &CancellationToken::new()).await;
        assert_eq!(result.status, ExecutionStatus::Exited(Some(3)));
        assert_eq!(result.failure_reason().unwrap(), "exit status 3");
    }

    #[tokio::test]
    async fn unknown_command_is_failure() {
        let result = ShellExecutor::new()
            .execute("definitely-not-a-real-command-xyz", &CancellationToken::new())
            .await;
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn missing_shell_is_spawn_failure() {
        let result = ShellExecutor::new()
            .with_shell("/nonexistent/shell")
            .execute("true", &CancellationToken::new())
            .await;
        assert!(matches!(result.status, ExecutionStatus::SpawnFailed(_)));
    }

    #[tokio::test]
    async fn timeout_kills_long_commands() {
        let started = Instant::now();
        let result = ShellExecutor::new()
            .with_timeout(Some(Duration::from_millis(100)))
            .execute("sleep 10", &CancellationToken::new())
            .await;
        assert_eq!(result.status, ExecutionStatus::TimedOut(Duration::from_millis(100)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_the_whole_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("survived");
        let command = format!("(sleep 1; echo survived > '{}') | cat", marker.display());

        let result = ShellExecutor::new()
            .with_timeout(Some(Duration::from_millis(200)))
            .execute(&command, &CancellationToken::new())
            .await;
        assert_eq!(result.status, ExecutionStatus::TimedOut(Duration::from_millis(200)));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!marker.exists(), "a process started by the command outlived the timeout");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_token_reaches_background_processes() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("survived");
        let command = format!("(sleep 1; touch '{}') & wait", marker.display());

        let kill = CancellationToken::new();
        let trigger = kill.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = ShellExecutor::new().execute(&command, &kill).await;
        assert_eq!(result.status, ExecutionStatus::Killed);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!marker.exists(), "a background process outlived the kill");
    }

    #[tokio::test]
    async fn kill_token_stops_running_command() {
        let kill = CancellationToken::new();
        let trigger = kill.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = ShellExecutor::new().execute("sleep 10", &kill).await;
        assert_eq!(result.status, ExecutionStatus::Killed);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
