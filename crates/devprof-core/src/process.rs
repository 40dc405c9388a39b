//! External process control
//!
//! [`ProcessController`] owns one spawned dev-server process for its whole
//! lifetime. Standard input is inherited; standard output and error are
//! captured and forwarded to `trace` logs without being interpreted.
//!
//! On unix the child is placed in its own process group so that
//! [`ProcessController::cancel`] can deliver SIGINT to the shell and to
//! everything the shell started, the same way Ctrl+C would.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::error::{ProfileError, ProfileResult};

/// Environment variable that makes the dev server emit spans to a collector.
pub const TRACE_TARGET_ENV: &str = "TRACE_TARGET";

/// What to launch and with which extra environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Shell command line, run through `sh -c` (`cmd /C` on Windows)
    pub command: String,
    /// Added on top of the inherited environment
    pub env: BTreeMap<String, String>,
    pub current_dir: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            env: BTreeMap::new(),
            current_dir: None,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Ask the child to emit trace spans to `target` (e.g. `ZIPKIN`).
    pub fn with_trace_target(self, target: impl Into<String>) -> Self {
        self.with_env(TRACE_TARGET_ENV, target)
    }

    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    fn to_command(&self) -> Command {
        #[cfg(unix)]
        let mut cmd = {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&self.command);
            cmd.process_group(0);
            cmd
        };

        #[cfg(not(unix))]
        let mut cmd = {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(&self.command);
            cmd
        };

        cmd.envs(&self.env)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }

        cmd
    }
}

/// How the process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    /// Terminating signal number (unix only)
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Handle to a running (or finished) external process
#[derive(Debug)]
pub struct ProcessController {
    command: String,
    pid: Option<u32>,
    exit: watch::Receiver<Option<ExitInfo>>,
    #[cfg(not(unix))]
    kill: std::sync::Arc<tokio::sync::Notify>,
}

impl ProcessController {
    /// Spawn the process. Must be called from within a tokio runtime.
    ///
    /// Fails immediately with [`ProfileError::SpawnFailure`] when the OS
    /// refuses to start it.
    pub fn start(spec: &LaunchSpec) -> ProfileResult<Self> {
        let mut child = spec
            .to_command()
            .spawn()
            .map_err(|e| ProfileError::spawn_failure(&spec.command, e))?;

        let pid = child.id();
        info!(command = %spec.command, pid = ?pid, "Spawned external process");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, "stdout", pid));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, "stderr", pid));
        }

        let (tx, rx) = watch::channel(None);

        #[cfg(not(unix))]
        let kill = std::sync::Arc::new(tokio::sync::Notify::new());
        #[cfg(not(unix))]
        let kill_requested = std::sync::Arc::clone(&kill);

        let command = spec.command.clone();
        tokio::spawn(async move {
            #[cfg(not(unix))]
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_requested.notified() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            #[cfg(unix)]
            let status = child.wait().await;

            let info = match status {
                Ok(status) => ExitInfo::from(status),
                Err(e) => {
                    warn!(command = %command, error = %e, "Failed to wait for process");
                    ExitInfo {
                        code: None,
                        signal: None,
                    }
                }
            };
            info!(command = %command, code = ?info.code, signal = ?info.signal, "External process exited");
            let _ = tx.send(Some(info));
        });

        Ok(Self {
            command: spec.command.clone(),
            pid,
            exit: rx,
            #[cfg(not(unix))]
            kill,
        })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Ask the process to stop with an interrupt. Idempotent; a no-op once
    /// the process has exited.
    pub fn cancel(&self) -> ProfileResult<()> {
        if self.has_exited() {
            return Ok(());
        }
        let Some(pid) = self.pid else {
            return Ok(());
        };

        debug!(command = %self.command, pid, "Interrupting external process");
        self.interrupt(pid)
    }

    #[cfg(unix)]
    fn interrupt(&self, pid: u32) -> ProfileResult<()> {
        // Negative pid targets the whole process group.
        let ret = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGINT) };
        if ret == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(ProfileError::Signal { pid, source: err });
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn interrupt(&self, _pid: u32) -> ProfileResult<()> {
        self.kill.notify_one();
        Ok(())
    }

    /// Wait for the process to exit. Every call yields the same result.
    pub async fn await_exit(&self) -> ProfileResult<ExitInfo> {
        let mut exit = self.exit.clone();
        let info = *exit.wait_for(Option::is_some).await.map_err(|_| {
            ProfileError::Io(std::io::Error::other("process monitor stopped unexpectedly"))
        })?;
        info.ok_or_else(|| ProfileError::Io(std::io::Error::other("exit status missing")))
    }

    /// Interrupt the process and wait for it to exit.
    pub async fn stop(&self) -> ProfileResult<ExitInfo> {
        self.cancel()?;
        self.await_exit().await
    }
}

impl Drop for ProcessController {
    fn drop(&mut self) {
        if !self.has_exited()
            && let Err(e) = self.cancel()
        {
            warn!(command = %self.command, error = %e, "Failed to interrupt process on drop");
        }
    }
}

async fn forward_output<R>(reader: R, stream: &'static str, pid: Option<u32>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end_matches(['\n', '\r']);
                trace!(target: "devprof::child", pid = ?pid, stream, "{text}");
            }
            Err(e) => {
                // Keep the pipe drained so the child never blocks or sees SIGPIPE.
                debug!(target: "devprof::child", pid = ?pid, stream, error = %e, "Output no longer forwarded");
                let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn reports_exit_code() {
        let process = ProcessController::start(&LaunchSpec::new("exit 3")).unwrap();
        let exit = process.await_exit().await.unwrap();
        assert_eq!(exit.code, Some(3));
        assert!(!exit.success());
    }

    #[tokio::test]
    async fn passes_explicit_environment() {
        let spec =
            LaunchSpec::new("exit $DEVPROF_TEST_EXIT_CODE").with_env("DEVPROF_TEST_EXIT_CODE", "7");
        let process = ProcessController::start(&spec).unwrap();
        assert_eq!(process.await_exit().await.unwrap().code, Some(7));
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_exit_is_shared() {
        let process = ProcessController::start(&LaunchSpec::new("sleep 30")).unwrap();
        assert!(!process.has_exited());

        process.cancel().unwrap();
        process.cancel().unwrap();

        let first = tokio::time::timeout(Duration::from_secs(10), process.await_exit())
            .await
            .unwrap()
            .unwrap();
        let second = process.await_exit().await.unwrap();

        assert_eq!(first, second);
        assert!(!first.success());
        assert!(process.has_exited());

        // After exit, cancel is a no-op.
        process.cancel().unwrap();
    }

    #[tokio::test]
    async fn non_utf8_output_does_not_break_the_pipe() {
        let spec = LaunchSpec::new(
            "printf '\\377\\n'; head -c 1048576 /dev/zero | tr '\\0' 'a'; echo; exit 0",
        );
        let process = ProcessController::start(&spec).unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(30), process.await_exit())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.code, Some(0));
        assert_eq!(exit.signal, None);
    }

    #[tokio::test]
    async fn spawn_failure_is_immediate() {
        let spec = LaunchSpec::new("true").with_current_dir("/nonexistent/devprof/dir");
        let err = ProcessController::start(&spec).unwrap_err();
        assert!(matches!(err, ProfileError::SpawnFailure { .. }));
    }

    #[test]
    fn trace_target_is_explicit_configuration() {
        let spec = LaunchSpec::new("next dev").with_trace_target("ZIPKIN");
        assert_eq!(spec.env.get(TRACE_TARGET_ENV).map(String::as_str), Some("ZIPKIN"));
    }
}
