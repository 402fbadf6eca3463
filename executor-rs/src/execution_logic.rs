// executor-rs/src/execution_logic.rs
// Core logic for running a command under a wall-clock timeout

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use shared_types::{ExecutionMetrics, ExecutionReport};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::shell::ShellSpec;

/// Liveness polling interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long output readers may lag behind process exit before being dropped.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Run `code` through `shell`, polling every `poll_interval` and killing the
/// process once `timeout` has elapsed. Never returns an error: launch and
/// wait failures are folded into a failed report.
pub(crate) async fn run_supervised(
    shell: &ShellSpec,
    code: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> ExecutionReport {
    let started_at = Utc::now();
    let clock = Instant::now();

    let mut command = shell.command_for(code);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own process group so the whole tree can be signalled at timeout.
    #[cfg(unix)]
    command.process_group(0);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            warn!(shell = %shell.name(), error = %err, "failed to launch command");
            return launch_failure(started_at, clock, err);
        }
    };

    let pid = child.id();
    info!(pid = ?pid, timeout_secs = timeout.as_secs(), "command started");

    let stdout_task = spawn_reader(child.stdout.take());
    let stderr_task = spawn_reader(child.stderr.take());

    let mut timed_out = false;
    let waited: io::Result<ExitStatus> = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Ok(status),
            Ok(None) => {
                if clock.elapsed() >= timeout {
                    timed_out = true;
                    warn!(pid = ?pid, "command exceeded timeout, terminating");
                    break terminate(&mut child, pid).await;
                }
                tokio::time::sleep(poll_interval).await;
            }
            Err(err) => {
                warn!(pid = ?pid, error = %err, "lost track of command, terminating");
                let _ = terminate(&mut child, pid).await;
                break Err(err);
            }
        }
    };

    let stdout = collect(stdout_task, "stdout").await;
    let stderr = collect(stderr_task, "stderr").await;

    let finished_at = Utc::now();
    let elapsed_seconds = round_secs(clock.elapsed());

    let status = match waited {
        Ok(status) => status,
        Err(err) => {
            return ExecutionReport {
                success: false,
                output: format!("Execution error: {}", err),
                metrics: ExecutionMetrics {
                    started_at,
                    finished_at,
                    elapsed_seconds,
                    timed_out,
                    exit_code: None,
                    error_text: Some(err.to_string()),
                },
            };
        }
    };

    let exit_code = status.code();
    let metrics = ExecutionMetrics {
        started_at,
        finished_at,
        elapsed_seconds,
        timed_out,
        exit_code,
        error_text: None,
    };

    if timed_out {
        return ExecutionReport {
            success: false,
            output: format!("Command timed out after {} seconds", timeout.as_secs()),
            metrics,
        };
    }

    debug!(exit_code = ?exit_code, elapsed_seconds, "command finished");

    if status.success() {
        let stdout = stdout.trim();
        ExecutionReport {
            success: true,
            output: if stdout.is_empty() {
                "Command executed successfully".to_string()
            } else {
                stdout.to_string()
            },
            metrics,
        }
    } else {
        let stderr = stderr.trim();
        let output = if !stderr.is_empty() {
            stderr.to_string()
        } else {
            match exit_code {
                Some(code) => format!("Command failed with exit code {}", code),
                None => "Command terminated by signal".to_string(),
            }
        };
        ExecutionReport {
            success: false,
            output,
            metrics,
        }
    }
}

fn launch_failure(started_at: DateTime<Utc>, clock: Instant, err: io::Error) -> ExecutionReport {
    ExecutionReport {
        success: false,
        output: format!("Execution error: {}", err),
        metrics: ExecutionMetrics {
            started_at,
            finished_at: Utc::now(),
            elapsed_seconds: round_secs(clock.elapsed()),
            timed_out: false,
            exit_code: None,
            error_text: Some(err.to_string()),
        },
    }
}

/// Kill the child (and on Unix its process group) and reap it.
async fn terminate(child: &mut Child, pid: Option<u32>) -> io::Result<ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // SAFETY: plain signal delivery to the group we created at spawn time.
        let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
        if rc != 0 {
            debug!(pid, error = %io::Error::last_os_error(), "killpg failed");
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    if let Err(err) = child.start_kill() {
        debug!(error = %err, "start_kill failed, process may already be gone");
    }
    child.wait().await
}

fn spawn_reader<R>(stream: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream {
            if let Err(err) = stream.read_to_end(&mut buf).await {
                debug!(error = %err, "output stream closed with error");
            }
        }
        buf
    })
}

async fn collect(task: JoinHandle<Vec<u8>>, stream: &'static str) -> String {
    let abort = task.abort_handle();
    match tokio::time::timeout(READER_GRACE, task).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(err)) => {
            warn!(stream, error = %err, "output reader failed");
            String::new()
        }
        Err(_) => {
            abort.abort();
            warn!(stream, "output still open after process exit, discarding");
            String::new()
        }
    }
}

fn round_secs(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 100.0).round() / 100.0
}
