use common::{BuiltCommand, Invocation, UnitStatus};
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

const GRACE_PERIOD: Duration = Duration::from_secs(2);
const STDERR_SNIPPET_LEN: usize = 250;

/// Result of one tool execution unit.
#[derive(Debug)]
pub struct UnitOutcome {
    pub status: UnitStatus,
    pub error_message: Option<String>,
    /// Artifact name relative to the output directory, directories suffixed
    /// with `/`. Only set when something non-empty landed on disk.
    pub artifact: Option<String>,
    pub duration_ms: u64,
}

impl UnitOutcome {
    fn error(message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            status: UnitStatus::Error,
            error_message: Some(message.into()),
            artifact: None,
            duration_ms,
        }
    }
}

enum WaitResult {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

/// Execute one built command with a deadline and cooperative cancellation.
///
/// The process gets SIGTERM first; if it is still alive after the grace
/// period it is SIGKILLed. Stdout and stderr are drained concurrently so a
/// chatty tool cannot deadlock on a full pipe. A `{file_base}_raw.log`
/// transcript is written into the output directory regardless of outcome.
pub async fn run_unit(
    built: &BuiltCommand,
    output_dir: &Path,
    file_base: &str,
    timeout: Duration,
    token: &CancellationToken,
) -> UnitOutcome {
    let started = Instant::now();

    let mut command = match &built.invocation {
        Invocation::Argv(argv) => {
            let mut cmd = Command::new(&argv[0]);
            cmd.args(&argv[1..]);
            cmd
        }
        Invocation::Shell(line) => {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(line);
            cmd
        }
    };
    command
        .current_dir(output_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return UnitOutcome::error(
                format!("Failed to start: {}", e),
                started.elapsed().as_millis() as u64,
            );
        }
    };

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });

    let wait = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => WaitResult::Exited(status),
            Err(e) => {
                return UnitOutcome::error(
                    format!("Wait failed: {}", e),
                    started.elapsed().as_millis() as u64,
                );
            }
        },
        _ = tokio::time::sleep(timeout) => WaitResult::TimedOut,
        _ = token.cancelled() => WaitResult::Cancelled,
    };

    let exit_status = match &wait {
        WaitResult::Exited(status) => Some(*status),
        WaitResult::TimedOut | WaitResult::Cancelled => {
            terminate(&mut child).await;
            None
        }
    };

    let duration_ms = started.elapsed().as_millis() as u64;
    let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
    let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();

    let (status, error_message) = match (&wait, exit_status) {
        (WaitResult::Cancelled, _) => (UnitStatus::Cancelled, None),
        (WaitResult::TimedOut, _) => (
            UnitStatus::Timeout,
            Some(format!("Timed out after {}s", timeout.as_secs())),
        ),
        (_, Some(status)) if status.success() => (UnitStatus::Completed, None),
        (_, Some(status)) => {
            let snippet = stderr_snippet(&stderr);
            let msg = match status.code() {
                Some(code) if snippet.is_empty() => format!("Exited with code {}", code),
                Some(code) => format!("Exited with code {}: {}", code, snippet),
                None => "Terminated by signal".to_string(),
            };
            (UnitStatus::Error, Some(msg))
        }
        (_, None) => (UnitStatus::Error, Some("Terminated".to_string())),
    };

    if built.capture_stdout && status == UnitStatus::Completed && !stdout.is_empty() {
        if let Err(e) = tokio::fs::write(&built.primary_output, &stdout).await {
            log::warn!(
                "Failed to write captured stdout to {:?}: {}",
                built.primary_output,
                e
            );
        }
    }

    let return_code = match exit_status {
        Some(status) => match status.code() {
            Some(code) => code.to_string(),
            None => "signal".to_string(),
        },
        None => "terminated".to_string(),
    };
    let transcript = format!(
        "Command: {}\nReturn Code: {}\n\n--- STDOUT ---\n{}\n\n--- STDERR ---\n{}\n",
        built.display, return_code, stdout, stderr
    );
    let raw_log = output_dir.join(format!("{}_raw.log", file_base));
    if let Err(e) = tokio::fs::write(&raw_log, transcript).await {
        log::warn!("Failed to write transcript {:?}: {}", raw_log, e);
    }
    log::info!(
        target: "job_output",
        "{} -> {} ({} bytes stdout, {} bytes stderr)",
        built.display,
        return_code,
        stdout.len(),
        stderr.len()
    );

    UnitOutcome {
        status,
        error_message,
        artifact: artifact_name(&built.primary_output, output_dir),
        duration_ms,
    }
}

async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if tokio::time::timeout(GRACE_PERIOD, child.wait()).await.is_err() {
            log::warn!("Process {} ignored SIGTERM, sending SIGKILL", pid);
            let _ = child.kill().await;
        }
    } else {
        let _ = child.kill().await;
    }
}

fn stderr_snippet(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.len() <= STDERR_SNIPPET_LEN {
        trimmed.to_string()
    } else {
        let mut end = STDERR_SNIPPET_LEN;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &trimmed[..end])
    }
}

/// Name of the unit's artifact if it materialized, relative to the output
/// directory. Empty files and empty directories count as no artifact.
fn artifact_name(primary_output: &Path, output_dir: &Path) -> Option<String> {
    let meta = std::fs::metadata(primary_output).ok()?;
    if meta.is_dir() {
        if primary_output == output_dir {
            // Whole-directory output; represented by its contents directly.
            return None;
        }
        let mut entries = std::fs::read_dir(primary_output).ok()?;
        if entries.next().is_none() {
            return None;
        }
        let name = primary_output.file_name()?.to_string_lossy().into_owned();
        Some(format!("{}/", name))
    } else if meta.len() > 0 {
        Some(primary_output.file_name()?.to_string_lossy().into_owned())
    } else {
        None
    }
}
