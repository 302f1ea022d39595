/// Child process lifecycle: spawn the wrapped command with its output
/// redirected into stream sinks, wait with an optional timeout, classify the
/// result, and make sure the child is gone before returning.
use crate::sink::StreamSink;
use nix::sys::signal::Signal;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};

/// Where the child's standard input comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StdinSource {
    /// Share this process's stdin.
    #[default]
    Inherit,
    /// Empty stdin (`/dev/null`).
    Null,
    /// Read stdin from a file.
    File(PathBuf),
}

impl StdinSource {
    fn stdio(&self) -> std::io::Result<Stdio> {
        match self {
            StdinSource::Inherit => Ok(Stdio::inherit()),
            StdinSource::Null => Ok(Stdio::null()),
            StdinSource::File(path) => Ok(Stdio::from(std::fs::File::open(path)?)),
        }
    }
}

/// What to run and for how long.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Command line, split with POSIX shell quoting rules.
    pub command: String,
    pub stdin: StdinSource,
    pub timeout: Option<Duration>,
}

/// How the child run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Exited with status 0.
    Success,
    /// Exited normally with a non-zero status.
    NonZeroExit(i32),
    /// Terminated by a signal the supervisor did not send.
    Signaled(i32),
    /// Still running when the timeout expired; killed.
    TimedOut(Duration),
    /// Could not be started or waited on.
    LaunchFailed(String),
}

impl RunOutcome {
    fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(0), _) => RunOutcome::Success,
            (Some(code), _) => RunOutcome::NonZeroExit(code),
            (None, Some(signal)) => RunOutcome::Signaled(signal),
            (None, None) => RunOutcome::LaunchFailed(format!("unknown exit status {status}")),
        }
    }

    /// Human-readable failure description, or `None` for a silent success.
    ///
    /// With `always_notify` a successful run still reports its exit code.
    pub fn failure_message(&self, always_notify: bool) -> Option<String> {
        match self {
            RunOutcome::Success if always_notify => Some("Exited with code 0".to_string()),
            RunOutcome::Success => None,
            RunOutcome::NonZeroExit(code) => Some(format!("Exited with code {code}")),
            RunOutcome::Signaled(signal) => {
                Some(format!("Killed by signal {}", signal_name(*signal)))
            }
            RunOutcome::TimedOut(timeout) => Some(format!(
                "Reached timeout {} and was killed",
                timeout.as_secs_f64()
            )),
            RunOutcome::LaunchFailed(cause) => {
                Some(format!("Caught exception {cause} and was killed"))
            }
        }
    }

    /// Exit status this program reports when passing the child's code through.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::NonZeroExit(code) => *code,
            RunOutcome::Signaled(signal) => 128 + signal,
            RunOutcome::TimedOut(_) => 128 + Signal::SIGKILL as i32,
            RunOutcome::LaunchFailed(_) => 127,
        }
    }
}

fn signal_name(signal: i32) -> String {
    match Signal::try_from(signal) {
        Ok(sig) => sig.as_str().to_string(),
        Err(_) => signal.to_string(),
    }
}

/// Result of a supervised run.
#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Child PID, if it was started.
    pub pid: Option<u32>,
    /// Wall-clock time from spawn to classification.
    pub duration: Duration,
}

/// Split the command line into argv.
fn parse_command(command: &str) -> Result<Vec<String>, String> {
    let argv = shell_words::split(command).map_err(|e| format!("invalid command: {e}"))?;
    if argv.is_empty() {
        return Err("empty command".to_string());
    }
    Ok(argv)
}

fn spawn(
    request: &RunRequest,
    stdout: &StreamSink,
    stderr: &StreamSink,
) -> std::io::Result<Child> {
    let argv = parse_command(&request.command)
        .map_err(|msg| std::io::Error::new(std::io::ErrorKind::InvalidInput, msg))?;

    Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(request.stdin.stdio()?)
        .stdout(stdout.stdio()?)
        .stderr(stderr.stdio()?)
        .kill_on_drop(true)
        .spawn()
}

/// Run the command to completion or until the timeout, capturing its output.
///
/// Never returns an error: spawn failures, wait failures and timeouts are all
/// folded into the [`RunOutcome`]. The child is killed (if still alive) and
/// reaped before this returns.
pub async fn run_process(
    request: &RunRequest,
    stdout: &StreamSink,
    stderr: &StreamSink,
) -> RunReport {
    let start = Instant::now();

    tracing::info!(
        command = %request.command,
        timeout_secs = ?request.timeout.map(|t| t.as_secs_f64()),
        "spawning child process"
    );

    let mut child = match spawn(request, stdout, stderr) {
        Ok(child) => child,
        Err(e) => {
            tracing::warn!(error = %e, command = %request.command, "failed to spawn child");
            return RunReport {
                outcome: RunOutcome::LaunchFailed(e.to_string()),
                pid: None,
                duration: start.elapsed(),
            };
        }
    };

    let pid = child.id();
    tracing::debug!(pid = ?pid, "child process started");

    let outcome = wait_with_timeout(&mut child, request.timeout).await;

    // Safe on an already-exited child; the error is expected and ignored
    if let Err(e) = child.start_kill() {
        tracing::trace!(error = %e, "post-wait kill was a no-op");
    }

    let duration = start.elapsed();
    tracing::info!(
        ?outcome,
        pid = ?pid,
        duration_secs = duration.as_secs_f64(),
        "child process finished"
    );

    RunReport {
        outcome,
        pid,
        duration,
    }
}

async fn wait_with_timeout(child: &mut Child, timeout: Option<Duration>) -> RunOutcome {
    let waited = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(waited) => waited,
            Err(_) => {
                tracing::warn!(
                    timeout_secs = limit.as_secs_f64(),
                    "timeout reached, killing child"
                );
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill timed out child");
                }
                return RunOutcome::TimedOut(limit);
            }
        },
        None => child.wait().await,
    };

    match waited {
        Ok(status) => RunOutcome::from_status(status),
        Err(e) => {
            tracing::warn!(error = %e, "failed waiting for child");
            RunOutcome::LaunchFailed(e.to_string())
        }
    }
}
