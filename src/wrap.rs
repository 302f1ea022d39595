/// Supervisor composition: run the wrapped command, and when it fails (or
/// always-notify is set) build the bounded diagnostic and send it.
use crate::compose::{self, DEFAULT_BUDGET_BYTES, DEFAULT_SUFFIX_BYTES};
use crate::config::Credentials;
use crate::notify::{MessageOptions, Notification, Notifier, NotifyError, Receipt};
use crate::runner::{self, RunReport, RunRequest, StdinSource};
use crate::sink::{StreamKind, StreamSink};
use std::time::Duration;

/// Behavior switches for one supervised run.
#[derive(Debug, Clone)]
pub struct WrapSettings {
    /// Notify even when the command exits 0.
    pub always_notify: bool,
    /// Don't echo the composed message to stdout.
    pub quiet: bool,
    pub timeout: Option<Duration>,
    pub stdin: StdinSource,
    pub budget_bytes: usize,
    pub suffix_bytes: u64,
}

impl Default for WrapSettings {
    fn default() -> Self {
        Self {
            always_notify: false,
            quiet: false,
            timeout: None,
            stdin: StdinSource::Inherit,
            budget_bytes: DEFAULT_BUDGET_BYTES,
            suffix_bytes: DEFAULT_SUFFIX_BYTES,
        }
    }
}

/// What happened during a supervised run.
#[derive(Debug)]
pub struct WrapReport {
    pub run: RunReport,
    /// The composed diagnostic, if a notification was due.
    pub message: Option<String>,
    /// Set when a notification was attempted.
    pub delivery: Option<Result<Receipt, NotifyError>>,
}

impl WrapReport {
    pub fn exit_code(&self) -> i32 {
        self.run.outcome.exit_code()
    }
}

/// Errors that stop a run before the command starts.
#[derive(Debug)]
pub enum WrapError {
    /// Failed to create a capture file.
    Sink {
        stream: StreamKind,
        source: std::io::Error,
    },
}

impl std::fmt::Display for WrapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WrapError::Sink { stream, source } => {
                write!(
                    f,
                    "failed to create {} capture file: {}",
                    stream.label().to_lowercase(),
                    source
                )
            }
        }
    }
}

impl std::error::Error for WrapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WrapError::Sink { source, .. } => Some(source),
        }
    }
}

fn create_sink(stream: StreamKind) -> Result<StreamSink, WrapError> {
    StreamSink::create(stream).map_err(|source| WrapError::Sink { stream, source })
}

/// Run `command` under supervision and send at most one notification.
///
/// Both capture files live only for the duration of this call.
pub async fn wrap_command<N: Notifier>(
    command: &str,
    settings: &WrapSettings,
    credentials: &Credentials,
    options: &MessageOptions,
    notifier: &N,
) -> Result<WrapReport, WrapError> {
    let mut stdout = create_sink(StreamKind::Stdout)?;
    let mut stderr = create_sink(StreamKind::Stderr)?;

    let request = RunRequest {
        command: command.to_string(),
        stdin: settings.stdin.clone(),
        timeout: settings.timeout,
    };
    let run = runner::run_process(&request, &stdout, &stderr).await;

    let Some(failure) = run.outcome.failure_message(settings.always_notify) else {
        tracing::debug!("command succeeded, no notification");
        return Ok(WrapReport {
            run,
            message: None,
            delivery: None,
        });
    };

    let message = compose::compose(
        Some(&failure),
        &mut stdout,
        &mut stderr,
        settings.suffix_bytes,
        settings.budget_bytes,
    );
    if !settings.quiet {
        println!("{message}");
    }

    let notification = Notification::new(credentials, options, message.clone());
    let delivery = notifier.send(&notification).await;
    if let Err(e) = &delivery {
        tracing::error!(error = %e, "failed to send notification");
    }

    Ok(WrapReport {
        run,
        message: Some(message),
        delivery: Some(delivery),
    })
}
