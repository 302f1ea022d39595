mod compose;
mod config;
mod notify;
mod runner;
mod sink;
mod wrap;

use clap::{Args, Parser, Subcommand};
use config::{ConfigError, CredentialOverrides, Credentials, PushoverConfig};
use notify::{MessageOptions, Notification, Notifier, PushoverClient};
use runner::StdinSource;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use wrap::WrapSettings;

/// Send Pushover notifications, or run a command and get notified with the
/// tail of its output when it fails.
#[derive(Parser, Debug)]
#[command(name = "pushwrap", version, about)]
pub struct Cli {
    /// Extra logging (spawn, composition and delivery details)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send a message
    Send {
        /// Message to send
        message: String,

        #[command(flatten)]
        notify: NotifyArgs,
    },
    /// Run a command and send a message if it fails
    Run(RunArgs),
}

/// Addressing and presentation options shared by both commands.
#[derive(Args)]
struct NotifyArgs {
    /// API token (optional, can be read from config too)
    #[arg(long)]
    token: Option<String>,

    /// User key or section name in the configuration
    #[arg(short, long, default_value = "Default")]
    user: String,

    /// Device key (optional, can be read from config too)
    #[arg(short, long)]
    device: Option<String>,

    /// Configuration file
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: String,

    /// Additional URL
    #[arg(long)]
    url: Option<String>,

    /// URL title
    #[arg(long)]
    url_title: Option<String>,

    /// Message title
    #[arg(short, long)]
    title: Option<String>,

    /// Notification priority (-2 to 2)
    #[arg(
        short,
        long,
        allow_negative_numbers = true,
        value_parser = clap::value_parser!(i8).range(-2..=2)
    )]
    priority: Option<i8>,

    /// Resend interval in seconds (required for priority 2)
    #[arg(short, long)]
    retry: Option<u32>,

    /// Expiration time in seconds (required for priority 2)
    #[arg(short, long)]
    expire: Option<u32>,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// The command to run
    #[arg(long)]
    command: String,

    /// Send a message even if the command succeeds
    #[arg(long)]
    always: bool,

    /// Don't print the message sent
    #[arg(long)]
    quiet: bool,

    /// Optional timeout for the command, in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Pass through the command's exit code as this program's (default)
    #[arg(long, overrides_with = "no_pass_returncode")]
    pass_returncode: bool,

    /// Exit 0 even if the command didn't
    #[arg(long, overrides_with = "pass_returncode")]
    no_pass_returncode: bool,

    /// Read the command's stdin from this file instead of inheriting it
    #[arg(long)]
    stdin: Option<PathBuf>,

    /// Give the command an empty stdin
    #[arg(long, conflicts_with = "stdin")]
    no_stdin: bool,

    #[command(flatten)]
    notify: NotifyArgs,
}

// The API token is a secret; keep it out of debug logs.
impl std::fmt::Debug for NotifyArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyArgs")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("user", &self.user)
            .field("device", &self.device)
            .field("config", &self.config)
            .field("url", &self.url)
            .field("url_title", &self.url_title)
            .field("title", &self.title)
            .field("priority", &self.priority)
            .field("retry", &self.retry)
            .field("expire", &self.expire)
            .finish()
    }
}

impl NotifyArgs {
    /// Validate options and resolve credentials before anything is launched.
    fn resolve(&self) -> Result<(Credentials, MessageOptions), ConfigError> {
        config::validate_priority(self.priority, self.retry, self.expire)?;
        let file = PushoverConfig::load(&self.config)?;
        let overrides = CredentialOverrides {
            token: self.token.clone(),
            user: self.user.clone(),
            device: self.device.clone(),
        };
        let credentials = config::resolve_credentials(&overrides, &file)?;
        let options = MessageOptions {
            title: self.title.clone(),
            priority: self.priority,
            url: self.url.clone(),
            url_title: self.url_title.clone(),
            retry: self.retry,
            expire: self.expire,
        };
        Ok((credentials, options))
    }
}

impl RunArgs {
    /// The flags override each other, so at most one is set.
    fn passes_returncode(&self) -> bool {
        self.pass_returncode || !self.no_pass_returncode
    }

    fn stdin_source(&self) -> StdinSource {
        match &self.stdin {
            Some(path) => StdinSource::File(path.clone()),
            None if self.no_stdin => StdinSource::Null,
            None => StdinSource::Inherit,
        }
    }

    fn settings(&self) -> WrapSettings {
        WrapSettings {
            always_notify: self.always,
            quiet: self.quiet,
            timeout: self.timeout.map(Duration::from_secs),
            stdin: self.stdin_source(),
            ..Default::default()
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "pushwrap=debug" } else { "pushwrap=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Child exit codes outside 0..=255 can't be passed through; report 1.
fn clamp_exit_code(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

async fn send(message: String, args: &NotifyArgs) -> ExitCode {
    let (credentials, options) = match args.resolve() {
        Ok(resolved) => resolved,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let client = match PushoverClient::new() {
        Ok(client) => client,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let notification = Notification::new(&credentials, &options, message);
    match client.send(&notification).await {
        Ok(receipt) => {
            tracing::info!(request = %receipt.request, "message sent");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &RunArgs) -> ExitCode {
    let (credentials, options) = match args.notify.resolve() {
        Ok(resolved) => resolved,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let client = match PushoverClient::new() {
        Ok(client) => client,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let report = match wrap::wrap_command(
        &args.command,
        &args.settings(),
        &credentials,
        &options,
        &client,
    )
    .await
    {
        Ok(report) => report,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        outcome = ?report.run.outcome,
        pid = ?report.run.pid,
        duration_secs = report.run.duration.as_secs_f64(),
        composed = report.message.is_some(),
        delivered = matches!(report.delivery, Some(Ok(_))),
        "supervised run complete"
    );

    if args.passes_returncode() {
        ExitCode::from(clamp_exit_code(report.exit_code()))
    } else {
        ExitCode::SUCCESS
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    tracing::debug!(?cli, "parsed CLI arguments");

    match &cli.command {
        Commands::Send { message, notify } => send(message.clone(), notify).await,
        Commands::Run(args) => run(args).await,
    }
}
