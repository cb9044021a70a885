//! Diagnostics CLI for the quiesce synchronization core.
//!
//! # Usage
//!
//! ```bash
//! # Print the effective configuration and strategy
//! quiesce config
//!
//! # Same, from an explicit config file
//! quiesce --config ./ci/quiesce.json config
//!
//! # Hold a network token for 200ms and check that an action waits for it
//! quiesce probe --busy-ms 200 --timeout-ms 1000
//!
//! # Hold an animation longer than the timeout (exits 1 with a busy report)
//! quiesce probe --kind animation --busy-ms 2000 --timeout-ms 100
//!
//! # Force the legacy polling strategy
//! QUIESCE_USE_LEGACY_SYNC=1 quiesce probe
//! quiesce --legacy probe
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use quiesce_core::config::{ConfigError, SyncConfig};
use quiesce_core::executor::SyncError;
use quiesce_core::manager::{ManagerError, SyncManager};
use quiesce_core::tracker::TokenKind;

/// Diagnostics CLI for the quiesce synchronization core.
#[derive(Parser)]
#[command(name = "quiesce")]
#[command(about = "Inspect and exercise UI test synchronization")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.quiesce/config.json)
    #[arg(short, long, env = "QUIESCE_CONFIG")]
    config: Option<PathBuf>,

    /// Force the legacy polling strategy
    #[arg(long)]
    legacy: bool,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the effective configuration as JSON
    Config,

    /// Register a busy token, release it later, and run a synchronized action
    Probe {
        /// Kind of token to hold
        #[arg(short, long, default_value = "network")]
        kind: ProbeKind,
        /// Handle attached to the token (e.g. a URL)
        #[arg(long)]
        handle: Option<String>,
        /// How long the token stays registered, in milliseconds
        #[arg(short, long, default_value = "200")]
        busy_ms: u64,
        /// Settle timeout for the action, in milliseconds
        #[arg(short, long, default_value = "1000")]
        timeout_ms: u64,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum ProbeKind {
    Network,
    Animation,
    DispatchedBlock,
    Timer,
}

impl From<ProbeKind> for TokenKind {
    fn from(kind: ProbeKind) -> Self {
        match kind {
            ProbeKind::Network => TokenKind::Network,
            ProbeKind::Animation => TokenKind::Animation,
            ProbeKind::DispatchedBlock => TokenKind::DispatchedBlock,
            ProbeKind::Timer => TokenKind::Timer,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref());

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

fn init_logging(log_file: Option<&std::path::Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(std::path::Path::new("."));
            let name = path.file_name().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("quiesce.log"));
            let file_appender = tracing_appender::rolling::never(dir, name);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(file_appender)
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

#[derive(Debug)]
enum CliError {
    Config(ConfigError),
    Startup(ManagerError),
    NotIdle(SyncError),
    Sync(SyncError),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::NotIdle(_) => ExitCode::from(1),
            CliError::Config(_) | CliError::Startup(_) => ExitCode::from(2),
            CliError::Sync(_) => ExitCode::from(3),
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Config(e) => write!(f, "Config error: {}", e),
            CliError::Startup(e) => write!(f, "Startup error: {}", e),
            CliError::NotIdle(e) => write!(f, "{}", e),
            CliError::Sync(e) => write!(f, "Synchronization error: {}", e),
        }
    }
}

impl From<SyncError> for CliError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::NotIdle(_) => CliError::NotIdle(e),
            other => CliError::Sync(other),
        }
    }
}

fn load_config(cli: &Cli) -> Result<SyncConfig, CliError> {
    let mut config = match &cli.config {
        Some(path) => SyncConfig::load_from(path).map_err(CliError::Config)?,
        None => SyncConfig::load(),
    };
    if cli.legacy {
        config.use_legacy_sync = Some(true);
    }
    Ok(config)
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = load_config(&cli)?;

    match cli.command {
        Command::Config => {
            let path = cli.config.clone().unwrap_or_else(SyncConfig::default_path);
            let output = json!({
                "path": path,
                "strategy": config.strategy(),
                "config": config,
            });
            println!("{}", pretty(&output));
        }
        Command::Probe {
            kind,
            handle,
            busy_ms,
            timeout_ms,
        } => {
            let manager = SyncManager::new(config).map_err(CliError::Startup)?;
            let kind = TokenKind::from(kind);
            info!(%kind, busy_ms, timeout_ms, "probing");

            let token = manager.register(kind, handle);
            let outcome = thread::scope(|scope| {
                scope.spawn(|| {
                    thread::sleep(Duration::from_millis(busy_ms));
                    manager.deregister(token);
                    debug!("probe token released");
                });
                manager.run_synchronized_blocking(|| (), Duration::from_millis(timeout_ms))
            });

            match outcome {
                Ok(outcome) => {
                    let output = json!({
                        "strategy": outcome.strategy,
                        "settled": true,
                        "settle_wait_ms": outcome.settle_wait.as_millis() as u64,
                        "run_ms": outcome.run_time.as_millis() as u64,
                    });
                    println!("{}", pretty(&output));
                }
                Err(e) => {
                    let output = json!({
                        "strategy": manager.strategy(),
                        "settled": false,
                        "report": e.busy_report(),
                    });
                    println!("{}", pretty(&output));
                    return Err(e.into());
                }
            }
        }
    }

    Ok(())
}

fn pretty(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
