//! Adapter runner
//!
//! Entry point for running the adapter: logging initialization and
//! run-mode selection (stdio agent or WebSocket daemon).

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::cli::{Cli, RunMode};
use crate::transport::{stdio, ws};
use crate::types::AdapterConfig;

/// Build an EnvFilter based on CLI args and the RUST_LOG environment variable
///
/// Priority: RUST_LOG environment variable > CLI arguments (-v, -vv, -q)
fn build_env_filter(cli: &Cli) -> tracing_subscriber::EnvFilter {
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        if !rust_log.is_empty() {
            return tracing_subscriber::EnvFilter::new(rust_log);
        }
    }
    let level = cli.log_level();
    tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into())
}

/// Initialize logging with file output (diagnostic mode)
fn init_logging_to_file(cli: &Cli) -> anyhow::Result<()> {
    let filter = build_env_filter(cli);
    let log_path = cli.log_path();

    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(&log_path)?;

    // Stdout carries the protocol; the log location goes to stderr.
    eprintln!("Diagnostic mode: logging to {}", log_path.display());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
    Ok(())
}

/// Initialize logging with stderr output (normal mode)
fn init_logging_to_stderr(cli: &Cli) {
    let filter = build_env_filter(cli);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

/// Initialize logging based on CLI arguments
fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    if cli.is_diagnostic() {
        init_logging_to_file(cli)
    } else {
        init_logging_to_stderr(cli);
        Ok(())
    }
}

/// Run the adapter with parsed CLI arguments
///
/// Initializes logging, loads the environment configuration, and enters the
/// selected run mode.
pub async fn run_with_cli(cli: &Cli) -> anyhow::Result<()> {
    init_logging(cli)?;

    let config = AdapterConfig::from_env();
    tracing::info!(
        version = %env!("CARGO_PKG_VERSION"),
        pid = %std::process::id(),
        mode = ?cli.mode,
        default_engine = %config.effective_default_engine(),
        task_oracle = ?config.task_oracle,
        "banjo starting"
    );

    let result = match cli.mode {
        RunMode::Agent => stdio::run(config).await,
        RunMode::Daemon => ws::run_daemon(config, cli.port).await,
        RunMode::Lsp => Err(anyhow::anyhow!(
            "the lsp run mode is not provided by this binary"
        )),
    };

    tracing::info!("banjo shutting down");
    result
}

/// Run the adapter in the default stdio agent mode
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(&Cli::default()).await
}
