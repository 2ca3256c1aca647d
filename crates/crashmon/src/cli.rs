//! Exposes the command line application.
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crashmon_service::config::Config;
use crashmon_service::metrics;
use crashmon_service::monitor::Monitor;
use crashmon_service::restore::restore_records;
use crashmon_service::tracker::IssueTracker;

use crate::logging;

/// Crash monitor commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Run the service loop until interrupted.
    Run {
        /// Path to the configuration file.
        #[arg(value_name = "FILE")]
        config: PathBuf,
    },

    /// Rebuild the records file from the issues in the tracker.
    RestoreRecords {
        /// Path to the configuration file.
        #[arg(value_name = "FILE")]
        config: PathBuf,

        /// The records file to write, defaults to the one in the service directory.
        #[arg(short = 'f', long = "file", value_name = "FILE")]
        file: Option<PathBuf>,
    },
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(name = "crashmon", version, args_conflicts_with_subcommands = true)]
struct Cli {
    /// Path to the configuration file, runs the service loop.
    #[arg(value_name = "FILE")]
    config: Option<PathBuf>,

    /// Overrides a configuration value.
    #[arg(
        short = 'o',
        long = "override",
        global = true,
        value_name = "SECTION.KEY=VALUE"
    )]
    overrides: Vec<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

impl Cli {
    /// Resolves the bare `crashmon <config>` form into the `run` command.
    fn into_command(self) -> Result<(Command, Vec<String>)> {
        let command = match (self.command, self.config) {
            (Some(command), _) => command,
            (None, Some(config)) => Command::Run { config },
            (None, None) => anyhow::bail!("missing configuration file"),
        };
        Ok((command, self.overrides))
    }
}

impl Command {
    fn config(&self) -> &PathBuf {
        match self {
            Command::Run { config } | Command::RestoreRecords { config, .. } => config,
        }
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let (command, overrides) = Cli::parse().into_command()?;
    let config_path = command.config().clone();
    let config = Config::get(&config_path, &overrides).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        enable_logs: true,
        ..Default::default()
    });

    // SAFETY: The runtime is not started yet, so there is only the main thread.
    unsafe { logging::init_logging(&config) }.context("failed to initialize logging")?;
    if let Some(title) = &config.logging.title {
        tracing::info!("{}", title);
    }
    tracing::info!("Using configuration {}", config_path.display());

    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("crashmon")
        .enable_all()
        .build()?;

    match command {
        Command::Run { .. } => runtime
            .block_on(run(config))
            .context("failed to run the service")?,
        Command::RestoreRecords { file, .. } => {
            let file = file.unwrap_or_else(|| config.options.records_path());
            let tracker =
                IssueTracker::new(&config.upload).context("failed to create tracker client")?;
            runtime
                .block_on(restore_records(&tracker, file))
                .context("failed to restore records")?;
        }
    }

    Ok(())
}

async fn run(config: Config) -> Result<()> {
    crashmon_service::metric!(counter("service.starting") += 1);

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let mut monitor = Monitor::new(&config, cancel).context("failed to create the monitor")?;
    monitor.run_service().await
}

/// Cancels `cancel` on the first interrupt or termination signal.
async fn cancel_on_signal(cancel: CancellationToken) {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = &e as &dyn std::error::Error, "Unable to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    "Unable to listen for SIGTERM"
                );
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
    tracing::info!("Stopping the service after the current phase");
    cancel.cancel();
}
