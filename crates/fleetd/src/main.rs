//! fleetd — supervise a pool of worker processes.
//!
//! # Usage
//!
//! ```text
//! fleetd run --config /etc/fleet/fleet.toml
//! fleetd check-config --config fleet.toml --print
//! ```
//!
//! SIGINT and SIGTERM shut down gracefully. SIGHUP re-reads the config and
//! rolls the pool to `deployment.version` when it changed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fleet_core::{FleetConfig, system_clock};
use fleet_supervisor::ProcessRuntime;
use fleetd::Daemon;

#[derive(Parser, Debug)]
#[command(name = "fleetd", about = "FleetGrid worker supervisor")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the worker pool and supervise it until signalled.
    Run {
        #[arg(long, short, default_value = "fleet.toml")]
        config: PathBuf,

        /// Override `supervisor.workers`.
        #[arg(long)]
        workers: Option<u32>,
    },
    /// Parse and validate a config file, then exit.
    CheckConfig {
        #[arg(long, short, default_value = "fleet.toml")]
        config: PathBuf,

        /// Print the effective config with defaults filled in.
        #[arg(long)]
        print: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fleetd=debug,fleet=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run { config, workers } => {
            let code = run(&config, workers).await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Command::CheckConfig { config, print } => check_config(&config, print),
    }
}

fn load_config(path: &Path) -> anyhow::Result<FleetConfig> {
    let config = FleetConfig::from_file(path)
        .with_context(|| format!("loading {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn check_config(path: &Path, print: bool) -> anyhow::Result<()> {
    let config = load_config(path)?;
    if print {
        print!("{}", config.to_toml_string()?);
    } else {
        println!(
            "{}: ok ({} workers, {} probes, {} alert rules, {} transports)",
            path.display(),
            config.supervisor.workers,
            config.health.probes.len(),
            config.alerts.rules.len(),
            config.transports.len(),
        );
    }
    Ok(())
}

/// Run the daemon until a signal or a fatal escalation. Returns the exit
/// code the process should end with.
async fn run(path: &Path, workers: Option<u32>) -> anyhow::Result<i32> {
    let mut config = load_config(path)?;
    if let Some(workers) = workers {
        config.supervisor.workers = workers;
        config.validate()?;
    }
    info!(config = %path.display(), version = %config.deployment.version, "fleetd starting");

    let runtime = Arc::new(ProcessRuntime::new(
        config.supervisor.command.clone(),
        config.supervisor.args.clone(),
    ));
    let daemon = Daemon::start(config, runtime, system_clock()).await?;

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received");
                break;
            }
            _ = sighup.recv() => {
                info!("SIGHUP received, reloading config");
                let daemon = daemon.clone();
                let path = path.to_path_buf();
                tokio::spawn(async move { reload(&daemon, &path).await });
            }
            _ = daemon.shutdown_requested() => {
                warn!(exit_code = daemon.exit_code(), "shutdown requested by escalation");
                break;
            }
        }
    }

    daemon.shutdown().await;
    let code = daemon.exit_code();
    info!(exit_code = code, "fleetd stopped");
    Ok(code)
}

async fn reload(daemon: &Daemon, path: &Path) {
    let config = match load_config(path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %format!("{e:#}"), "reload rejected, keeping current config");
            return;
        }
    };
    match daemon.reload(config).await {
        Ok(Some(report)) => info!(
            version = %report.version,
            replaced = report.replaced,
            "deployment finished"
        ),
        Ok(None) => {}
        Err(e) => error!(error = %format!("{e:#}"), "deployment failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_defaults() {
        let cli = Cli::try_parse_from(["fleetd", "run"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Text);
        match cli.command {
            Command::Run { config, workers } => {
                assert_eq!(config, PathBuf::from("fleet.toml"));
                assert_eq!(workers, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn run_with_overrides() {
        let cli = Cli::try_parse_from([
            "fleetd",
            "run",
            "--config",
            "/etc/fleet.toml",
            "--workers",
            "6",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Command::Run { config, workers } => {
                assert_eq!(config, PathBuf::from("/etc/fleet.toml"));
                assert_eq!(workers, Some(6));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn check_config_print_flag() {
        let cli = Cli::try_parse_from(["fleetd", "check-config", "-c", "x.toml", "--print"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::CheckConfig { print: true, .. }
        ));
    }

    #[test]
    fn unknown_log_format_is_rejected() {
        assert!(Cli::try_parse_from(["fleetd", "--log-format", "xml", "run"]).is_err());
    }

    #[test]
    fn check_config_reports_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.toml");
        std::fs::write(&path, "[supervisor]\nmin_workers = 9\nmax_workers = 4\n").unwrap();
        assert!(check_config(&path, false).is_err());
    }
}
