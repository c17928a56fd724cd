//! CLI command definitions for gencore.
//!
//! `serve` runs the orchestration core until Ctrl-C, `check-config` loads and
//! validates a configuration and `metrics` prints the Prometheus exposition.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::inference::HttpTransport;
use crate::metrics::{export_metrics, init_metrics};
use crate::orchestrator::Orchestrator;
use crate::store::InMemoryJobStore;

/// Default interval between snapshot log lines while serving.
const DEFAULT_REPORT_INTERVAL_SECS: u64 = 30;

/// Orchestration core for AI media generation.
#[derive(Parser)]
#[command(name = "gencore")]
#[command(about = "Schedule image and video generation jobs against remote GPU backends")]
#[command(version)]
#[command(
    long_about = "gencore schedules interactive and batch generation jobs against remote inference backends, parks work while backends are degraded, replays exhausted calls from a local retry queue and fans job events out to subscribers.\n\nExample usage:\n  gencore serve --config gencore.yaml\n  gencore check-config --config gencore.yaml"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the orchestration core until interrupted.
    Serve(ServeArgs),

    /// Load and validate a configuration, then print a summary.
    #[command(name = "check-config")]
    CheckConfig(ConfigArgs),

    /// Print Prometheus metrics in text exposition format.
    Metrics,
}

/// Arguments for `gencore serve`.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// YAML configuration file. Falls back to GENCORE_* environment variables.
    #[arg(short, long, env = "GENCORE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Seconds between scheduler snapshot log lines.
    #[arg(long, default_value_t = DEFAULT_REPORT_INTERVAL_SECS)]
    pub report_interval: u64,
}

/// Arguments for `gencore check-config`.
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// YAML configuration file. Falls back to GENCORE_* environment variables.
    #[arg(short, long, env = "GENCORE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Print the resolved configuration as YAML.
    #[arg(long)]
    pub yaml: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve(args) => run_serve_command(args).await,
        Commands::CheckConfig(args) => run_check_config_command(args),
        Commands::Metrics => run_metrics_command(),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<OrchestratorConfig> {
    let config = match path {
        Some(path) => OrchestratorConfig::from_yaml_file(path).map_err(|e| {
            anyhow::anyhow!("Failed to load configuration from {}: {}", path.display(), e)
        })?,
        None => OrchestratorConfig::from_env().map_err(|e| {
            anyhow::anyhow!(
                "Failed to load configuration: {}. Pass --config or set GENCORE_BACKEND_URL.",
                e
            )
        })?,
    };
    Ok(config)
}

async fn run_serve_command(args: ServeArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref())?;
    let transport = Arc::new(HttpTransport::new()?);
    let store = Arc::new(InMemoryJobStore::new());

    let orchestrator = Orchestrator::start(config, transport, store).await?;
    info!("gencore serving; press Ctrl-C to stop");

    let mut ticker =
        tokio::time::interval(Duration::from_secs(args.report_interval.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                }
                break;
            }
            _ = ticker.tick() => {
                let snapshot = orchestrator.scheduler_snapshot();
                info!(
                    interactive = snapshot.interactive_depth,
                    batch = snapshot.batch_depth,
                    in_flight = snapshot.in_flight,
                    degraded = snapshot.degraded,
                    retry_pending = snapshot.retry_pending,
                    health = ?snapshot.backend_health,
                    "Scheduler snapshot"
                );
            }
        }
    }

    orchestrator.shutdown().await?;
    Ok(())
}

fn run_check_config_command(args: ConfigArgs) -> anyhow::Result<()> {
    let mut config = load_config(args.config.as_deref())?;

    if args.yaml {
        for backend in config.backends.values_mut() {
            if backend.api_key.is_some() {
                backend.api_key = Some("<redacted>".to_string());
            }
        }
        println!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    println!("Configuration OK");
    println!();
    println!("Backends:");
    for (name, backend) in &config.backends {
        println!(
            "  {:<16} {}  attempts={} backoff={:?}x{}..{:?} local_retries={} timeouts(connect/write/read/request)={:?}/{:?}/{:?}/{:?}",
            name,
            backend.base_url,
            backend.max_attempts,
            backend.backoff_base,
            backend.backoff_factor,
            backend.backoff_max,
            backend.local_queue_max_retries,
            backend.connect_timeout,
            backend.write_timeout,
            backend.read_timeout,
            backend.request_timeout,
        );
    }
    println!();
    println!("Scheduler:");
    println!("  workers:          {}", config.scheduler.worker_count);
    println!(
        "  degraded backoff: {:?}x{}..{:?}",
        config.scheduler.degraded_base_delay,
        config.scheduler.degraded_backoff_factor,
        config.scheduler.degraded_max_delay
    );
    match config.scheduler.batch_max_wait {
        Some(wait) => println!("  batch aging:      {:?}", wait),
        None => println!("  batch aging:      off (strict priority)"),
    }
    println!();
    println!("Hub:");
    println!("  subscriber buffer: {}", config.hub.subscriber_buffer);
    println!("  heartbeat timeout: {:?}", config.hub.heartbeat_timeout);

    Ok(())
}

fn run_metrics_command() -> anyhow::Result<()> {
    init_metrics()?;
    print!("{}", export_metrics());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::io::Write;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_defaults() {
        let cli = Cli::try_parse_from(["gencore", "serve", "--config", "gencore.yaml"])
            .expect("should parse");

        assert_eq!(cli.log_level, "info");
        match cli.command {
            Commands::Serve(args) => {
                assert_eq!(args.config, Some(PathBuf::from("gencore.yaml")));
                assert_eq!(args.report_interval, DEFAULT_REPORT_INTERVAL_SECS);
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_global_log_level() {
        let cli = Cli::try_parse_from(["gencore", "metrics", "--log-level", "debug"])
            .expect("should parse");
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(cli.command, Commands::Metrics));
    }

    #[test]
    fn test_check_config_loads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "backends:\n  default:\n    base_url: http://gpu-1:8080\n    max_attempts: 2"
        )
        .unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.backends["default"].max_attempts, 2);

        let result = run_check_config_command(ConfigArgs {
            config: Some(file.path().to_path_buf()),
            yaml: false,
        });
        assert!(result.is_ok());
    }

    #[test]
    fn test_check_config_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "backends:\n  default:\n    base_url: ftp://gpu-1").unwrap();

        assert!(load_config(Some(file.path())).is_err());
    }
}
