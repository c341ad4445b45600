//! vnetd entry point.
//!
//! Loads the configuration, starts the daemon against the simulated
//! platform and runs until SIGINT or SIGTERM.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vnetd::{config::DEFAULT_CONFIG_PATH, Daemon, SimulatedPlatform, SinkChoice, VnetdConfig};

/// Switch telemetry and control daemon
#[derive(Parser, Debug)]
#[command(name = "vnetd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Record destination
    #[arg(long, value_enum, default_value_t = SinkArg::Redis)]
    sink: SinkArg,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print version information
    Version,
    /// Print license information
    License,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum SinkArg {
    Redis,
    Log,
}

fn print_yaml(map: &BTreeMap<&str, &str>) -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(map)?);
    Ok(())
}

fn init_logging() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set logger")?;
    Ok(())
}

async fn wait_for_signal() -> anyhow::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for SIGINT")?;
            info!("Received SIGINT");
        }
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Some(Command::Version) => {
            return print_yaml(&BTreeMap::from([
                ("name", env!("CARGO_PKG_NAME")),
                ("version", env!("CARGO_PKG_VERSION")),
            ]));
        }
        Some(Command::License) => {
            return print_yaml(&BTreeMap::from([
                ("name", env!("CARGO_PKG_NAME")),
                ("license", env!("CARGO_PKG_LICENSE")),
            ]));
        }
        None => {}
    }

    init_logging()?;

    let config = VnetdConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let platform = SimulatedPlatform::new(config.platform.ports, config.platform.subports);

    let startup = platform.startup_messages();
    let (tx, messages) = mpsc::channel(startup.len().max(1));
    for message in startup {
        tx.send(message).await.context("message stream closed")?;
    }
    drop(tx);

    let sinks = match args.sink {
        SinkArg::Redis => SinkChoice::Redis,
        SinkArg::Log => SinkChoice::Log,
    };
    let daemon = Daemon::start(&config, Box::new(platform), sinks, Some(messages))
        .await
        .context("starting vnetd")?;

    wait_for_signal().await?;
    daemon.shutdown().await.context("stopping vnetd")?;
    Ok(())
}
