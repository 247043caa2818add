use std::path::PathBuf;
use std::sync::Arc;

use air::config::Config;
use air::export::health::HealthMetrics;
use air::Air;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

/// In-process telemetry engine host.
#[derive(Parser)]
#[command(name = "air", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error). Overrides
    /// the config file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine until interrupted (default).
    Run,
    /// Validate the configuration and print the node table.
    Check,
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via build.rs.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("air {}", version::full());
        return Ok(());
    }

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;
    fmt().with_env_filter(filter).with_target(true).init();

    if let Some(Command::Check) = &cli.command {
        return check(&cfg);
    }

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting air",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

fn check(cfg: &Config) -> Result<()> {
    let nodes = cfg.resolved_nodes()?;
    println!(
        "{:<4} {:<30} {:<12} {:<10} {:<6} {:<6} {:>6} {:>6}",
        "ID", "NAME", "TYPE", "GROUP", "BUILD", "RUN", "RATIO", "INDEX"
    );
    for (nid, node) in nodes.iter().enumerate() {
        println!(
            "{:<4} {:<30} {:<12} {:<10} {:<6} {:<6} {:>6} {:>6}",
            nid,
            node.name,
            node.ptype.as_str(),
            node.group.as_deref().unwrap_or("-"),
            node.build,
            node.run,
            node.sampling_ratio,
            node.index_size,
        );
        println!("     filter {}: {}", node.filter_name, node.filter_items.join(", "));
    }
    println!(
        "{} nodes, streaming interval {}s",
        nodes.len(),
        cfg.streaming_interval_secs()
    );
    Ok(())
}

async fn run(cfg: Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    tracing::error!(error = %e, "registering SIGTERM handler");
                    return;
                }
            };

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    let metrics = if cfg.health.enabled {
        Some(Arc::new(HealthMetrics::new(&cfg.health.addr)?))
    } else {
        None
    };

    let air = Air::new(&cfg, metrics.clone())?;

    if let Some(metrics) = &metrics {
        metrics.start(air.latest_handle()).await?;
    }

    air.start()?;

    let _ = shutdown_rx.await;

    air.stop()?;
    if let Some(metrics) = &metrics {
        metrics.stop().await?;
    }

    tracing::info!("air stopped");

    Ok(())
}
