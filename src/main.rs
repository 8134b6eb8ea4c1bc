// rpsguard - Main Entry Point
//
// Command line front end for the admission controller:
// - Load and validate configuration
// - Replay simulated traffic against the configured engine
// - Print engine state and metrics

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rpsguard::config::Config;
use rpsguard::metrics;
use rpsguard::throttle::{Algorithm, ThrottleManager, ThrottleStats};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

/// rpsguard: per-user requests-per-second admission control
#[derive(Parser, Debug)]
#[command(name = "rpsguard")]
#[command(author = "rpsguard Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Per-user RPS admission control with lazily resolved quotas", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (defaults to $RPSGUARD_CONFIG or ~/.config/rpsguard/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fire simulated traffic at the admission engine
    Simulate {
        /// Requests per round
        #[arg(short, long, default_value_t = 2500)]
        requests: usize,

        /// Rounds, one second apart
        #[arg(long, default_value_t = 2)]
        rounds: usize,

        /// Client threads
        #[arg(long, default_value_t = 8)]
        threads: usize,

        /// Override the configured algorithm (fixed-second, sliding-window)
        #[arg(long)]
        algorithm: Option<Algorithm>,

        /// Print Prometheus metrics after the run
        #[arg(long)]
        metrics: bool,
    },
    /// Print the effective configuration
    ShowConfig,
}

#[derive(Debug, Serialize)]
struct RoundSummary {
    round: usize,
    requests: usize,
    admitted: usize,
    rejected: usize,
    elapsed_ms: u128,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    algorithm: Algorithm,
    resolver_threads: Option<usize>,
    rounds: Vec<RoundSummary>,
    stats: ThrottleStats,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    init_tracing(&config, args.verbose)?;

    match args.command {
        Some(Commands::Simulate {
            requests,
            rounds,
            threads,
            algorithm,
            metrics,
        }) => {
            let mut config = config;
            if let Some(algorithm) = algorithm {
                config.throttle.algorithm = algorithm;
            }
            simulate(config, requests, rounds, threads, metrics).await?;
        }
        Some(Commands::ShowConfig) => {
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{}", rendered);
        }
        None => {
            info!("No command specified. Use \"rpsguard --help\" for usage.");
        }
    }

    Ok(())
}

fn init_tracing(config: &Config, verbose: bool) -> Result<()> {
    let level = if verbose {
        Level::DEBUG
    } else {
        config.log_level()?
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.logging.format.to_lowercase().as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
    Ok(())
}

/// Token of the `index`-th simulated request: a guest, an unknown token or
/// one of the stub backend's tokens
fn simulated_token(index: usize, known: &[String]) -> Option<String> {
    match index % 4 {
        0 => None,
        1 => Some(uuid::Uuid::new_v4().to_string()),
        _ if known.is_empty() => None,
        _ => Some(known[index % known.len()].clone()),
    }
}

async fn simulate(
    config: Config,
    requests: usize,
    rounds: usize,
    threads: usize,
    print_metrics: bool,
) -> Result<()> {
    if let Err(e) = metrics::init() {
        warn!("Failed to register metrics: {}", e);
    }

    let known: Arc<Vec<String>> =
        Arc::new(config.stub.tokens.iter().map(|t| t.token.clone()).collect());
    let manager = Arc::new(ThrottleManager::new(
        config.throttle.clone(),
        Arc::new(config.stub.lookup()),
    )?);

    info!(
        requests,
        rounds,
        threads,
        algorithm = %manager.algorithm(),
        resolver_threads = config.throttle.resolver_threads,
        "Starting simulation"
    );

    let mut summaries = Vec::with_capacity(rounds);
    for round in 0..rounds {
        if round > 0 {
            manager.wait_idle().await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let manager = manager.clone();
        let known = known.clone();
        let summary = tokio::task::spawn_blocking(move || {
            fire_round(&manager, &known, round, requests, threads.max(1))
        })
        .await
        .context("Simulation round panicked")?;

        info!(
            round = summary.round,
            admitted = summary.admitted,
            rejected = summary.rejected,
            elapsed_ms = summary.elapsed_ms as u64,
            "Round finished"
        );
        summaries.push(summary);
    }

    manager.wait_idle().await;
    let report = SimulationReport {
        algorithm: manager.algorithm(),
        resolver_threads: manager.pool().worker_threads(),
        rounds: summaries,
        stats: manager.stats(),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to render report")?
    );

    if print_metrics {
        let text = metrics::gather().context("Failed to gather metrics")?;
        println!("{}", text);
    }

    Ok(())
}

fn fire_round(
    manager: &ThrottleManager,
    known: &[String],
    round: usize,
    requests: usize,
    threads: usize,
) -> RoundSummary {
    let admitted = AtomicUsize::new(0);
    let started = Instant::now();

    std::thread::scope(|scope| {
        for t in 0..threads {
            let admitted = &admitted;
            scope.spawn(move || {
                for i in (t..requests).step_by(threads) {
                    let token = simulated_token(i, known);
                    if manager.admit(token.as_deref()) {
                        admitted.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });

    let admitted = admitted.into_inner();
    RoundSummary {
        round,
        requests,
        admitted,
        rejected: requests - admitted,
        elapsed_ms: started.elapsed().as_millis(),
    }
}
