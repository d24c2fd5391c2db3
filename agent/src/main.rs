//! MoE Mesh Agent - Command Line Interface
//!
//! Runs the pieces of a distributed Mixture-of-Experts cluster.
//!
//! ## Commands
//!
//! - `init-config` - Write a default cluster configuration
//! - `placement` - Show which nodes host which experts
//! - `worker` - Serve this node's experts over TCP
//! - `bench` - Drive forward passes through the cluster and report statistics

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use moe_agent::{
    init_from_config, init_simple_logging, AffineExpertKernel, CancelToken, ClusterTransport,
    DispatchCoordinator, ExpertComputeKernel, ExpertRegistry, ExpertWorker, ForwardDriver,
    InProcessTransport, LinearGate, MoeStats, NetworkTransport, NodeHealthMonitor, NodeId,
    Router, RuntimeConfig, Token, WorkerServer,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// MoE Mesh Agent - distributed expert routing and inference
#[derive(Parser, Debug)]
#[command(name = "moe-agent")]
#[command(about = "Distributed Mixture-of-Experts agent", long_about = None)]
#[command(version)]
struct Cli {
    /// Cluster configuration file (defaults to ~/.moe-mesh/cluster.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default cluster configuration
    InitConfig {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Show expert placement across nodes
    Placement,

    /// Serve this node's experts until Ctrl+C
    Worker {
        /// Node id from the [[nodes]] table
        #[arg(short, long)]
        node_id: String,
    },

    /// Run forward passes through the cluster and print statistics
    Bench {
        /// How to reach the workers
        #[arg(short, long, value_enum, default_value = "in-process")]
        transport: BenchTransport,

        /// Start a TCP worker for every configured node in this process
        #[arg(long)]
        spawn_workers: bool,

        /// Tokens per forward pass
        #[arg(long, default_value = "32")]
        tokens: usize,

        /// Number of forward passes
        #[arg(short, long, default_value = "10")]
        passes: usize,

        /// Mark these nodes unreachable (in-process transport only)
        #[arg(long = "fail-node")]
        fail_nodes: Vec<String>,

        /// Write statistics as JSON to this file
        #[arg(long)]
        stats_out: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BenchTransport {
    InProcess,
    Tcp,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => RuntimeConfig::default_path()?,
    };

    match cli.command {
        Commands::InitConfig { force } => {
            init_simple_logging("info")?;
            cmd_init_config(&config_path, force)?;
        }

        Commands::Placement => {
            // No logging for placement (pure display)
            let config = load_config(&config_path)?;
            cmd_placement(&config);
        }

        Commands::Worker { node_id } => {
            let config = load_config(&config_path)?;
            init_from_config(&config.logging, &format!("worker-{node_id}.log"))?;
            cmd_worker(config, node_id).await?;
        }

        Commands::Bench {
            transport,
            spawn_workers,
            tokens,
            passes,
            fail_nodes,
            stats_out,
        } => {
            let config = load_config(&config_path)?;
            init_from_config(&config.logging, "bench.log")?;
            cmd_bench(
                config,
                transport,
                spawn_workers,
                tokens,
                passes,
                fail_nodes,
                stats_out,
            )
            .await?;
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<RuntimeConfig> {
    RuntimeConfig::load(path).with_context(|| {
        format!(
            "Failed to load {} (run `moe-agent init-config` first)",
            path.display()
        )
    })
}

fn cmd_init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }

    let config = RuntimeConfig::default();
    config.save(path)?;

    println!("✓ Configuration saved to: {}", path.display());
    println!("   Experts: {}", config.model.expert_count);
    println!("   Top-k: {}", config.model.top_k);
    println!("   Nodes: {}", config.nodes.len());
    println!("\nNext steps:");
    println!("  1. Start workers:  moe-agent worker --node-id node-0");
    println!("  2. Run a bench:    moe-agent bench --transport tcp");
    Ok(())
}

fn cmd_placement(config: &RuntimeConfig) {
    use colored::Colorize;

    println!("\n{}", "═══ Expert Placement ═══".bright_cyan().bold());
    for node in &config.nodes {
        let experts = config.experts_for(&node.id);
        println!(
            "  {} {} {}",
            node.id.bright_white().bold(),
            format!("({})", node.address).dimmed(),
            format!("{experts:?}").green()
        );
    }
    println!();
    for (expert, nodes) in config.placements() {
        let names: Vec<&str> = nodes.iter().map(|n| n.as_str()).collect();
        println!("  expert {:>3} → {}", expert, names.join(", "));
    }
}

/// Run a worker node until Ctrl+C
async fn cmd_worker(config: RuntimeConfig, node_id: String) -> Result<()> {
    let node = config
        .node(&node_id)
        .with_context(|| format!("Node '{node_id}' is not in the configuration"))?
        .clone();
    let experts = config.experts_for(&node_id);
    if experts.is_empty() {
        warn!(node = %node_id, "Node hosts no experts");
    }

    let kernel: Arc<dyn ExpertComputeKernel> =
        Arc::new(AffineExpertKernel::new(config.model.hidden_size));
    let worker = ExpertWorker::new(NodeId::new(node_id.clone()), experts, kernel);
    let stats = worker.stats().clone();
    let server = WorkerServer::new(
        worker,
        config.transport.worker_concurrency,
        config.transport.max_frame_bytes,
    );

    let shutdown = CancelToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
        }
        signal.cancel();
    });

    println!("✅ Worker {} listening on {}", node_id, node.address);
    println!("   Press Ctrl+C to stop\n");
    server.run(&node.address, shutdown).await?;

    info!(
        completed = stats.requests_completed.load(std::sync::atomic::Ordering::Relaxed),
        failed = stats.requests_failed.load(std::sync::atomic::Ordering::Relaxed),
        "Worker stopped"
    );
    Ok(())
}

/// Drive forward passes and report statistics
async fn cmd_bench(
    config: RuntimeConfig,
    transport_kind: BenchTransport,
    spawn_workers: bool,
    token_count: usize,
    passes: usize,
    fail_nodes: Vec<String>,
    stats_out: Option<PathBuf>,
) -> Result<()> {
    let shutdown = CancelToken::new();
    let kernel: Arc<dyn ExpertComputeKernel> =
        Arc::new(AffineExpertKernel::new(config.model.hidden_size));
    let workers: Vec<ExpertWorker> = config
        .nodes
        .iter()
        .map(|n| {
            ExpertWorker::new(
                NodeId::new(n.id.clone()),
                config.experts_for(&n.id),
                kernel.clone(),
            )
        })
        .collect();

    let transport: Arc<dyn ClusterTransport> = match transport_kind {
        BenchTransport::InProcess => {
            let transport = InProcessTransport::with_workers(workers).await;
            for node in &fail_nodes {
                transport
                    .set_behavior(&NodeId::new(node.clone()), moe_agent::NodeBehavior::Unreachable)
                    .await?;
                println!("   Marked {node} unreachable");
            }
            Arc::new(transport)
        }
        BenchTransport::Tcp => {
            if !fail_nodes.is_empty() {
                warn!("--fail-node is ignored with the TCP transport");
            }
            if spawn_workers {
                for (worker, node) in workers.into_iter().zip(&config.nodes) {
                    let listener = tokio::net::TcpListener::bind(&node.address)
                        .await
                        .with_context(|| format!("Failed to bind {}", node.address))?;
                    let server = WorkerServer::new(
                        worker,
                        config.transport.worker_concurrency,
                        config.transport.max_frame_bytes,
                    );
                    let stop = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.serve(listener, stop).await {
                            error!(error = %e, "Worker server failed");
                        }
                    });
                }
            }
            Arc::new(NetworkTransport::new(
                config.addresses(),
                config.network_config(),
            ))
        }
    };

    let registry = Arc::new(ExpertRegistry::new(config.placements())?);
    let monitor = Arc::new(NodeHealthMonitor::new(
        registry.clone(),
        transport.clone(),
        config.health_config(),
    ));
    // One probe round before the first pass so dead nodes start demoted
    monitor.probe_once().await;
    let monitor_task = monitor.clone().spawn(shutdown.clone());

    let stats = Arc::new(MoeStats::new());
    let coordinator = Arc::new(DispatchCoordinator::new(
        registry,
        transport.clone(),
        kernel,
        config.dispatch_config(),
        stats.clone(),
    ));

    let routers = (0..config.model.num_layers)
        .map(|layer| {
            let gate = LinearGate::seeded(
                config.model.hidden_size,
                config.model.expert_count,
                config.model.gate_seed.wrapping_add(layer as u64),
            );
            Router::new(Arc::new(gate), config.model.hidden_size)
        })
        .collect::<moe_agent::Result<Vec<_>>>()?;
    let mut driver = ForwardDriver::new(routers, coordinator, config.driver_settings())?;

    println!(
        "\n🚀 Running {} passes × {} tokens through {} layers",
        passes, token_count, config.model.num_layers
    );

    let mut rng = StdRng::seed_from_u64(config.model.gate_seed);
    let mut next_token = 0u64;
    let mut failures = 0usize;
    for pass in 0..passes {
        let tokens: Vec<Token> = (0..token_count)
            .map(|_| {
                next_token += 1;
                let hidden: Vec<f32> = (0..config.model.hidden_size)
                    .map(|_| rng.gen_range(-1.0..1.0))
                    .collect();
                Token::new(next_token, hidden)
            })
            .collect();

        match driver.forward(tokens, &shutdown).await {
            Ok(output) if output.is_partial() => {
                println!(
                    "   pass {:>3}: partial (layers {:?})",
                    pass, output.partial_layers
                );
            }
            Ok(_) => {}
            Err(e) if e.is_fatal() => {
                shutdown.cancel();
                return Err(e).context("Forward pass failed");
            }
            Err(e) => {
                failures += 1;
                warn!(pass, error = %e, "Forward pass failed");
            }
        }
    }

    shutdown.cancel();
    if let Err(e) = monitor_task.await {
        warn!(error = %e, "Health monitor task ended abnormally");
    }
    // Let in-flight connection tasks observe the shutdown
    tokio::time::sleep(Duration::from_millis(10)).await;

    stats.display();
    let transport_stats = transport.stats().snapshot();
    println!(
        "   Frames sent/received: {}/{}  corrupt: {}  reconnects: {}",
        transport_stats.frames_sent,
        transport_stats.frames_received,
        transport_stats.corrupt_frames,
        transport_stats.reconnects
    );
    if failures > 0 {
        println!("   Failed passes: {failures}/{passes}");
    }

    if let Some(path) = stats_out {
        stats
            .save_to_file(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("\n✓ Statistics saved to: {}", path.display());
    }

    Ok(())
}
