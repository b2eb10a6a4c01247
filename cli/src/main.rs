// meshcast: command-line front end
//
// Runs in-process mesh simulations over the local link layer and manages the
// node configuration file.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use meshcast_core::store::{unix_millis, ContentItem, MemoryContentStore};
use meshcast_core::transport::{pump_inbox, LocalAdapter, LocalMedium};
use meshcast_core::{DensityTable, MeshConfig, NetworkCoordinator, TransportType};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

#[derive(Parser)]
#[command(name = "meshcast")]
#[command(about = "meshcast: epidemic content dissemination over ad-hoc neighbors", long_about = None)]
#[command(version)]
struct Cli {
    /// Log at info level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run several nodes on an in-process medium
    Simulate {
        #[arg(short, long, default_value = "4")]
        nodes: usize,
        #[arg(short, long, default_value = "20")]
        items: usize,
        #[arg(short, long, default_value = "3")]
        duration_secs: u64,
        /// Pause between two pushes on a session
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Get { key: String },
    Set { key: String, value: String },
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Simulate {
            nodes,
            items,
            duration_secs,
            interval_ms,
        } => cmd_simulate(nodes, items, duration_secs, interval_ms).await,
        Commands::Config { action } => cmd_config(action),
    }
}

struct SimNode {
    name: String,
    coordinator: Arc<NetworkCoordinator>,
    store: MemoryContentStore,
    shutdown: watch::Sender<bool>,
}

fn sim_address(index: usize) -> String {
    format!("02:00:00:00:{:02X}:{:02X}", index / 256, index % 256)
}

/// A simulation runs entirely on the local link layer
fn check_simulation(base: &MeshConfig, nodes: usize) -> Result<()> {
    if nodes < 2 {
        anyhow::bail!("A simulation needs at least two nodes");
    }
    if !base.adapters.enables(TransportType::Local) {
        anyhow::bail!(
            "The local link layer is disabled (adapters.local = false), nothing to simulate on"
        );
    }
    Ok(())
}

async fn cmd_simulate(
    nodes: usize,
    items: usize,
    duration_secs: u64,
    interval_ms: Option<u64>,
) -> Result<()> {
    let base = config::ConfigFile::load()?.mesh;
    check_simulation(&base, nodes)?;

    println!("{}", "meshcast simulation".bold());
    println!();

    let medium = LocalMedium::new();
    let mut sim = Vec::with_capacity(nodes);
    for index in 0..nodes {
        let name = format!("node-{}", index);
        let mut config = base.clone();
        config.local_name = name.clone();
        if let Some(ms) = interval_ms {
            config.push.send_interval_ms = ms;
        }

        let store = MemoryContentStore::with_feed_capacity(config.push.feed_capacity);
        let coordinator = NetworkCoordinator::new(
            sim_address(index),
            config,
            Arc::new(store.clone()),
            store.feed(),
            Arc::new(DensityTable::new(0.5)),
        )
        .with_context(|| format!("Failed to create {}", name))?;

        let (_adapter, inbox) = LocalAdapter::attach(&medium, &coordinator);
        coordinator
            .start_adapter(TransportType::Local)
            .with_context(|| format!("Failed to start link layer of {}", name))?;
        tokio::spawn(pump_inbox(inbox, Arc::downgrade(&coordinator), store.clone()));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let runner = coordinator.clone();
        tokio::spawn(async move { runner.run_until_shutdown(shutdown_rx).await });

        sim.push(SimNode {
            name,
            coordinator,
            store,
            shutdown,
        });
    }
    println!("  {} {} nodes attached", "✓".green(), nodes);

    let now = unix_millis();
    for i in 0..items {
        sim[0].store.insert(
            ContentItem::new("node-0", "public", format!("status #{}", i))
                .with_tags(&["sim"])
                .with_created_at_ms(now),
        );
    }
    for node in sim.iter().skip(1) {
        node.store.insert(ContentItem::new(
            node.name.clone(),
            "public",
            format!("hello from {}", node.name),
        ));
    }
    let total = items + nodes - 1;
    println!("  {} {} items seeded", "✓".green(), total);

    // every node scans at the same moment, so dials race
    let scans: Vec<_> = sim
        .iter()
        .map(|node| {
            let coordinator = node.coordinator.clone();
            tokio::task::spawn_blocking(move || coordinator.force_scan())
        })
        .collect();
    for result in futures::future::join_all(scans).await {
        result.context("Discovery task failed")?;
    }
    println!("  {} Discovery done, running for {}s", "✓".green(), duration_secs);
    println!();

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(duration_secs)) => {}
        _ = tokio::signal::ctrl_c() => {
            println!("{}", "Interrupted".yellow());
        }
    }

    println!("{}", "Results".bold());
    let mut complete = 0;
    for node in &sim {
        let held = node.store.len();
        if held == total {
            complete += 1;
        }
        let items_label = format!("{:>4}/{} items", held, total);
        println!(
            "  {:<10} {:>3} sessions  {}  {} pushed",
            node.name.bright_cyan(),
            node.coordinator.push().active_sessions().len(),
            if held == total {
                items_label.green()
            } else {
                items_label.yellow()
            },
            node.coordinator.push().total_sent()
        );
    }
    println!();
    println!("  {}/{} nodes hold every item", complete, nodes);

    for node in &sim {
        let _ = node.shutdown.send(true);
        node.coordinator.shutdown().await;
    }
    info!("Simulation of {} nodes finished", nodes);
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::ConfigFile::load()?;

    match action {
        ConfigAction::Show => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<34} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Path => {
            println!("{}", config.path().display());
        }
    }

    Ok(())
}
