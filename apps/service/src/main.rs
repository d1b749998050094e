use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use badping_service::config::Config;
use badping_service::database::{DatabaseImpl, initialize_database};
use badping_service::monitoring::{NetworkPingProvider, PingType, ProbeExecutor};
use badping_service::orchestrator::MonitorRegistry;
use badping_service::pool;

#[derive(Parser)]
#[command(name = "badping")]
#[command(about = "Network health monitor with per-device supervised ping loops", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the database path from the configuration
    #[arg(long, global = true)]
    database: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor all enabled devices until interrupted (default)
    Run,

    /// Print the effective configuration
    Config,

    /// Probe one address once and print the results
    Probe {
        /// IP address to probe
        ip: String,

        #[arg(short = 't', long, default_value_t = PingType::Icmp)]
        ping_type: PingType,

        /// Packet size in bytes, headers included
        #[arg(short = 's', long)]
        packet_size: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut config = Config::from_config(cli.config.as_ref())?;
    if let Some(path) = cli.database {
        config.database.path = path;
    }
    logger::init(&config.logging.level);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Config => {
            println!("{config}");
            Ok(())
        }
        Commands::Probe { ip, ping_type, packet_size } => {
            probe(&config, &ip, ping_type, packet_size.unwrap_or(config.defaults.packet_size)).await
        }
    }
}

async fn run(config: Config) -> Result<()> {
    info!("Opening database {}", config.database.path);
    let pool = pool::open(&config.database.path, config.database.pool_size).await?;
    {
        let conn = pool.get().await.context("getting a database connection")?;
        info!("Initializing database schema...");
        initialize_database(&conn).await?;
    }
    let database = Arc::new(DatabaseImpl::new_from_pool(pool));

    let provider = Arc::new(NetworkPingProvider::new(config.monitoring.probe_timeout_seconds));
    if !provider.is_arp_available().await {
        warn!("ARP probing is not available on this host, ARP probes will be skipped");
    }
    let registry = MonitorRegistry::new(database, provider, &config);
    registry.start().await?;

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Shutdown requested");

    registry.stop().await
}

async fn probe(config: &Config, ip: &str, ping_type: PingType, packet_size: u16) -> Result<()> {
    let provider = Arc::new(NetworkPingProvider::new(config.monitoring.probe_timeout_seconds));
    let executor = ProbeExecutor::new(provider.clone());

    if ping_type.uses_arp() && !provider.is_arp_available().await {
        warn!("ARP probing is not available on this host");
    }
    let results = executor.execute(0, ip, ping_type, packet_size).await;

    for result in &results {
        match result.latency_ms {
            Some(latency) => println!("{} {}: reply in {:.3} ms", result.ping_type, ip, latency),
            None => println!("{} {}: lost", result.ping_type, ip),
        }
    }
    Ok(())
}
