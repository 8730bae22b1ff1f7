use clap::Parser;
use geodirectory::config::DirectoryConfig;
use geodirectory::directory::{ClusterId, HostId};
use geodirectory::logging::create_logger;
use geodirectory::runtime::{oracle_from_config, DirectoryRuntime};
use slog::{error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "geodirectory")]
#[command(about = "Global single instance grain directory silo", long_about = None)]
struct Args {
    /// Load settings from a JSON file; other flags override it
    #[arg(short, long)]
    config: Option<String>,

    /// Name of the cluster this silo belongs to
    #[arg(long)]
    cluster_id: Option<String>,

    /// Address to listen on for directory requests (e.g., 0.0.0.0:11111)
    #[arg(short = 'l', long)]
    listen: Option<String>,

    /// Advertised address other silos use to reach this one
    /// If not specified, uses the listen address
    #[arg(short = 'a', long)]
    advertise: Option<String>,

    /// Other silos of the same cluster (e.g., 10.0.0.2:11111,10.0.0.3:11111)
    #[arg(short, long, value_delimiter = ',')]
    silos: Vec<String>,

    /// Clusters of the initial federation (e.g., us-east,eu-west)
    #[arg(short, long, value_delimiter = ',')]
    multi_cluster: Vec<String>,

    /// Gateway into a remote cluster, as cluster=host:port (repeatable)
    #[arg(short, long)]
    gateway: Vec<String>,

    /// Rounds of the ownership protocol before giving up
    #[arg(long)]
    retries: Option<u32>,

    /// Period of the reconciliation agent in milliseconds
    #[arg(long)]
    retry_interval_ms: Option<u64>,

    /// Log debug messages
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

fn build_config(args: &Args) -> Result<DirectoryConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => DirectoryConfig::from_file(path)?,
        None => DirectoryConfig::default(),
    };

    if let Some(cluster_id) = &args.cluster_id {
        config.cluster_id = ClusterId::new(cluster_id.clone());
    }
    if let Some(listen) = &args.listen {
        config = config.with_listen_address(listen.clone());
        config.silo_address = HostId::new(listen.clone());
    }
    if let Some(advertise) = &args.advertise {
        config.silo_address = HostId::new(advertise.clone());
    }
    if !args.silos.is_empty() {
        config = config.with_cluster_silos(args.silos.iter().cloned().map(HostId::new).collect());
    }
    if !args.multi_cluster.is_empty() {
        config = config.with_multi_cluster(args.multi_cluster.iter().cloned().map(ClusterId::new).collect());
    }
    for gateway in &args.gateway {
        let (cluster, address) = gateway
            .split_once('=')
            .ok_or_else(|| format!("gateway '{}' must be cluster=host:port", gateway))?;
        config = config.with_gateway(ClusterId::new(cluster), HostId::new(address));
    }
    if let Some(retries) = args.retries {
        config = config.with_retries(retries);
    }
    if let Some(interval) = args.retry_interval_ms {
        config = config.with_retry_interval(Duration::from_millis(interval));
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.verbose { slog::Level::Debug } else { slog::Level::Info };
    let logger = create_logger(level);

    let config = build_config(&args)?;
    let oracle = Arc::new(oracle_from_config(&config));

    let runtime = DirectoryRuntime::with_http(config, oracle, logger.clone())?;
    let address = runtime.start_http().await?;
    info!(logger, "Directory endpoint listening"; "address" => %address);

    if let Some(mut deactivations) = runtime.take_deactivation_requests() {
        let logger = logger.clone();
        tokio::spawn(async move {
            while let Some(request) = deactivations.recv().await {
                info!(logger, "Activations lost ownership";
                    "host" => %request.host,
                    "count" => request.addresses.len()
                );
            }
        });
    }

    info!(logger, "Press Ctrl+C to shutdown gracefully");
    if let Err(e) = signal::ctrl_c().await {
        error!(logger, "Failed to wait for shutdown signal"; "error" => %e);
    }

    runtime.shutdown().await;
    Ok(())
}
