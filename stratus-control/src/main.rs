//! stratus-control: reconciles IpRange and NfsInstance records of remote clusters.
//!
//! This binary runs the looper against the simulated provider with one
//! in-memory record store per `--cluster`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use stratus_api::{
    FileTier, IpRange, IpRangeSpec, MemoryStore, NfsInstance, NfsInstanceSpec, RecordStore, Scope,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stratus_control::config::parse_duration;
use stratus_control::provider::SimProvider;
use stratus_control::{
    ClusterConnection, ControlConfig, ControlContext, Looper, StaticConnectionFactory,
    default_kinds,
};

/// Project number the simulated provider reports for the configured project.
const SIM_PROJECT_NUMBER: u64 = 100_000_000_001;

/// stratus control plane
#[derive(Parser, Debug)]
#[command(name = "stratus-control", version, about)]
struct Args {
    /// Remote cluster to manage (repeatable)
    #[arg(long = "cluster", default_value = "local")]
    clusters: Vec<String>,

    /// Provider project the clusters live in
    #[arg(long, env = "STRATUS_PROJECT", default_value = "stratus-dev")]
    project: String,

    /// VPC network of the clusters
    #[arg(long, env = "STRATUS_VPC", default_value = "default")]
    vpc: String,

    /// Default region for file instances
    #[arg(long, env = "STRATUS_REGION", default_value = "us-east1")]
    region: String,

    /// Seed every cluster with an IpRange and an NfsInstance
    #[arg(long)]
    demo: bool,

    /// Stop after this long instead of waiting for ctrl-c (e.g. 90s)
    #[arg(long, value_parser = parse_duration)]
    run_for: Option<Duration>,

    /// Print every record as JSON on exit
    #[arg(long)]
    dump: bool,

    /// Record kinds to leave alone (e.g. NfsInstance)
    #[arg(long = "disable-kind", env = "STRATUS_DISABLED_KINDS", value_delimiter = ',')]
    disabled_kinds: Vec<String>,

    /// Delay before retrying after a provider error or a running operation
    #[arg(long, env = "STRATUS_RETRY_WAIT", default_value = "3s", value_parser = parse_duration)]
    retry_wait: Duration,

    /// Delay before polling an operation that was just started
    #[arg(
        long,
        env = "STRATUS_OPERATION_WAIT",
        default_value = "5s",
        value_parser = parse_duration
    )]
    operation_wait: Duration,

    /// Upper bound for a single provider call
    #[arg(long, env = "STRATUS_API_TIMEOUT", default_value = "8s", value_parser = parse_duration)]
    api_timeout: Duration,

    /// Clusters handled in parallel
    #[arg(long, env = "STRATUS_CONCURRENCY", default_value = "1")]
    concurrency: usize,

    /// How often the cluster set is re-emitted
    #[arg(long, env = "STRATUS_EMIT_INTERVAL", default_value = "1s", value_parser = parse_duration)]
    emit_interval: Duration,

    /// Bound for one cluster's run
    #[arg(
        long,
        env = "STRATUS_CLUSTER_TIMEOUT",
        default_value = "30s",
        value_parser = parse_duration
    )]
    cluster_timeout: Duration,

    /// Pause after a failed cluster connection
    #[arg(
        long,
        env = "STRATUS_CONNECT_BACKOFF",
        default_value = "5s",
        value_parser = parse_duration
    )]
    connect_backoff: Duration,

    /// Bound for the per-cluster manager
    #[arg(
        long,
        env = "STRATUS_MANAGER_TIMEOUT",
        default_value = "60s",
        value_parser = parse_duration
    )]
    manager_timeout: Duration,

    /// Reconcile workers per controller
    #[arg(long, env = "STRATUS_MAX_CONCURRENT_RECONCILES", default_value = "1")]
    max_concurrent_reconciles: usize,
}

impl Args {
    fn config(&self) -> ControlConfig {
        ControlConfig {
            retry_wait: self.retry_wait,
            operation_wait: self.operation_wait,
            api_timeout: self.api_timeout,
            concurrency: self.concurrency,
            emit_interval: self.emit_interval,
            cluster_timeout: self.cluster_timeout,
            connect_backoff: self.connect_backoff,
            manager_timeout: self.manager_timeout,
            max_concurrent_reconciles: self.max_concurrent_reconciles,
        }
    }
}

/// Stores of one cluster, kept for seeding and the exit dump.
struct ClusterStores {
    id: String,
    ip_ranges: Arc<MemoryStore<IpRange>>,
    nfs_instances: Arc<MemoryStore<NfsInstance>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClusterDump {
    cluster: String,
    generated_at: DateTime<Utc>,
    ip_ranges: Vec<IpRange>,
    nfs_instances: Vec<NfsInstance>,
}

async fn seed_demo(stores: &ClusterStores, index: usize) -> Result<()> {
    let cidr = format!("10.{}.0.0/24", 20 + index);
    stores
        .ip_ranges
        .create(IpRange::new("demo-range", IpRangeSpec::new(cidr)))
        .await
        .context("Failed to seed IpRange")?;
    stores
        .nfs_instances
        .create(NfsInstance::new(
            "demo-nfs",
            NfsInstanceSpec {
                ip_range: "demo-range".into(),
                tier: FileTier::BasicHdd,
                capacity_gb: 1024,
                file_share_name: "vol1".into(),
                location: None,
                source_backup: None,
            },
        ))
        .await
        .context("Failed to seed NfsInstance")?;
    info!("Seeded demo records for cluster {}", stores.id);
    Ok(())
}

async fn dump(stores: &[ClusterStores]) -> Result<()> {
    for cluster in stores {
        let dump = ClusterDump {
            cluster: cluster.id.clone(),
            generated_at: Utc::now(),
            ip_ranges: cluster.ip_ranges.list().await?,
            nfs_instances: cluster.nfs_instances.list().await?,
        };
        println!("{}", serde_json::to_string_pretty(&dump)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stratus_control=info,stratus_api=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = args.config();

    info!("Starting stratus-control for {} clusters", args.clusters.len());
    info!("Project {}, network {}, region {}", args.project, args.vpc, args.region);

    let sim = Arc::new(SimProvider::new());
    sim.set_project_number(&args.project, SIM_PROJECT_NUMBER);
    let ctx = ControlContext::simulated(config, sim);

    let factory = Arc::new(StaticConnectionFactory::new());
    let mut clusters = Vec::with_capacity(args.clusters.len());
    for (index, id) in args.clusters.iter().enumerate() {
        let stores = ClusterStores {
            id: id.clone(),
            ip_ranges: Arc::new(MemoryStore::new()),
            nfs_instances: Arc::new(MemoryStore::new()),
        };
        factory
            .register(ClusterConnection {
                cluster_id: id.clone(),
                scope: Scope::new(&args.project, &args.vpc, &args.region),
                ip_ranges: stores.ip_ranges.clone(),
                nfs_instances: stores.nfs_instances.clone(),
            })
            .await;
        if args.demo {
            seed_demo(&stores, index).await?;
        }
        clusters.push(stores);
    }

    let looper = Looper::new(ctx, factory, default_kinds())
        .with_disabled_kinds(args.disabled_kinds.clone());
    for cluster in &clusters {
        looper.add_cluster_id(&cluster.id);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run_for = args.run_for;
    tokio::spawn(async move {
        match run_for {
            Some(limit) => {
                tokio::select! {
                    _ = tokio::time::sleep(limit) => info!("Run time of {:?} elapsed", limit),
                    _ = tokio::signal::ctrl_c() => info!("Received ctrl-c"),
                }
            }
            None => {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for ctrl-c: {}", e);
                }
                info!("Received ctrl-c");
            }
        }
        let _ = shutdown_tx.send(true);
    });

    looper.start(shutdown_rx).await?;

    if args.dump {
        dump(&clusters).await?;
    }

    info!("stratus-control stopped");
    Ok(())
}
