use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use kube::{Api, Client};
use kube_runtime::watcher;
use pet_api::constants::{LABEL_SELECTOR, PET_NAMESPACE};
use pet_core::coalesce;
use pet_core::{ClusterSnapshot, ControllerMetrics, KubeCluster, NodeReconciler, TickReport};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod metrics_server;

/// Exit status when the watch-driven loop ends, which it never should
const LOOP_EXITED: i32 = 5;

/// Cluster-side controller that provisions WireGuard addressing for pet nodes
#[derive(Parser, Debug)]
#[command(name = "node-controller", version)]
struct Args {
    /// List every resource once, reconcile a single time, then exit
    #[arg(long)]
    once: bool,

    /// Expose Prometheus metrics over HTTP
    #[arg(long)]
    serve_metrics: bool,

    /// Listen address for --serve-metrics
    #[arg(long, env = "KUBE_PET_METRICS_ADDR", default_value = "0.0.0.0:9090")]
    metrics_addr: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    info!("Starting node-controller...");

    let metrics = ControllerMetrics::new()?;
    if args.serve_metrics {
        let addr = args.metrics_addr;
        let metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics_server::serve(addr, metrics).await {
                error!("Metrics server error: {}", e);
            }
        });
        info!("Now serving OpenMetrics @ {}/metrics", addr);
    }

    let client = Client::try_default().await?;
    let cluster = KubeCluster::new(client.clone());
    let reconciler = NodeReconciler::new(Arc::new(cluster.clone()));

    if args.once {
        let snapshot = cluster.list_snapshot().await?;
        tick(&reconciler, &metrics, &snapshot).await?;
        return Ok(());
    }

    run_forever(client, &reconciler, &metrics).await;

    error!("Completed infinite loop... wait what??");
    std::process::exit(LOOP_EXITED);
}

/// Watch nodes, our ConfigMaps and CSRs, reconciling each settled combination in turn
async fn run_forever(client: Client, reconciler: &NodeReconciler, metrics: &ControllerMetrics) {
    let config = watcher::Config::default().labels(LABEL_SELECTOR);

    info!("Starting reflection sync...");
    let nodes = coalesce::reflect(Api::<Node>::all(client.clone()), config.clone());
    let config_maps = coalesce::reflect(
        Api::<ConfigMap>::namespaced(client.clone(), PET_NAMESPACE),
        config.clone(),
    );
    let csrs = coalesce::reflect(Api::<CertificateSigningRequest>::all(client), config);

    let combined = coalesce::settle_node_inputs(nodes, config_maps, csrs);

    coalesce::run_sequential(combined, |(nodes, config_maps, csrs)| async move {
        let snapshot = ClusterSnapshot {
            nodes,
            config_maps,
            csrs,
        };
        if let Err(e) = tick(reconciler, metrics, &snapshot).await {
            error!("Reconciliation aborted: {}", e);
        }
    })
    .await;
}

async fn tick(
    reconciler: &NodeReconciler,
    metrics: &ControllerMetrics,
    snapshot: &ClusterSnapshot,
) -> pet_core::Result<TickReport> {
    info!("--- {}", Utc::now().to_rfc3339());
    metrics.ticks_total.inc();

    let result = reconciler.reconcile(snapshot).await;
    match &result {
        Ok(report) => {
            metrics.record(report);
            info!(
                "--- {} nodes, {} writes",
                report.nodes_seen,
                report.writes()
            );
        }
        Err(_) => metrics.tick_errors_total.inc(),
    }
    result
}
