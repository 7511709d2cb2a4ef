use anyhow::{Context, Result};
use clap::Parser;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ListParams;
use kube::{Api, Client};
use kube_runtime::watcher;
use pet_api::constants::{LABEL_SELECTOR, PET_NAMESPACE};
use pet_core::coalesce::{self, CONFIGMAP_SETTLE};
use pet_core::{wgkey, PeerInstaller};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod host;

use host::SystemHost;

/// Exit status when the watch-driven loop ends, which it never should
const LOOP_EXITED: i32 = 5;

/// Router-side controller that installs WireGuard peers for allocated nodes
#[derive(Parser, Debug)]
#[command(name = "router-controller", version)]
struct Args {
    /// List the ConfigMaps once, install peers a single time, then exit
    #[arg(long)]
    once: bool,

    /// WireGuard interface managed through wg-quick
    #[arg(long, env = "KUBE_PET_INTERFACE", default_value = "wg-gke")]
    interface: String,

    /// wg-quick config file, defaults to /etc/wireguard/<interface>.conf
    #[arg(long, env = "KUBE_PET_CONFIG_PATH")]
    config_path: Option<PathBuf>,

    /// Host reported as the source of emitted events
    #[arg(long, env = "HOSTNAME")]
    host: Option<String>,
}

impl Args {
    fn config_path(&self) -> PathBuf {
        self.config_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("/etc/wireguard/{}.conf", self.interface)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    info!("Starting router-controller...");

    let config_path = args.config_path();
    let installed = tokio::fs::read_to_string(&config_path)
        .await
        .with_context(|| format!("reading {}", config_path.display()))?;
    let router_key = wgkey::public_key_from_config(&installed)?;
    info!("Router public key: {}", router_key);

    let client = Client::try_default().await?;
    let host = SystemHost::new(client.clone(), &args.interface, args.host.clone());
    let mut installer = PeerInstaller::new(config_path, router_key, host);
    let api = Api::<ConfigMap>::namespaced(client, PET_NAMESPACE);

    if args.once {
        let config_maps = api
            .list(&ListParams::default().labels(LABEL_SELECTOR))
            .await?
            .items
            .into_iter()
            .map(Arc::new)
            .collect::<Vec<_>>();
        installer.handle(&config_maps).await?;
        return Ok(());
    }

    info!("Starting reflection sync...");
    let config_maps = coalesce::debounce(
        coalesce::reflect(api, watcher::Config::default().labels(LABEL_SELECTOR)),
        CONFIGMAP_SETTLE,
    );
    let installer = Arc::new(Mutex::new(installer));
    coalesce::run_sequential(config_maps, |config_maps| {
        let installer = installer.clone();
        async move {
            if let Err(e) = installer.lock().await.handle(&config_maps).await {
                error!("Failed to install peers: {}", e);
            }
        }
    })
    .await;

    error!("Completed infinite loop... wait what??");
    std::process::exit(LOOP_EXITED);
}
