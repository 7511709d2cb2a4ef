//! Turning watch caches into settled, coalesced snapshots
//!
//! Every stage hands values on through a `tokio::sync::watch` channel, so
//! only the latest value is ever retained between stages. A slow consumer
//! sees the newest snapshot when it gets back around, never a backlog.

use futures::StreamExt;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::core::v1::{ConfigMap, Node, NodeSpec};
use kube::api::Api;
use kube::Resource;
use kube_runtime::{reflector, watcher, WatchStreamExt};
use pet_api::constants::NOISY_ANNOTATION_PREFIX;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const NODE_SETTLE: Duration = Duration::from_millis(250);
pub const CONFIGMAP_SETTLE: Duration = Duration::from_millis(100);
pub const CSR_SETTLE: Duration = Duration::from_millis(250);
pub const COMBINED_SETTLE: Duration = Duration::from_millis(1000);

/// Latest-value slot shared between a producer stage and the next one
pub type Latest<T> = watch::Receiver<Option<T>>;

/// Mirror a resource collection and publish a full snapshot after every change.
///
/// Nothing is published until the initial list has completed, and again
/// nothing while a relist is in progress.
pub fn reflect<K>(api: Api<K>, config: watcher::Config) -> Latest<Vec<Arc<K>>>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    let (tx, rx) = watch::channel(None);
    let (reader, writer) = reflector::store();
    let kind = K::kind(&K::DynamicType::default()).to_string();

    tokio::spawn(async move {
        let stream = reflector(writer, watcher(api, config).default_backoff());
        futures::pin_mut!(stream);

        let mut synced = false;
        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Init) => {
                    synced = false;
                    continue;
                }
                Ok(watcher::Event::InitDone) => {
                    if !synced {
                        info!("{} reflector synced with {} objects", kind, reader.state().len());
                    }
                    synced = true;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("{} watch error: {}", kind, e);
                    continue;
                }
            }

            if synced && tx.send(Some(reader.state())).is_err() {
                return;
            }
        }
        warn!("{} watch stream ended", kind);
    });

    rx
}

/// Re-publish a value only once its source has been quiet for `window`
pub fn debounce<T>(mut input: Latest<T>, window: Duration) -> Latest<T>
where
    T: Clone + Send + Sync + 'static,
{
    let (tx, rx) = watch::channel(None);

    tokio::spawn(async move {
        while input.changed().await.is_ok() {
            let mut closed = false;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(window) => break,
                    changed = input.changed() => {
                        if changed.is_err() {
                            closed = true;
                            break;
                        }
                    }
                }
            }

            let latest = input.borrow_and_update().clone();
            if latest.is_some() && tx.send(latest).is_err() {
                return;
            }
            if closed {
                return;
            }
        }
    });

    rx
}

/// Drop values whose key equals the key of the last value passed on
pub fn distinct_by_key<T, K, F>(mut input: Latest<T>, key_fn: F) -> Latest<T>
where
    T: Clone + Send + Sync + 'static,
    K: PartialEq + Send + 'static,
    F: Fn(&T) -> K + Send + 'static,
{
    let (tx, rx) = watch::channel(None);

    tokio::spawn(async move {
        let mut last_key: Option<K> = None;
        while input.changed().await.is_ok() {
            let Some(value) = input.borrow_and_update().clone() else {
                continue;
            };
            let key = key_fn(&value);
            if last_key.as_ref() == Some(&key) {
                debug!("Suppressing snapshot with unchanged key");
                continue;
            }
            last_key = Some(key);
            if tx.send(Some(value)).is_err() {
                return;
            }
        }
    });

    rx
}

/// Combine three sources positionally, emitting whenever any of them changes
/// once all three have produced a value.
pub fn combine_latest<A, B, C>(mut a: Latest<A>, mut b: Latest<B>, mut c: Latest<C>) -> Latest<(A, B, C)>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    let (tx, rx) = watch::channel(None);

    tokio::spawn(async move {
        loop {
            let changed = tokio::select! {
                r = a.changed() => r,
                r = b.changed() => r,
                r = c.changed() => r,
            };
            if changed.is_err() {
                return;
            }

            let latest = (
                a.borrow_and_update().clone(),
                b.borrow_and_update().clone(),
                c.borrow_and_update().clone(),
            );
            if let (Some(a), Some(b), Some(c)) = latest {
                if tx.send(Some((a, b, c))).is_err() {
                    return;
                }
            }
        }
    });

    rx
}

/// Feed values to `handler` one at a time.
///
/// Values arriving while a handler call is in flight collapse into the
/// newest one. Returns once the source is closed and drained.
pub async fn run_sequential<T, F, Fut>(mut input: Latest<T>, mut handler: F)
where
    T: Clone,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = ()>,
{
    while input.changed().await.is_ok() {
        let latest = input.borrow_and_update().clone();
        if let Some(value) = latest {
            handler(value).await;
        }
    }
}

/// Everything one node controller tick looks at
pub type NodeInputs = (
    Vec<Arc<Node>>,
    Vec<Arc<ConfigMap>>,
    Vec<Arc<CertificateSigningRequest>>,
);

/// Settle the node controller's three sources into one stream of ticks.
///
/// Each source settles on its own window and node lists only pass when their
/// change key moves. The combination then settles for [`COMBINED_SETTLE`].
pub fn settle_node_inputs(
    nodes: Latest<Vec<Arc<Node>>>,
    config_maps: Latest<Vec<Arc<ConfigMap>>>,
    csrs: Latest<Vec<Arc<CertificateSigningRequest>>>,
) -> Latest<NodeInputs> {
    let nodes = distinct_by_key(debounce(nodes, NODE_SETTLE), |nodes| node_change_key(nodes));
    let config_maps = debounce(config_maps, CONFIGMAP_SETTLE);
    let csrs = debounce(csrs, CSR_SETTLE);
    debounce(combine_latest(nodes, config_maps, csrs), COMBINED_SETTLE)
}

/// What about a node is worth reconciling over
pub type NodeChangeKey = Vec<(Option<String>, Vec<(String, String)>, Option<NodeSpec>)>;

/// Reduce a node list to names, non-noisy annotations and specs, ordered by name
pub fn node_change_key(nodes: &[Arc<Node>]) -> NodeChangeKey {
    let mut key: NodeChangeKey = nodes
        .iter()
        .map(|node| {
            let annotations = node
                .metadata
                .annotations
                .iter()
                .flatten()
                .filter(|(k, _)| !k.starts_with(NOISY_ANNOTATION_PREFIX))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            (node.metadata.name.clone(), annotations, node.spec.clone())
        })
        .collect();
    key.sort_by(|a, b| a.0.cmp(&b.0));
    key
}
