//! hyperconverged-operator library crate
//!
//! This module exports the reconciliation core, the HyperConverged CRD and the wiring
//! that feeds watch events into the reconciler.

pub mod config;
pub mod controller;
pub mod crd;
pub mod health;

pub use health::HealthState;

use std::sync::Arc;

use futures::stream::{BoxStream, select_all};
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::api::{DynamicObject, GroupVersionKind};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{WatchStreamExt, metadata_watcher, watcher};
use kube::{Api, Client};
use tracing::{debug, error, info, warn};

use config::OperatorConfig;
use controller::cluster::{ClusterClient, KubeClusterClient};
use controller::context::{
    ClusterInfo, Context, KubeEventEmitter, UpgradeableConditionSink, api_server_gvk,
};
use controller::error::Result;
use controller::operands::{ComponentStatusHandler, default_components};
use controller::queue::{WorkQueue, work_queue};
use controller::reconciler::{HyperConvergedReconciler, error_policy};
use controller::request::ObjectKey;
use controller::upgrade_patch::UpgradePatchStore;
use crd::HyperConverged;
use health::Metrics;

/// Build the reconciler with its production collaborators.
///
/// The upgrade patch document is loaded and validated here; a document that fails
/// validation is fatal for the process.
pub async fn register_reconciler(
    client: Client,
    cluster_info: Arc<dyn ClusterInfo>,
    upgradeable: Arc<dyn UpgradeableConditionSink>,
    metrics: Arc<Metrics>,
) -> Result<HyperConvergedReconciler> {
    let config = OperatorConfig::from_env();
    config.operator_namespace()?;

    let cluster_client: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(client.clone()));
    let operands = Arc::new(ComponentStatusHandler::new(
        cluster_client.clone(),
        default_components(&config.component_versions),
    ));

    let upgrade_patches = Arc::new(UpgradePatchStore::new(config.upgrade_patches_path.clone()));
    upgrade_patches.get().await?;

    info!(
        version = %config.own_version,
        namespace = ?config.operator_namespace,
        "Registering the HyperConverged reconciler"
    );

    let ctx = Context {
        client: cluster_client,
        cluster_info,
        events: Arc::new(KubeEventEmitter::new(client)),
        upgradeable,
        operands,
        upgrade_patches,
        config,
        metrics,
    };
    Ok(HyperConvergedReconciler::new(Arc::new(ctx)))
}

/// Create the default watcher configuration.
///
/// `any_semantic()` gives more reliable resource discovery in test environments.
fn default_watcher_config() -> WatcherConfig {
    WatcherConfig::default().any_semantic()
}

/// Map every change of a watched stream to a fixed queue key.
fn keyed<S, T>(stream: S, key: ObjectKey, source: &'static str) -> BoxStream<'static, ObjectKey>
where
    S: Stream<Item = std::result::Result<T, watcher::Error>> + Send + 'static,
    T: Send + 'static,
{
    stream
        .filter_map(move |result| {
            let key = key.clone();
            async move {
                match result {
                    Ok(_) => Some(key),
                    Err(e) => {
                        warn!(source, error = %e, "Watch error");
                        None
                    }
                }
            }
        })
        .boxed()
}

/// Resolve a kind through discovery and watch its metadata cluster-wide.
async fn dynamic_metadata_stream(
    client: &Client,
    gvk: &GroupVersionKind,
    key: ObjectKey,
) -> Option<BoxStream<'static, ObjectKey>> {
    match kube::discovery::pinned_kind(client, gvk).await {
        Ok((ar, _)) => {
            let api: Api<DynamicObject> = Api::all_with(client.clone(), &ar);
            let stream = metadata_watcher(api, default_watcher_config())
                .default_backoff()
                .touched_objects();
            Some(keyed(stream, key, "dynamic"))
        }
        Err(e) => {
            warn!(kind = %gvk.kind, group = %gvk.group, error = %e, "Not watching kind");
            None
        }
    }
}

/// Build the watch streams feeding the queue.
///
/// The HyperConverged resource enqueues its own key. Subordinates and owned objects
/// enqueue the secondary placeholder; the APIServer configuration enqueues its own
/// placeholder so the reconciler refreshes its cached copy.
async fn watch_streams(
    client: &Client,
    reconciler: &HyperConvergedReconciler,
) -> Result<Vec<BoxStream<'static, ObjectKey>>> {
    let ctx = reconciler.context();
    let router = reconciler.router();
    let namespace = ctx.config.operator_namespace()?.to_string();
    let secondary = router.secondary_cr_key()?;

    let mut streams = Vec::new();

    let hyperconvergeds: Api<HyperConverged> = Api::namespaced(client.clone(), &namespace);
    streams.push(
        watcher(hyperconvergeds, default_watcher_config())
            .default_backoff()
            .touched_objects()
            .filter_map(|result| async move {
                match result {
                    Ok(hc) => Some(ObjectKey::of(&hc)),
                    Err(e) => {
                        warn!(error = %e, "HyperConverged watch error");
                        None
                    }
                }
            })
            .boxed(),
    );

    for component in default_components(&ctx.config.component_versions) {
        if let Some(stream) = dynamic_metadata_stream(client, &component.gvk, secondary.clone()).await {
            streams.push(stream);
        }
    }

    let configmaps: Api<ConfigMap> = Api::namespaced(client.clone(), &namespace);
    streams.push(keyed(
        metadata_watcher(configmaps, default_watcher_config())
            .default_backoff()
            .touched_objects(),
        secondary.clone(),
        "configmaps",
    ));
    let services: Api<Service> = Api::namespaced(client.clone(), &namespace);
    streams.push(keyed(
        metadata_watcher(services, default_watcher_config())
            .default_backoff()
            .touched_objects(),
        secondary,
        "services",
    ));

    if ctx.cluster_info.is_openshift() {
        let key = router.api_server_cr_key()?;
        if let Some(stream) = dynamic_metadata_stream(client, &api_server_gvk(), key).await {
            streams.push(stream);
        }
    }

    Ok(streams)
}

/// Drain the queue, one cycle at a time.
async fn run_worker(
    reconciler: &HyperConvergedReconciler,
    queue: &WorkQueue,
    mut receiver: controller::queue::WorkQueueReceiver,
    health_state: Option<&HealthState>,
) {
    while let Some(key) = receiver.next().await {
        match reconciler.reconcile(&key).await {
            Ok(outcome) => {
                if let Some(after) = outcome.requeue_after {
                    queue.add_after(key, after);
                } else if outcome.requeue {
                    let delay = queue.backoff(&key);
                    queue.add_after(key, delay);
                } else {
                    queue.forget(&key);
                }
                if let Some(state) = health_state {
                    state.mark_reconciled();
                }
            }
            Err(e) => {
                let delay = if e.requeue {
                    queue.backoff(&key).min(error_policy(&e))
                } else {
                    error_policy(&e)
                };
                debug!(key = %key, delay = ?delay, "Retrying after error");
                queue.add_after(key, delay);
            }
        }
    }
}

/// Run the operator controller.
///
/// Watches the HyperConverged resource and everything it drives, and reconciles
/// through a single-worker queue. If health_state is provided, readiness and the last
/// reconcile time are reported there.
pub async fn run_controller(
    client: Client,
    reconciler: HyperConvergedReconciler,
    health_state: Option<Arc<HealthState>>,
) -> Result<()> {
    info!("Starting controller for HyperConverged resources");

    let streams = watch_streams(&client, &reconciler).await?;
    let (queue, receiver) = work_queue();

    // Start with the primary key so a missing resource is noticed right away.
    queue.add(reconciler.router().primary_key()?);

    let feeder = {
        let queue = queue.clone();
        let mut events = select_all(streams);
        tokio::spawn(async move {
            while let Some(key) = events.next().await {
                queue.add(key);
            }
            error!("Watch streams ended unexpectedly");
        })
    };

    if let Some(ref state) = health_state {
        state.set_serving(true);
    }

    run_worker(&reconciler, &queue, receiver, health_state.as_deref()).await;

    feeder.abort();
    error!("Controller stream ended unexpectedly");
    Ok(())
}
