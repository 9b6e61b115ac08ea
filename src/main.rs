//! hyperconverged-operator - drives the virtualization operands through a single
//! HyperConverged resource.
//!
//! Bootstrap only: logging, the Kubernetes client, the probe server, leader election
//! and the reconcile loop. Everything else lives in the library.

use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use hyperconverged_operator::config::OperatorConfig;
use hyperconverged_operator::controller::cluster::{ClusterClient, KubeClusterClient};
use hyperconverged_operator::controller::context::{
    ClusterInfo, NoopUpgradeableSink, OperatorConditionSink, StaticClusterInfo,
    UpgradeableConditionSink,
};
use hyperconverged_operator::health::{HealthState, run_health_server};
use hyperconverged_operator::{register_reconciler, run_controller};

const LEASE_NAME: &str = "hyperconverged-cluster-operator-lock";
const LEASE_TTL: Duration = Duration::from_secs(15);
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Time given to the in-flight cycle before the process exits.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    init_tracing()?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting hyperconverged-operator");

    let config = OperatorConfig::from_env();
    let client = Client::try_default().await?;

    // Probes answer while this replica waits for the lease.
    let health_state = Arc::new(HealthState::new());
    let health_handle = {
        let health_state = health_state.clone();
        let port = config.health_port;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, port).await {
                error!(error = %e, "Health server failed");
            }
        })
    };

    let lease = lease_lock(&client, &config);
    acquire_leadership(&lease).await;
    let lease_handle = spawn_lease_renewal(lease);

    // An invalid upgrade patch document fails here and stops the process.
    let cluster_client: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(client.clone()));
    let cluster_info: Arc<dyn ClusterInfo> =
        Arc::new(StaticClusterInfo::detect(cluster_client, &config).await?);
    let reconciler = register_reconciler(
        client.clone(),
        cluster_info,
        upgradeable_sink(&client, &config),
        health_state.metrics.clone(),
    )
    .await?;

    let controller_handle = {
        let health_state = health_state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_controller(client, reconciler, Some(health_state)).await {
                error!(error = %e, "Controller failed");
            }
        })
    };

    tokio::select! {
        result = controller_handle => {
            if let Err(e) = result {
                error!(error = %e, "Controller task panicked");
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!(error = %e, "Health server task panicked");
            }
        }
        result = lease_handle => {
            // Losing the lease ends the process so Kubernetes restarts it into the election.
            health_state.set_serving(false);
            return match result {
                Ok(lost) => Err(lost.into()),
                Err(e) => Err(e.into()),
            };
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
            health_state.set_serving(false);
            tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;
        }
    }

    info!("Operator stopped");
    Ok(())
}

fn init_tracing() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hyperconverged_operator=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .json()
        .init();
    Ok(())
}

/// Lease lock held by this pod, falling back to the hostname as holder identity.
fn lease_lock(client: &Client, config: &OperatorConfig) -> LeaseLock {
    let holder_id = config.pod_name.clone().unwrap_or_else(|| {
        warn!("POD_NAME not set, using hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    });
    info!(
        holder_id = %holder_id,
        namespace = %config.lease_namespace(),
        lease_name = LEASE_NAME,
        "Initializing leader election"
    );
    LeaseLock::new(
        client.clone(),
        config.lease_namespace(),
        LeaseLockParams {
            holder_id,
            lease_name: LEASE_NAME.to_string(),
            lease_ttl: LEASE_TTL,
        },
    )
}

async fn acquire_leadership(lease: &LeaseLock) {
    loop {
        match lease.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                info!("Acquired leadership");
                return;
            }
            Ok(_) => info!("Another instance is leader, waiting"),
            Err(e) => warn!(error = %e, "Failed to acquire lease, retrying"),
        }
        tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
    }
}

/// Keep renewing the lease; the task only finishes when leadership is lost.
fn spawn_lease_renewal(lease: LeaseLock) -> JoinHandle<String> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
            match lease.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {}
                Ok(_) => {
                    error!("Lost leadership");
                    return "leadership lost".to_string();
                }
                Err(e) => {
                    error!(error = %e, "Failed to renew lease");
                    return format!("failed to renew lease: {e}");
                }
            }
        }
    })
}

/// The OLM OperatorCondition sink when deployed by OLM, otherwise a no-op.
fn upgradeable_sink(client: &Client, config: &OperatorConfig) -> Arc<dyn UpgradeableConditionSink> {
    match (&config.operator_namespace, &config.operator_condition_name) {
        (Some(ns), Some(name)) => {
            Arc::new(OperatorConditionSink::new(client.clone(), ns.clone(), name.clone()))
        }
        _ => Arc::new(NoopUpgradeableSink),
    }
}

/// Wait for SIGTERM or SIGINT.
///
/// Failing to install a handler is fatal; the operator could not shut down cleanly.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
