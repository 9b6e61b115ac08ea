//! Shared context for the controller.
//!
//! The Context struct holds the capabilities the reconciler needs: cluster access,
//! cluster facts, the event sink, the OLM Upgradeable sink and the operand handler.
//! Each is a narrow trait so tests can substitute in-memory implementations.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::OperatorConfig;
use crate::controller::cluster::ClusterClient;
use crate::controller::error::Result;
use crate::controller::operands::OperandHandler;
use crate::controller::upgrade_patch::UpgradePatchStore;
use crate::crd::{ConditionStatus, HyperConverged};
use crate::health::Metrics;

/// Field manager name for the operator
pub const FIELD_MANAGER: &str = "hyperconverged-operator";

/// Facts about the cluster the operator runs in.
#[async_trait]
pub trait ClusterInfo: Send + Sync {
    fn is_managed_by_olm(&self) -> bool;
    fn is_openshift(&self) -> bool;
    /// Re-read the cluster APIServer configuration after it changed.
    async fn refresh_api_server_cr(&self) -> Result<()>;
}

/// Kubernetes events about the HyperConverged resource.
#[async_trait]
pub trait EventEmitter: Send + Sync {
    async fn emit_event(&self, hc: &HyperConverged, event_type: EventType, reason: &str, message: &str);
}

/// The OLM Upgradeable operator condition.
#[async_trait]
pub trait UpgradeableConditionSink: Send + Sync {
    async fn set(&self, status: ConditionStatus, reason: &str, message: &str) -> Result<()>;
}

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    pub client: Arc<dyn ClusterClient>,
    pub cluster_info: Arc<dyn ClusterInfo>,
    pub events: Arc<dyn EventEmitter>,
    pub upgradeable: Arc<dyn UpgradeableConditionSink>,
    pub operands: Arc<dyn OperandHandler>,
    pub upgrade_patches: Arc<UpgradePatchStore>,
    pub config: OperatorConfig,
    pub metrics: Arc<Metrics>,
}

/// Publishes events through the kube-runtime recorder.
#[derive(Clone)]
pub struct KubeEventEmitter {
    client: Client,
    reporter: Reporter,
}

impl KubeEventEmitter {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }

    /// Create an event recorder for publishing Kubernetes events
    fn recorder(&self) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone())
    }
}

#[async_trait]
impl EventEmitter for KubeEventEmitter {
    async fn emit_event(&self, hc: &HyperConverged, event_type: EventType, reason: &str, message: &str) {
        let object_ref = hc.object_ref(&());
        if let Err(e) = self
            .recorder()
            .publish(
                &Event {
                    type_: event_type,
                    reason: reason.into(),
                    note: Some(message.into()),
                    action: reason.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            warn!(reason = %reason, error = %e, "Failed to publish event");
        }
    }
}

/// OpenShift cluster configuration object watched for TLS settings.
pub fn api_server_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("config.openshift.io", "v1", "APIServer")
}

/// Name of the cluster-scoped APIServer configuration object.
pub const API_SERVER_CR_NAME: &str = "cluster";

/// Cluster facts determined once at startup.
pub struct StaticClusterInfo {
    client: Arc<dyn ClusterClient>,
    managed_by_olm: bool,
    openshift: bool,
    api_server: RwLock<Option<DynamicObject>>,
}

impl StaticClusterInfo {
    pub fn new(client: Arc<dyn ClusterClient>, managed_by_olm: bool, openshift: bool) -> Self {
        Self {
            client,
            managed_by_olm,
            openshift,
            api_server: RwLock::new(None),
        }
    }

    /// Probe the cluster: OpenShift serves the APIServer configuration kind.
    pub async fn detect(client: Arc<dyn ClusterClient>, config: &OperatorConfig) -> Result<Self> {
        let api_server = client
            .get_object(&api_server_gvk(), None, API_SERVER_CR_NAME)
            .await?;
        let openshift = api_server.is_some();
        info!(
            openshift,
            managed_by_olm = config.is_managed_by_olm(),
            "Detected cluster capabilities"
        );
        let info = Self::new(client, config.is_managed_by_olm(), openshift);
        *info.api_server.write().await = api_server;
        Ok(info)
    }

    /// Last observed APIServer configuration object.
    pub async fn api_server(&self) -> Option<DynamicObject> {
        self.api_server.read().await.clone()
    }
}

#[async_trait]
impl ClusterInfo for StaticClusterInfo {
    fn is_managed_by_olm(&self) -> bool {
        self.managed_by_olm
    }

    fn is_openshift(&self) -> bool {
        self.openshift
    }

    async fn refresh_api_server_cr(&self) -> Result<()> {
        if !self.openshift {
            return Ok(());
        }
        let latest = self
            .client
            .get_object(&api_server_gvk(), None, API_SERVER_CR_NAME)
            .await?;
        debug!(found = latest.is_some(), "Refreshed the APIServer configuration");
        *self.api_server.write().await = latest;
        Ok(())
    }
}

/// Writes the Upgradeable condition on the OLM OperatorCondition object.
pub struct OperatorConditionSink {
    client: Client,
    namespace: String,
    name: String,
}

impl OperatorConditionSink {
    pub fn new(client: Client, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    fn api(&self) -> Api<DynamicObject> {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk(
            "operators.coreos.com",
            "v2",
            "OperatorCondition",
        ));
        Api::namespaced_with(self.client.clone(), &self.namespace, &ar)
    }
}

#[async_trait]
impl UpgradeableConditionSink for OperatorConditionSink {
    async fn set(&self, status: ConditionStatus, reason: &str, message: &str) -> Result<()> {
        let patch = serde_json::json!({
            "spec": {
                "conditions": [{
                    "type": "Upgradeable",
                    "status": status.to_string(),
                    "reason": reason,
                    "message": message,
                    "lastTransitionTime": jiff::Timestamp::now().to_string(),
                }]
            }
        });
        self.api()
            .patch(
                &self.name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        debug!(status = %status, reason, "Set the Upgradeable operator condition");
        Ok(())
    }
}

/// Sink used when the operator is not deployed by OLM.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopUpgradeableSink;

#[async_trait]
impl UpgradeableConditionSink for NoopUpgradeableSink {
    async fn set(&self, _status: ConditionStatus, _reason: &str, _message: &str) -> Result<()> {
        Ok(())
    }
}
