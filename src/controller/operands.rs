//! Operand handling.
//!
//! An operand handler owns the subordinate resources: it renders them, folds their status
//! into the cycle's conditions and removes them on teardown. The reconcile core only sees
//! the `OperandHandler` trait. `ComponentStatusHandler` is the built-in handler: it does
//! not render specs, it only observes the subordinates' status and deletes them.

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use kube::api::{DynamicObject, GroupVersionKind};
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::ComponentVersions;
use crate::controller::cluster::ClusterClient;
use crate::controller::common::api_version;
use crate::controller::error::Result;
use crate::controller::request::HcoRequest;
use crate::crd::{ConditionStatus, ConditionType, HyperConverged, RelatedObject};

/// The subordinate resources behind the HyperConverged resource.
#[async_trait]
pub trait OperandHandler: Send + Sync {
    /// Drop per-cycle caches. Called on cycles triggered by the HyperConverged resource.
    fn reset(&self);

    /// One-time setup on the operator's first cycle.
    async fn first_use_initiation(&self, hc: &HyperConverged, is_openshift: bool);

    /// Reconcile every operand and record negative conditions in `req`.
    async fn ensure(&self, req: &mut HcoRequest) -> Result<()>;

    /// Remove every operand.
    async fn ensure_deleted(&self, req: &HcoRequest) -> Result<()>;

    /// Names of the quick start guides the current build ships.
    fn quick_start_names(&self) -> Vec<String>;
}

/// A condition as reported by a subordinate resource.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ComponentCondition {
    pub r#type: String,
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl ComponentCondition {
    fn is(&self, status: &str) -> bool {
        self.status.eq_ignore_ascii_case(status)
    }
}

/// Fold one subordinate's conditions and versions into `req`.
///
/// Only negative conditions are recorded. Returns true if the component has finished
/// upgrading: no negative conditions and the observed version equals the expected one.
/// `req.component_upgrade_in_progress` is cleared when it has not.
pub fn inspect_component_conditions(
    req: &mut HcoRequest,
    kind: &str,
    conditions: &[ComponentCondition],
    observed_version: Option<&str>,
    expected_version: Option<&str>,
) -> bool {
    if conditions.is_empty() {
        let message = format!("{kind} resource has no conditions");
        let reason = format!("{kind}Conditions");
        set_negative(req, ConditionType::Available, ConditionStatus::False, &reason, &message);
        set_negative(req, ConditionType::Progressing, ConditionStatus::True, &reason, &message);
        set_negative(req, ConditionType::Upgradeable, ConditionStatus::False, &reason, &message);
        req.component_upgrade_in_progress = false;
        return false;
    }

    let mut upgrade_done = true;
    let mut found_available = false;
    let mut found_progressing = false;
    let mut found_degraded = false;

    for condition in conditions {
        match condition.r#type.as_str() {
            "Available" => {
                found_available = true;
                if condition.is("False") {
                    upgrade_done = false;
                    set_negative(
                        req,
                        ConditionType::Available,
                        ConditionStatus::False,
                        &format!("{kind}NotAvailable"),
                        &format!("{kind} is not available: {}", condition.message),
                    );
                }
            }
            "Progressing" => {
                found_progressing = true;
                if condition.is("True") {
                    upgrade_done = false;
                    let reason = format!("{kind}Progressing");
                    let message = format!("{kind} is progressing: {}", condition.message);
                    set_negative(req, ConditionType::Progressing, ConditionStatus::True, &reason, &message);
                    set_negative(req, ConditionType::Upgradeable, ConditionStatus::False, &reason, &message);
                }
            }
            "Degraded" => {
                found_degraded = true;
                if condition.is("True") {
                    upgrade_done = false;
                    set_negative(
                        req,
                        ConditionType::Degraded,
                        ConditionStatus::True,
                        &format!("{kind}Degraded"),
                        &format!("{kind} is degraded: {}", condition.message),
                    );
                }
            }
            "Upgradeable" => {
                if condition.is("False") {
                    set_negative(
                        req,
                        ConditionType::Upgradeable,
                        ConditionStatus::False,
                        &format!("{kind}NotUpgradeable"),
                        &format!("{kind} is not upgradeable: {}", condition.message),
                    );
                }
            }
            _ => {}
        }
    }

    if !found_available {
        upgrade_done = false;
        set_negative(
            req,
            ConditionType::Available,
            ConditionStatus::False,
            &format!("{kind}NotAvailable"),
            &format!("{kind} is not available: missing \"Available\" condition"),
        );
    }
    if !found_progressing {
        upgrade_done = false;
        set_negative(
            req,
            ConditionType::Progressing,
            ConditionStatus::True,
            &format!("{kind}Progressing"),
            &format!("{kind} is progressing: missing \"Progressing\" condition"),
        );
    }
    if !found_degraded {
        upgrade_done = false;
        set_negative(
            req,
            ConditionType::Degraded,
            ConditionStatus::True,
            &format!("{kind}Degraded"),
            &format!("{kind} is degraded: missing \"Degraded\" condition"),
        );
    }

    if upgrade_done {
        if let Some(expected) = expected_version {
            if observed_version != Some(expected) {
                debug!(
                    kind,
                    observed = observed_version.unwrap_or_default(),
                    expected,
                    "Component is not yet at the expected version"
                );
                upgrade_done = false;
            }
        }
    }

    if !upgrade_done {
        req.component_upgrade_in_progress = false;
    }
    upgrade_done
}

fn set_negative(
    req: &mut HcoRequest,
    condition_type: ConditionType,
    status: ConditionStatus,
    reason: &str,
    message: &str,
) {
    let condition = req.condition(condition_type, status, reason, message);
    req.conditions.set(condition);
}

/// A subordinate resource observed by `ComponentStatusHandler`.
#[derive(Clone, Debug)]
pub struct Component {
    pub gvk: GroupVersionKind,
    pub name: String,
    /// Field under `status` carrying the deployed version.
    pub observed_version_field: &'static str,
    pub expected_version: Option<String>,
}

/// The subordinates deployed for a HyperConverged resource.
pub fn default_components(versions: &ComponentVersions) -> Vec<Component> {
    vec![
        Component {
            gvk: GroupVersionKind::gvk("kubevirt.io", "v1", "KubeVirt"),
            name: "kubevirt-kubevirt-hyperconverged".to_string(),
            observed_version_field: "observedKubeVirtVersion",
            expected_version: versions.kubevirt.clone(),
        },
        Component {
            gvk: GroupVersionKind::gvk("cdi.kubevirt.io", "v1beta1", "CDI"),
            name: "cdi-kubevirt-hyperconverged".to_string(),
            observed_version_field: "observedVersion",
            expected_version: versions.cdi.clone(),
        },
        Component {
            gvk: GroupVersionKind::gvk(
                "networkaddonsoperator.network.kubevirt.io",
                "v1",
                "NetworkAddonsConfig",
            ),
            name: "cluster".to_string(),
            observed_version_field: "observedVersion",
            expected_version: versions.network_addons.clone(),
        },
        Component {
            gvk: GroupVersionKind::gvk("ssp.kubevirt.io", "v1beta2", "SSP"),
            name: "ssp-kubevirt-hyperconverged".to_string(),
            observed_version_field: "observedVersion",
            expected_version: versions.ssp.clone(),
        },
        Component {
            gvk: GroupVersionKind::gvk("tektontasks.kubevirt.io", "v1alpha1", "TektonTasks"),
            name: "tto-kubevirt-hyperconverged".to_string(),
            observed_version_field: "observedVersion",
            expected_version: versions.tto.clone(),
        },
    ]
}

/// Operand handler that observes subordinate status without rendering specs.
pub struct ComponentStatusHandler {
    client: Arc<dyn ClusterClient>,
    components: Vec<Component>,
}

impl ComponentStatusHandler {
    pub fn new(client: Arc<dyn ClusterClient>, components: Vec<Component>) -> Self {
        Self { client, components }
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    fn read_status(obj: &DynamicObject, component: &Component) -> (Vec<ComponentCondition>, Option<String>) {
        let status = obj.data.get("status");
        let conditions = status
            .and_then(|s| s.get("conditions"))
            .and_then(|c| serde_json::from_value::<Vec<ComponentCondition>>(c.clone()).ok())
            .unwrap_or_default();
        let observed = status
            .and_then(|s| s.get(component.observed_version_field))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        (conditions, observed)
    }
}

#[async_trait]
impl OperandHandler for ComponentStatusHandler {
    fn reset(&self) {}

    async fn first_use_initiation(&self, hc: &HyperConverged, is_openshift: bool) {
        info!(
            name = %hc.name_any(),
            openshift = is_openshift,
            components = self.components.len(),
            "Initializing operand handler"
        );
    }

    async fn ensure(&self, req: &mut HcoRequest) -> Result<()> {
        let namespace = req.key.namespace.clone();
        for component in &self.components {
            let kind = component.gvk.kind.as_str();
            let Some(obj) = self
                .client
                .get_object(&component.gvk, Some(&namespace), &component.name)
                .await?
            else {
                let message = format!("{kind} resource does not exist");
                let reason = format!("{kind}NotAvailable");
                set_negative(req, ConditionType::Available, ConditionStatus::False, &reason, &message);
                set_negative(req, ConditionType::Upgradeable, ConditionStatus::False, &reason, &message);
                req.component_upgrade_in_progress = false;
                continue;
            };

            let mut related = RelatedObject::new(
                &api_version(&component.gvk),
                kind,
                obj.metadata.namespace.as_deref(),
                &component.name,
            );
            related.uid = obj.metadata.uid.clone();
            if req
                .instance
                .status
                .get_or_insert_with(Default::default)
                .add_related_object(related)
            {
                req.status_dirty = true;
            }

            let (conditions, observed) = Self::read_status(&obj, component);
            inspect_component_conditions(
                req,
                kind,
                &conditions,
                observed.as_deref(),
                component.expected_version.as_deref(),
            );
        }
        Ok(())
    }

    async fn ensure_deleted(&self, req: &HcoRequest) -> Result<()> {
        for component in &self.components {
            if self
                .client
                .delete_object(&component.gvk, Some(&req.key.namespace), &component.name)
                .await?
            {
                info!(kind = %component.gvk.kind, name = %component.name, "Deleted operand");
            }
        }
        Ok(())
    }

    fn quick_start_names(&self) -> Vec<String> {
        Vec::new()
    }
}
