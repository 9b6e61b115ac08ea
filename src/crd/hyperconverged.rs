//! HyperConverged Custom Resource Definition.
//!
//! The HyperConverged resource is the single object an administrator edits. Its spec is
//! rendered into the operand resources by the operand handler; its status aggregates
//! what those operands report.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Name every HyperConverged resource must carry.
pub const HYPERCONVERGED_NAME: &str = "kubevirt-hyperconverged";

/// API group of the HyperConverged resource.
pub const HYPERCONVERGED_GROUP: &str = "hco.kubevirt.io";

/// Name of the HyperConverged CRD.
pub const HYPERCONVERGED_CRD_NAME: &str = "hyperconvergeds.hco.kubevirt.io";

/// Entry in `status.versions` describing the operator itself.
pub const OPERATOR_VERSION_NAME: &str = "operator";

/// HyperConverged is the top-level resource of the operator.
///
/// Example:
/// ```yaml
/// apiVersion: hco.kubevirt.io/v1beta1
/// kind: HyperConverged
/// metadata:
///   name: kubevirt-hyperconverged
///   namespace: kubevirt-hyperconverged
/// spec:
///   liveMigrationConfig:
///     parallelMigrationsPerCluster: 5
/// ```
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "hco.kubevirt.io",
    version = "v1beta1",
    kind = "HyperConverged",
    plural = "hyperconvergeds",
    shortname = "hco",
    status = "HyperConvergedStatus",
    namespaced,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.systemHealthStatus"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HyperConvergedSpec {
    /// Storage class used for local storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_storage_class_name: Option<String>,

    /// Placement of infrastructure components.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infra: Option<serde_json::Value>,

    /// Placement of workload components.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workloads: Option<serde_json::Value>,

    /// Feature gates, by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub feature_gates: BTreeMap<String, bool>,

    /// Live migration tuning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_migration_config: Option<LiveMigrationConfigurations>,

    /// Cron expression for the data import scheduler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_import_schedule: Option<String>,

    /// Fields this operator does not interpret; they are carried through untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Live migration tuning knobs.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LiveMigrationConfigurations {
    /// Maximum number of migrations running in parallel in the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_migrations_per_cluster: Option<u32>,

    /// Maximum number of outbound migrations per node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_outbound_migrations_per_node: Option<u32>,

    /// Bandwidth limit of each migration, as a quantity (e.g. "64Mi").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_per_migration: Option<String>,

    /// Seconds per GiB of memory a migration may take before it is cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_timeout_per_gi_b: Option<i64>,

    /// Seconds without progress before a migration is cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_timeout: Option<i64>,
}

/// Status of a HyperConverged resource.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HyperConvergedStatus {
    /// Conditions describing the aggregated state of the operands.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Objects created and maintained by this operator.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_objects: Vec<RelatedObject>,

    /// Component versions as name/version pairs. The "operator" entry is this operator.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versions: Vec<Version>,

    /// The generation most recently observed by the controller.
    #[serde(default)]
    pub observed_generation: i64,

    /// One of "healthy", "warning" or "error".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_health_status: Option<String>,
}

impl HyperConvergedStatus {
    /// Record `version` under `name`, replacing any previous entry.
    pub fn update_version(&mut self, name: &str, version: &str) {
        match self.versions.iter_mut().find(|v| v.name == name) {
            Some(existing) => existing.version = version.to_string(),
            None => self.versions.push(Version {
                name: name.to_string(),
                version: version.to_string(),
            }),
        }
    }

    /// Get the version recorded under `name`.
    pub fn get_version(&self, name: &str) -> Option<&str> {
        self.versions
            .iter()
            .find(|v| v.name == name)
            .map(|v| v.version.as_str())
    }

    /// Add a related object unless an entry with the same identity is already there.
    ///
    /// Returns true if the list changed.
    pub fn add_related_object(&mut self, object: RelatedObject) -> bool {
        if self.related_objects.iter().any(|o| o.same_object(&object)) {
            return false;
        }
        self.related_objects.push(object);
        true
    }

    /// Drop every related object matching `pred`. Returns true if anything was dropped.
    pub fn remove_related_objects<F>(&mut self, pred: F) -> bool
    where
        F: Fn(&RelatedObject) -> bool,
    {
        let before = self.related_objects.len();
        self.related_objects.retain(|o| !pred(o));
        before != self.related_objects.len()
    }
}

/// Name/version pair in `status.versions`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    pub name: String,
    pub version: String,
}

/// Reference to an object whose lifecycle this operator influences.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RelatedObject {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

impl RelatedObject {
    pub fn new(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
            uid: None,
            resource_version: None,
        }
    }

    /// Identity comparison: apiVersion, kind, namespace and name.
    pub fn same_object(&self, other: &RelatedObject) -> bool {
        self.api_version == other.api_version
            && self.kind == other.kind
            && self.namespace == other.namespace
            && self.name == other.name
    }

    /// API group part of `api_version` ("" for the core group).
    pub fn group(&self) -> &str {
        match self.api_version.split_once('/') {
            Some((group, _)) => group,
            None => "",
        }
    }
}

/// Status of a condition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

/// Condition describes the state of the HyperConverged at a certain point.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition.
    pub status: ConditionStatus,
    /// Machine-readable reason for the condition's last transition.
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    #[serde(default)]
    pub last_transition_time: String,
    /// The generation of the resource this condition was observed for.
    #[serde(default)]
    pub observed_generation: i64,
}

impl Condition {
    /// Create a new condition stamped with the current time.
    pub fn new(
        condition_type: &str,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        generation: i64,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: jiff::Timestamp::now().to_string(),
            observed_generation: generation,
        }
    }
}

/// Types of conditions for HyperConverged.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ConditionType {
    /// The last reconcile cycle finished.
    ReconcileComplete,
    /// All operands are available.
    Available,
    /// At least one operand is rolling out a change.
    Progressing,
    /// At least one operand is degraded.
    Degraded,
    /// The operator may be upgraded.
    Upgradeable,
    /// An unsupported patch annotation is in effect.
    TaintedConfiguration,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::ReconcileComplete => "ReconcileComplete",
            ConditionType::Available => "Available",
            ConditionType::Progressing => "Progressing",
            ConditionType::Degraded => "Degraded",
            ConditionType::Upgradeable => "Upgradeable",
            ConditionType::TaintedConfiguration => "TaintedConfiguration",
        }
    }
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition types merged into the status on every cycle, in order.
pub const HCO_CONDITION_TYPES: [ConditionType; 5] = [
    ConditionType::ReconcileComplete,
    ConditionType::Available,
    ConditionType::Progressing,
    ConditionType::Degraded,
    ConditionType::Upgradeable,
];

/// Find a condition by type.
pub fn find_condition<'a>(
    conditions: &'a [Condition],
    condition_type: ConditionType,
) -> Option<&'a Condition> {
    conditions
        .iter()
        .find(|c| c.r#type == condition_type.as_str())
}

/// Check if a condition type is present with status True.
pub fn is_condition_true(conditions: &[Condition], condition_type: ConditionType) -> bool {
    find_condition(conditions, condition_type).is_some_and(|c| c.status == ConditionStatus::True)
}

/// Check if a condition type is present with status False.
pub fn is_condition_false(conditions: &[Condition], condition_type: ConditionType) -> bool {
    find_condition(conditions, condition_type).is_some_and(|c| c.status == ConditionStatus::False)
}
