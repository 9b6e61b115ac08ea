//! Per-cycle reconcile request state.

use std::collections::BTreeMap;
use std::fmt;

use kube::ResourceExt;

use crate::crd::{Condition, ConditionStatus, ConditionType, HyperConverged};

/// Namespaced name identifying a work-queue entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a namespaced Kubernetes object.
    pub fn of<K: ResourceExt>(obj: &K) -> Self {
        Self::new(obj.namespace().unwrap_or_default(), obj.name_any())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// In-memory conditions collected during one cycle, keyed by type.
///
/// Only negative component conditions are recorded by operand handlers; the aggregator
/// fills in the rest.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HcoConditions(BTreeMap<String, Condition>);

impl HcoConditions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a condition, replacing any entry of the same type.
    pub fn set(&mut self, condition: Condition) {
        self.0.insert(condition.r#type.clone(), condition);
    }

    /// Set a condition only if no entry of that type exists yet.
    pub fn set_if_unset(&mut self, condition: Condition) {
        self.0.entry(condition.r#type.clone()).or_insert(condition);
    }

    pub fn has(&self, condition_type: ConditionType) -> bool {
        self.0.contains_key(condition_type.as_str())
    }

    pub fn get(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.0.get(condition_type.as_str())
    }

    pub fn is_true(&self, condition_type: ConditionType) -> bool {
        self.get(condition_type)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// State of a single reconcile cycle.
#[derive(Clone, Debug)]
pub struct HcoRequest {
    /// Resolved identity of the HyperConverged resource.
    pub key: ObjectKey,
    /// Working copy of the resource; written back at the end of the cycle.
    pub instance: HyperConverged,
    /// Conditions collected this cycle.
    pub conditions: HcoConditions,
    /// Spec or metadata changed and must be written.
    pub dirty: bool,
    /// Status changed and must be written.
    pub status_dirty: bool,
    pub upgrade_mode: bool,
    /// Cleared by operand handlers while any component is still converging.
    pub component_upgrade_in_progress: bool,
    /// The cycle was triggered by the HyperConverged resource itself.
    pub hco_triggered: bool,
}

impl HcoRequest {
    pub fn new(key: ObjectKey, instance: HyperConverged, upgrade_mode: bool, hco_triggered: bool) -> Self {
        Self {
            key,
            instance,
            conditions: HcoConditions::new(),
            dirty: false,
            status_dirty: false,
            upgrade_mode,
            component_upgrade_in_progress: upgrade_mode,
            hco_triggered,
        }
    }

    pub fn set_upgrade_mode(&mut self, upgrade_mode: bool) {
        self.upgrade_mode = upgrade_mode;
        self.component_upgrade_in_progress = upgrade_mode;
    }

    pub fn generation(&self) -> i64 {
        self.instance.metadata.generation.unwrap_or_default()
    }

    /// Build a condition stamped with the resource's current generation.
    pub fn condition(
        &self,
        condition_type: ConditionType,
        status: ConditionStatus,
        reason: &str,
        message: &str,
    ) -> Condition {
        Condition::new(
            condition_type.as_str(),
            status,
            reason,
            message,
            self.generation(),
        )
    }
}
