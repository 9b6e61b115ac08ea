//! Aggregation of component conditions into the HyperConverged status.
//!
//! Operand handlers record only negative conditions. The aggregator completes the picture
//! with a fixed decision table, finishes an upgrade once every component reports
//! positively, and merges the result into the persisted condition list.

use kube::runtime::events::EventType;
use tracing::info;

use crate::controller::request::{HcoConditions, HcoRequest};
use crate::controller::status::set_status_condition;
use crate::controller::tainted::detect_tainted_configuration;
use crate::controller::upgrade_state_machine::{
    UpgradeEvent, UpgradeStateMachine, UpgradeStep, UpgradeTransitionContext,
};
use crate::crd::{ConditionStatus, ConditionType, HCO_CONDITION_TYPES, OPERATOR_VERSION_NAME};
use crate::health::Metrics;

pub const REASON_RECONCILE_COMPLETED: &str = "ReconcileCompleted";
pub const MESSAGE_RECONCILE_COMPLETED: &str = "Reconcile completed successfully";
pub const REASON_DEGRADED: &str = "HCODegraded";
pub const REASON_PROGRESSING: &str = "HCOProgressing";
pub const REASON_UPGRADING: &str = "HCOUpgrading";
pub const REASON_STATUS_UNKNOWN: &str = "StatusUnknown";
pub const MESSAGE_STATUS_UNKNOWN: &str = "Unknown Status";

/// Values of `status.systemHealthStatus`.
pub const SYSTEM_HEALTH_HEALTHY: &str = "healthy";
pub const SYSTEM_HEALTH_WARNING: &str = "warning";
pub const SYSTEM_HEALTH_ERROR: &str = "error";

/// Fill in the conditions the components did not report negatively.
///
/// Returns true if no component reported anything negative this cycle.
pub fn aggregate_component_conditions(req: &mut HcoRequest) -> bool {
    let all_components_up = req.conditions.is_empty();

    let completed = |req: &HcoRequest, t: ConditionType, s: ConditionStatus| {
        req.condition(t, s, REASON_RECONCILE_COMPLETED, MESSAGE_RECONCILE_COMPLETED)
    };

    let c = completed(req, ConditionType::ReconcileComplete, ConditionStatus::True);
    req.conditions.set(c);

    if req.conditions.has(ConditionType::Degraded) {
        let c = completed(req, ConditionType::Progressing, ConditionStatus::False);
        req.conditions.set_if_unset(c);
        let c = req.condition(
            ConditionType::Upgradeable,
            ConditionStatus::False,
            REASON_DEGRADED,
            "HCO is not Upgradeable due to degraded components",
        );
        req.conditions.set_if_unset(c);
        let c = req.condition(
            ConditionType::Available,
            ConditionStatus::False,
            REASON_DEGRADED,
            "HCO is not available due to degraded components",
        );
        req.conditions.set_if_unset(c);
        return all_components_up;
    }

    let c = completed(req, ConditionType::Degraded, ConditionStatus::False);
    req.conditions.set(c);

    if req.conditions.has(ConditionType::Progressing) {
        let c = req.condition(
            ConditionType::Upgradeable,
            ConditionStatus::False,
            REASON_PROGRESSING,
            "HCO is not Upgradeable due to progressing components",
        );
        req.conditions.set_if_unset(c);
        let c = completed(req, ConditionType::Available, ConditionStatus::True);
        req.conditions.set_if_unset(c);
    } else {
        let c = completed(req, ConditionType::Progressing, ConditionStatus::False);
        req.conditions.set(c);
        let c = completed(req, ConditionType::Upgradeable, ConditionStatus::True);
        req.conditions.set_if_unset(c);
        let c = completed(req, ConditionType::Available, ConditionStatus::True);
        req.conditions.set_if_unset(c);
    }

    all_components_up
}

/// Outcome of a completed cycle, reported with exactly one event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Completion {
    /// The upgrade finished in this cycle.
    UpgradeCompleted(String),
    /// Every component is ready.
    Ready,
    /// An upgrade is still running.
    Upgrading(String),
    /// At least one component reported negatively.
    NotReady,
}

impl Completion {
    /// Event type, reason and message announcing the outcome.
    pub fn event(&self) -> (EventType, &'static str, String) {
        match self {
            Completion::UpgradeCompleted(version) => (
                EventType::Normal,
                "UpgradeHCO",
                format!("Successfully upgraded to version {version}"),
            ),
            Completion::Ready => (
                EventType::Normal,
                "ReconcileHCO",
                "HCO Reconcile completed successfully".to_string(),
            ),
            Completion::Upgrading(version) => (
                EventType::Normal,
                "ReconcileHCO",
                format!("HCO is upgrading to version {version}"),
            ),
            Completion::NotReady => (
                EventType::Warning,
                "ReconcileHCO",
                "Not all the operators are ready".to_string(),
            ),
        }
    }
}

/// Aggregate, finish an upgrade if possible and decide the cycle outcome.
///
/// The upgrade finishes only when every component is up, every component reported its
/// expected version and no spec or metadata write is pending. While still upgrading,
/// Progressing is forced to True.
pub fn complete_reconciliation(req: &mut HcoRequest, upgrade_mode: &mut bool, own_version: &str) -> Completion {
    let all_components_up = aggregate_component_conditions(req);
    let mut upgrade_completed = false;

    let ctx = UpgradeTransitionContext {
        all_components_up,
        components_upgraded: req.component_upgrade_in_progress,
        writes_pending: req.dirty,
        ..Default::default()
    };
    let converged = UpgradeStateMachine::new()
        .transition(
            UpgradeStep::WaitComponentConvergence,
            UpgradeEvent::ComponentsConverged,
            &ctx,
        )
        .is_some();

    if *upgrade_mode && converged {
        req.instance
            .status
            .get_or_insert_with(Default::default)
            .update_version(OPERATOR_VERSION_NAME, own_version);
        req.status_dirty = true;
        *upgrade_mode = false;
        req.upgrade_mode = false;
        req.component_upgrade_in_progress = false;
        upgrade_completed = true;
        info!(version = own_version, "Successfully upgraded");
    }

    if *upgrade_mode {
        let c = req.condition(
            ConditionType::Progressing,
            ConditionStatus::True,
            REASON_UPGRADING,
            &format!("HCO is now upgrading to version {own_version}"),
        );
        req.conditions.set(c);
        return Completion::Upgrading(own_version.to_string());
    }

    if upgrade_completed {
        Completion::UpgradeCompleted(own_version.to_string())
    } else if all_components_up {
        Completion::Ready
    } else {
        Completion::NotReady
    }
}

/// Health summary of the in-memory conditions.
pub fn system_health_status(conditions: &HcoConditions) -> &'static str {
    if !conditions.is_true(ConditionType::Available) || conditions.is_true(ConditionType::Degraded) {
        SYSTEM_HEALTH_ERROR
    } else if !conditions.is_true(ConditionType::ReconcileComplete)
        || conditions.is_true(ConditionType::Progressing)
    {
        SYSTEM_HEALTH_WARNING
    } else {
        SYSTEM_HEALTH_HEALTHY
    }
}

/// Numeric value exported for a health status.
pub fn system_health_value(status: &str) -> i64 {
    match status {
        SYSTEM_HEALTH_HEALTHY => 0,
        SYSTEM_HEALTH_WARNING => 1,
        _ => 2,
    }
}

/// Merge the in-memory conditions into the persisted list.
///
/// Types missing from the cycle are recorded as Unknown. The status is only marked dirty
/// when the merged list, or the health summary, actually changed.
pub fn update_conditions(req: &mut HcoRequest, metrics: &Metrics) {
    let generation = req.generation();
    let status = req.instance.status.get_or_insert_with(Default::default);
    let mut conditions = status.conditions.clone();

    for condition_type in HCO_CONDITION_TYPES {
        let condition = match req.conditions.get(condition_type) {
            Some(c) => c.clone(),
            None => crate::crd::Condition::new(
                condition_type.as_str(),
                ConditionStatus::Unknown,
                REASON_STATUS_UNKNOWN,
                MESSAGE_STATUS_UNKNOWN,
                generation,
            ),
        };
        set_status_condition(&mut conditions, condition);
    }

    detect_tainted_configuration(&req.instance, &mut conditions, metrics);

    let health = system_health_status(&req.conditions);
    metrics.set_system_health_status(system_health_value(health));

    let status = req.instance.status.get_or_insert_with(Default::default);
    if conditions != status.conditions {
        status.conditions = conditions;
        req.status_dirty = true;
    }
    if status.system_health_status.as_deref() != Some(health) {
        status.system_health_status = Some(health.to_string());
        req.status_dirty = true;
    }
}
