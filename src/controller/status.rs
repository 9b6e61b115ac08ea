//! Status management utilities.
//!
//! Provides the condition merge used for the persisted condition list and the write
//! protocol that flushes a cycle's changes back to the API server.

use kube::runtime::events::EventType;
use tracing::{debug, error};

use crate::controller::cluster::ClusterClient;
use crate::controller::context::EventEmitter;
use crate::controller::error::Result;
use crate::controller::request::HcoRequest;
use crate::crd::{Condition, ConditionType};

/// Add or update a condition.
///
/// The last transition time only moves when the status changes; reason, message and
/// observed generation always follow `new`.
pub fn set_status_condition(conditions: &mut Vec<Condition>, new: Condition) {
    let Some(existing) = conditions.iter_mut().find(|c| c.r#type == new.r#type) else {
        let mut new = new;
        if new.last_transition_time.is_empty() {
            new.last_transition_time = jiff::Timestamp::now().to_string();
        }
        conditions.push(new);
        return;
    };

    if existing.status != new.status {
        existing.status = new.status;
        existing.last_transition_time = if new.last_transition_time.is_empty() {
            jiff::Timestamp::now().to_string()
        } else {
            new.last_transition_time
        };
    }
    existing.reason = new.reason;
    existing.message = new.message;
    existing.observed_generation = new.observed_generation;
}

/// Remove a condition by type. Returns true if it was present.
pub fn remove_status_condition(conditions: &mut Vec<Condition>, condition_type: ConditionType) -> bool {
    let before = conditions.len();
    conditions.retain(|c| c.r#type != condition_type.as_str());
    before != conditions.len()
}

/// Get the reason for a condition
pub fn get_condition_reason(conditions: &[Condition], condition_type: ConditionType) -> Option<&str> {
    conditions
        .iter()
        .find(|c| c.r#type == condition_type.as_str())
        .map(|c| c.reason.as_str())
}

/// Flush the cycle's changes with a single write.
///
/// Spec or metadata changes win: the whole object is written and the caller must requeue,
/// since the status update is then still pending. Otherwise a dirty status is written
/// through the status subresource. Returns whether to requeue.
pub async fn update_hyperconverged(
    client: &dyn ClusterClient,
    events: &dyn EventEmitter,
    req: &mut HcoRequest,
) -> Result<bool> {
    if req.dirty {
        match client.update_hyperconverged(&req.instance).await {
            Ok(updated) => {
                debug!(name = %req.key, "Updated HyperConverged spec and metadata");
                req.instance = updated;
                return Ok(true);
            }
            Err(e) => {
                report_update_error(events, req, &e, "Failed to update HCO CR").await;
                return Err(e);
            }
        }
    }

    if req.status_dirty {
        match client.update_hyperconverged_status(&req.instance).await {
            Ok(updated) => {
                debug!(name = %req.key, "Updated HyperConverged status");
                req.instance = updated;
            }
            Err(e) => {
                report_update_error(events, req, &e, "Failed to update HCO Status").await;
                return Err(e);
            }
        }
    }

    Ok(false)
}

async fn report_update_error(
    events: &dyn EventEmitter,
    req: &HcoRequest,
    err: &crate::controller::error::Error,
    message: &str,
) {
    error!(name = %req.key, error = %err, "{message}");
    events
        .emit_event(&req.instance, EventType::Warning, "HcoUpdateError", message)
        .await;
}
