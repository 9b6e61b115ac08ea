//! Shared controller helpers.
//!
//! Utilities used by both the main reconciler and the upgrade engine.

use kube::ResourceExt;
use kube::api::GroupVersionKind;
use kube::runtime::events::EventType;
use tracing::info;

use crate::controller::cluster::ClusterClient;
use crate::controller::context::EventEmitter;
use crate::controller::error::Result;
use crate::controller::request::HcoRequest;
use crate::crd::RelatedObject;

/// Label every HyperConverged resource carries, with its own name as value.
pub const APP_LABEL: &str = "app";

/// Ensure the `app` label is set to the resource name. Marks the request dirty if changed.
pub fn ensure_app_label(req: &mut HcoRequest) -> bool {
    let name = req.instance.name_any();
    let labels = req.instance.labels_mut();
    if labels.get(APP_LABEL) == Some(&name) {
        return false;
    }
    labels.insert(APP_LABEL.to_string(), name);
    req.dirty = true;
    true
}

/// API version string of a kind (`v1` for the core group).
pub fn api_version(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        gvk.version.clone()
    } else {
        format!("{}/{}", gvk.group, gvk.version)
    }
}

/// Drop a related object, matched by apiVersion, kind, namespace and name.
/// Marks the status dirty if changed.
pub fn prune_related_object(req: &mut HcoRequest, reference: &RelatedObject) -> bool {
    let Some(status) = req.instance.status.as_mut() else {
        return false;
    };
    let removed = status.remove_related_objects(|o| o.same_object(reference));
    if removed {
        req.status_dirty = true;
    }
    removed
}

/// Delete an object if it exists, report the deletion and forget its related object.
///
/// Returns true if the object was deleted in this call.
pub async fn remove_object(
    client: &dyn ClusterClient,
    events: &dyn EventEmitter,
    req: &mut HcoRequest,
    gvk: &GroupVersionKind,
    namespace: Option<&str>,
    name: &str,
) -> Result<bool> {
    let deleted = client.delete_object(gvk, namespace, name).await?;
    if deleted {
        info!(kind = %gvk.kind, name, namespace = ?namespace, "Removed object");
        events
            .emit_event(
                &req.instance,
                EventType::Normal,
                "Killing",
                &format!("Removed {name} {}", gvk.kind),
            )
            .await;
    }
    let reference = RelatedObject::new(&api_version(gvk), &gvk.kind, namespace, name);
    prune_related_object(req, &reference);
    Ok(deleted)
}
