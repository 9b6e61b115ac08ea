//! Finalizer handling for the HyperConverged resource.

use kube::ResourceExt;
use tracing::info;

use crate::controller::request::HcoRequest;

/// Finalizer guarding the teardown of the subordinate resources.
pub const FINALIZER: &str = "kubevirt.io/hyperconverged";

/// Unqualified finalizer name set by old releases.
pub const LEGACY_FINALIZER: &str = "hyperconvergeds.hco.kubevirt.io";

/// What the rest of the cycle should do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalizerAction {
    /// The resource is live; reconcile normally.
    Continue,
    /// The resource is being deleted.
    Delete,
}

/// Remove every occurrence of `name`. Returns true if anything was removed.
fn drop_finalizer(finalizers: &mut Vec<String>, name: &str) -> bool {
    let before = finalizers.len();
    finalizers.retain(|f| f != name);
    before != finalizers.len()
}

/// Replace the legacy finalizer with the canonical one.
///
/// The canonical finalizer is only added while the resource is not being deleted.
pub fn check_finalizers(req: &mut HcoRequest) -> FinalizerAction {
    let deleting = req.instance.metadata.deletion_timestamp.is_some();
    let finalizers = req.instance.finalizers_mut();

    if drop_finalizer(finalizers, LEGACY_FINALIZER) {
        info!("Removing the legacy finalizer");
        req.dirty = true;
    }

    if deleting {
        return FinalizerAction::Delete;
    }

    let finalizers = req.instance.finalizers_mut();
    if !finalizers.iter().any(|f| f == FINALIZER) {
        info!(finalizer = FINALIZER, "Adding finalizer");
        finalizers.push(FINALIZER.to_string());
        req.dirty = true;
    }
    FinalizerAction::Continue
}

/// Drop both finalizer variants.
///
/// Returns true if a finalizer was removed in this call; such a change does not bump the
/// resource generation, so the caller must requeue to observe the result.
pub fn drop_finalizers(req: &mut HcoRequest) -> bool {
    let finalizers = req.instance.finalizers_mut();
    let dropped_canonical = drop_finalizer(finalizers, FINALIZER);
    let dropped_legacy = drop_finalizer(finalizers, LEGACY_FINALIZER);

    let dropped = dropped_canonical || dropped_legacy;
    if dropped {
        info!("Removed finalizers");
        req.dirty = true;
    }
    dropped
}
