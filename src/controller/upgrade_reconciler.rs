//! Upgrade engine for the HyperConverged resource.
//!
//! Runs the cluster-mutating upgrade steps in order. A step that writes ends the cycle
//! with a requeue; completion is decided later by the condition aggregator once every
//! component reports the new version.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::ResourceExt;
use kube::api::GroupVersionKind;
use kube::runtime::events::EventType;
use tracing::{debug, info, warn};

use crate::controller::common::{prune_related_object, remove_object};
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::request::HcoRequest;
use crate::controller::upgrade_patch::UpgradePatches;
use crate::controller::upgrade_state_machine::{
    UpgradeEvent, UpgradeStateMachine, UpgradeStep, UpgradeTransitionContext,
};
use crate::controller::version::parse_tolerant;
use crate::crd::{HYPERCONVERGED_CRD_NAME, OPERATOR_VERSION_NAME, RelatedObject};

/// Schema versions no longer stored for the HyperConverged CRD.
pub const DEPRECATED_CRD_VERSIONS: [&str; 1] = ["v1alpha1"];

/// Group of the retired VM import components.
pub const V2V_GROUP: &str = "v2v.kubevirt.io";

/// CRDs of retired components, as (kind, CRD name).
pub const DEPRECATED_CRDS: [(&str, &str); 3] = [
    ("V2VVmware", "v2vvmwares.v2v.kubevirt.io"),
    ("OVirtProvider", "ovirtproviders.v2v.kubevirt.io"),
    ("VMImportConfig", "vmimportconfigs.v2v.kubevirt.io"),
];

/// Name of the metrics Service and Endpoints created by old releases.
pub const LEGACY_METRICS_NAME: &str = "kubevirt-hyperconverged-operator-metrics";
/// ConfigMap created by old releases.
pub const LEGACY_STORAGE_CONFIG_MAP: &str = "kubevirt-storage-class-defaults";
/// Role and RoleBinding created by old releases.
pub const LEGACY_CONFIG_READER_ROLE: &str = "hco.kubevirt.io:config-reader";

/// Label selecting the quick start guides this operator created.
pub const QUICK_START_SELECTOR: &str = "app.kubernetes.io/managed-by=kubevirt-hyperconverged-operator";

/// Version assumed when nothing was recorded.
const UNKNOWN_VERSION: &str = "0.0.0";

/// Whether the upgrade engine finished its steps in this cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpgradeProgress {
    /// A step wrote something; end the cycle and come back.
    Requeue,
    /// Every step is done; continue with the operands.
    Continue,
}

pub fn console_quick_start_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("console.openshift.io", "v1", "ConsoleQuickStart")
}

/// Objects removed unconditionally during an upgrade, as (kind, namespaced).
fn legacy_objects() -> Vec<(GroupVersionKind, &'static str)> {
    vec![
        (GroupVersionKind::gvk("", "v1", "Service"), LEGACY_METRICS_NAME),
        (GroupVersionKind::gvk("", "v1", "Endpoints"), LEGACY_METRICS_NAME),
        (GroupVersionKind::gvk("", "v1", "ConfigMap"), LEGACY_STORAGE_CONFIG_MAP),
        (
            GroupVersionKind::gvk("rbac.authorization.k8s.io", "v1", "Role"),
            LEGACY_CONFIG_READER_ROLE,
        ),
        (
            GroupVersionKind::gvk("rbac.authorization.k8s.io", "v1", "RoleBinding"),
            LEGACY_CONFIG_READER_ROLE,
        ),
    ]
}

/// Check whether an upgrade starts in this cycle.
///
/// A resource without a recorded operator version is a first deployment: the running
/// version is recorded and no upgrade starts.
pub fn detect_upgrade(req: &mut HcoRequest, own_version: &str) -> bool {
    let known = req
        .instance
        .status
        .as_ref()
        .and_then(|s| s.get_version(OPERATOR_VERSION_NAME))
        .map(str::to_string);

    let ctx = UpgradeTransitionContext {
        first_deployment: known.is_none(),
        version_differs: known.as_deref() != Some(own_version),
        ..Default::default()
    };
    let upgrading = UpgradeStateMachine::new()
        .transition(UpgradeStep::Stable, UpgradeEvent::VersionChanged, &ctx)
        .is_some();

    if known.is_none() {
        info!(version = own_version, "Recording the operator version of a new deployment");
        req.instance
            .status
            .get_or_insert_with(Default::default)
            .update_version(OPERATOR_VERSION_NAME, own_version);
        req.status_dirty = true;
    }
    upgrading
}

/// Run the upgrade steps, starting over from the detected upgrade.
///
/// Every step is idempotent, so a cycle that was interrupted resumes at the first step
/// that still has work to do.
pub async fn reconcile_upgrade(ctx: &Context, req: &mut HcoRequest) -> Result<UpgradeProgress> {
    let patches = ctx.upgrade_patches.get().await?;
    let sm = UpgradeStateMachine::new();
    let transition_ctx = UpgradeTransitionContext::default();

    let mut step = UpgradeStep::DetectUpgrade;
    loop {
        let (done, event) = match step {
            UpgradeStep::DetectUpgrade => (true, UpgradeEvent::UpgradeStarted),
            UpgradeStep::PruneCrdVersions => {
                (handle_prune_crd_versions(ctx).await?, UpgradeEvent::CrdVersionsPruned)
            }
            UpgradeStep::RemoveDeprecatedCrds => (
                handle_remove_deprecated_crds(ctx, req).await?,
                UpgradeEvent::DeprecatedCrdsRemoved,
            ),
            UpgradeStep::ApplyDeclarativeMigrations => (
                handle_declarative_migrations(ctx, req, &patches).await?,
                UpgradeEvent::MigrationsApplied,
            ),
            UpgradeStep::WaitComponentConvergence => return Ok(UpgradeProgress::Continue),
            UpgradeStep::Stable => {
                return Err(Error::Validation(format!("unexpected upgrade step {step}")));
            }
        };

        if !done {
            debug!(step = %step, "Upgrade step made changes, requeueing");
            return Ok(UpgradeProgress::Requeue);
        }

        step = sm
            .transition(step, event, &transition_ctx)
            .map(|t| t.to)
            .ok_or_else(|| Error::Validation(format!("no transition from {step} on {event}")))?;
    }
}

/// Drop deprecated versions from the CRD's stored versions.
///
/// Returns true when nothing had to be written.
async fn handle_prune_crd_versions(ctx: &Context) -> Result<bool> {
    let Some(mut crd) = ctx.client.get_crd(HYPERCONVERGED_CRD_NAME).await? else {
        return Ok(true);
    };
    if !prune_stored_versions(&mut crd) {
        return Ok(true);
    }

    info!(crd = HYPERCONVERGED_CRD_NAME, "Removing deprecated stored versions");
    ctx.client.update_crd_status(&crd).await?;
    Ok(false)
}

/// Remove the deprecated versions from `status.storedVersions`. Returns true if changed.
pub fn prune_stored_versions(crd: &mut CustomResourceDefinition) -> bool {
    let Some(stored) = crd.status.as_mut().and_then(|s| s.stored_versions.as_mut()) else {
        return false;
    };
    let before = stored.len();
    stored.retain(|v| !DEPRECATED_CRD_VERSIONS.contains(&v.as_str()));
    before != stored.len()
}

/// Delete the CRDs of retired components.
///
/// Returns true once none of them is left.
async fn handle_remove_deprecated_crds(ctx: &Context, req: &mut HcoRequest) -> Result<bool> {
    let mut remaining = false;

    for (kind, crd_name) in DEPRECATED_CRDS {
        if ctx.client.get_crd(crd_name).await?.is_some() {
            remaining = true;
            if ctx.client.delete_crd(crd_name).await? {
                info!(crd = crd_name, "Removed deprecated CRD");
                ctx.events
                    .emit_event(
                        &req.instance,
                        EventType::Normal,
                        "Killing",
                        &format!("Removed {crd_name} CustomResourceDefinition"),
                    )
                    .await;
            }
            continue;
        }

        if let Some(status) = req.instance.status.as_mut() {
            if status.remove_related_objects(|o| o.group() == V2V_GROUP && o.kind == kind) {
                req.status_dirty = true;
            }
        }
    }

    Ok(!remaining)
}

/// Apply the declarative migrations and the fixed legacy cleanups.
///
/// Returns true when the spec did not change.
async fn handle_declarative_migrations(
    ctx: &Context,
    req: &mut HcoRequest,
    patches: &UpgradePatches,
) -> Result<bool> {
    let known = req
        .instance
        .status
        .as_ref()
        .and_then(|s| s.get_version(OPERATOR_VERSION_NAME))
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(UNKNOWN_VERSION)
        .to_string();
    let known = parse_tolerant(&known)?;

    let patched_spec = patches.apply_spec_patches(&known, &req.instance.spec)?;

    for entry in patches.objects_to_remove(&known) {
        let entry = entry?;
        let gvk = entry.group_version_kind.to_gvk();
        remove_object(
            ctx.client.as_ref(),
            ctx.events.as_ref(),
            req,
            &gvk,
            entry.object_key.namespace.as_deref(),
            &entry.object_key.name,
        )
        .await?;
    }

    let namespace = req.key.namespace.clone();
    for (gvk, name) in legacy_objects() {
        remove_object(
            ctx.client.as_ref(),
            ctx.events.as_ref(),
            req,
            &gvk,
            Some(&namespace),
            name,
        )
        .await?;
    }

    remove_stale_quick_starts(ctx, req).await;

    match patched_spec {
        Some(spec) => {
            info!(known_version = %known, "Upgrade patches changed the HyperConverged spec");
            req.instance.spec = spec;
            req.dirty = true;
            Ok(false)
        }
        None => Ok(true),
    }
}

/// Delete generated quick start guides the running build no longer ships.
///
/// Failures are logged and otherwise ignored; the guides are cosmetic.
async fn remove_stale_quick_starts(ctx: &Context, req: &mut HcoRequest) {
    let gvk = console_quick_start_gvk();
    let wanted = ctx.operands.quick_start_names();

    let existing = match ctx.client.list_objects(&gvk, None, QUICK_START_SELECTOR).await {
        Ok(items) => items,
        Err(e) => {
            warn!(error = %e, "Failed to list quick start guides");
            return;
        }
    };

    for qs in existing {
        let name = qs.name_any();
        if wanted.contains(&name) {
            continue;
        }
        if let Err(e) = remove_object(
            ctx.client.as_ref(),
            ctx.events.as_ref(),
            req,
            &gvk,
            None,
            &name,
        )
        .await
        {
            warn!(name = %name, error = %e, "Failed to remove quick start guide");
        }
    }

    let stale: Vec<RelatedObject> = req
        .instance
        .status
        .iter()
        .flat_map(|s| s.related_objects.iter())
        .filter(|o| o.kind == gvk.kind && o.group() == gvk.group && !wanted.contains(&o.name))
        .cloned()
        .collect();
    for reference in &stale {
        prune_related_object(req, reference);
    }
}
