//! Detection of the unsupported patch annotations.
//!
//! Each patchable subordinate has an annotation on the HyperConverged resource whose
//! value is an RFC 6902 document applied to that subordinate's spec. Using it leaves the
//! deployment in an unsupported state, which is surfaced as the TaintedConfiguration
//! condition.

use json_patch::Patch;
use kube::ResourceExt;
use serde_json::Value;
use tracing::{info, warn};

use crate::controller::error::Result;
use crate::controller::status::{remove_status_condition, set_status_condition};
use crate::crd::{Condition, ConditionStatus, ConditionType, HyperConverged, is_condition_true};
use crate::health::Metrics;

pub const KUBEVIRT_JSON_PATCH_ANNOTATION: &str = "kubevirt.kubevirt.io/jsonpatch";
pub const CDI_JSON_PATCH_ANNOTATION: &str = "containerizeddataimporter.kubevirt.io/jsonpatch";
pub const CNAO_JSON_PATCH_ANNOTATION: &str = "networkaddonsconfigs.kubevirt.io/jsonpatch";

/// Every annotation that taints the configuration.
pub const JSON_PATCH_ANNOTATIONS: [&str; 3] = [
    KUBEVIRT_JSON_PATCH_ANNOTATION,
    CDI_JSON_PATCH_ANNOTATION,
    CNAO_JSON_PATCH_ANNOTATION,
];

pub const TAINTED_CONFIGURATION_REASON: &str = "UnsupportedFeatureAnnotation";
pub const TAINTED_CONFIGURATION_MESSAGE: &str =
    "Unsupported feature was activated via an HCO annotation";

/// Number of operations in a patch document, valid or not. Anything that is not a JSON
/// array counts as zero.
pub fn count_patch_operations(raw: &str) -> usize {
    match serde_json::from_str::<Vec<Value>>(raw) {
        Ok(operations) => operations.len(),
        Err(e) => {
            warn!(error = %e, "Ignoring malformed JSON patch annotation");
            0
        }
    }
}

/// Upsert or remove the TaintedConfiguration condition in `conditions`.
///
/// The condition is never set to False; it disappears once no annotation is in use.
pub fn detect_tainted_configuration(
    hc: &HyperConverged,
    conditions: &mut Vec<Condition>,
    metrics: &Metrics,
) {
    let was_tainted = is_condition_true(
        hc.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or_default(),
        ConditionType::TaintedConfiguration,
    );

    let annotations = hc.annotations();
    let mut tainted = false;
    for annotation in JSON_PATCH_ANNOTATIONS {
        let count = annotations
            .get(annotation)
            .map(|raw| count_patch_operations(raw))
            .unwrap_or(0);
        if count > 0 {
            tainted = true;
        }
        metrics.set_unsafe_modification_count(annotation, count);
    }

    if tainted {
        set_status_condition(
            conditions,
            Condition::new(
                ConditionType::TaintedConfiguration.as_str(),
                ConditionStatus::True,
                TAINTED_CONFIGURATION_REASON,
                TAINTED_CONFIGURATION_MESSAGE,
                hc.metadata.generation.unwrap_or_default(),
            ),
        );
        if !was_tainted {
            info!("Detected tainted configuration state for HCO");
        }
    } else if remove_status_condition(conditions, ConditionType::TaintedConfiguration) {
        info!("Detected untainted configuration state for HCO");
    }
}

/// Apply the patch in `annotation` to a subordinate's spec.
///
/// Returns true if the annotation was present and applied. A malformed document is an
/// error here since the caller is about to write the result.
pub fn apply_annotation_patch(hc: &HyperConverged, annotation: &str, spec: &mut Value) -> Result<bool> {
    let Some(raw) = hc.annotations().get(annotation) else {
        return Ok(false);
    };
    let patch: Patch = serde_json::from_str(raw)?;
    let mut doc = serde_json::json!({ "spec": spec.take() });
    let applied = json_patch::patch(&mut doc, &patch.0);
    *spec = doc
        .get_mut("spec")
        .map(Value::take)
        .unwrap_or(Value::Null);
    applied?;
    Ok(true)
}
