//! Reconcile scenarios against the in-memory cluster.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use kube::api::{DynamicObject, GroupVersionKind};
use kube::discovery::ApiResource;
use serde_json::json;

use hyperconverged_operator::controller::finalizers::{FINALIZER, LEGACY_FINALIZER};
use hyperconverged_operator::controller::operands::default_components;
use hyperconverged_operator::controller::request::ObjectKey;
use hyperconverged_operator::controller::tainted::KUBEVIRT_JSON_PATCH_ANNOTATION;
use hyperconverged_operator::controller::upgrade_patch::UpgradePatches;
use hyperconverged_operator::controller::upgrade_reconciler::{
    LEGACY_STORAGE_CONFIG_MAP, QUICK_START_SELECTOR, console_quick_start_gvk,
};
use hyperconverged_operator::crd::{
    ConditionStatus, ConditionType, HYPERCONVERGED_CRD_NAME, HYPERCONVERGED_NAME, HyperConverged,
    LiveMigrationConfigurations, OPERATOR_VERSION_NAME, RelatedObject,
};
use hyperconverged_operator::health::CycleOutcome;

use crate::fakes::*;

fn version(env: &TestEnv) -> Option<String> {
    env.stored()
        .status
        .and_then(|s| s.get_version(OPERATOR_VERSION_NAME).map(str::to_string))
}

fn assert_condition(env: &TestEnv, t: ConditionType, status: ConditionStatus, reason: &str) {
    let hc = env.stored();
    let c = condition(&hc, t).unwrap_or_else(|| panic!("{} condition missing", t.as_str()));
    assert_eq!(c.status, status, "{} status", t.as_str());
    assert_eq!(c.reason, reason, "{} reason", t.as_str());
}

fn kubevirt_gvk() -> GroupVersionKind {
    default_components(&test_config().component_versions)[0].gvk.clone()
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_fresh_install_reaches_steady_state() {
    let env = TestEnv::new();
    env.cluster.put_hyperconverged(hyperconverged());

    // First cycle only initializes the status.
    let outcome = env.reconciler.reconcile(&env.primary_key()).await.unwrap();
    assert!(outcome.requeue);
    assert_eq!(env.events.with_reason("InitHCO").len(), 1);
    assert_eq!(env.cluster.updates(), 0);
    assert_eq!(env.cluster.status_updates(), 1);

    assert_eq!(version(&env).as_deref(), Some(OWN_VERSION));
    assert_eq!(env.stored().status.unwrap().observed_generation, 1);
    assert_condition(&env, ConditionType::ReconcileComplete, ConditionStatus::Unknown, "Init");
    assert_condition(&env, ConditionType::Available, ConditionStatus::False, "Init");
    assert_condition(&env, ConditionType::Progressing, ConditionStatus::True, "Init");
    assert_condition(&env, ConditionType::Degraded, ConditionStatus::False, "Init");
    assert_condition(&env, ConditionType::Upgradeable, ConditionStatus::Unknown, "Init");

    // Second cycle sees healthy components.
    env.put_healthy_components(COMPONENT_VERSION);
    let outcome = env.reconciler.reconcile(&env.primary_key()).await.unwrap();
    assert!(!outcome.requeue);

    for (t, s) in [
        (ConditionType::ReconcileComplete, ConditionStatus::True),
        (ConditionType::Available, ConditionStatus::True),
        (ConditionType::Progressing, ConditionStatus::False),
        (ConditionType::Degraded, ConditionStatus::False),
        (ConditionType::Upgradeable, ConditionStatus::True),
    ] {
        assert_condition(&env, t, s, "ReconcileCompleted");
    }

    let status = env.stored().status.unwrap();
    assert_eq!(status.system_health_status.as_deref(), Some("healthy"));
    assert_eq!(status.related_objects.len(), 5);
    assert_eq!(env.metrics.system_health_status.get(), 0);
    assert_eq!(env.metrics.hyperconverged_exists.get(), 1);

    let completed = env.events.with_reason("ReconcileHCO");
    assert_eq!(completed.len(), 1);
    assert!(!completed[0].warning);
    assert_eq!(completed[0].message, "HCO Reconcile completed successfully");

    let (status, reason, _) = env.upgradeable.last().unwrap();
    assert_eq!(status, ConditionStatus::True);
    assert_eq!(reason, "AsExpected");
}

#[tokio::test]
async fn test_steady_state_does_not_rewrite_status() {
    let env = TestEnv::new();
    env.cluster.put_hyperconverged(reconciled_hyperconverged(OWN_VERSION));
    env.put_healthy_components(COMPONENT_VERSION);

    env.reconciler.reconcile(&env.primary_key()).await.unwrap();
    let writes = env.cluster.status_updates();
    let before = env.stored().status;

    let outcome = env.reconciler.reconcile(&env.primary_key()).await.unwrap();
    assert!(!outcome.requeue);
    assert_eq!(env.cluster.status_updates(), writes);
    assert_eq!(env.cluster.updates(), 0);
    assert_eq!(env.stored().status, before);
}

#[tokio::test]
async fn test_bare_resource_gets_metadata_first() {
    let env = TestEnv::new();
    env.cluster.put_hyperconverged(bare_hyperconverged());

    let outcome = env.reconciler.reconcile(&env.primary_key()).await.unwrap();
    assert!(outcome.requeue);
    assert_eq!(env.cluster.updates(), 1);
    assert_eq!(env.cluster.status_updates(), 0);
    assert!(env.events.with_reason("InitHCO").is_empty());

    let hc = env.stored();
    assert_eq!(hc.finalizers(), &[FINALIZER.to_string()]);
    assert_eq!(hc.labels().get("app").map(String::as_str), Some(HYPERCONVERGED_NAME));
    // The status is only written by a later cycle.
    assert!(hc.status.is_none());

    let outcome = env.reconciler.reconcile(&env.primary_key()).await.unwrap();
    assert!(outcome.requeue);
    assert_eq!(env.cluster.status_updates(), 1);
    assert_eq!(version(&env).as_deref(), Some(OWN_VERSION));
    assert_eq!(env.events.with_reason("InitHCO").len(), 1);
}

#[tokio::test]
async fn test_legacy_finalizer_is_replaced() {
    let env = TestEnv::new();
    let mut hc = hyperconverged();
    hc.metadata.finalizers = Some(vec![LEGACY_FINALIZER.to_string()]);
    env.cluster.put_hyperconverged(hc);

    let outcome = env.reconciler.reconcile(&env.primary_key()).await.unwrap();
    assert!(outcome.requeue);
    assert_eq!(env.stored().finalizers(), &[FINALIZER.to_string()]);
}

#[tokio::test]
async fn test_version_recorded_on_first_deployment() {
    let env = TestEnv::new();
    let mut hc = reconciled_hyperconverged(OWN_VERSION);
    hc.status.as_mut().unwrap().versions.clear();
    env.cluster.put_hyperconverged(hc);
    env.put_healthy_components(COMPONENT_VERSION);

    let outcome = env.reconciler.reconcile(&env.primary_key()).await.unwrap();
    assert!(!outcome.requeue);
    assert!(!env.reconciler.is_upgrade_mode());
    assert!(env.events.with_reason("UpgradeHCO").is_empty());
    assert_eq!(version(&env).as_deref(), Some(OWN_VERSION));
}

#[tokio::test]
async fn test_degraded_component() {
    let env = TestEnv::new();
    env.cluster.put_hyperconverged(reconciled_hyperconverged(OWN_VERSION));
    env.put_healthy_components(COMPONENT_VERSION);
    let components = default_components(&test_config().component_versions);
    let cdi = &components[1];
    env.cluster.put_object(
        &cdi.gvk,
        component_object(
            &cdi.gvk,
            &cdi.name,
            cdi.observed_version_field,
            COMPONENT_VERSION,
            json!([
                {"type": "Available", "status": "True"},
                {"type": "Progressing", "status": "False"},
                {"type": "Degraded", "status": "True", "message": "import pod crashlooping"},
            ]),
        ),
    );

    env.reconciler.reconcile(&env.primary_key()).await.unwrap();

    assert_condition(&env, ConditionType::Degraded, ConditionStatus::True, "CDIDegraded");
    assert_condition(&env, ConditionType::Available, ConditionStatus::False, "HCODegraded");
    assert_condition(&env, ConditionType::Upgradeable, ConditionStatus::False, "HCODegraded");
    assert_condition(&env, ConditionType::Progressing, ConditionStatus::False, "ReconcileCompleted");
    assert_eq!(
        env.stored().status.unwrap().system_health_status.as_deref(),
        Some("error")
    );
    assert_eq!(env.metrics.system_health_status.get(), 2);

    let completed = env.events.with_reason("ReconcileHCO");
    assert!(completed[0].warning);
    assert_eq!(completed[0].message, "Not all the operators are ready");
}

#[tokio::test]
async fn test_component_upgradeable_reason_is_propagated() {
    let env = TestEnv::new();
    env.cluster.put_hyperconverged(reconciled_hyperconverged(OWN_VERSION));
    env.put_healthy_components(COMPONENT_VERSION);
    let gvk = kubevirt_gvk();
    env.cluster.put_object(
        &gvk,
        component_object(
            &gvk,
            "kubevirt-kubevirt-hyperconverged",
            "observedKubeVirtVersion",
            COMPONENT_VERSION,
            json!([
                {"type": "Available", "status": "True"},
                {"type": "Progressing", "status": "False"},
                {"type": "Degraded", "status": "False"},
                {"type": "Upgradeable", "status": "False", "message": "migration in progress"},
            ]),
        ),
    );

    env.reconciler.reconcile(&env.primary_key()).await.unwrap();

    assert_condition(&env, ConditionType::Upgradeable, ConditionStatus::False, "KubeVirtNotUpgradeable");
    let (status, reason, message) = env.upgradeable.last().unwrap();
    assert_eq!(status, ConditionStatus::False);
    assert_eq!(reason, "KubeVirtNotUpgradeable");
    assert_eq!(message, "KubeVirt is not upgradeable: migration in progress");
}

#[tokio::test]
async fn test_upgradeable_condition_needs_olm() {
    let env = TestEnv::build(UpgradePatches::default(), Arc::new(FakeClusterInfo::default()));
    env.cluster.put_hyperconverged(reconciled_hyperconverged(OWN_VERSION));
    env.put_healthy_components(COMPONENT_VERSION);

    env.reconciler.reconcile(&env.primary_key()).await.unwrap();
    assert_eq!(env.upgradeable.count(), 0);
}

#[tokio::test]
async fn test_missing_resource() {
    let env = TestEnv::new();

    let outcome = env.reconciler.reconcile(&env.primary_key()).await.unwrap();
    assert!(!outcome.requeue);
    assert_eq!(env.metrics.hyperconverged_exists.get(), 0);
    assert!(env.events.all().is_empty());

    let (status, reason, _) = env.upgradeable.last().unwrap();
    assert_eq!(status, ConditionStatus::True);
    assert_eq!(reason, "AsExpected");
}

#[tokio::test]
async fn test_missing_resource_leaves_upgrade_mode() {
    let env = TestEnv::new();
    env.cluster.put_hyperconverged(reconciled_hyperconverged("1.5.0"));
    env.put_healthy_components("v0.9.0");
    env.reconciler.reconcile(&env.primary_key()).await.unwrap();
    assert!(env.reconciler.is_upgrade_mode());

    env.cluster.remove_hyperconverged();
    env.reconciler.reconcile(&env.primary_key()).await.unwrap();
    assert!(!env.reconciler.is_upgrade_mode());
}

// ============================================================================
// Deletion
// ============================================================================

fn mark_deleted(env: &TestEnv) {
    env.cluster.edit_hyperconverged(|hc| {
        hc.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
    });
}

#[tokio::test]
async fn test_deletion_removes_components_and_finalizer() {
    let env = TestEnv::new();
    env.cluster.put_hyperconverged(reconciled_hyperconverged(OWN_VERSION));
    env.put_healthy_components(COMPONENT_VERSION);
    env.reconciler.reconcile(&env.primary_key()).await.unwrap();

    mark_deleted(&env);
    let outcome = env.reconciler.reconcile(&env.primary_key()).await.unwrap();
    assert!(outcome.requeue);

    for component in default_components(&test_config().component_versions) {
        assert!(!env.cluster.has_object(&component.gvk, Some(NAMESPACE), &component.name));
    }
    assert_eq!(env.cluster.deleted().len(), 5);
    assert!(env.cluster.hyperconverged().is_none());

    let outcome = env.reconciler.reconcile(&env.primary_key()).await.unwrap();
    assert!(!outcome.requeue);
    assert_eq!(env.metrics.hyperconverged_exists.get(), 0);
}

#[tokio::test]
async fn test_secondary_trigger_ignored_while_deleting() {
    let env = TestEnv::new();
    env.cluster.put_hyperconverged(reconciled_hyperconverged(OWN_VERSION));
    env.put_healthy_components(COMPONENT_VERSION);
    mark_deleted(&env);

    let outcome = env.reconciler.reconcile(&env.secondary_key()).await.unwrap();
    assert!(!outcome.requeue);
    assert!(env.cluster.deleted().is_empty());
    assert_eq!(env.stored().finalizers(), &[FINALIZER.to_string()]);
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_placeholder_triggers_reconcile_primary() {
    let info = Arc::new(FakeClusterInfo {
        olm: true,
        openshift: true,
        ..Default::default()
    });
    let env = TestEnv::build(UpgradePatches::default(), info);
    env.cluster.put_hyperconverged(reconciled_hyperconverged(OWN_VERSION));
    env.put_healthy_components(COMPONENT_VERSION);

    env.reconciler.reconcile(&env.api_server_key()).await.unwrap();
    assert_eq!(env.info.refreshes(), 1);
    assert_condition(&env, ConditionType::ReconcileComplete, ConditionStatus::True, "ReconcileCompleted");

    env.reconciler.reconcile(&env.secondary_key()).await.unwrap();
    assert_eq!(env.info.refreshes(), 1);
}

#[tokio::test]
async fn test_unexpected_request_is_reported() {
    let env = TestEnv::new();
    let mut hc = hyperconverged();
    hc.metadata.name = Some("other-hco".to_string());
    env.cluster.put_hyperconverged(hc);

    let outcome = env
        .reconciler
        .reconcile(&ObjectKey::new(NAMESPACE, "other-hco"))
        .await
        .unwrap();
    assert!(!outcome.requeue);

    let hc = env.cluster.hyperconverged_named("other-hco").unwrap();
    let c = condition(&hc, ConditionType::ReconcileComplete).unwrap();
    assert_eq!(c.status, ConditionStatus::False);
    assert_eq!(c.reason, "InvalidRequest");
    assert!(c.message.contains(HYPERCONVERGED_NAME));
    assert!(env.events.with_reason("InitHCO").is_empty());
}

// ============================================================================
// Status write protocol
// ============================================================================

#[tokio::test]
async fn test_status_conflict_requeues() {
    let env = TestEnv::new();
    env.cluster.put_hyperconverged(reconciled_hyperconverged(OWN_VERSION));
    env.put_healthy_components(COMPONENT_VERSION);
    env.cluster.fail_next_status_update_with_conflict();

    let err = env.reconciler.reconcile(&env.primary_key()).await.unwrap_err();
    assert!(err.requeue);
    assert!(err.to_string().contains("conflict"));

    let reported = env.events.with_reason("HcoUpdateError");
    assert_eq!(reported.len(), 1);
    assert!(reported[0].warning);

    env.reconciler.reconcile(&env.primary_key()).await.unwrap();
    assert_condition(&env, ConditionType::ReconcileComplete, ConditionStatus::True, "ReconcileCompleted");
    assert_eq!(env.metrics.cycles(CycleOutcome::Conflict), 1);
    assert_eq!(env.metrics.cycles(CycleOutcome::Error), 0);
}

#[tokio::test]
async fn test_metadata_write_wins_over_status() {
    let env = TestEnv::new();
    let mut hc = reconciled_hyperconverged(OWN_VERSION);
    hc.metadata.labels = None;
    env.cluster.put_hyperconverged(hc);
    env.put_healthy_components(COMPONENT_VERSION);

    let outcome = env.reconciler.reconcile(&env.primary_key()).await.unwrap();
    assert!(outcome.requeue);
    assert_eq!(env.cluster.updates(), 1);
    assert_eq!(env.cluster.status_updates(), 0);
    assert!(env.events.with_reason("InitHCO").is_empty());
}

#[tokio::test]
async fn test_tainted_configuration_follows_annotation() {
    let env = TestEnv::new();
    let mut hc = reconciled_hyperconverged(OWN_VERSION);
    hc.metadata.annotations = Some(BTreeMap::from([(
        KUBEVIRT_JSON_PATCH_ANNOTATION.to_string(),
        r#"[{"op": "add", "path": "/spec/configuration/a", "value": 1}, {"op": "add", "path": "/spec/configuration/b", "value": 2}]"#.to_string(),
    )]));
    env.cluster.put_hyperconverged(hc);
    env.put_healthy_components(COMPONENT_VERSION);

    env.reconciler.reconcile(&env.primary_key()).await.unwrap();
    assert_condition(
        &env,
        ConditionType::TaintedConfiguration,
        ConditionStatus::True,
        "UnsupportedFeatureAnnotation",
    );
    assert_eq!(env.metrics.unsafe_modification_count(KUBEVIRT_JSON_PATCH_ANNOTATION), 2);

    env.cluster.edit_hyperconverged(|hc| {
        hc.annotations_mut().remove(KUBEVIRT_JSON_PATCH_ANNOTATION);
    });
    env.reconciler.reconcile(&env.primary_key()).await.unwrap();
    assert!(condition(&env.stored(), ConditionType::TaintedConfiguration).is_none());
    assert_eq!(env.metrics.unsafe_modification_count(KUBEVIRT_JSON_PATCH_ANNOTATION), 0);
}

// ============================================================================
// Upgrade
// ============================================================================

#[tokio::test]
async fn test_upgrade_waits_for_component_versions() {
    let env = TestEnv::new();
    env.cluster.put_hyperconverged(reconciled_hyperconverged("1.5.0"));
    env.put_healthy_components("v0.9.0");

    let outcome = env.reconciler.reconcile(&env.primary_key()).await.unwrap();
    assert!(!outcome.requeue);
    assert!(env.reconciler.is_upgrade_mode());
    assert_eq!(env.events.with_reason("UpgradeHCO").len(), 1);
    assert_eq!(version(&env).as_deref(), Some("1.5.0"));
    assert_condition(&env, ConditionType::Progressing, ConditionStatus::True, "HCOUpgrading");

    let completed = env.events.with_reason("ReconcileHCO");
    assert_eq!(completed[0].message, format!("HCO is upgrading to version {OWN_VERSION}"));

    let (status, reason, _) = env.upgradeable.last().unwrap();
    assert_eq!(status, ConditionStatus::False);
    assert_eq!(reason, "AlreadyPerformingUpgrade");

    // Still upgrading while the components report the old version.
    env.reconciler.reconcile(&env.primary_key()).await.unwrap();
    assert!(env.reconciler.is_upgrade_mode());
    assert_eq!(env.events.with_reason("UpgradeHCO").len(), 1);

    env.put_healthy_components(COMPONENT_VERSION);
    let outcome = env.reconciler.reconcile(&env.primary_key()).await.unwrap();
    assert!(!outcome.requeue);
    assert!(!env.reconciler.is_upgrade_mode());
    assert_eq!(version(&env).as_deref(), Some(OWN_VERSION));
    assert_condition(&env, ConditionType::Progressing, ConditionStatus::False, "ReconcileCompleted");

    let upgrade_events = env.events.with_reason("UpgradeHCO");
    assert_eq!(upgrade_events.len(), 2);
    assert_eq!(
        upgrade_events[1].message,
        format!("Successfully upgraded to version {OWN_VERSION}")
    );
    let (status, reason, _) = env.upgradeable.last().unwrap();
    assert_eq!(status, ConditionStatus::True);
    assert_eq!(reason, "AsExpected");
}

const BANDWIDTH_PATCH: &str = r#"{
    "hcoCRPatchList": [
        {
            "semverRange": "<1.5.0",
            "jsonPatch": [
                {"op": "test", "path": "/spec/liveMigrationConfig/bandwidthPerMigration", "value": "64Mi"},
                {"op": "remove", "path": "/spec/liveMigrationConfig/bandwidthPerMigration"}
            ]
        }
    ]
}"#;

fn with_bandwidth(version: &str, bandwidth: &str) -> HyperConverged {
    let mut hc = reconciled_hyperconverged(version);
    hc.spec.live_migration_config = Some(LiveMigrationConfigurations {
        bandwidth_per_migration: Some(bandwidth.to_string()),
        ..Default::default()
    });
    hc
}

#[tokio::test]
async fn test_upgrade_patch_rewrites_spec() {
    let env = TestEnv::with_patches(UpgradePatches::from_slice(BANDWIDTH_PATCH.as_bytes()).unwrap());
    env.cluster.put_hyperconverged(with_bandwidth("1.4.99", "64Mi"));
    env.put_healthy_components(COMPONENT_VERSION);

    let outcome = env.reconciler.reconcile(&env.primary_key()).await.unwrap();
    assert!(outcome.requeue);
    assert!(env.reconciler.is_upgrade_mode());
    assert_eq!(env.cluster.updates(), 1);
    assert_eq!(env.cluster.status_updates(), 0);

    let hc = env.stored();
    assert_eq!(
        hc.spec
            .live_migration_config
            .and_then(|l| l.bandwidth_per_migration),
        None
    );
    assert_eq!(hc.metadata.generation, Some(2));
    assert_eq!(version(&env).as_deref(), Some("1.4.99"));
}

#[tokio::test]
async fn test_upgrade_patch_skipped_when_test_fails() {
    let env = TestEnv::with_patches(UpgradePatches::from_slice(BANDWIDTH_PATCH.as_bytes()).unwrap());
    env.cluster.put_hyperconverged(with_bandwidth("1.4.99", "128Mi"));
    env.put_healthy_components(COMPONENT_VERSION);

    let outcome = env.reconciler.reconcile(&env.primary_key()).await.unwrap();
    assert!(!outcome.requeue);
    assert_eq!(env.cluster.updates(), 0);
    assert_eq!(
        env.stored()
            .spec
            .live_migration_config
            .and_then(|l| l.bandwidth_per_migration)
            .as_deref(),
        Some("128Mi")
    );
    // Nothing else blocks the upgrade, so it finishes in the same cycle.
    assert_eq!(version(&env).as_deref(), Some(OWN_VERSION));
}

#[tokio::test]
async fn test_upgrade_patch_outside_range() {
    let env = TestEnv::with_patches(UpgradePatches::from_slice(BANDWIDTH_PATCH.as_bytes()).unwrap());
    env.cluster.put_hyperconverged(with_bandwidth("1.5.1", "64Mi"));
    env.put_healthy_components(COMPONENT_VERSION);

    env.reconciler.reconcile(&env.primary_key()).await.unwrap();
    assert_eq!(env.cluster.updates(), 0);
    assert_eq!(
        env.stored()
            .spec
            .live_migration_config
            .and_then(|l| l.bandwidth_per_migration)
            .as_deref(),
        Some("64Mi")
    );
}

fn object(gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> DynamicObject {
    let obj = DynamicObject::new(name, &ApiResource::from_gvk(gvk));
    match namespace {
        Some(ns) => obj.within(ns),
        None => obj,
    }
}

#[tokio::test]
async fn test_upgrade_removes_obsolete_objects() {
    let raw = r#"{
        "objectsToBeRemoved": [
            {
                "semverRange": "<1.5.0",
                "groupVersionKind": {"group": "monitoring.coreos.com", "version": "v1", "kind": "PrometheusRule"},
                "objectKey": {"name": "kubevirt-hyperconverged-prometheus-rule", "namespace": "kubevirt-hyperconverged"}
            }
        ]
    }"#;
    let env = TestEnv::with_patches(UpgradePatches::from_slice(raw.as_bytes()).unwrap());
    let mut hc = reconciled_hyperconverged("1.4.99");
    let status = hc.status.as_mut().unwrap();
    for (api_version, kind, namespace, name) in [
        ("monitoring.coreos.com/v1", "PrometheusRule", Some(NAMESPACE), "kubevirt-hyperconverged-prometheus-rule"),
        ("monitoring.coreos.com/v1", "PrometheusRule", Some("user-monitoring"), "kubevirt-hyperconverged-prometheus-rule"),
        ("console.openshift.io/v1", "ConsoleQuickStart", None, "retired-quick-start"),
    ] {
        status.add_related_object(RelatedObject::new(api_version, kind, namespace, name));
    }
    env.cluster.put_hyperconverged(hc);
    env.put_healthy_components(COMPONENT_VERSION);

    let rule = GroupVersionKind::gvk("monitoring.coreos.com", "v1", "PrometheusRule");
    env.cluster.put_object(
        &rule,
        object(&rule, Some(NAMESPACE), "kubevirt-hyperconverged-prometheus-rule"),
    );
    let config_map = GroupVersionKind::gvk("", "v1", "ConfigMap");
    env.cluster.put_object(
        &config_map,
        object(&config_map, Some(NAMESPACE), LEGACY_STORAGE_CONFIG_MAP),
    );

    let quick_start = console_quick_start_gvk();
    let (label, value) = QUICK_START_SELECTOR.split_once('=').unwrap();
    let mut stale = object(&quick_start, None, "retired-quick-start");
    stale.metadata.labels = Some(BTreeMap::from([(label.to_string(), value.to_string())]));
    env.cluster.put_object(&quick_start, stale);
    env.cluster
        .put_object(&quick_start, object(&quick_start, None, "user-quick-start"));

    env.reconciler.reconcile(&env.primary_key()).await.unwrap();

    assert!(!env.cluster.has_object(&rule, Some(NAMESPACE), "kubevirt-hyperconverged-prometheus-rule"));
    assert!(!env.cluster.has_object(&config_map, Some(NAMESPACE), LEGACY_STORAGE_CONFIG_MAP));
    assert!(!env.cluster.has_object(&quick_start, None, "retired-quick-start"));
    assert!(env.cluster.has_object(&quick_start, None, "user-quick-start"));
    assert_eq!(env.events.with_reason("Killing").len(), 3);

    // The pruned references are gone from the stored status, not just the local copy.
    let related = env.stored().status.unwrap().related_objects;
    let rules: Vec<_> = related.iter().filter(|o| o.kind == "PrometheusRule").collect();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].namespace.as_deref(), Some("user-monitoring"));
    assert!(related.iter().all(|o| o.kind != "ConsoleQuickStart"));
}

#[tokio::test]
async fn test_clearing_the_last_related_object_is_stored() {
    let env = TestEnv::new();
    let mut hc = reconciled_hyperconverged("1.5.0");
    let status = hc.status.as_mut().unwrap();
    status.related_objects.clear();
    status.add_related_object(RelatedObject::new(
        "v2v.kubevirt.io/v1beta1",
        "VMImportConfig",
        None,
        "vmimport-kubevirt-hyperconverged",
    ));
    env.cluster.put_hyperconverged(hc);
    // No subordinate exists, so nothing adds its own reference back.
    env.reconciler.reconcile(&env.primary_key()).await.unwrap();

    let related = env.stored().status.unwrap().related_objects;
    assert!(related.iter().all(|o| o.kind != "VMImportConfig"));
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_operand_failure_reports_reconcile_failed() {
    let env = TestEnv::with_operands(Arc::new(FailingOperands::new("kubevirt is unreachable")));
    env.cluster.put_hyperconverged(hyperconverged());

    // The initial cycle asks to run again.
    let outcome = env.reconciler.reconcile(&env.primary_key()).await.unwrap();
    assert!(outcome.requeue);
    assert_condition(&env, ConditionType::ReconcileComplete, ConditionStatus::False, "ReconcileFailed");
    let c = condition(&env.stored(), ConditionType::ReconcileComplete).cloned().unwrap();
    assert!(c.message.contains("kubevirt is unreachable"));

    let reported = env.events.with_reason("ReconcileError");
    assert_eq!(reported.len(), 1);
    assert!(reported[0].warning);

    // Later cycles wait for the next event instead.
    let outcome = env.reconciler.reconcile(&env.primary_key()).await.unwrap();
    assert!(!outcome.requeue);
    assert_condition(&env, ConditionType::ReconcileComplete, ConditionStatus::False, "ReconcileFailed");
    assert_eq!(env.events.with_reason("ReconcileError").len(), 2);
    assert!(env.events.with_reason("ReconcileHCO").is_empty());
}

#[tokio::test]
async fn test_unparseable_recorded_version_requeues() {
    let env = TestEnv::new();
    env.cluster.put_hyperconverged(reconciled_hyperconverged("1.4.x"));
    env.put_healthy_components(COMPONENT_VERSION);
    let before = env.stored().status.unwrap().versions;

    let err = env.reconciler.reconcile(&env.primary_key()).await.unwrap_err();
    assert!(err.requeue);
    assert_eq!(env.stored().status.unwrap().versions, before);
    assert_eq!(version(&env).as_deref(), Some("1.4.x"));
    assert_eq!(env.metrics.cycles(CycleOutcome::Error), 1);
}

#[tokio::test]
async fn test_failed_migration_aborts_upgrade() {
    let raw = r#"{
        "hcoCRPatchList": [
            {
                "semverRange": "<1.5.0",
                "jsonPatch": [
                    {"op": "remove", "path": "/spec/doesNotExist"}
                ]
            }
        ]
    }"#;
    let env = TestEnv::with_patches(UpgradePatches::from_slice(raw.as_bytes()).unwrap());
    env.cluster.put_hyperconverged(reconciled_hyperconverged("1.4.0"));
    env.put_healthy_components(COMPONENT_VERSION);

    let err = env.reconciler.reconcile(&env.primary_key()).await.unwrap_err();
    assert!(err.requeue);
    assert_eq!(env.cluster.updates(), 0);
    assert_eq!(version(&env).as_deref(), Some("1.4.0"));

    // Still failing on the next attempt; the version is never recorded.
    let err = env.reconciler.reconcile(&env.primary_key()).await.unwrap_err();
    assert!(err.requeue);
    assert_eq!(version(&env).as_deref(), Some("1.4.0"));
}

#[tokio::test]
async fn test_upgrade_prunes_crd_stored_versions() {
    let env = TestEnv::new();
    env.cluster
        .put_crd(crd_with_stored_versions(HYPERCONVERGED_CRD_NAME, &["v1alpha1", "v1beta1"]));
    env.cluster.put_hyperconverged(reconciled_hyperconverged("1.5.0"));
    env.put_healthy_components(COMPONENT_VERSION);

    let outcome = env.reconciler.reconcile(&env.primary_key()).await.unwrap();
    assert!(outcome.requeue);
    let stored = env
        .cluster
        .crd(HYPERCONVERGED_CRD_NAME)
        .and_then(|c| c.status)
        .and_then(|s| s.stored_versions);
    assert_eq!(stored, Some(vec!["v1beta1".to_string()]));
    assert_eq!(version(&env).as_deref(), Some("1.5.0"));

    let outcome = env.reconciler.reconcile(&env.primary_key()).await.unwrap();
    assert!(!outcome.requeue);
    assert_eq!(version(&env).as_deref(), Some(OWN_VERSION));
}

#[tokio::test]
async fn test_upgrade_removes_deprecated_crds() {
    let crd_name = "vmimportconfigs.v2v.kubevirt.io";
    let env = TestEnv::new();
    env.cluster.put_crd(crd_with_stored_versions(crd_name, &["v1beta1"]));
    let mut hc = reconciled_hyperconverged("1.5.0");
    hc.status.as_mut().unwrap().add_related_object(RelatedObject::new(
        "v2v.kubevirt.io/v1beta1",
        "VMImportConfig",
        None,
        "vmimport-kubevirt-hyperconverged",
    ));
    env.cluster.put_hyperconverged(hc);
    env.put_healthy_components(COMPONENT_VERSION);

    let outcome = env.reconciler.reconcile(&env.primary_key()).await.unwrap();
    assert!(outcome.requeue);
    assert!(env.cluster.crd(crd_name).is_none());
    let killed = env.events.with_reason("Killing");
    assert_eq!(killed.len(), 1);
    assert!(killed[0].message.contains(crd_name));

    env.reconciler.reconcile(&env.primary_key()).await.unwrap();
    let status = env.stored().status.unwrap();
    assert!(status.related_objects.iter().all(|o| o.kind != "VMImportConfig"));
    assert_eq!(version(&env).as_deref(), Some(OWN_VERSION));
}
