//! Reconciliation loop for HyperConverged.
//!
//! One cycle routes the queue key, loads the resource, runs finalizers, the upgrade
//! engine and the operands, aggregates the conditions and flushes the result with a
//! single write.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use kube::runtime::events::EventType;
use tracing::{debug, error, info, warn};

use crate::controller::aggregator::{complete_reconciliation, update_conditions};
use crate::controller::common::ensure_app_label;
use crate::controller::context::Context;
use crate::controller::error::ReconcileError;
use crate::controller::finalizers::{FinalizerAction, check_finalizers, drop_finalizers};
use crate::controller::request::{HcoConditions, HcoRequest, ObjectKey};
use crate::controller::request_router::{RequestRouter, Trigger};
use crate::controller::status;
use crate::controller::upgrade_reconciler::{UpgradeProgress, detect_upgrade, reconcile_upgrade};
use crate::crd::{ConditionStatus, ConditionType, OPERATOR_VERSION_NAME};
use crate::health::CycleOutcome;

pub const REASON_INIT: &str = "Init";
pub const MESSAGE_INIT: &str = "Initializing HyperConverged cluster";
pub const REASON_INVALID_REQUEST: &str = "InvalidRequest";
pub const REASON_RECONCILE_FAILED: &str = "ReconcileFailed";
pub const REASON_UPGRADEABLE_AS_EXPECTED: &str = "AsExpected";
pub const REASON_ALREADY_UPGRADING: &str = "AlreadyPerformingUpgrade";

/// Result of a successful cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Run another cycle for the same key.
    pub requeue: bool,
    /// Delay before the next cycle, if one is wanted.
    pub requeue_after: Option<Duration>,
}

impl Outcome {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn requeue() -> Self {
        Self {
            requeue: true,
            requeue_after: None,
        }
    }

    fn requeue_if(requeue: bool) -> Self {
        Self {
            requeue,
            requeue_after: None,
        }
    }
}

/// Upgradeable operator condition for the current state.
pub fn upgradeable_condition(
    upgrade_mode: bool,
    conditions: &HcoConditions,
    own_version: &str,
) -> (ConditionStatus, String, String) {
    if upgrade_mode {
        return (
            ConditionStatus::False,
            REASON_ALREADY_UPGRADING.to_string(),
            format!("upgrading the hyperconverged-cluster-operator to version {own_version}"),
        );
    }
    match conditions.get(ConditionType::Upgradeable) {
        Some(c) if c.status == ConditionStatus::False => {
            (ConditionStatus::False, c.reason.clone(), c.message.clone())
        }
        _ => (
            ConditionStatus::True,
            REASON_UPGRADEABLE_AS_EXPECTED.to_string(),
            "All is well".to_string(),
        ),
    }
}

/// Requeue delay after a failed cycle.
pub fn error_policy(error: &ReconcileError) -> Duration {
    let delay = error.source.requeue_after();
    if error.requeue {
        delay.min(Duration::from_secs(5))
    } else {
        delay
    }
}

/// Reconciler of the HyperConverged resource.
///
/// Holds the state that outlives a single cycle: the upgrade mode and whether the
/// first cycle already ran.
pub struct HyperConvergedReconciler {
    ctx: Arc<Context>,
    router: RequestRouter,
    upgrade_mode: AtomicBool,
    first_loop: AtomicBool,
}

impl HyperConvergedReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        let router = RequestRouter::new(ctx.config.operator_namespace.clone());
        Self::with_router(ctx, router)
    }

    pub fn with_router(ctx: Arc<Context>, router: RequestRouter) -> Self {
        Self {
            ctx,
            router,
            upgrade_mode: AtomicBool::new(false),
            first_loop: AtomicBool::new(true),
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn router(&self) -> &RequestRouter {
        &self.router
    }

    pub fn is_upgrade_mode(&self) -> bool {
        self.upgrade_mode.load(Ordering::SeqCst)
    }

    /// Run one cycle for a queue key, recording metrics.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome, ReconcileError> {
        let start_time = Instant::now();
        let result = self.reconcile_inner(key).await;
        let duration = start_time.elapsed().as_secs_f64();

        let outcome = match &result {
            Ok(outcome) => {
                debug!(key = %key, requeue = outcome.requeue, "Reconcile finished");
                if outcome.requeue || outcome.requeue_after.is_some() {
                    CycleOutcome::Requeue
                } else {
                    CycleOutcome::Done
                }
            }
            Err(e) if e.source.is_conflict() => {
                warn!(key = %key, error = %e, "Write conflict, requeueing");
                CycleOutcome::Conflict
            }
            Err(e) => {
                error!(key = %key, error = %e, requeue = e.requeue, "Reconcile failed");
                CycleOutcome::Error
            }
        };
        self.ctx.metrics.record_cycle(outcome, duration);
        self.ctx.metrics.set_upgrade_in_progress(self.is_upgrade_mode());
        result
    }

    async fn reconcile_inner(&self, key: &ObjectKey) -> Result<Outcome, ReconcileError> {
        let routed = self.router.resolve(key)?;
        if routed.trigger == Trigger::ApiServerCr {
            self.ctx.cluster_info.refresh_api_server_cr().await?;
        }
        if routed.hco_triggered {
            self.ctx.operands.reset();
        }

        let Some(instance) = self.ctx.client.get_hyperconverged(&routed.key).await? else {
            info!(name = %routed.key, "HyperConverged resource not found");
            self.upgrade_mode.store(false, Ordering::SeqCst);
            self.ctx.metrics.set_hyperconverged_exists(false);
            self.set_operator_upgradeable_status(false, &HcoConditions::new())
                .await?;
            return Ok(Outcome::done());
        };
        self.ctx.metrics.set_hyperconverged_exists(true);

        let mut req = HcoRequest::new(
            routed.key,
            instance,
            self.upgrade_mode.load(Ordering::SeqCst),
            routed.hco_triggered,
        );

        if self.first_loop.swap(false, Ordering::SeqCst) {
            self.ctx
                .operands
                .first_use_initiation(&req.instance, self.ctx.cluster_info.is_openshift())
                .await;
        }

        let result = self.do_reconcile(&mut req).await;
        self.upgrade_mode.store(req.upgrade_mode, Ordering::SeqCst);

        let mut outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.emit(&req, EventType::Warning, "ReconcileError", &e.to_string())
                    .await;
                return Err(e);
            }
        };

        self.set_operator_upgradeable_status(req.upgrade_mode, &req.conditions)
            .await?;

        match status::update_hyperconverged(self.ctx.client.as_ref(), self.ctx.events.as_ref(), &mut req)
            .await
        {
            Ok(requeue) => {
                outcome.requeue |= requeue;
                Ok(outcome)
            }
            Err(e) => Err(ReconcileError::with_requeue(e, outcome.requeue)),
        }
    }

    async fn do_reconcile(&self, req: &mut HcoRequest) -> Result<Outcome, ReconcileError> {
        if !self.validate_namespace(req)? {
            return Ok(Outcome::done());
        }

        let init = req
            .instance
            .status
            .as_ref()
            .is_none_or(|s| s.conditions.is_empty());
        if init {
            self.set_initial_conditions(req);
        }

        ensure_app_label(req);
        let generation = req.generation();
        let status = req.instance.status.get_or_insert_with(Default::default);
        if status.observed_generation != generation {
            status.observed_generation = generation;
            req.status_dirty = true;
        }

        // Only conditions reported during this cycle are carried into the aggregation.
        req.conditions = HcoConditions::new();

        if check_finalizers(req) == FinalizerAction::Delete {
            if !req.hco_triggered {
                debug!(name = %req.key, "Ignoring a secondary trigger while deleting");
                return Ok(Outcome::done());
            }
            return self.ensure_deleted(req).await;
        }

        // A metadata write discards this cycle's status; the next cycle initializes again.
        if init && !req.dirty {
            self.emit(req, EventType::Normal, "InitHCO", "Initiating the HyperConverged")
                .await;
        }

        let own_version = self.ctx.config.own_version.clone();
        if !req.upgrade_mode && detect_upgrade(req, &own_version) {
            let known = req
                .instance
                .status
                .as_ref()
                .and_then(|s| s.get_version(OPERATOR_VERSION_NAME))
                .unwrap_or_default()
                .to_string();
            info!(from = %known, to = %own_version, "Starting upgrade");
            self.emit(
                req,
                EventType::Normal,
                "UpgradeHCO",
                &format!("Upgrading the HyperConverged to version {own_version}"),
            )
            .await;
            req.set_upgrade_mode(true);
        }

        if req.upgrade_mode {
            match reconcile_upgrade(&self.ctx, req).await {
                Ok(UpgradeProgress::Continue) => {}
                Ok(UpgradeProgress::Requeue) => {
                    update_conditions(req, &self.ctx.metrics);
                    return Ok(Outcome::requeue());
                }
                Err(e) => {
                    error!(error = %e, "Upgrade step failed");
                    return Err(ReconcileError::requeue(e));
                }
            }
        }

        if let Err(e) = self.ctx.operands.ensure(req).await {
            warn!(error = %e, "Failed to reconcile the operands");
            let c = req.condition(
                ConditionType::ReconcileComplete,
                ConditionStatus::False,
                REASON_RECONCILE_FAILED,
                &format!("Error while reconciling: {e}"),
            );
            req.conditions.set(c);
            self.emit(req, EventType::Warning, "ReconcileError", &e.to_string())
                .await;
            update_conditions(req, &self.ctx.metrics);
            return Ok(Outcome::requeue_if(init));
        }

        if init {
            return Ok(Outcome::requeue());
        }

        let mut upgrade_mode = req.upgrade_mode;
        let completion = complete_reconciliation(req, &mut upgrade_mode, &own_version);
        let (event_type, reason, message) = completion.event();
        self.emit(req, event_type, reason, &message).await;
        update_conditions(req, &self.ctx.metrics);

        Ok(Outcome::done())
    }

    /// Check the resolved identity. Returns false if the request targets an unexpected
    /// resource; the status then records why.
    fn validate_namespace(&self, req: &mut HcoRequest) -> Result<bool, ReconcileError> {
        let expected = self.router.primary_key()?;
        if req.key == expected {
            return Ok(true);
        }

        warn!(name = %req.key, expected = %expected, "Invalid request");
        let c = req.condition(
            ConditionType::ReconcileComplete,
            ConditionStatus::False,
            REASON_INVALID_REQUEST,
            &format!(
                "Request does not match expected name ({}) and namespace ({})",
                expected.name, expected.namespace
            ),
        );
        req.conditions.set(c);
        update_conditions(req, &self.ctx.metrics);
        Ok(false)
    }

    fn set_initial_conditions(&self, req: &mut HcoRequest) {
        req.instance
            .status
            .get_or_insert_with(Default::default)
            .update_version(OPERATOR_VERSION_NAME, &self.ctx.config.own_version);

        for (condition_type, status) in [
            (ConditionType::ReconcileComplete, ConditionStatus::Unknown),
            (ConditionType::Available, ConditionStatus::False),
            (ConditionType::Progressing, ConditionStatus::True),
            (ConditionType::Degraded, ConditionStatus::False),
            (ConditionType::Upgradeable, ConditionStatus::Unknown),
        ] {
            let c = req.condition(condition_type, status, REASON_INIT, MESSAGE_INIT);
            req.conditions.set(c);
        }

        update_conditions(req, &self.ctx.metrics);
    }

    async fn ensure_deleted(&self, req: &mut HcoRequest) -> Result<Outcome, ReconcileError> {
        info!(name = %req.key, "Removing the operands of a deleted HyperConverged");
        self.ctx
            .operands
            .ensure_deleted(req)
            .await
            .map_err(ReconcileError::new)?;

        // Finalizer changes do not bump the generation, so force another cycle.
        let requeue = drop_finalizers(req);
        Ok(Outcome::requeue_if(requeue))
    }

    async fn set_operator_upgradeable_status(
        &self,
        upgrade_mode: bool,
        conditions: &HcoConditions,
    ) -> Result<(), ReconcileError> {
        if !self.ctx.cluster_info.is_managed_by_olm() {
            return Ok(());
        }
        let (status, reason, message) =
            upgradeable_condition(upgrade_mode, conditions, &self.ctx.config.own_version);
        debug!(status = %status, reason = %reason, "Setting the Upgradeable operator condition");
        self.ctx
            .upgradeable
            .set(status, &reason, &message)
            .await
            .map_err(ReconcileError::new)
    }

    async fn emit(&self, req: &HcoRequest, event_type: EventType, reason: &str, message: &str) {
        self.ctx
            .events
            .emit_event(&req.instance, event_type, reason, message)
            .await;
    }
}
