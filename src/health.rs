//! Probe and metrics endpoints.
//!
//! - `/healthz` answers as long as the process runs.
//! - `/readyz` answers 200 once this replica leads and the reconcile loop is running.
//! - `/metrics` serves the Prometheus registry shared with the reconciler.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use serde_json::json;
use tracing::info;

/// Default port of the probe and metrics server.
pub const HEALTH_PORT: u16 = 8080;

const METRIC_PREFIX: &str = "kubevirt_hco";

/// How a reconcile cycle ended.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing left to do until the next event.
    Done,
    /// The cycle asked to run again.
    Requeue,
    /// A write lost an optimistic-concurrency race.
    Conflict,
    Error,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Done => "done",
            CycleOutcome::Requeue => "requeue",
            CycleOutcome::Conflict => "conflict",
            CycleOutcome::Error => "error",
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct CycleLabels {
    outcome: CycleOutcome,
}

impl EncodeLabelSet for CycleLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("outcome", self.outcome.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct AnnotationLabels {
    annotation_name: String,
}

impl EncodeLabelSet for AnnotationLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("annotation_name", self.annotation_name.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Operator metrics, registered once and shared by the reconciler and the server.
pub struct Metrics {
    cycles: Family<CycleLabels, Counter>,
    cycle_duration_seconds: Histogram,
    /// 1 while the HyperConverged resource exists.
    pub hyperconverged_exists: Gauge,
    /// 0 healthy, 1 warning, 2 error.
    pub system_health_status: Gauge,
    /// 1 while an upgrade is running.
    pub upgrade_in_progress: Gauge,
    unsafe_modifications: Family<AnnotationLabels, Gauge>,
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix(METRIC_PREFIX);

        let cycles = Family::<CycleLabels, Counter>::default();
        registry.register(
            "reconcile_cycles",
            "Reconcile cycles of the HyperConverged resource by outcome",
            cycles.clone(),
        );

        let cycle_duration_seconds = Histogram::new(exponential_buckets(0.005, 2.0, 12));
        registry.register(
            "reconcile_duration_seconds",
            "Wall time of one reconcile cycle",
            cycle_duration_seconds.clone(),
        );

        let hyperconverged_exists = Gauge::default();
        registry.register(
            "hyperconverged_cr_exists",
            "Indicates whether the HyperConverged custom resource exists (1) or not (0)",
            hyperconverged_exists.clone(),
        );

        let system_health_status = Gauge::default();
        registry.register(
            "system_health_status",
            "Indicates whether the system health status is healthy (0), warning (1), or error (2)",
            system_health_status.clone(),
        );

        let upgrade_in_progress = Gauge::default();
        registry.register(
            "upgrade_in_progress",
            "Indicates whether the operator is upgrading its components (1) or not (0)",
            upgrade_in_progress.clone(),
        );

        let unsafe_modifications = Family::<AnnotationLabels, Gauge>::default();
        registry.register(
            "unsafe_modifications",
            "Count of unsafe modifications in the HyperConverged annotations",
            unsafe_modifications.clone(),
        );

        Self {
            cycles,
            cycle_duration_seconds,
            hyperconverged_exists,
            system_health_status,
            upgrade_in_progress,
            unsafe_modifications,
            registry,
        }
    }

    /// Count a finished cycle and observe its duration.
    pub fn record_cycle(&self, outcome: CycleOutcome, duration_secs: f64) {
        self.cycles.get_or_create(&CycleLabels { outcome }).inc();
        self.cycle_duration_seconds.observe(duration_secs);
    }

    pub fn cycles(&self, outcome: CycleOutcome) -> u64 {
        self.cycles.get_or_create(&CycleLabels { outcome }).get()
    }

    pub fn set_hyperconverged_exists(&self, exists: bool) {
        self.hyperconverged_exists.set(i64::from(exists));
    }

    pub fn set_system_health_status(&self, value: i64) {
        self.system_health_status.set(value);
    }

    pub fn set_upgrade_in_progress(&self, upgrading: bool) {
        self.upgrade_in_progress.set(i64::from(upgrading));
    }

    /// Record the number of operations in a patch annotation.
    pub fn set_unsafe_modification_count(&self, annotation: &str, count: usize) {
        self.unsafe_modifications
            .get_or_create(&AnnotationLabels {
                annotation_name: annotation.to_string(),
            })
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    pub fn unsafe_modification_count(&self, annotation: &str) -> i64 {
        self.unsafe_modifications
            .get_or_create(&AnnotationLabels {
                annotation_name: annotation.to_string(),
            })
            .get()
    }

    /// Render the registry in the Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}

/// State read by the probe handlers.
pub struct HealthState {
    serving: AtomicBool,
    /// Unix seconds of the last cycle that did not fail.
    last_reconcile: AtomicU64,
    pub metrics: Arc<Metrics>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// A state that is not serving yet.
    pub fn new() -> Self {
        Self {
            serving: AtomicBool::new(false),
            last_reconcile: AtomicU64::new(0),
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn set_serving(&self, serving: bool) {
        self.serving.store(serving, Ordering::SeqCst);
    }

    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::SeqCst)
    }

    /// Stamp the current time as the last successful cycle.
    pub fn mark_reconciled(&self) {
        let now = jiff::Timestamp::now().as_second();
        self.last_reconcile
            .store(u64::try_from(now).unwrap_or_default(), Ordering::Relaxed);
    }

    /// Unix seconds of the last successful cycle, if any ran.
    pub fn last_reconcile(&self) -> Option<u64> {
        match self.last_reconcile.load(Ordering::Relaxed) {
            0 => None,
            secs => Some(secs),
        }
    }
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    let status = if state.is_serving() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "serving": state.is_serving(),
        "lastReconcile": state.last_reconcile(),
    });
    (status, Json(body)).into_response()
}

async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.encode(),
    )
}

pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serve the probe and metrics endpoints on all interfaces.
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> Result<(), std::io::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(port, "Starting health server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, create_router(state)).await
}
