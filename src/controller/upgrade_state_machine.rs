//! State machine for HyperConverged upgrades.
//!
//! An upgrade starts when the recorded operator version differs from the running build
//! and walks through a fixed sequence of steps. A step that writes to the cluster ends the
//! cycle with a requeue, so the next cycle resumes at the first incomplete step.

use std::fmt;

// ============================================================================
// Upgrade Steps
// ============================================================================

/// Steps of an upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpgradeStep {
    /// No upgrade running.
    Stable,

    /// The recorded version differs from the running build.
    DetectUpgrade,

    /// Drop deprecated schema versions from the CRD's stored versions.
    PruneCrdVersions,

    /// Delete CRDs of retired components.
    RemoveDeprecatedCrds,

    /// Apply the declarative spec patches and object removals.
    ApplyDeclarativeMigrations,

    /// Wait for every component to report the expected version.
    WaitComponentConvergence,
}

impl fmt::Display for UpgradeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgradeStep::Stable => write!(f, "Stable"),
            UpgradeStep::DetectUpgrade => write!(f, "DetectUpgrade"),
            UpgradeStep::PruneCrdVersions => write!(f, "PruneCRDVersions"),
            UpgradeStep::RemoveDeprecatedCrds => write!(f, "RemoveDeprecatedCRDs"),
            UpgradeStep::ApplyDeclarativeMigrations => write!(f, "ApplyDeclarativeMigrations"),
            UpgradeStep::WaitComponentConvergence => write!(f, "WaitComponentConvergence"),
        }
    }
}

// ============================================================================
// Upgrade Events
// ============================================================================

/// Events that move an upgrade forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeEvent {
    /// The recorded version differs from the running build.
    VersionChanged,

    /// Upgrade mode was entered.
    UpgradeStarted,

    /// The CRD no longer stores deprecated versions.
    CrdVersionsPruned,

    /// No deprecated CRD is left.
    DeprecatedCrdsRemoved,

    /// The declarative migrations left nothing to write.
    MigrationsApplied,

    /// Every component reports the expected version.
    ComponentsConverged,
}

impl fmt::Display for UpgradeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgradeEvent::VersionChanged => write!(f, "VersionChanged"),
            UpgradeEvent::UpgradeStarted => write!(f, "UpgradeStarted"),
            UpgradeEvent::CrdVersionsPruned => write!(f, "CrdVersionsPruned"),
            UpgradeEvent::DeprecatedCrdsRemoved => write!(f, "DeprecatedCrdsRemoved"),
            UpgradeEvent::MigrationsApplied => write!(f, "MigrationsApplied"),
            UpgradeEvent::ComponentsConverged => write!(f, "ComponentsConverged"),
        }
    }
}

// ============================================================================
// Transition Context
// ============================================================================

/// Facts used to evaluate transition guards.
#[derive(Debug, Clone, Default)]
pub struct UpgradeTransitionContext {
    /// This is the reconciler's first cycle after the HyperConverged was created.
    pub first_deployment: bool,

    /// The recorded operator version differs from the running build.
    pub version_differs: bool,

    /// No component reported a negative condition this cycle.
    pub all_components_up: bool,

    /// Every component reports its expected version.
    pub components_upgraded: bool,

    /// A spec or metadata write is pending.
    pub writes_pending: bool,
}

impl UpgradeTransitionContext {
    /// Check if an upgrade may finish.
    pub fn can_complete(&self) -> bool {
        self.all_components_up && self.components_upgraded && !self.writes_pending
    }
}

// ============================================================================
// Upgrade Transition
// ============================================================================

/// Represents a single state transition.
#[derive(Debug, Clone)]
pub struct UpgradeTransition {
    /// Source step.
    pub from: UpgradeStep,

    /// Target step.
    pub to: UpgradeStep,

    /// Event that triggers this transition.
    pub event: UpgradeEvent,

    /// Human-readable description.
    pub description: &'static str,
}

// ============================================================================
// Upgrade State Machine
// ============================================================================

/// State machine validating upgrade step transitions.
#[derive(Debug, Clone)]
pub struct UpgradeStateMachine {
    transitions: Vec<UpgradeTransition>,
}

impl Default for UpgradeStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl UpgradeStateMachine {
    /// Create a new state machine with all valid transitions.
    pub fn new() -> Self {
        let transitions = vec![
            UpgradeTransition {
                from: UpgradeStep::Stable,
                to: UpgradeStep::DetectUpgrade,
                event: UpgradeEvent::VersionChanged,
                description: "Recorded version differs from the running build",
            },
            UpgradeTransition {
                from: UpgradeStep::DetectUpgrade,
                to: UpgradeStep::PruneCrdVersions,
                event: UpgradeEvent::UpgradeStarted,
                description: "Enter upgrade mode",
            },
            UpgradeTransition {
                from: UpgradeStep::PruneCrdVersions,
                to: UpgradeStep::RemoveDeprecatedCrds,
                event: UpgradeEvent::CrdVersionsPruned,
                description: "Stored versions are clean",
            },
            UpgradeTransition {
                from: UpgradeStep::RemoveDeprecatedCrds,
                to: UpgradeStep::ApplyDeclarativeMigrations,
                event: UpgradeEvent::DeprecatedCrdsRemoved,
                description: "Deprecated CRDs are gone",
            },
            UpgradeTransition {
                from: UpgradeStep::ApplyDeclarativeMigrations,
                to: UpgradeStep::WaitComponentConvergence,
                event: UpgradeEvent::MigrationsApplied,
                description: "Declarative migrations applied",
            },
            UpgradeTransition {
                from: UpgradeStep::WaitComponentConvergence,
                to: UpgradeStep::Stable,
                event: UpgradeEvent::ComponentsConverged,
                description: "Every component runs the new version",
            },
        ];

        Self { transitions }
    }

    /// Attempt to move from `from` given an event.
    ///
    /// Returns the transition if valid, None otherwise.
    pub fn transition(
        &self,
        from: UpgradeStep,
        event: UpgradeEvent,
        ctx: &UpgradeTransitionContext,
    ) -> Option<UpgradeTransition> {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == from && t.event == event)?;

        if !self.evaluate_guards(transition, ctx) {
            return None;
        }

        Some(transition.clone())
    }

    fn evaluate_guards(&self, transition: &UpgradeTransition, ctx: &UpgradeTransitionContext) -> bool {
        match (transition.from, transition.to) {
            // A first deployment records the version without upgrading
            (UpgradeStep::Stable, UpgradeStep::DetectUpgrade) => {
                ctx.version_differs && !ctx.first_deployment
            }
            (UpgradeStep::WaitComponentConvergence, UpgradeStep::Stable) => ctx.can_complete(),
            _ => true,
        }
    }
}
