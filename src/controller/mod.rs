//! Controller module for the HyperConverged operator.
//!
//! Contains the reconciliation loop, the upgrade engine, condition aggregation, status
//! management and the capability traits the loop is built on.

// Shared modules
pub mod cluster;
pub mod common;
pub mod context;
pub mod error;
pub mod queue;
pub mod request;
pub mod status;

// Reconcile core
pub mod aggregator;
pub mod finalizers;
pub mod operands;
pub mod reconciler;
pub mod request_router;
pub mod tainted;

// Upgrade engine
pub mod upgrade_patch;
pub mod upgrade_reconciler;
pub mod upgrade_state_machine;
pub mod version;
