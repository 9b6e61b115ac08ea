//! Custom Resource Definitions (CRDs) for hyperconverged-operator.
//!
//! - `HyperConverged`: the single top-level resource that drives every operand

mod hyperconverged;

pub use hyperconverged::*;
