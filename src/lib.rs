//! Crate root: public surface, core aliases, and rule-execution invariants
//!
//! This module is the **single canonical entry-point** for downstream users
//! of the library. It centralizes the variable/value aliases, the small
//! block-identity newtype, and re-exports the main submodules that implement
//! the rule-execution engine.
//!
//! ## Invariants
//!
//! - **Purity boundary.** The [`aligner`] and [`evaluator`] modules are pure
//!   functions of the aligned frame and the rule topology. The only side
//!   effects in a whole execution happen inside the evaluator's `WriteVar`
//!   handling and the qualification sweep in [`orchestrator`], both of which
//!   go through the [`gateway::Gateway`] trait. We **forbid unsafe**
//!   throughout the crate.
//!
//! - **Re-execution discipline.** The aligner reads exclusively unqualified
//!   samples. Once a source sample is marked qualified at the end of an
//!   execution, the next execution over the same rule sees a strictly
//!   smaller working set — this is what makes [`execute`] idempotent
//!   together with `insert_if_absent` (see [`gateway::Gateway`]).
//!
//! - **Memoization.** [`evaluator::Evaluator`] computes each block's time
//!   series at most once per execution, keyed by block id, so cost is linear
//!   in DAG size rather than exponential in fan-out.
//!
//! These invariants are enforced by design across the submodules. Each
//! submodule carries its own error enum for the failures it can cause
//! ([`rule::RuleError`], [`aligner::AlignError`], [`evaluator::EvalError`]);
//! [`orchestrator::OrchestrateError`] composes them into the single error
//! type returned by [`execute`].

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

/// Rule JSON schema, parsing, and adjacency construction (spec §6).
pub mod rule;
/// Block/time-series primitives shared across the engine (ids, samples, series).
pub mod series;
/// Sample Store Gateway trait and an in-memory adapter for tests/demos.
pub mod gateway;
/// Temporal Aligner: cross-variable union timeline with interpolation.
pub mod aligner;
/// DAG Evaluator: interprets `ReadVar`/arithmetic/`PeriodicCalc`/`WriteVar`.
pub mod evaluator;
/// Execution Orchestrator: drives one execution end to end.
pub mod orchestrator;

// ============================================================================
// Canonical aliases and root-level re-exports (centralization)
// ============================================================================

/// Identifier of a time-series channel in the sample store.
pub type VarId = i64;

/// A real-valued sample value. `None` represents a SQL `NULL`.
pub type Value = Option<f64>;

/// Unix-epoch timestamp, seconds resolution.
pub type Timestamp = i64;

/// Centralized block-identity newtype used across the crate.
///
/// Re-exported from [`rule`] to keep a single definition site. Downstream
/// code should import it from the crate root (`use tsrule_engine::BlockId;`).
pub use crate::rule::BlockId;

/// Top-level error type returned by [`execute`]; see
/// [`orchestrator::OrchestrateError`] for the full taxonomy (spec §7).
pub use crate::orchestrator::OrchestrateError as EngineError;

pub use crate::orchestrator::{execute, ExecutionMode, ExecutionSummary};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_offending_id() {
        let e = EngineError::Eval(crate::evaluator::EvalError::UnknownVariable {
            block: BlockId(3),
            var: 9,
        });
        assert!(e.to_string().contains('3'));
        assert!(e.to_string().contains('9'));
    }
}
