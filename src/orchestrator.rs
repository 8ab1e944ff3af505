//! Execution Orchestrator
//!
//! Drives one execution end to end (spec §4.4): parse the rule, gather every
//! source variable's unqualified history in one bulk load, align it into a
//! dense frame, evaluate every sink, and sweep the unqualified set into
//! qualified once evaluation has succeeded. This is the only module that
//! calls more than one `Gateway` method, and the only place loop-carried
//! state crosses module boundaries.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use tracing::{info, info_span};

use crate::aligner::{align, AlignError};
use crate::evaluator::{EvalError, Evaluator};
use crate::gateway::Gateway;
use crate::rule::{parse, BlockId, RuleError};
use crate::{Timestamp, VarId};

/// Errors raised by a full execution (spec §7), composing each phase's own
/// error type the way the teacher's `ProveError`/`VerifySchedError` compose
/// `QuotientError`/`PcsVerifyError`.
#[derive(Debug, thiserror::Error)]
pub enum OrchestrateError {
    /// Rule parsing failed.
    #[error(transparent)]
    Rule(#[from] RuleError),
    /// The rule's blocks form a cycle; a topological evaluation order does
    /// not exist (spec §9).
    #[error("rule graph contains a cycle reachable from block {0}")]
    CyclicRule(BlockId),
    /// A rule with no `ReadVar` blocks has nothing to align or evaluate.
    #[error("rule has no ReadVar blocks")]
    NoReadVars,
    /// Temporal alignment failed.
    #[error(transparent)]
    Align(#[from] AlignError),
    /// Block evaluation failed.
    #[error(transparent)]
    Eval(#[from] EvalError),
    /// A `Gateway` call the Orchestrator itself makes — bulk-loading
    /// unqualified history, or the qualification sweep — failed.
    #[error("gateway failure for variable {var}: {source}")]
    Gateway {
        /// The variable being loaded or qualified.
        var: VarId,
        /// The underlying store diagnostic.
        #[source]
        source: anyhow::Error,
    },
}

/// Which caller-visible mode an execution is running in (spec §4.4). The
/// engine's own logic does not branch on this — both modes run the identical
/// parse/align/evaluate/qualify pipeline — it exists so the orchestrator can
/// log which the caller requested, and so `bin/execute.rs`/`bin/simulate.rs`
/// can label their output without duplicating the pipeline.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    /// The caller will commit the gateway's transaction on success.
    Execute,
    /// The caller will roll back the gateway's transaction regardless of
    /// outcome — used to preview what an execution would write.
    Simulate,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Execute => write!(f, "execute"),
            Self::Simulate => write!(f, "simulate"),
        }
    }
}

/// A record of what one execution did, for logging/CLI display.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSummary {
    /// The distinct variables the rule reads from (`ReadVar` blocks).
    pub source_variables: Vec<VarId>,
    /// Number of distinct timestamps in the aligned frame.
    pub aligned_timestamps: usize,
    /// Number of `(variable, timestamp)` rows written by every `WriteVar`
    /// sink, across the whole rule.
    pub output_samples: usize,
}

/// Run one execution of `rule_json` against `gateway` (spec §4.4, steps
/// 1-8). `mode` only affects logging; the caller is responsible for
/// committing or rolling back whatever transaction `gateway` participates
/// in.
pub fn execute<G: Gateway>(
    rule_json: &str,
    gateway: &mut G,
    mode: ExecutionMode,
) -> Result<ExecutionSummary, OrchestrateError> {
    let span = info_span!("execution", mode = %mode);
    let _enter = span.enter();

    let rule = parse(rule_json)?;
    info!(blocks = rule.blocks.len(), "parsed rule");

    if let Err(stuck) = rule.topological_order() {
        return Err(OrchestrateError::CyclicRule(stuck));
    }

    let source_vars = rule.source_variables();
    if source_vars.is_empty() {
        return Err(OrchestrateError::NoReadVars);
    }

    let mut loaded: BTreeMap<VarId, Vec<(Timestamp, crate::Value)>> = BTreeMap::new();
    for &var in &source_vars {
        if loaded.contains_key(&var) {
            continue;
        }
        let rows = gateway
            .load_unqualified(var)
            .map_err(|source| OrchestrateError::Gateway { var, source })?;
        loaded.insert(var, rows);
    }
    info!(variables = loaded.len(), "loaded unqualified history");

    let frame = align(&loaded, &source_vars)?;
    info!(timestamps = frame.len(), "aligned source history");

    let mut output_samples = 0;
    {
        let mut evaluator = Evaluator::new(&rule, &frame, &source_vars, gateway);
        for sink in rule.sinks() {
            let series = evaluator.evaluate(sink.id)?;
            output_samples += series.iter().filter(|(_, v)| v.is_some()).count();
        }
    }

    // Qualification sweep (spec §4.4 step 7): every timestamp actually
    // stored (not merely interpolated) for a source variable, across the
    // whole aligned frame, transitions from unqualified to qualified. This
    // is what makes a second execution over the same window a no-op.
    for &var in loaded.keys() {
        for &t in frame.timestamps() {
            if frame.has_stored_sample(var, t) {
                gateway
                    .mark_qualified(var, t)
                    .map_err(|source| OrchestrateError::Gateway { var, source })?;
            }
        }
    }
    info!(output_samples, "execution complete");

    Ok(ExecutionSummary { source_variables: source_vars, aligned_timestamps: frame.len(), output_samples })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::InMemoryGateway;
    use crate::series::Qualification::Unqualified;

    #[test]
    fn end_to_end_subtraction_writes_result_and_qualifies_sources() {
        let raw = r#"{"blocks":[
            {"class":"ReadVar","parameters":{"Id":1}},
            {"class":"ReadVar","parameters":{"Id":2}},
            {"class":"-","parameters":{}},
            {"class":"WriteVar","parameters":{"Id":3}}
        ],"links":[{"parent":1,"child":3},{"parent":2,"child":3},{"parent":3,"child":4}]}"#;
        let mut gw = InMemoryGateway::new();
        gw.seed(1, 100, Some(10.0), Unqualified);
        gw.seed(2, 100, Some(4.0), Unqualified);

        let summary = execute(raw, &mut gw, ExecutionMode::Execute).unwrap();
        assert_eq!(summary.source_variables, vec![1, 2]);
        assert_eq!(summary.aligned_timestamps, 1);
        assert_eq!(summary.output_samples, 1);
        assert_eq!(gw.all(3), vec![(100, Some(6.0), crate::series::Qualification::Qualified)]);

        // spec §8 scenario 5: repeating the execution with no new source
        // data is idempotent. Every source sample is now qualified, so the
        // aligner sees an empty union rather than erroring — zero new output
        // samples, and the store is otherwise unchanged.
        let before = (gw.all(1), gw.all(2), gw.all(3));
        let summary = execute(raw, &mut gw, ExecutionMode::Execute).unwrap();
        assert_eq!(summary.aligned_timestamps, 0);
        assert_eq!(summary.output_samples, 0);
        assert_eq!(before, (gw.all(1), gw.all(2), gw.all(3)));
    }

    #[test]
    fn cyclic_rule_is_rejected_before_any_gateway_call() {
        let raw = r#"{"blocks":[
            {"class":"+","parameters":{}},
            {"class":"+","parameters":{}}
        ],"links":[{"parent":1,"child":2},{"parent":2,"child":1}]}"#;
        let mut gw = InMemoryGateway::new();
        let err = execute(raw, &mut gw, ExecutionMode::Execute).unwrap_err();
        assert!(matches!(err, OrchestrateError::CyclicRule(_)));
    }

    #[test]
    fn rule_without_read_vars_is_rejected() {
        let raw = r#"{"blocks":[{"class":"WriteVar","parameters":{"Id":1}}],"links":[]}"#;
        let mut gw = InMemoryGateway::new();
        let err = execute(raw, &mut gw, ExecutionMode::Execute).unwrap_err();
        assert!(matches!(err, OrchestrateError::NoReadVars));
    }

    #[test]
    fn simulate_mode_runs_the_same_pipeline_as_execute() {
        let raw = r#"{"blocks":[
            {"class":"ReadVar","parameters":{"Id":1}},
            {"class":"WriteVar","parameters":{"Id":2}}
        ],"links":[{"parent":1,"child":2}]}"#;
        let mut gw = InMemoryGateway::new();
        gw.seed(1, 10, Some(1.0), Unqualified);
        let summary = execute(raw, &mut gw, ExecutionMode::Simulate).unwrap();
        assert_eq!(summary.output_samples, 1);
    }
}
