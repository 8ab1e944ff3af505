//! DAG Evaluator
//!
//! Interprets the rule graph bottom-up, memoizing per-block time series
//! keyed by block identity (spec §4.3). The evaluator is pure with respect
//! to the aligned frame and the rule topology — its only side effect is
//! `WriteVar` calling through to the [`Gateway`].
//!
//! Evaluation is driven recursively from a sink; [`Evaluator`] caches each
//! block's result the first time it is computed so a block with several
//! children is never recomputed, keeping cost linear in DAG size rather than
//! exponential in fan-out (spec §4.3 "Memoization").

#![forbid(unsafe_code)]

use std::collections::HashMap;

use chrono::{DateTime, Timelike, Utc};

use crate::aligner::AlignedFrame;
use crate::gateway::Gateway;
use crate::rule::{ArithOp, BlockId, BlockKind, PeriodicOp, PeriodicParams, RuleGraph};
use crate::series::Series;
use crate::{Timestamp, VarId};

/// Errors raised while evaluating the DAG (spec §7).
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    /// A `ReadVar` names an identifier absent from the aligned columns.
    #[error("ReadVar block {block} references unknown variable {var}")]
    UnknownVariable {
        /// The offending block.
        block: BlockId,
        /// The variable id that was not part of the aligned frame.
        var: VarId,
    },
    /// A link references a block id that does not exist, or evaluation
    /// reaches one.
    #[error("block {0} does not exist")]
    UnknownBlock(BlockId),
    /// An arithmetic, `PeriodicCalc`, or `WriteVar` block has no parent.
    #[error("block {0} has no input")]
    MissingInput(BlockId),
    /// A `WriteVar`'s call into the sample store failed.
    #[error("gateway failure while writing block {block}: {source}")]
    Gateway {
        /// The `WriteVar` block that was writing.
        block: BlockId,
        /// The underlying store diagnostic.
        #[source]
        source: anyhow::Error,
    },
}

/// Drives bottom-up, memoized evaluation of a [`RuleGraph`] against one
/// [`AlignedFrame`], writing through `gateway` for every `WriteVar` block.
pub struct Evaluator<'a, G: Gateway> {
    rule: &'a RuleGraph,
    frame: &'a AlignedFrame,
    var_col: HashMap<VarId, usize>,
    gateway: &'a mut G,
    cache: HashMap<BlockId, Series>,
}

impl<'a, G: Gateway> Evaluator<'a, G> {
    /// Build an evaluator. `source_vars` must be the same slice (duplicates
    /// and all) that produced `frame` via [`crate::aligner::align`]; the
    /// evaluator maps each distinct variable id to its first matching
    /// column, since duplicate columns hold identical data (spec §4.4).
    pub fn new(
        rule: &'a RuleGraph,
        frame: &'a AlignedFrame,
        source_vars: &[VarId],
        gateway: &'a mut G,
    ) -> Self {
        let mut var_col = HashMap::new();
        for (idx, &v) in source_vars.iter().enumerate() {
            var_col.entry(v).or_insert(idx);
        }
        Self { rule, frame, var_col, gateway, cache: HashMap::new() }
    }

    /// Evaluate `id`, returning its (possibly cached) time series.
    pub fn evaluate(&mut self, id: BlockId) -> Result<Series, EvalError> {
        if let Some(cached) = self.cache.get(&id) {
            return Ok(cached.clone());
        }
        let block = self.rule.block(id).ok_or(EvalError::UnknownBlock(id))?;
        let result = match block.kind.clone() {
            BlockKind::ReadVar { id: var } => self.evaluate_read_var(id, var)?,
            BlockKind::Arithmetic(op) => self.evaluate_arithmetic(id, op)?,
            BlockKind::PeriodicCalc(params) => self.evaluate_periodic(id, params)?,
            BlockKind::WriteVar { id: var } => self.evaluate_write_var(id, var)?,
        };
        self.cache.insert(id, result.clone());
        Ok(result)
    }

    fn parent_ids(&self, id: BlockId) -> &[BlockId] {
        self.rule.inputs(id)
    }

    fn evaluate_read_var(&mut self, id: BlockId, var: VarId) -> Result<Series, EvalError> {
        let col = *self
            .var_col
            .get(&var)
            .ok_or(EvalError::UnknownVariable { block: id, var })?;
        Ok(Series::from_points(
            self.frame.column(col).into_iter().map(|(t, v)| (t, Some(v))).collect(),
        ))
    }

    fn evaluate_arithmetic(&mut self, id: BlockId, op: ArithOp) -> Result<Series, EvalError> {
        let parents = self.parent_ids(id).to_vec();
        if parents.is_empty() {
            return Err(EvalError::MissingInput(id));
        }
        let mut series: Vec<Series> = Vec::with_capacity(parents.len());
        for p in &parents {
            series.push(self.evaluate(*p)?);
        }
        let len = series.iter().map(Series::len).min().unwrap_or(0);
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            let t = series[0].0[i].0;
            let vals: Vec<f64> = series.iter().filter_map(|s| s.0[i].1).collect();
            out.push((t, apply_arith(op, &vals)));
        }
        Ok(Series::from_points(out))
    }

    fn evaluate_periodic(&mut self, id: BlockId, params: PeriodicParams) -> Result<Series, EvalError> {
        let parent = *self.parent_ids(id).first().ok_or(EvalError::MissingInput(id))?;
        let input = self.evaluate(parent)?;
        if input.is_empty() {
            return Ok(Series::new());
        }

        let period_seconds = (params.period_minutes * 60.0) as i64;
        let mut buckets: HashMap<i64, Vec<(Timestamp, Option<f64>)>> = HashMap::new();
        let mut bucket_order: Vec<i64> = Vec::new();
        for &(t, v) in input.iter() {
            let idx = t.div_euclid(period_seconds.max(1));
            if !buckets.contains_key(&idx) {
                bucket_order.push(idx);
            }
            buckets.entry(idx).or_default().push((t, v));
        }

        let mut out = Vec::new();
        for idx in bucket_order {
            let members = &buckets[&idx];
            let total = members.len();
            let valid_vals: Vec<f64> = members.iter().filter_map(|(_, v)| *v).collect();
            let valid = valid_vals.len();
            if valid == 0 {
                continue;
            }
            let pct = (valid as f64 / total as f64) * 100.0;
            if pct < params.validity_rate {
                continue;
            }
            let agg = match params.operation {
                PeriodicOp::Moyenne => valid_vals.iter().sum::<f64>() / valid as f64,
                PeriodicOp::Somme => valid_vals.iter().sum::<f64>(),
                PeriodicOp::Maximum => valid_vals.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                PeriodicOp::Minimum => valid_vals.iter().copied().fold(f64::INFINITY, f64::min),
                PeriodicOp::Premiere => valid_vals[0],
                PeriodicOp::Derniere => *valid_vals.last().expect("valid_vals is non-empty"),
            };
            let earliest = members.iter().map(|(t, _)| *t).min().expect("bucket has members");
            out.push((truncate_to_hour(earliest), Some(agg)));
        }

        let mut result = Series::from_points(out);
        result.sort_by_timestamp();
        Ok(result)
    }

    fn evaluate_write_var(&mut self, id: BlockId, var: VarId) -> Result<Series, EvalError> {
        let parent = *self.parent_ids(id).first().ok_or(EvalError::MissingInput(id))?;
        let input = self.evaluate(parent)?;
        for &(t, v) in input.iter() {
            if let Some(value) = v {
                self.gateway
                    .insert_if_absent(var, t, value)
                    .map_err(|source| EvalError::Gateway { block: id, source })?;
            }
        }
        Ok(input)
    }
}

fn apply_arith(op: ArithOp, vals: &[f64]) -> Option<f64> {
    if vals.is_empty() {
        return None;
    }
    match op {
        ArithOp::Add => Some(vals.iter().sum()),
        ArithOp::Sub => {
            if vals.len() == 1 {
                Some(vals[0])
            } else {
                Some(vals[0] - vals[1..].iter().sum::<f64>())
            }
        }
        ArithOp::Mul => Some(vals.iter().product()),
        ArithOp::Div => {
            let mut acc = vals[0];
            for &v in &vals[1..] {
                if v == 0.0 {
                    return None;
                }
                acc /= v;
            }
            Some(acc)
        }
    }
}

/// Truncate a Unix timestamp to the start of its UTC hour (spec §4.3: output
/// timestamps are truncated to the hour regardless of the configured
/// period — this is intentional and preserved verbatim, see spec §9).
fn truncate_to_hour(t: Timestamp) -> Timestamp {
    let dt: DateTime<Utc> = DateTime::from_timestamp(t, 0).expect("valid unix timestamp");
    let truncated = dt.with_minute(0).and_then(|d| d.with_second(0)).and_then(|d| d.with_nanosecond(0));
    truncated.expect("zeroing sub-hour fields never fails").timestamp()
}
