//! Rule JSON schema & parsing
//!
//! A rule is a directed acyclic graph of [`Block`]s connected by [`LinkSpec`]s
//! (spec §3, §6). This module turns the duck-typed JSON document into a
//! checked, typed intermediate representation before the evaluator ever
//! looks at it — `RuleError::MalformedRule` is reported here, at parse time,
//! never during evaluation (spec §9, "Duck-typed JSON → typed schema").
//!
//! Block identifiers are the block's 1-based position in `blocks` and are
//! stable for one execution (spec §3).

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;

use crate::VarId;

/// Identifier of a block: its 1-based position in the rule's `blocks` list.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub usize);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised while parsing a rule document (spec §7).
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    /// JSON parse failure or missing required keys.
    #[error("malformed rule: {0}")]
    MalformedRule(String),
    /// A block's `class` tag is not one of the seven recognized classes.
    #[error("block {block} has unknown class {class:?}")]
    UnknownBlockClass {
        /// The offending block.
        block: BlockId,
        /// The unrecognized class string, as given in the rule.
        class: String,
    },
    /// A link references a block id that does not exist.
    #[error("block {0} does not exist")]
    UnknownBlock(BlockId),
    /// A `PeriodicCalc.operation` string is not one of the six recognized
    /// aggregations (spec §7).
    #[error("block {block} has unknown periodic operation {operation:?}")]
    UnknownOperation {
        /// The offending block.
        block: BlockId,
        /// The unrecognized operation string, as given in the rule.
        operation: String,
    },
}

/// The `period`/`validity_rate` parameters of a `PeriodicCalc` block, with
/// defaults applied (spec §4.3, §9: "When `period` is absent, use 60
/// minutes. When `validity_rate` is absent, use 0").
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PeriodicParams {
    /// Aggregation to apply per bucket.
    pub operation: PeriodicOp,
    /// Bucket length, in minutes.
    pub period_minutes: f64,
    /// Minimum percentage of non-null samples a bucket must contain.
    pub validity_rate: f64,
}

/// The seven recognized `PeriodicCalc.operation` values (spec §4.3),
/// case-insensitive and whitespace-trimmed at parse time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PeriodicOp {
    Moyenne,
    Somme,
    Maximum,
    Minimum,
    Premiere,
    Derniere,
}

impl PeriodicOp {
    /// Parse a trimmed, case-folded operation name. Returns `None` if it is
    /// not one of the six recognized operations.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "moyenne" => Some(Self::Moyenne),
            "somme" => Some(Self::Somme),
            "maximum" => Some(Self::Maximum),
            "minimum" => Some(Self::Minimum),
            "premiere" => Some(Self::Premiere),
            "derniere" => Some(Self::Derniere),
            _ => None,
        }
    }
}

/// The four arithmetic operators (spec §4.3).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// The class-specific behavior and parameters of a [`Block`] (spec §6).
#[derive(Clone, Debug, PartialEq)]
pub enum BlockKind {
    /// Reads the aligned projection of source variable `id`.
    ReadVar { id: VarId },
    /// Writes its single parent's non-null rows to variable `id`.
    WriteVar { id: VarId },
    /// One of `+ - * /`, applied positionally across parent streams.
    Arithmetic(ArithOp),
    /// Periodic bucketed aggregation over its single parent.
    PeriodicCalc(PeriodicParams),
}

/// One node of the rule DAG (spec §3): a class tag plus its parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    /// This block's 1-based position, stable for the execution.
    pub id: BlockId,
    /// The parsed class and its parameters.
    pub kind: BlockKind,
}

/// A parsed, adjacency-indexed rule ready for evaluation.
///
/// `inputs`/`outputs` are derived from the link list exactly as spec §3
/// describes: `inputs(b)` preserves the order links naming `b` as a child
/// appear in the JSON `links` array, which is what makes parent order for
/// `-`/`/` blocks well defined (spec §4.3, §9).
#[derive(Clone, Debug)]
pub struct RuleGraph {
    /// Blocks indexed by `id.0 - 1`.
    pub blocks: Vec<Block>,
    inputs: HashMap<BlockId, Vec<BlockId>>,
    outputs: HashMap<BlockId, Vec<BlockId>>,
}

impl RuleGraph {
    /// Parents of `b`, in link-list order.
    pub fn inputs(&self, b: BlockId) -> &[BlockId] {
        self.inputs.get(&b).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Children of `b`.
    pub fn outputs(&self, b: BlockId) -> &[BlockId] {
        self.outputs.get(&b).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The block at `id`, if it exists.
    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id.0.checked_sub(1)?)
    }

    /// All `WriteVar` blocks; an execution evaluates each as a sink.
    pub fn sinks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|b| matches!(b.kind, BlockKind::WriteVar { .. }))
    }

    /// Source variable ids named by `ReadVar` blocks, in block order
    /// (duplicates preserved; spec §4.4 step 3).
    pub fn source_variables(&self) -> Vec<VarId> {
        self.blocks
            .iter()
            .filter_map(|b| match b.kind {
                BlockKind::ReadVar { id } => Some(id),
                _ => None,
            })
            .collect()
    }

    /// A topological order over block ids, or the id of a block unreachable
    /// by the sort — i.e. part of (or downstream of) a cycle (spec §9,
    /// resolved as `CyclicRule` rather than the reference's silent
    /// non-termination).
    pub fn topological_order(&self) -> Result<Vec<BlockId>, BlockId> {
        let n = self.blocks.len();
        let mut indegree: HashMap<BlockId, usize> = self.blocks.iter().map(|b| (b.id, 0)).collect();
        for b in &self.blocks {
            for &child in self.outputs(b.id) {
                *indegree.entry(child).or_insert(0) += 1;
            }
        }
        let mut queue: Vec<BlockId> =
            self.blocks.iter().filter(|b| indegree[&b.id] == 0).map(|b| b.id).collect();
        let mut order = Vec::with_capacity(n);
        let mut head = 0;
        while head < queue.len() {
            let cur = queue[head];
            head += 1;
            order.push(cur);
            for &child in self.outputs(cur) {
                let e = indegree.get_mut(&child).expect("child present in indegree map");
                *e -= 1;
                if *e == 0 {
                    queue.push(child);
                }
            }
        }
        if order.len() < n {
            let stuck = self
                .blocks
                .iter()
                .map(|b| b.id)
                .find(|id| !order.contains(id))
                .expect("fewer than n blocks ordered implies at least one missing id");
            return Err(stuck);
        }
        Ok(order)
    }
}

// ============================================================================
// Wire format (serde) — kept separate from the typed `RuleGraph` above so
// that parse errors are reported before any block semantics are consulted.
// ============================================================================

#[derive(Deserialize)]
struct RawDocument {
    blocks: Vec<RawBlock>,
    links: Vec<RawLink>,
}

#[derive(Deserialize)]
struct RawBlock {
    class: String,
    #[serde(default)]
    parameters: serde_json::Value,
}

#[derive(Deserialize)]
struct RawLink {
    parent: usize,
    child: usize,
}

fn param_i64(params: &serde_json::Value, key: &str, block: BlockId) -> Result<VarId, RuleError> {
    params
        .get(key)
        .and_then(serde_json::Value::as_i64)
        .ok_or_else(|| {
            RuleError::MalformedRule(format!("block {block} parameters missing integer {key:?}"))
        })
}

fn param_periodic(params: &serde_json::Value, block: BlockId) -> Result<PeriodicParams, RuleError> {
    let op_raw = params
        .get("operation")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| {
            RuleError::MalformedRule(format!("block {block} parameters missing string \"operation\""))
        })?;
    let operation = PeriodicOp::parse(op_raw).ok_or_else(|| RuleError::UnknownOperation {
        block,
        operation: op_raw.to_string(),
    })?;
    let period_minutes = params.get("period").and_then(serde_json::Value::as_f64).unwrap_or(60.0);
    let validity_rate = params.get("validity_rate").and_then(serde_json::Value::as_f64).unwrap_or(0.0);
    Ok(PeriodicParams { operation, period_minutes, validity_rate })
}

/// Parse a rule JSON document into a [`RuleGraph`] (spec §4.4 step 1-2).
///
/// Top-level fields other than `blocks`/`links` (`id`, `name`, `description`)
/// are metadata and are ignored, per spec §6.
pub fn parse(rule_json: &str) -> Result<RuleGraph, RuleError> {
    let raw: RawDocument = serde_json::from_str(rule_json)
        .map_err(|e| RuleError::MalformedRule(e.to_string()))?;

    let mut blocks = Vec::with_capacity(raw.blocks.len());
    for (i, rb) in raw.blocks.into_iter().enumerate() {
        let id = BlockId(i + 1);
        let kind = match rb.class.as_str() {
            "ReadVar" => BlockKind::ReadVar { id: param_i64(&rb.parameters, "Id", id)? },
            "WriteVar" => BlockKind::WriteVar { id: param_i64(&rb.parameters, "Id", id)? },
            "+" => BlockKind::Arithmetic(ArithOp::Add),
            "-" => BlockKind::Arithmetic(ArithOp::Sub),
            "*" => BlockKind::Arithmetic(ArithOp::Mul),
            "/" => BlockKind::Arithmetic(ArithOp::Div),
            "PeriodicCalc" => BlockKind::PeriodicCalc(param_periodic(&rb.parameters, id)?),
            other => {
                return Err(RuleError::UnknownBlockClass { block: id, class: other.to_string() })
            }
        };
        blocks.push(Block { id, kind });
    }

    let n = blocks.len();
    let mut inputs: HashMap<BlockId, Vec<BlockId>> = HashMap::new();
    let mut outputs: HashMap<BlockId, Vec<BlockId>> = HashMap::new();
    for link in &raw.links {
        let parent = BlockId(link.parent);
        let child = BlockId(link.child);
        if parent.0 == 0 || parent.0 > n {
            return Err(RuleError::UnknownBlock(parent));
        }
        if child.0 == 0 || child.0 > n {
            return Err(RuleError::UnknownBlock(child));
        }
        inputs.entry(child).or_default().push(parent);
        outputs.entry(parent).or_default().push(child);
    }

    Ok(RuleGraph { blocks, inputs, outputs })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rule() -> &'static str {
        r#"{
            "blocks": [
                {"class": "ReadVar", "parameters": {"Id": 1}},
                {"class": "ReadVar", "parameters": {"Id": 2}},
                {"class": "-", "parameters": {}},
                {"class": "WriteVar", "parameters": {"Id": 3}}
            ],
            "links": [
                {"parent": 1, "child": 3},
                {"parent": 2, "child": 3},
                {"parent": 3, "child": 4}
            ]
        }"#
    }

    #[test]
    fn parses_blocks_and_preserves_parent_order() {
        let g = parse(sample_rule()).unwrap();
        assert_eq!(g.blocks.len(), 4);
        assert_eq!(g.inputs(BlockId(3)), &[BlockId(1), BlockId(2)]);
        assert_eq!(g.source_variables(), vec![1, 2]);
    }

    #[test]
    fn unknown_class_is_rejected_at_parse_time() {
        let raw = r#"{"blocks":[{"class":"Bogus","parameters":{}}],"links":[]}"#;
        let err = parse(raw).unwrap_err();
        assert!(matches!(err, RuleError::UnknownBlockClass { .. }));
    }

    #[test]
    fn unrecognized_periodic_operation_is_its_own_error_kind() {
        let raw = r#"{"blocks":[
            {"class":"ReadVar","parameters":{"Id":1}},
            {"class":"PeriodicCalc","parameters":{"operation":"bogus"}}
        ],"links":[{"parent":1,"child":2}]}"#;
        let err = parse(raw).unwrap_err();
        match err {
            RuleError::UnknownOperation { block, operation } => {
                assert_eq!(block, BlockId(2));
                assert_eq!(operation, "bogus");
            }
            other => panic!("expected UnknownOperation, got {other:?}"),
        }
    }

    #[test]
    fn link_to_nonexistent_block_is_rejected() {
        let raw = r#"{"blocks":[{"class":"ReadVar","parameters":{"Id":1}}],"links":[{"parent":1,"child":9}]}"#;
        let err = parse(raw).unwrap_err();
        assert!(matches!(err, RuleError::UnknownBlock(BlockId(9))));
    }

    #[test]
    fn periodic_params_apply_defaults() {
        let raw = r#"{"blocks":[
            {"class":"ReadVar","parameters":{"Id":1}},
            {"class":"PeriodicCalc","parameters":{"operation":" Moyenne "}}
        ],"links":[{"parent":1,"child":2}]}"#;
        let g = parse(raw).unwrap();
        match &g.block(BlockId(2)).unwrap().kind {
            BlockKind::PeriodicCalc(p) => {
                assert_eq!(p.operation, PeriodicOp::Moyenne);
                assert_eq!(p.period_minutes, 60.0);
                assert_eq!(p.validity_rate, 0.0);
            }
            _ => panic!("expected PeriodicCalc"),
        }
    }

    #[test]
    fn cyclic_rule_is_detected() {
        let raw = r#"{"blocks":[
            {"class":"+","parameters":{}},
            {"class":"+","parameters":{}}
        ],"links":[{"parent":1,"child":2},{"parent":2,"child":1}]}"#;
        let g = parse(raw).unwrap();
        assert!(g.topological_order().is_err());
    }

    #[test]
    fn acyclic_rule_sorts_cleanly() {
        let g = parse(sample_rule()).unwrap();
        let order = g.topological_order().unwrap();
        assert_eq!(order.len(), 4);
        let pos = |id: BlockId| order.iter().position(|&x| x == id).unwrap();
        assert!(pos(BlockId(1)) < pos(BlockId(3)));
        assert!(pos(BlockId(2)) < pos(BlockId(3)));
        assert!(pos(BlockId(3)) < pos(BlockId(4)));
    }
}
