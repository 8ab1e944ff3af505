//! Sample Store Gateway
//!
//! The narrow data-access surface the engine uses to read unqualified source
//! samples, mark them qualified, and insert computed samples (spec §4.1).
//! All operations execute within the caller-provided transactional scope;
//! the gateway itself never commits or rolls back.
//!
//! [`InMemoryGateway`] is a test/demo adapter — the engine's equivalent of
//! the teacher crate's `api::adapters::VecRows`/`CsvRows`: a trivial struct
//! that implements the trait so the pure evaluation logic can be exercised
//! without a real store.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use crate::series::Qualification;
use crate::{Timestamp, VarId, Value};

/// The sample-store access surface the engine depends on (spec §4.1).
///
/// A production implementation backs this with a transactional SQL
/// connection; the transaction's lifetime is the caller's concern, not
/// this trait's.
pub trait Gateway {
    /// All samples of `var_id` whose qualification state is unqualified.
    /// Order is unspecified; the aligner sorts.
    fn load_unqualified(&mut self, var_id: VarId) -> anyhow::Result<Vec<(Timestamp, Value)>>;

    /// Insert a qualified sample at `(var_id, timestamp)` iff no sample
    /// exists there yet, regardless of that existing sample's qualification.
    /// Returns whether a row was actually inserted.
    fn insert_if_absent(
        &mut self,
        var_id: VarId,
        timestamp: Timestamp,
        value: f64,
    ) -> anyhow::Result<bool>;

    /// Transition the sample at `(var_id, timestamp)` from unqualified to
    /// qualified. No-op if already qualified or absent.
    fn mark_qualified(&mut self, var_id: VarId, timestamp: Timestamp) -> anyhow::Result<()>;
}

/// An in-memory [`Gateway`] backed by a `BTreeMap`, for tests and the CLI
/// demo binaries.
///
/// Rows are keyed by `(var_id, timestamp)` so `insert_if_absent` and
/// `mark_qualified` are natural map operations; `BTreeMap` keeps iteration
/// order deterministic, which is convenient when asserting on test fixtures.
#[derive(Clone, Debug, Default)]
pub struct InMemoryGateway {
    rows: BTreeMap<(VarId, Timestamp), (Value, Qualification)>,
}

impl InMemoryGateway {
    /// An empty store.
    pub fn new() -> Self {
        Self { rows: BTreeMap::new() }
    }

    /// Seed a sample directly, bypassing `insert_if_absent`'s qualification
    /// policy — useful for constructing test fixtures of raw, unqualified
    /// history.
    pub fn seed(&mut self, var_id: VarId, timestamp: Timestamp, value: Value, q: Qualification) {
        self.rows.insert((var_id, timestamp), (value, q));
    }

    /// All stored rows for `var_id`, including qualified ones — useful for
    /// asserting idempotence in tests (spec §8 scenario 5).
    pub fn all(&self, var_id: VarId) -> Vec<(Timestamp, Value, Qualification)> {
        self.rows
            .iter()
            .filter(|((v, _), _)| *v == var_id)
            .map(|((_, t), (val, q))| (*t, *val, *q))
            .collect()
    }
}

impl Gateway for InMemoryGateway {
    fn load_unqualified(&mut self, var_id: VarId) -> anyhow::Result<Vec<(Timestamp, Value)>> {
        Ok(self
            .rows
            .iter()
            .filter(|((v, _), (_, q))| *v == var_id && *q == Qualification::Unqualified)
            .map(|((_, t), (val, _))| (*t, *val))
            .collect())
    }

    fn insert_if_absent(
        &mut self,
        var_id: VarId,
        timestamp: Timestamp,
        value: f64,
    ) -> anyhow::Result<bool> {
        let key = (var_id, timestamp);
        if self.rows.contains_key(&key) {
            return Ok(false);
        }
        self.rows.insert(key, (Some(value), Qualification::Qualified));
        Ok(true)
    }

    fn mark_qualified(&mut self, var_id: VarId, timestamp: Timestamp) -> anyhow::Result<()> {
        if let Some((_, q)) = self.rows.get_mut(&(var_id, timestamp)) {
            *q = Qualification::Qualified;
        }
        Ok(())
    }
}
