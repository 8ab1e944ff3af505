//! Temporal Aligner
//!
//! Given a set of source variable identifiers, returns the union of their
//! sample timestamps and, for each `(variable, timestamp)`, a value obtained
//! by direct read or by linear interpolation/extrapolation along that
//! variable's own timeline (spec §4.2). This is the sole place in the engine
//! that turns sparse, possibly-misaligned history into a dense matrix every
//! downstream block can read positionally.
//!
//! The aligner reads exclusively unqualified samples (via [`Gateway`]); this
//! is what makes re-execution idempotent once qualification is applied at
//! the end of an execution (spec §4.4 step 7).

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use crate::{Timestamp, VarId, Value};

/// Errors raised by the aligner (spec §7).
#[derive(Debug, thiserror::Error)]
pub enum AlignError {
    /// A source variable has zero unqualified samples, yet some other source
    /// variable in the same rule has a timestamp this one would need to
    /// supply a value for. Alignment is undefined there.
    ///
    /// This is *not* raised when every source variable is simultaneously
    /// starved — that is the ordinary shape of re-running a rule right after
    /// a successful execution, once everything it touched has been marked
    /// qualified (spec §4.4 step 7); there the union of timestamps is empty
    /// and [`align`] returns an empty frame instead (spec.md:178, :198).
    #[error("source variable {0} has no unqualified samples")]
    NoSourceData(VarId),
}

/// Per-variable unqualified history, split into "every sample timestamp
/// seen" (used for the union timeline and the qualification sweep) and
/// "timestamps with a usable, non-null value" (used for resolution).
///
/// A stored sample whose value is SQL `NULL` cannot anchor an interpolation
/// and is not "used verbatim" either, since the aligned frame's invariant is
/// that every cell is non-null (spec §3); we fall through to the nearest
/// usable neighbor exactly as if no sample existed at that timestamp.
struct VarTimeline {
    all_timestamps: BTreeSet<Timestamp>,
    usable: BTreeMap<Timestamp, f64>,
}

impl VarTimeline {
    fn resolve(&self, t: Timestamp) -> Option<f64> {
        if let Some(&v) = self.usable.get(&t) {
            return Some(v);
        }
        let prev = self.usable.range(..t).next_back();
        let next = self.usable.range((std::ops::Bound::Excluded(t), std::ops::Bound::Unbounded)).next();
        match (prev, next) {
            (Some((&d1, &v1)), Some((&d2, &v2))) => {
                Some(v1 + (v2 - v1) * (t - d1) as f64 / (d2 - d1) as f64)
            }
            (Some((_, &v1)), None) => Some(v1), // hold-last
            (None, Some((_, &v2))) => Some(v2), // hold-first
            (None, None) => None,
        }
    }
}

/// The Aligner's output: a dense matrix of values over the union timeline
/// (spec §3). Column order matches the `source_vars` slice passed to
/// [`align`], duplicates and all.
#[derive(Clone, Debug)]
pub struct AlignedFrame {
    timestamps: Vec<Timestamp>,
    columns: Vec<Vec<f64>>,
    stored: BTreeMap<VarId, BTreeSet<Timestamp>>,
}

impl AlignedFrame {
    /// The sorted union of timestamps across all source variables.
    pub fn timestamps(&self) -> &[Timestamp] {
        &self.timestamps
    }

    /// The per-column projection for the `col`-th source variable passed to
    /// [`align`] (0-based), as `(timestamp, value)` pairs.
    pub fn column(&self, col: usize) -> Vec<(Timestamp, f64)> {
        self.timestamps.iter().copied().zip(self.columns[col].iter().copied()).collect()
    }

    /// Whether `var_id` had a real (non-interpolated) stored sample at `t`
    /// in the unqualified set — used by the qualification sweep (spec §4.4
    /// step 7: "Interpolated-only timestamps are not marked").
    pub fn has_stored_sample(&self, var_id: VarId, t: Timestamp) -> bool {
        self.stored.get(&var_id).is_some_and(|ts| ts.contains(&t))
    }

    /// Number of distinct aligned timestamps.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Whether the frame has no rows at all.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Build the aligned frame for `source_vars` from already-loaded unqualified
/// history (spec §4.2).
///
/// The aligner is purely in-memory and CPU-bound (spec §5); the one bulk
/// `Gateway::load_unqualified` call per distinct variable happens in the
/// [`crate::orchestrator`] before this function is invoked, and its results
/// are passed in via `loaded`.
///
/// `source_vars` may contain duplicates; each entry gets its own column so
/// later code can address columns positionally, even though `loaded` only
/// holds one entry per distinct variable.
pub fn align(
    loaded: &BTreeMap<VarId, Vec<(Timestamp, Value)>>,
    source_vars: &[VarId],
) -> Result<AlignedFrame, AlignError> {
    // Build every variable's timeline first, including ones with zero rows.
    // Whether an empty timeline is actually an error depends on the *union*
    // across every variable, computed below — not on any one variable in
    // isolation.
    let mut timelines: BTreeMap<VarId, VarTimeline> = BTreeMap::new();
    for &v in source_vars {
        if timelines.contains_key(&v) {
            continue;
        }
        let mut all_timestamps = BTreeSet::new();
        let mut usable = BTreeMap::new();
        if let Some(rows) = loaded.get(&v) {
            for &(t, val) in rows {
                all_timestamps.insert(t);
                if let Some(v) = val {
                    usable.insert(t, v);
                }
            }
        }
        timelines.insert(v, VarTimeline { all_timestamps, usable });
    }

    let mut union: BTreeSet<Timestamp> = BTreeSet::new();
    for tl in timelines.values() {
        union.extend(tl.all_timestamps.iter().copied());
    }

    // Every source variable is starved at once: there is nothing to align
    // against and nothing any of them needs to supply. This is the ordinary
    // shape of re-running a rule whose entire source history was already
    // qualified by the previous execution, not an error.
    if union.is_empty() {
        let stored: BTreeMap<VarId, BTreeSet<Timestamp>> =
            timelines.into_iter().map(|(v, tl)| (v, tl.all_timestamps)).collect();
        return Ok(AlignedFrame {
            timestamps: Vec::new(),
            columns: vec![Vec::new(); source_vars.len()],
            stored,
        });
    }

    let timestamps: Vec<Timestamp> = union.into_iter().collect();

    let mut columns = Vec::with_capacity(source_vars.len());
    for &v in source_vars {
        let tl = &timelines[&v];
        let mut col = Vec::with_capacity(timestamps.len());
        for &t in &timestamps {
            col.push(tl.resolve(t).ok_or(AlignError::NoSourceData(v))?);
        }
        columns.push(col);
    }

    let stored: BTreeMap<VarId, BTreeSet<Timestamp>> =
        timelines.into_iter().map(|(v, tl)| (v, tl.all_timestamps)).collect();

    Ok(AlignedFrame { timestamps, columns, stored })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Gateway, InMemoryGateway};
    use crate::series::Qualification::Unqualified;

    fn load(gw: &mut InMemoryGateway, vars: &[VarId]) -> BTreeMap<VarId, Vec<(Timestamp, Value)>> {
        vars.iter().map(|&v| (v, gw.load_unqualified(v).unwrap())).collect()
    }

    #[test]
    fn interpolation_scenario_from_spec() {
        // spec §8 scenario 1
        let mut gw = InMemoryGateway::new();
        gw.seed(1, 10 * 3600, Some(100.0), Unqualified); // 10:00
        gw.seed(1, 10 * 3600 + 20 * 60, Some(120.0), Unqualified); // 10:20
        gw.seed(2, 10 * 3600 + 10 * 60, Some(50.0), Unqualified); // 10:10

        let loaded = load(&mut gw, &[1, 2]);
        let frame = align(&loaded, &[1, 2]).unwrap();
        assert_eq!(frame.timestamps().len(), 3);

        let v1 = frame.column(0);
        let v2 = frame.column(1);
        let at = |col: &[(Timestamp, f64)], t: Timestamp| col.iter().find(|(ts, _)| *ts == t).unwrap().1;

        let t0 = 10 * 3600;
        let t10 = 10 * 3600 + 10 * 60;
        let t20 = 10 * 3600 + 20 * 60;

        assert!((at(&v1, t10) - 110.0).abs() < 1e-9);
        assert!((at(&v2, t0) - 50.0).abs() < 1e-9); // hold-first
        assert!((at(&v2, t20) - 50.0).abs() < 1e-9); // hold-last
    }

    #[test]
    fn no_source_data_is_reported_with_variable_id() {
        let mut gw = InMemoryGateway::new();
        gw.seed(1, 100, Some(1.0), Unqualified);
        let loaded = load(&mut gw, &[1, 9]);
        let err = align(&loaded, &[1, 9]).unwrap_err();
        assert!(matches!(err, AlignError::NoSourceData(9)));
    }

    #[test]
    fn duplicate_source_vars_get_their_own_column() {
        let mut gw = InMemoryGateway::new();
        gw.seed(1, 100, Some(1.0), Unqualified);
        let loaded = load(&mut gw, &[1]);
        let frame = align(&loaded, &[1, 1]).unwrap();
        assert_eq!(frame.column(0), frame.column(1));
    }

    #[test]
    fn all_source_variables_starved_at_once_yields_empty_frame_not_error() {
        // The shape a rule is in immediately after a successful execution
        // qualified every sample it read: every source variable has zero
        // unqualified rows simultaneously. Nothing needs aligning and
        // nothing is missing, so this is `Ok`, not `NoSourceData`.
        let mut gw = InMemoryGateway::new();
        gw.seed(1, 100, Some(1.0), crate::series::Qualification::Qualified);
        gw.seed(2, 100, Some(2.0), crate::series::Qualification::Qualified);
        let loaded = load(&mut gw, &[1, 2]);
        let frame = align(&loaded, &[1, 2]).unwrap();
        assert!(frame.is_empty());
        assert_eq!(frame.column(0), Vec::<(Timestamp, f64)>::new());
        assert_eq!(frame.column(1), Vec::<(Timestamp, f64)>::new());
    }

    #[test]
    fn null_stored_sample_is_treated_as_absent() {
        let mut gw = InMemoryGateway::new();
        gw.seed(1, 100, None, Unqualified);
        gw.seed(1, 200, Some(4.0), Unqualified);
        let loaded = load(&mut gw, &[1]);
        let frame = align(&loaded, &[1]).unwrap();
        // t=100 has no usable value; only neighbor is at t=200 (hold-first).
        assert_eq!(frame.column(0), vec![(100, 4.0), (200, 4.0)]);
    }
}
