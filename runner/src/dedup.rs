use crate::record::FlatRecord;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;

/// conventional relative tolerance for numeric closeness
pub const DEFAULT_REL_TOL: f64 = 1e-9;

/// `|a-b| <= max(rel_tol * max(|a|,|b|), abs_tol)`
pub fn is_close(a: f64, b: f64, abs_tol: f64) -> bool {
    (a - b).abs() <= f64::max(DEFAULT_REL_TOL * f64::max(a.abs(), b.abs()), abs_tol)
}

fn as_number(value: &Value) -> Option<f64> {
    value.as_f64()
}

/// A term compared for strict equality between two flattened records.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, rename_all = "lowercase")]
pub enum ExactTerm {
    /// a raw field
    Field(String),
    /// the difference `hi - lo` of two raw fields, computed before comparison
    Diff { name: String, hi: String, lo: String },
}

impl ExactTerm {
    fn value(&self, row: &FlatRecord) -> Option<Value> {
        match self {
            Self::Field(name) => row.get(name).cloned(),
            Self::Diff { hi, lo, .. } => {
                let hi = as_number(row.get(hi)?)?;
                let lo = as_number(row.get(lo)?)?;

                Some(Value::from(hi - lo))
            }
        }
    }
}

/// Decides whether a candidate job is equivalent to an already-recorded one.
///
/// A candidate is a duplicate iff some existing record matches on every exact
/// term and, for every tolerance term present in both rows, the values are
/// within the configured absolute tolerance (or the relative default).
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct CompareSpec {
    #[serde(default)]
    pub exact: Vec<ExactTerm>,
    /// tolerance term -> absolute tolerance
    #[serde(default)]
    pub tolerance: BTreeMap<String, f64>,
}

impl CompareSpec {
    /// symmetric, deterministic equivalence of two flattened records
    pub fn matches(&self, a: &FlatRecord, b: &FlatRecord) -> bool {
        for term in &self.exact {
            if term.value(a) != term.value(b) {
                return false;
            }
        }

        for (term, abs_tol) in &self.tolerance {
            let left = a.get(term).and_then(as_number);
            let right = b.get(term).and_then(as_number);

            // a term missing on either side imposes no constraint
            if let (Some(left), Some(right)) = (left, right) {
                if !is_close(left, right, *abs_tol) {
                    return false;
                }
            }
        }

        true
    }

    /// indices of the candidates with no matching existing record
    pub fn filter_new(&self, existing: &[FlatRecord], candidates: &[FlatRecord]) -> Vec<usize> {
        candidates
            .iter()
            .enumerate()
            .filter(|(_, candidate)| !existing.iter().any(|record| self.matches(record, candidate)))
            .map(|(index, _)| index)
            .collect()
    }
}
