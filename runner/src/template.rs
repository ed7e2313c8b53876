use crate::{
    database::{RecordFilter, Stores},
    prepare::PrepareError,
    record::JobStatus,
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// requested key that a builder resolves to the source record's own key
pub const PARENT_KEY_FIELD: &str = "parent";

/// A group of same-length value lists iterated in lockstep: index `i` of
/// every key in the group is combined together.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiGroup {
    pub keys: Vec<String>,
    pub columns: Vec<Vec<Value>>,
}

impl MultiGroup {
    pub fn new(keys: Vec<String>, columns: Vec<Vec<Value>>) -> Result<Self, PrepareError> {
        let group = Self { keys, columns };
        group.len()?;

        Ok(group)
    }

    /// lockstep length of the group
    pub fn len(&self) -> Result<usize, PrepareError> {
        if self.keys.len() != self.columns.len() {
            return Err(PrepareError::LockstepMismatch {
                keys: self.keys.clone(),
            });
        }

        let mut lengths = self.columns.iter().map(Vec::len);
        let length = lengths.next().unwrap_or(0);

        if lengths.all(|other| other == length) {
            Ok(length)
        } else {
            Err(PrepareError::LockstepMismatch {
                keys: self.keys.clone(),
            })
        }
    }
}

/// Declared parameter axes of one job style.
#[derive(Debug, Clone, Default)]
pub struct JobAxes {
    pub singular: BTreeMap<String, Value>,
    pub multi: Vec<MultiGroup>,
}

/// Expand axes into the full set of candidate parameter sets: the Cartesian
/// product is taken across groups while every key within a group follows the
/// selected index in lockstep. Groups of lengths `L1..Ln` yield `L1*..*Ln`
/// candidates.
pub fn expand(axes: &JobAxes) -> Result<Vec<BTreeMap<String, Value>>, PrepareError> {
    if axes.multi.is_empty() {
        return Ok(vec![axes.singular.clone()]);
    }

    let lengths = axes
        .multi
        .iter()
        .map(MultiGroup::len)
        .collect::<Result<Vec<_>, _>>()?;

    let mut candidates = Vec::with_capacity(lengths.iter().product());
    for selection in lengths.iter().map(|length| 0..*length).multi_cartesian_product() {
        let mut candidate = axes.singular.clone();

        for (group, index) in axes.multi.iter().zip(selection) {
            for (key, column) in group.keys.iter().zip(group.columns.iter()) {
                candidate.insert(key.clone(), column[index].clone());
            }
        }

        candidates.push(candidate);
    }

    Ok(candidates)
}

/// Reference to a registered combo builder, as declared in a style's axes.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct BuilderRef {
    /// Name of the selected builder, see `BuilderRegistry` for the selection proccess
    pub name: String,
    /// keys of the produced multi-key group
    pub keys: Vec<String>,
    /// style whose existing records the builder draws from
    #[serde(default)]
    pub source_style: Option<String>,
}

/// A combo builder derives a multi-key group from existing records instead of
/// hand-typed values. Builders are pure functions of store state at call time.
pub type ComboBuilder = fn(&Stores, &BuilderRef) -> Result<MultiGroup, PrepareError>;

pub struct BuilderRegistry {
    builders: BTreeMap<String, ComboBuilder>,
}

impl Default for BuilderRegistry {
    fn default() -> Self {
        let mut registry = Self {
            builders: BTreeMap::new(),
        };
        registry.register("finished-records", finished_records);

        registry
    }
}

impl BuilderRegistry {
    pub fn register(&mut self, name: impl Into<String>, builder: ComboBuilder) {
        self.builders.insert(name.into(), builder);
    }

    pub fn get(&self, name: &str) -> Option<&ComboBuilder> {
        self.builders.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }
}

/// Builtin builder: one group entry per distinct finished record of
/// `source_style`, pulling the requested keys out of each record's input.
/// The reserved key `parent` resolves to the source record's own key, which
/// lets styles chain onto upstream results.
pub fn finished_records(
    store: &Stores,
    reference: &BuilderRef,
) -> Result<MultiGroup, PrepareError> {
    let style = reference
        .source_style
        .as_deref()
        .ok_or_else(|| PrepareError::BuilderSource(reference.name.clone()))?;

    let mut columns = vec![Vec::new(); reference.keys.len()];
    let mut seen = BTreeSet::new();

    for record in store.get_records(style, &RecordFilter::default())? {
        if record.status != JobStatus::Finished {
            continue;
        }

        let mut row = Vec::with_capacity(reference.keys.len());
        for key in &reference.keys {
            let value = if key == PARENT_KEY_FIELD {
                Some(Value::String(record.key.clone()))
            } else {
                record.input.get(key).cloned()
            };

            match value {
                Some(value) => row.push(value),
                None => {
                    debug!(key = %key, record = %record.key, "Record lacks requested key, skipped");
                    row.clear();
                    break;
                }
            }
        }

        if row.is_empty() {
            continue;
        }

        // dedup whole tuples, records may repeat parameter sets
        if seen.insert(serde_yaml::to_string(&row)?) {
            for (column, value) in columns.iter_mut().zip(row) {
                column.push(value);
            }
        }
    }

    MultiGroup::new(reference.keys.clone(), columns)
}
