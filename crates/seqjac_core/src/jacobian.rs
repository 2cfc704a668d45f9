use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::sparse::SparseOperator;

/// Nested Jacobian `J[output][input]`.
///
/// A missing `(output, input)` entry is an exact structural zero: the output
/// does not depend on that input at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Jacobian<J = SparseOperator> {
    entries: BTreeMap<String, BTreeMap<String, J>>,
}

impl<J> Jacobian<J> {
    /// Empty Jacobian with a (structurally zero) row for every output.
    pub fn new<I, S>(outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: outputs
                .into_iter()
                .map(|o| (o.into(), BTreeMap::new()))
                .collect(),
        }
    }

    pub fn insert(&mut self, output: &str, input: &str, entry: J) {
        self.entries
            .entry(output.to_string())
            .or_default()
            .insert(input.to_string(), entry);
    }

    pub fn get(&self, output: &str, input: &str) -> Option<&J> {
        self.entries.get(output)?.get(input)
    }

    /// All non-zero entries of one output, keyed by input.
    pub fn output(&self, output: &str) -> Option<&BTreeMap<String, J>> {
        self.entries.get(output)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn is_structural_zero(&self, output: &str, input: &str) -> bool {
        self.get(output, input).is_none()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &J)> {
        self.entries.iter().flat_map(|(o, row)| {
            row.iter()
                .map(move |(i, entry)| (o.as_str(), i.as_str(), entry))
        })
    }
}

impl Jacobian<SparseOperator> {
    /// Dense `T x T` version of every entry.
    pub fn materialize(&self, horizon: usize) -> Jacobian<DMatrix<f64>> {
        Jacobian {
            entries: self
                .entries
                .iter()
                .map(|(o, row)| {
                    let dense = row
                        .iter()
                        .map(|(i, op)| (i.clone(), op.matrix(horizon)))
                        .collect();
                    (o.clone(), dense)
                })
                .collect(),
        }
    }
}
