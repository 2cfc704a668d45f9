use nalgebra::{DMatrix, DVector};
use num_traits::{One, Zero};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};
use std::sync::OnceLock;

use crate::asymptotic::AsymptoticSignature;
use crate::basis::BasisKey;
use crate::error::OperatorError;

/// Coefficients smaller than this are dropped when two entries are folded.
pub const SPARSITY_TOLERANCE: f64 = 1e-14;

/// Sparse linear operator: a linear combination of basis shift operators.
///
/// The Jacobian of a simple block only uses keys `(i, 0)`; general missing
/// counts appear once operators are composed with each other.
#[derive(Serialize, Deserialize)]
#[serde(into = "Vec<OperatorEntry>", from = "Vec<OperatorEntry>")]
pub struct SparseOperator {
    elements: BTreeMap<BasisKey, f64>,
    // Flat key/coefficient arrays for the dense hot path, built on first use.
    flat: OnceLock<(Vec<BasisKey>, Vec<f64>)>,
}

/// Serialized form of one operator entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OperatorEntry {
    pub offset: i32,
    pub missing: u32,
    pub coefficient: f64,
}

impl SparseOperator {
    pub fn new(elements: BTreeMap<BasisKey, f64>) -> Self {
        Self {
            elements,
            flat: OnceLock::new(),
        }
    }

    /// Builds `(i, 0) -> x` from a map of offsets `i -> x`, as produced by
    /// differentiating a simple block.
    pub fn from_simple_diagonals<I>(diagonals: I) -> Self
    where
        I: IntoIterator<Item = (i32, f64)>,
    {
        Self::new(
            diagonals
                .into_iter()
                .map(|(offset, x)| (BasisKey::new(offset, 0), x))
                .collect(),
        )
    }

    pub fn identity() -> Self {
        Self::new(BTreeMap::from([(BasisKey::IDENTITY, 1.0)]))
    }

    pub fn elements(&self) -> &BTreeMap<BasisKey, f64> {
        &self.elements
    }

    pub fn get(&self, key: BasisKey) -> Option<f64> {
        self.elements.get(&key).copied()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    fn flat(&self) -> (&[BasisKey], &[f64]) {
        let (keys, xs) = self
            .flat
            .get_or_init(|| self.elements.iter().map(|(k, x)| (*k, *x)).unzip());
        (keys.as_slice(), xs.as_slice())
    }

    /// Transpose: `(i, m) -> (-i, m)`.
    pub fn transpose(&self) -> Self {
        Self::new(
            self.elements
                .iter()
                .map(|(k, x)| (BasisKey::new(-k.offset, k.missing), *x))
                .collect(),
        )
    }

    pub fn scale(&self, a: f64) -> Self {
        Self::new(self.elements.iter().map(|(k, x)| (*k, a * x)).collect())
    }

    /// Operator product `self ∘ rhs`, using the closed-form rule on every
    /// pair of basis keys.
    pub fn compose(&self, rhs: &SparseOperator) -> Self {
        let mut elements = BTreeMap::new();
        for (a, x) in &self.elements {
            for (b, y) in &rhs.elements {
                *elements.entry(a.compose(*b)).or_insert(0.0) += x * y;
            }
        }
        Self::new(elements)
    }

    /// Applies the operator to a dense square matrix from the left.
    pub fn apply_matrix(&self, a: &DMatrix<f64>) -> Result<DMatrix<f64>, OperatorError> {
        ensure_square(a)?;
        let (rows, cols) = a.shape();
        let mut out = DMatrix::zeros(rows, cols);
        self.shift_accumulate(a.as_slice(), out.as_mut_slice(), rows, cols);
        Ok(out)
    }

    /// Applies the operator to a time path.
    pub fn apply_vector(&self, v: &DVector<f64>) -> DVector<f64> {
        let mut out = DVector::zeros(v.len());
        self.shift_accumulate(v.as_slice(), out.as_mut_slice(), v.len(), 1);
        out
    }

    /// Dense product `a ∘ self`, computed as `(selfᵀ ∘ aᵀ)ᵀ`.
    pub fn left_apply_matrix(&self, a: &DMatrix<f64>) -> Result<DMatrix<f64>, OperatorError> {
        Ok(self.transpose().apply_matrix(&a.transpose())?.transpose())
    }

    /// Column-major kernel: for key `(i, m)`, row `t` of the output gains
    /// `x * src[t + i]` for `t` in `[m, T - i)` (i >= 0) or `[m - i, T)` (i < 0).
    fn shift_accumulate(&self, src: &[f64], dst: &mut [f64], rows: usize, cols: usize) {
        let (keys, xs) = self.flat();
        let t_len = rows as i64;
        for (key, &x) in keys.iter().zip(xs) {
            let i = i64::from(key.offset);
            let m = i64::from(key.missing);
            let (start, stop) = if i >= 0 { (m, t_len - i) } else { (m - i, t_len) };
            if start >= stop {
                continue;
            }
            let len = (stop - start) as usize;
            let start = start as usize;
            let read = (start as i64 + i) as usize;
            for col in 0..cols {
                let base = col * rows;
                let out = &mut dst[base + start..base + start + len];
                let input = &src[base + read..base + read + len];
                for (o, v) in out.iter_mut().zip(input) {
                    *o += x * v;
                }
            }
        }
    }

    /// Adds the operator's first `T` rows and columns to a square matrix.
    pub fn add_matrix(&self, a: &DMatrix<f64>) -> Result<DMatrix<f64>, OperatorError> {
        ensure_square(a)?;
        let t = a.nrows();
        // Row-major copy so each diagonal is a strided run of the flat array.
        let mut flat = a.transpose().as_slice().to_vec();
        self.add_diagonals(&mut flat, t);
        Ok(DMatrix::from_row_slice(t, t, &flat))
    }

    /// Dense `T x T` matrix of the operator.
    pub fn matrix(&self, t: usize) -> DMatrix<f64> {
        let mut flat = vec![0.0; t * t];
        self.add_diagonals(&mut flat, t);
        DMatrix::from_row_slice(t, t, &flat)
    }

    fn add_diagonals(&self, flat: &mut [f64], t: usize) {
        let t = t as i64;
        for (key, &x) in &self.elements {
            let i = i64::from(key.offset);
            let m = i64::from(key.missing);
            let (start, stop) = if i < 0 {
                (t * (-i) + (t + 1) * m, t * t)
            } else {
                // Diagonals at or beyond T have no cells.
                (i + (t + 1) * m, ((t - i) * t).max(0))
            };
            let mut idx = start;
            while idx < stop {
                flat[idx as usize] += x;
                idx += t + 1;
            }
        }
    }

    /// Translation-invariant kernel of the operator, for long-horizon
    /// approximations.
    ///
    /// Only defined when every diagonal is untruncated (`missing == 0`);
    /// truncated keys are rejected rather than silently folded.
    pub fn asymptotic_time_invariant(&self) -> Result<AsymptoticSignature, OperatorError> {
        if let Some(key) = self.elements.keys().find(|k| k.missing != 0) {
            return Err(OperatorError::TruncatedDiagonal {
                offset: key.offset,
                missing: key.missing,
            });
        }
        let tau = self
            .elements
            .keys()
            .map(|k| k.offset.unsigned_abs() as usize)
            .max()
            .unwrap_or(0)
            + 1;
        let mut v = vec![0.0; 2 * tau - 1];
        for (key, &x) in &self.elements {
            // Asymptotic column: offset i sits at position tau - 1 - i.
            let pos = (tau as i64 - 1 - i64::from(key.offset)) as usize;
            v[pos] = x;
        }
        Ok(AsymptoticSignature::from_kernel(v))
    }
}

fn ensure_square(a: &DMatrix<f64>) -> Result<(), OperatorError> {
    let (rows, cols) = a.shape();
    if rows != cols {
        return Err(OperatorError::NonSquare { rows, cols });
    }
    Ok(())
}

impl Clone for SparseOperator {
    fn clone(&self) -> Self {
        Self::new(self.elements.clone())
    }
}

impl PartialEq for SparseOperator {
    fn eq(&self, other: &Self) -> bool {
        self.elements == other.elements
    }
}

impl fmt::Debug for SparseOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.elements.iter()).finish()
    }
}

impl fmt::Display for SparseOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SparseOperator({{")?;
        for (idx, (key, x)) in self.elements.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{key}: {x:.3}")?;
        }
        write!(f, "}})")
    }
}

impl From<SparseOperator> for Vec<OperatorEntry> {
    fn from(op: SparseOperator) -> Self {
        op.elements
            .into_iter()
            .map(|(key, coefficient)| OperatorEntry {
                offset: key.offset,
                missing: key.missing,
                coefficient,
            })
            .collect()
    }
}

impl From<Vec<OperatorEntry>> for SparseOperator {
    fn from(entries: Vec<OperatorEntry>) -> Self {
        let mut elements = BTreeMap::new();
        for e in entries {
            *elements
                .entry(BasisKey::new(e.offset, e.missing))
                .or_insert(0.0) += e.coefficient;
        }
        Self::new(elements)
    }
}

/// Sum of two operators. Overlapping keys whose coefficients cancel to
/// below [`SPARSITY_TOLERANCE`] are removed.
impl Add<&SparseOperator> for &SparseOperator {
    type Output = SparseOperator;
    fn add(self, rhs: &SparseOperator) -> SparseOperator {
        let mut elements = self.elements.clone();
        for (key, x) in &rhs.elements {
            match elements.get_mut(key) {
                Some(existing) => {
                    *existing += x;
                    if existing.abs() < SPARSITY_TOLERANCE {
                        elements.remove(key);
                    }
                }
                None => {
                    elements.insert(*key, *x);
                }
            }
        }
        SparseOperator::new(elements)
    }
}

impl Add for SparseOperator {
    type Output = SparseOperator;
    fn add(self, rhs: SparseOperator) -> SparseOperator {
        &self + &rhs
    }
}

impl Sub for SparseOperator {
    type Output = SparseOperator;
    fn sub(self, rhs: SparseOperator) -> SparseOperator {
        &self + &-rhs
    }
}

impl Sub<&SparseOperator> for &SparseOperator {
    type Output = SparseOperator;
    fn sub(self, rhs: &SparseOperator) -> SparseOperator {
        self + &-rhs
    }
}

impl Neg for SparseOperator {
    type Output = SparseOperator;
    fn neg(self) -> SparseOperator {
        self.scale(-1.0)
    }
}

impl Neg for &SparseOperator {
    type Output = SparseOperator;
    fn neg(self) -> SparseOperator {
        self.scale(-1.0)
    }
}

/// `a * b` composes the operators.
impl Mul for SparseOperator {
    type Output = SparseOperator;
    fn mul(self, rhs: SparseOperator) -> SparseOperator {
        self.compose(&rhs)
    }
}

impl Mul<&SparseOperator> for &SparseOperator {
    type Output = SparseOperator;
    fn mul(self, rhs: &SparseOperator) -> SparseOperator {
        self.compose(rhs)
    }
}

impl Mul<f64> for SparseOperator {
    type Output = SparseOperator;
    fn mul(self, a: f64) -> SparseOperator {
        self.scale(a)
    }
}

impl Mul<SparseOperator> for f64 {
    type Output = SparseOperator;
    fn mul(self, op: SparseOperator) -> SparseOperator {
        op.scale(self)
    }
}

impl Zero for SparseOperator {
    fn zero() -> Self {
        Self::new(BTreeMap::new())
    }
    fn is_zero(&self) -> bool {
        self.elements.is_empty()
    }
}

impl One for SparseOperator {
    fn one() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(entries: &[((i32, u32), f64)]) -> SparseOperator {
        SparseOperator::new(entries.iter().map(|(k, x)| (BasisKey::from(*k), *x)).collect())
    }

    fn sample_operators() -> Vec<SparseOperator> {
        vec![
            SparseOperator::from_simple_diagonals([(0, 2.0), (1, -1.0)]),
            SparseOperator::from_simple_diagonals([(-1, 0.5), (2, 3.0)]),
            op(&[((0, 1), 1.5), ((-2, 0), -0.25), ((1, 2), 4.0)]),
            op(&[((-1, 1), 1.0), ((3, 0), 0.75)]),
        ]
    }

    fn assert_matrix_close(a: &DMatrix<f64>, b: &DMatrix<f64>) {
        assert_eq!(a.shape(), b.shape());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-12, "{a} != {b}");
        }
    }

    #[test]
    fn simple_diagonals_materialize_to_bidiagonal_matrix() {
        let s = SparseOperator::from_simple_diagonals([(0, 2.0), (1, -1.0)]);
        let expected = DMatrix::from_row_slice(
            4,
            4,
            &[
                2.0, -1.0, 0.0, 0.0, //
                0.0, 2.0, -1.0, 0.0, //
                0.0, 0.0, 2.0, -1.0, //
                0.0, 0.0, 0.0, 2.0,
            ],
        );
        assert_eq!(s.matrix(4), expected);
    }

    #[test]
    fn matrix_skips_missing_leading_entries() {
        let s = op(&[((-1, 1), 1.0), ((0, 2), 3.0)]);
        let expected = DMatrix::from_row_slice(
            4,
            4,
            &[
                0.0, 0.0, 0.0, 0.0, //
                0.0, 0.0, 0.0, 0.0, //
                0.0, 1.0, 3.0, 0.0, //
                0.0, 0.0, 1.0, 3.0,
            ],
        );
        assert_eq!(s.matrix(4), expected);
    }

    #[test]
    fn matrix_ignores_diagonals_outside_horizon() {
        let s = SparseOperator::from_simple_diagonals([(4, 1.0), (-5, 1.0), (0, 1.0)]);
        assert_eq!(s.matrix(3), DMatrix::identity(3, 3));
    }

    #[test]
    fn add_matrix_rejects_non_square() {
        let s = SparseOperator::identity();
        let err = s.add_matrix(&DMatrix::zeros(2, 3)).expect_err("expected shape error");
        assert_eq!(err, OperatorError::NonSquare { rows: 2, cols: 3 });
    }

    #[test]
    fn add_matrix_keeps_base_entries() {
        let s = SparseOperator::from_simple_diagonals([(-1, 2.0)]);
        let base = DMatrix::from_element(3, 3, 1.0);
        let sum = s.add_matrix(&base).expect("square matrix");
        let expected = DMatrix::from_row_slice(
            3,
            3,
            &[
                1.0, 1.0, 1.0, //
                3.0, 1.0, 1.0, //
                1.0, 3.0, 1.0,
            ],
        );
        assert_eq!(sum, expected);
    }

    #[test]
    fn dense_and_sparse_vector_paths_agree() {
        for t in [1usize, 3, 6, 11] {
            let v = DVector::from_fn(t, |r, _| 0.5 + r as f64 * 1.25 - (r * r) as f64 * 0.1);
            for s in sample_operators() {
                let dense = s.matrix(t) * &v;
                let sparse = s.apply_vector(&v);
                for (x, y) in dense.iter().zip(sparse.iter()) {
                    assert!((x - y).abs() < 1e-12, "T={t} {s}");
                }
            }
        }
    }

    #[test]
    fn apply_matrix_matches_dense_product() {
        let t = 7;
        let a = DMatrix::from_fn(t, t, |r, c| (r as f64 - 2.0 * c as f64).sin());
        for s in sample_operators() {
            let sparse = s.apply_matrix(&a).expect("square matrix");
            assert_matrix_close(&sparse, &(s.matrix(t) * &a));
            let left = s.left_apply_matrix(&a).expect("square matrix");
            assert_matrix_close(&left, &(&a * s.matrix(t)));
        }
    }

    #[test]
    fn apply_matrix_rejects_non_square() {
        let s = SparseOperator::identity();
        let err = s.apply_matrix(&DMatrix::zeros(4, 2)).expect_err("expected shape error");
        assert!(format!("{err}").contains("must be square"));
    }

    #[test]
    fn compose_matches_dense_product_away_from_the_end() {
        // Top-left blocks of the infinite matrices agree once the horizon
        // leaves room for every lead.
        let t = 6;
        let big = t + 8;
        let ops = sample_operators();
        for a in &ops {
            for b in &ops {
                let product = (a * b).matrix(big);
                let dense = a.matrix(big) * b.matrix(big);
                assert_matrix_close(
                    &product.view((0, 0), (t, t)).into_owned(),
                    &dense.view((0, 0), (t, t)).into_owned(),
                );
            }
        }
    }

    #[test]
    fn compose_is_associative_on_operators() {
        let ops = sample_operators();
        for a in &ops {
            for b in &ops {
                for c in &ops {
                    let left = (a * b).compose(c);
                    let right = a.compose(&(b * c));
                    assert_eq!(left.elements().len(), right.elements().len());
                    for (key, x) in left.elements() {
                        let y = right.get(*key).expect("same keys");
                        assert!((x - y).abs() < 1e-12);
                    }
                }
            }
        }
    }

    #[test]
    fn identity_composition_is_neutral() {
        let id = SparseOperator::one();
        for s in sample_operators() {
            assert_eq!(&id * &s, s);
            assert_eq!(&s * &id, s);
        }
    }

    #[test]
    fn add_is_commutative_and_drops_cancelled_entries() {
        let a = op(&[((0, 0), 1.0), ((1, 0), 2.0)]);
        let b = op(&[((0, 0), -1.0), ((-1, 0), 0.5)]);
        assert_eq!(&a + &b, &b + &a);
        assert_eq!(&a + &b, op(&[((1, 0), 2.0), ((-1, 0), 0.5)]));

        let tiny = op(&[((0, 0), 1e-15)]);
        let x = 0.25;
        let sum = &tiny + &op(&[((0, 0), -1e-15 + x)]);
        assert_eq!(sum.len(), 1);
        assert!((sum.get(BasisKey::IDENTITY).expect("entry") - x).abs() < 1e-15);

        let cancelled = &tiny + &op(&[((0, 0), -1e-15)]);
        assert!(cancelled.is_zero());
    }

    #[test]
    fn sub_and_neg_flip_coefficients() {
        let a = SparseOperator::from_simple_diagonals([(0, 1.0), (2, 3.0)]);
        assert!((&a - &a).is_empty());
        assert_eq!(-a.clone(), a.scale(-1.0));
        assert_eq!(2.0 * a.clone(), a.clone() * 2.0);
        assert_eq!((-a).get(BasisKey::new(2, 0)), Some(-3.0));
    }

    #[test]
    fn transpose_flips_offsets() {
        let s = op(&[((2, 1), 1.0), ((-1, 0), 4.0)]);
        assert_eq!(s.transpose(), op(&[((-2, 1), 1.0), ((1, 0), 4.0)]));
        assert_eq!(s.transpose().matrix(5), s.matrix(5).transpose());
    }

    #[test]
    fn equality_is_exact() {
        let a = SparseOperator::from_simple_diagonals([(0, 1.0)]);
        let b = SparseOperator::from_simple_diagonals([(0, 1.0 + 1e-16 * 4.0)]);
        assert_ne!(a, b);
        // The cached flat view does not take part in equality.
        let _ = a.apply_vector(&DVector::from_element(3, 1.0));
        assert_eq!(a, a.clone());
    }

    #[test]
    fn asymptotic_signature_places_offsets_as_columns() {
        let s = SparseOperator::from_simple_diagonals([(-1, 0.5), (0, 2.0), (2, -1.0)]);
        let sig = s.asymptotic_time_invariant().expect("untruncated operator");
        assert_eq!(sig.tau(), 3);
        assert_eq!(sig.values(), &[-1.0, 0.0, 2.0, 0.5, 0.0]);
    }

    #[test]
    fn asymptotic_signature_rejects_truncated_keys() {
        let s = op(&[((0, 0), 1.0), ((1, 2), 1.0)]);
        let err = s.asymptotic_time_invariant().expect_err("truncated operator");
        assert_eq!(err, OperatorError::TruncatedDiagonal { offset: 1, missing: 2 });
    }

    #[test]
    fn display_lists_entries() {
        let s = SparseOperator::from_simple_diagonals([(0, 2.0), (-1, 0.5)]);
        assert_eq!(format!("{s}"), "SparseOperator({(-1, 0): 0.500, (0, 0): 2.000})");
    }

    #[test]
    fn serializes_as_entry_list() {
        let s = op(&[((0, 0), 2.0), ((-1, 1), 0.5)]);
        let json = serde_json::to_string(&s).expect("serialize");
        assert!(json.contains("\"missing\":1"));
        let back: SparseOperator = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, s);
    }
}
