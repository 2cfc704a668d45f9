//! Displacement-aware values passed to block functions.
//!
//! Every input of a block function is a [`Value`]. Reading it at an offset
//! (`x.at(-1)`) and doing arithmetic on it behave according to the variant the
//! caller bound:
//! - `Steady` / `SteadyVector`: steady-state constants, offsets are ignored.
//! - `Path`: a time path that shifts, padding with its steady state.
//! - `Probe`: records every offset it is read at.
//! - `Bump`: a steady-state scalar perturbed at exactly one offset.
//! - `Derived`: the result of arithmetic on a probe or bump. It can only be
//!   read at offset zero, since the offsets of its inputs are no longer known.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::{Add, Div, Index, Mul, Neg, Sub};
use std::rc::Rc;

use crate::error::ValueError;
use crate::traits::Displaceable;

/// A plain number or numeric sequence: what steady-state solvers supply and
/// what block evaluations return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Primitive {
    Scalar(f64),
    Vector(DVector<f64>),
}

impl Primitive {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Primitive::Scalar(x) => Some(*x),
            Primitive::Vector(_) => None,
        }
    }

    pub fn as_vector(&self) -> Option<&DVector<f64>> {
        match self {
            Primitive::Scalar(_) => None,
            Primitive::Vector(v) => Some(v),
        }
    }

    /// Element-wise `op`, broadcasting scalars against vectors.
    ///
    /// Vector operands must share a length. Block evaluation checks this with
    /// [`ensure_common_length`](crate::differentiation::ensure_common_length)
    /// before any arithmetic runs.
    pub fn binary(op: BinaryOp, lhs: &Primitive, rhs: &Primitive) -> Primitive {
        match (lhs, rhs) {
            (Primitive::Scalar(a), Primitive::Scalar(b)) => Primitive::Scalar(op.apply(*a, *b)),
            (Primitive::Vector(v), other) => Primitive::Vector(vector_binary(op, v, other, false)),
            (other, Primitive::Vector(v)) => Primitive::Vector(vector_binary(op, v, other, true)),
        }
    }

    pub fn unary(&self, op: UnaryOp) -> Primitive {
        match self {
            Primitive::Scalar(x) => Primitive::Scalar(op.apply(*x)),
            Primitive::Vector(v) => Primitive::Vector(v.map(|x| op.apply(x))),
        }
    }
}

impl From<f64> for Primitive {
    fn from(x: f64) -> Self {
        Primitive::Scalar(x)
    }
}

impl From<DVector<f64>> for Primitive {
    fn from(v: DVector<f64>) -> Self {
        Primitive::Vector(v)
    }
}

impl From<Vec<f64>> for Primitive {
    fn from(v: Vec<f64>) -> Self {
        Primitive::Vector(DVector::from_vec(v))
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Primitive::Scalar(x) => write!(f, "{x}"),
            Primitive::Vector(v) => write!(f, "{:?}", v.as_slice()),
        }
    }
}

/// `vector op other`, or `other op vector` when `flipped`.
fn vector_binary(op: BinaryOp, v: &DVector<f64>, other: &Primitive, flipped: bool) -> DVector<f64> {
    let apply = |x: f64, y: f64| if flipped { op.apply(y, x) } else { op.apply(x, y) };
    match other {
        Primitive::Scalar(y) => v.map(|x| apply(x, *y)),
        Primitive::Vector(w) => v.zip_map(w, apply),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Pow => a.powf(b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Exp,
    Ln,
}

impl UnaryOp {
    pub fn apply(self, a: f64) -> f64 {
        match self {
            UnaryOp::Neg => -a,
            UnaryOp::Exp => a.exp(),
            UnaryOp::Ln => a.ln(),
        }
    }
}

/// Set of offsets collected during one discovery pass.
///
/// Clones share the same set; create a fresh recorder for every pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OffsetRecorder(Rc<RefCell<BTreeSet<i32>>>);

impl OffsetRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, offset: i32) {
        self.0.borrow_mut().insert(offset);
    }

    pub fn offsets(&self) -> BTreeSet<i32> {
        self.0.borrow().clone()
    }
}

/// Steady-state scalar that reports each offset it is read at.
#[derive(Debug, Clone, PartialEq)]
pub struct OffsetProbe {
    pub value: f64,
    recorder: OffsetRecorder,
}

impl OffsetProbe {
    pub fn new(value: f64, recorder: OffsetRecorder) -> Self {
        Self { value, recorder }
    }
}

impl Displaceable for OffsetProbe {
    fn at(&self, offset: i32) -> Result<Value, ValueError> {
        self.recorder.record(offset);
        Ok(Value::Probe(self.clone()))
    }
}

/// Steady-state scalar `base` shifted by `step` at offset `target` only.
///
/// When `target` is zero the shift is already part of the bump's own value,
/// so plain reads of the current period need no lookup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bump {
    base: f64,
    step: f64,
    target: i32,
}

impl Bump {
    pub fn new(base: f64, step: f64, target: i32) -> Self {
        Self { base, step, target }
    }

    /// Value seen when the bump is used without an explicit offset.
    pub fn value(&self) -> f64 {
        if self.target == 0 {
            self.base + self.step
        } else {
            self.base
        }
    }
}

impl Displaceable for Bump {
    fn at(&self, offset: i32) -> Result<Value, ValueError> {
        Ok(match (self.target == 0, offset == self.target) {
            (true, true) => Value::Bump(*self),
            (true, false) => Value::Steady(self.base),
            (false, true) => Value::Steady(self.base + self.step),
            (false, false) => Value::Bump(*self),
        })
    }
}

/// Time path of a variable together with its steady state.
#[derive(Debug, Clone, PartialEq)]
pub struct TimePath {
    pub values: DVector<f64>,
    pub steady_state: Option<Primitive>,
    pub name: String,
}

impl TimePath {
    pub fn new(
        values: DVector<f64>,
        steady_state: Option<Primitive>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            values,
            steady_state,
            name: name.into(),
        }
    }

    fn combine(&self, op: BinaryOp, other: &Value, flipped: bool) -> TimePath {
        let values = vector_binary(op, &self.values, &other.primitive(), flipped);
        let steady_state = match (&self.steady_state, other.steady_state()) {
            (Some(own), Some(theirs)) => Some(if flipped {
                Primitive::binary(op, &theirs, own)
            } else {
                Primitive::binary(op, own, &theirs)
            }),
            _ => None,
        };
        TimePath {
            values,
            steady_state,
            name: self.name.clone(),
        }
    }
}

impl Displaceable for TimePath {
    fn at(&self, offset: i32) -> Result<Value, ValueError> {
        if offset == 0 {
            return Ok(Value::Path(self.clone()));
        }
        let steady = self
            .steady_state
            .as_ref()
            .ok_or_else(|| ValueError::MissingSteadyState {
                name: self.name.clone(),
                offset,
            })?;

        let len = self.values.len();
        let mut shifted = match steady {
            Primitive::Scalar(x) => DVector::from_element(len, *x),
            Primitive::Vector(v) if v.len() == len => v.clone(),
            Primitive::Vector(v) => {
                return Err(ValueError::ShapeMismatch {
                    name: self.name.clone(),
                    expected: len,
                    got: v.len(),
                })
            }
        };

        let k = offset.unsigned_abs() as usize;
        if k < len {
            let kept = len - k;
            if offset > 0 {
                shifted.rows_mut(0, kept).copy_from(&self.values.rows(k, kept));
            } else {
                shifted.rows_mut(k, kept).copy_from(&self.values.rows(0, kept));
            }
        }

        Ok(Value::Path(TimePath {
            values: shifted,
            steady_state: self.steady_state.clone(),
            name: self.name.clone(),
        }))
    }
}

/// Displacement-aware value bound to a block input.
///
/// Binary arithmetic promotes to the more informative operand:
///
/// | lhs \ rhs        | scalar-like  | `SteadyVector` | `Path` |
/// |------------------|--------------|----------------|--------|
/// | scalar-like      | `Steady`     | `SteadyVector` | `Path` |
/// | `SteadyVector`   | `SteadyVector` | `SteadyVector` | `Path` |
/// | `Path`           | `Path`       | `Path`         | `Path` |
///
/// Scalar-like means `Steady`, `Probe`, `Bump` or `Derived`. When either
/// operand is a probe, a bump or already derived from one, the result is
/// `Derived` instead of `Steady` (or `SteadyVector`), so a later offset read
/// fails rather than silently reading the current period. The steady state
/// of a resulting `Path` is the same operation applied to the operands'
/// steady states (a non-path operand is its own steady state).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Steady(f64),
    SteadyVector(DVector<f64>),
    Path(TimePath),
    Probe(OffsetProbe),
    Bump(Bump),
    Derived(Primitive),
}

impl Value {
    /// Wraps a steady-state primitive so that offsets are ignored.
    pub fn steady(p: Primitive) -> Value {
        match p {
            Primitive::Scalar(x) => Value::Steady(x),
            Primitive::Vector(v) => Value::SteadyVector(v),
        }
    }

    /// Plain numeric content, dropping any displacement behaviour.
    pub fn primitive(&self) -> Primitive {
        match self {
            Value::Steady(x) => Primitive::Scalar(*x),
            Value::SteadyVector(v) => Primitive::Vector(v.clone()),
            Value::Path(p) => Primitive::Vector(p.values.clone()),
            Value::Probe(p) => Primitive::Scalar(p.value),
            Value::Bump(b) => Primitive::Scalar(b.value()),
            Value::Derived(p) => p.clone(),
        }
    }

    pub fn into_primitive(self) -> Primitive {
        match self {
            Value::SteadyVector(v) => Primitive::Vector(v),
            Value::Path(p) => Primitive::Vector(p.values),
            Value::Derived(p) => p,
            other => other.primitive(),
        }
    }

    /// Steady state of this operand, if known.
    pub fn steady_state(&self) -> Option<Primitive> {
        match self {
            Value::Path(p) => p.steady_state.clone(),
            other => Some(other.primitive()),
        }
    }

    /// Length of the vector carried by this value, if any.
    pub fn vector_len(&self) -> Option<usize> {
        match self {
            Value::SteadyVector(v) => Some(v.len()),
            Value::Path(p) => Some(p.values.len()),
            Value::Derived(p) => p.as_vector().map(|v| v.len()),
            _ => None,
        }
    }

    // Probes, bumps and anything computed from them.
    fn is_displaced(&self) -> bool {
        matches!(self, Value::Probe(_) | Value::Bump(_) | Value::Derived(_))
    }

    fn settle(p: Primitive, displaced: bool) -> Value {
        if displaced {
            Value::Derived(p)
        } else {
            Value::steady(p)
        }
    }

    pub fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Value {
        match (lhs, rhs) {
            (Value::Path(p), other) => Value::Path(p.combine(op, other, false)),
            (other, Value::Path(p)) => Value::Path(p.combine(op, other, true)),
            _ => Value::settle(
                Primitive::binary(op, &lhs.primitive(), &rhs.primitive()),
                lhs.is_displaced() || rhs.is_displaced(),
            ),
        }
    }

    pub fn unary(&self, op: UnaryOp) -> Value {
        match self {
            Value::Path(p) => Value::Path(TimePath {
                values: p.values.map(|x| op.apply(x)),
                steady_state: p.steady_state.as_ref().map(|s| s.unary(op)),
                name: p.name.clone(),
            }),
            other => Value::settle(other.primitive().unary(op), other.is_displaced()),
        }
    }

    pub fn pow(&self, exponent: &Value) -> Value {
        Value::binary(BinaryOp::Pow, self, exponent)
    }

    pub fn powf(&self, exponent: f64) -> Value {
        Value::binary(BinaryOp::Pow, self, &Value::Steady(exponent))
    }

    pub fn exp(&self) -> Value {
        self.unary(UnaryOp::Exp)
    }

    pub fn ln(&self) -> Value {
        self.unary(UnaryOp::Ln)
    }
}

impl Displaceable for Value {
    fn at(&self, offset: i32) -> Result<Value, ValueError> {
        match self {
            Value::Steady(_) | Value::SteadyVector(_) => Ok(self.clone()),
            Value::Path(p) => p.at(offset),
            Value::Probe(p) => p.at(offset),
            Value::Bump(b) => b.at(offset),
            Value::Derived(_) if offset == 0 => Ok(self.clone()),
            Value::Derived(_) => Err(ValueError::DisplacedExpression { offset }),
        }
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Steady(x)
    }
}

impl From<Primitive> for Value {
    fn from(p: Primitive) -> Self {
        Value::steady(p)
    }
}

macro_rules! impl_value_binary {
    ($trait:ident, $method:ident, $op:expr) => {
        impl $trait<&Value> for &Value {
            type Output = Value;
            fn $method(self, rhs: &Value) -> Value {
                Value::binary($op, self, rhs)
            }
        }

        impl $trait<Value> for Value {
            type Output = Value;
            fn $method(self, rhs: Value) -> Value {
                Value::binary($op, &self, &rhs)
            }
        }

        impl $trait<&Value> for Value {
            type Output = Value;
            fn $method(self, rhs: &Value) -> Value {
                Value::binary($op, &self, rhs)
            }
        }

        impl $trait<Value> for &Value {
            type Output = Value;
            fn $method(self, rhs: Value) -> Value {
                Value::binary($op, self, &rhs)
            }
        }

        impl $trait<f64> for Value {
            type Output = Value;
            fn $method(self, rhs: f64) -> Value {
                Value::binary($op, &self, &Value::Steady(rhs))
            }
        }

        impl $trait<f64> for &Value {
            type Output = Value;
            fn $method(self, rhs: f64) -> Value {
                Value::binary($op, self, &Value::Steady(rhs))
            }
        }

        impl $trait<Value> for f64 {
            type Output = Value;
            fn $method(self, rhs: Value) -> Value {
                Value::binary($op, &Value::Steady(self), &rhs)
            }
        }

        impl $trait<&Value> for f64 {
            type Output = Value;
            fn $method(self, rhs: &Value) -> Value {
                Value::binary($op, &Value::Steady(self), rhs)
            }
        }
    };
}

impl_value_binary!(Add, add, BinaryOp::Add);
impl_value_binary!(Sub, sub, BinaryOp::Sub);
impl_value_binary!(Mul, mul, BinaryOp::Mul);
impl_value_binary!(Div, div, BinaryOp::Div);

impl Neg for Value {
    type Output = Value;
    fn neg(self) -> Value {
        self.unary(UnaryOp::Neg)
    }
}

impl Neg for &Value {
    type Output = Value;
    fn neg(self) -> Value {
        self.unary(UnaryOp::Neg)
    }
}

/// Named inputs handed to a block function.
#[derive(Debug, Clone, Default)]
pub struct Args {
    values: BTreeMap<String, Value>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Like indexing, but an unbound name is an error instead of a panic.
    pub fn require(&self, name: &str) -> Result<&Value, ValueError> {
        self.values.get(name).ok_or_else(|| ValueError::Unbound {
            name: name.to_string(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

impl FromIterator<(String, Value)> for Args {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// # Panics
/// Panics when `name` is not bound, like `BTreeMap` indexing. Block facades
/// bind every declared input; use [`Args::require`] to read anything else.
impl Index<&str> for Args {
    type Output = Value;
    fn index(&self, name: &str) -> &Value {
        match self.values.get(name) {
            Some(value) => value,
            None => panic!("input '{name}' is not bound"),
        }
    }
}
