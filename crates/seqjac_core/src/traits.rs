use anyhow::Result;

use crate::error::ValueError;
use crate::values::{Args, Value};

/// A value that can be read at an integer time offset.
///
/// Positive offsets read the future, negative offsets the past: `x.at(-1)` is
/// last period's `x`.
pub trait Displaceable {
    fn at(&self, offset: i32) -> Result<Value, ValueError>;
}

/// A function from named inputs to an ordered list of named outputs.
pub trait BlockFunction {
    /// Name used in log lines and error context.
    fn name(&self) -> &str;

    /// Declared input names, in call order.
    fn inputs(&self) -> &[String];

    /// Declared output names. `evaluate` returns values in this order.
    fn outputs(&self) -> &[String];

    /// Evaluates the block once with every input bound in `args`.
    fn evaluate(&self, args: &Args) -> Result<Vec<Value>>;
}
