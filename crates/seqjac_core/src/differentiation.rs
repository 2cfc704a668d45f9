//! Jacobians of block functions by symmetric finite differences.
//!
//! For every differentiated input `k`:
//! 1. Discovery: bind `k` to an [`OffsetProbe`] and every other input to its
//!    steady state, evaluate once, and collect the offsets `k` was read at
//!    (offset zero is always included).
//! 2. Perturbation: for each offset `i`, evaluate with `k(i)` bumped up and
//!    down by `step`; every output that changes gets the coefficient
//!    `(up - down) / (2 step)` on diagonal `i`.
//!
//! Outputs that are bitwise identical under both bumps get no entry, which is
//! how structural zeros are detected.

use anyhow::{bail, Context, Result};
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::ValueError;
use crate::jacobian::Jacobian;
use crate::sparse::SparseOperator;
use crate::traits::BlockFunction;
use crate::values::{Args, Bump, OffsetProbe, OffsetRecorder, Primitive, Value};

pub const DEFAULT_STEP: f64 = 1e-5;

/// Options for [`jacobian`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JacobianSettings {
    /// Radius of the symmetric difference.
    pub step: f64,
    /// Inputs to differentiate with respect to; all declared inputs if unset.
    #[serde(default)]
    pub shocks: Option<Vec<String>>,
}

impl Default for JacobianSettings {
    fn default() -> Self {
        Self {
            step: DEFAULT_STEP,
            shocks: None,
        }
    }
}

impl JacobianSettings {
    pub fn with_shocks<I, S>(mut self, shocks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.shocks = Some(shocks.into_iter().map(Into::into).collect());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.step.is_finite() && self.step > 0.0) {
            bail!("step must be positive and finite, got {}.", self.step);
        }
        Ok(())
    }
}

/// Binds every declared input of `block` to its steady-state value.
pub fn steady_state_args<B>(block: &B, ss: &BTreeMap<String, Primitive>) -> Result<Args>
where
    B: BlockFunction + ?Sized,
{
    let args = block
        .inputs()
        .iter()
        .map(|name| match ss.get(name) {
            Some(value) => Ok((name.clone(), Value::steady(value.clone()))),
            None => bail!("Missing steady-state value for input '{}'.", name),
        })
        .collect::<Result<Args>>()?;
    ensure_common_length(block, &args)?;
    Ok(args)
}

/// Checks that every vector bound in `args` has one length, including the
/// steady states attached to time paths.
pub fn ensure_common_length<B>(block: &B, args: &Args) -> Result<()>
where
    B: BlockFunction + ?Sized,
{
    let mut first: Option<(&str, usize)> = None;
    for (name, value) in args.iter() {
        let path_ss = match value {
            Value::Path(p) => p.steady_state.as_ref().and_then(Primitive::as_vector),
            _ => None,
        };
        let lengths = [value.vector_len(), path_ss.map(|v| v.len())];
        for len in lengths.into_iter().flatten() {
            match first {
                None => first = Some((name, len)),
                Some((seen, expected)) if expected != len => bail!(
                    "Input '{}' has length {}, but '{}' has length {} in block '{}'.",
                    name,
                    len,
                    seen,
                    expected,
                    block.name()
                ),
                Some(_) => {}
            }
        }
    }
    Ok(())
}

/// Evaluates the block, checking it returns one value per declared output.
pub fn evaluate<B>(block: &B, args: &Args) -> Result<Vec<Value>>
where
    B: BlockFunction + ?Sized,
{
    let values = block
        .evaluate(args)
        .with_context(|| format!("Failed to evaluate block '{}'.", block.name()))?;
    if values.len() != block.outputs().len() {
        bail!(
            "Block '{}' returned {} values for {} declared outputs.",
            block.name(),
            values.len(),
            block.outputs().len()
        );
    }
    Ok(values)
}

/// Offsets at which `input` is read, always including zero.
pub fn discover_offsets<B>(block: &B, base: &Args, input: &str, ss: f64) -> Result<BTreeSet<i32>>
where
    B: BlockFunction + ?Sized,
{
    let recorder = OffsetRecorder::new();
    let mut args = base.clone();
    args.insert(input, Value::Probe(OffsetProbe::new(ss, recorder.clone())));
    evaluate(block, &args)
        .with_context(|| format!("Offset discovery for input '{}' failed.", input))?;

    let mut offsets = recorder.offsets();
    offsets.insert(0);
    debug!("{}: input {} read at offsets {:?}", block.name(), input, offsets);
    Ok(offsets)
}

/// Derivatives of every output with respect to `input`, as `output -> offset -> coefficient`.
pub fn differentiate_input<B>(
    block: &B,
    base: &Args,
    input: &str,
    ss: f64,
    step: f64,
) -> Result<BTreeMap<String, BTreeMap<i32, f64>>>
where
    B: BlockFunction + ?Sized,
{
    let offsets = discover_offsets(block, base, input, ss)?;
    let mut derivatives: BTreeMap<String, BTreeMap<i32, f64>> = BTreeMap::new();
    let mut args = base.clone();

    for offset in offsets {
        trace!("{}: bumping {}({}) by ±{}", block.name(), input, offset, step);
        args.insert(input, Value::Bump(Bump::new(ss, step, offset)));
        let up = evaluate(block, &args)?;
        args.insert(input, Value::Bump(Bump::new(ss, -step, offset)));
        let down = evaluate(block, &args)?;

        for ((y_up, y_down), output) in up.into_iter().zip(down).zip(block.outputs()) {
            let (y_up, y_down) = (y_up.into_primitive(), y_down.into_primitive());
            if y_up == y_down {
                continue;
            }
            let (Some(a), Some(b)) = (y_up.as_scalar(), y_down.as_scalar()) else {
                return Err(ValueError::NotScalar {
                    name: output.clone(),
                })
                .with_context(|| {
                    format!("Cannot differentiate output '{}' of '{}'.", output, block.name())
                });
            };
            let coefficient = (a - b) / (2.0 * step);
            trace!("{}: d{}/d{}({}) = {}", block.name(), output, input, offset, coefficient);
            derivatives
                .entry(output.clone())
                .or_default()
                .insert(offset, coefficient);
        }
    }
    Ok(derivatives)
}

/// Sparse Jacobian of `block` around the steady state `ss`.
pub fn jacobian<B>(
    block: &B,
    ss: &BTreeMap<String, Primitive>,
    settings: &JacobianSettings,
) -> Result<Jacobian>
where
    B: BlockFunction + ?Sized,
{
    settings.validate()?;
    let shocks = match &settings.shocks {
        Some(shocks) => shocks.clone(),
        None => block.inputs().to_vec(),
    };
    for shock in &shocks {
        if !block.inputs().contains(shock) {
            bail!("'{}' is not an input of block '{}'.", shock, block.name());
        }
    }

    let base = steady_state_args(block, ss)?;
    let mut jac = Jacobian::new(block.outputs().iter().cloned());

    for shock in &shocks {
        let ss_value = match ss.get(shock).and_then(Primitive::as_scalar) {
            Some(x) => x,
            None => {
                return Err(ValueError::NotScalar {
                    name: shock.clone(),
                })
                .context("Only scalar steady-state inputs can be differentiated.")
            }
        };
        let derivatives = differentiate_input(block, &base, shock, ss_value, settings.step)
            .with_context(|| format!("Failed to differentiate with respect to '{}'.", shock))?;
        for (output, diagonals) in derivatives {
            jac.insert(&output, shock, SparseOperator::from_simple_diagonals(diagonals));
        }
    }
    Ok(jac)
}
