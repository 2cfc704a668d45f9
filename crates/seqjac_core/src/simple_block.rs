use anyhow::{bail, Result};
use log::debug;
use nalgebra::DMatrix;
use std::collections::BTreeMap;
use std::fmt;

use crate::differentiation::{self, JacobianSettings};
use crate::jacobian::Jacobian;
use crate::traits::BlockFunction;
use crate::values::{Args, Primitive, TimePath, Value};

type BlockFn = dyn Fn(&Args) -> Result<Vec<Value>> + Send + Sync;

/// A block defined by a plain function of named, time-indexed inputs.
///
/// Every declared input is bound before the function runs, so `x["K"]` is
/// safe for declared names. [`Args::require`] is the fallible lookup.
/// Offsets must be applied to inputs before combining them: `x["K"].at(-1)?`
/// works everywhere, while shifting an expression built from inputs fails
/// when the block is differentiated.
///
/// ```
/// use seqjac_core::{Displaceable, SimpleBlock};
///
/// // Y = Z * K(-1)^alpha * L^(1 - alpha)
/// let production = SimpleBlock::new("production", &["Z", "K", "L", "alpha"], &["Y"], |x| {
///     let alpha = x.require("alpha")?;
///     let capital = x.require("K")?.at(-1)?.pow(alpha);
///     let labor = x.require("L")?.pow(&(1.0 - alpha));
///     Ok(vec![x.require("Z")? * capital * labor])
/// });
/// assert_eq!(production.inputs().len(), 4);
/// ```
pub struct SimpleBlock {
    name: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    f: Box<BlockFn>,
}

impl SimpleBlock {
    pub fn new<F>(name: impl Into<String>, inputs: &[&str], outputs: &[&str], f: F) -> Self
    where
        F: Fn(&Args) -> Result<Vec<Value>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            f: Box::new(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    fn named_outputs(&self, values: Vec<Value>) -> BTreeMap<String, Primitive> {
        self.outputs
            .iter()
            .cloned()
            .zip(values.into_iter().map(Value::into_primitive))
            .collect()
    }

    /// Evaluates the block at a steady state, where every offset reads the
    /// same value.
    pub fn ss(&self, ss: &BTreeMap<String, Primitive>) -> Result<BTreeMap<String, Primitive>> {
        debug!("{}: steady-state evaluation", self.name);
        let args = differentiation::steady_state_args(self, ss)?;
        let values = differentiation::evaluate(self, &args)?;
        Ok(self.named_outputs(values))
    }

    /// Evaluates the block along time paths.
    ///
    /// Inputs listed in `paths` are shifted when read at an offset, padding
    /// with their entry in `ss`; every other input stays at its steady state.
    pub fn td(
        &self,
        ss: &BTreeMap<String, Primitive>,
        paths: &BTreeMap<String, Primitive>,
    ) -> Result<BTreeMap<String, Primitive>> {
        debug!("{}: time-path evaluation of {} inputs", self.name, paths.len());
        let mut args = Args::new();
        for (name, path) in paths {
            if !self.inputs.contains(name) {
                bail!("'{}' is not an input of block '{}'.", name, self.name);
            }
            let values = match path {
                Primitive::Vector(v) => v.clone(),
                Primitive::Scalar(x) => {
                    bail!("Input {}={} is scalar, should be a time path.", name, x)
                }
            };
            args.insert(
                name.clone(),
                Value::Path(TimePath::new(values, ss.get(name).cloned(), name.clone())),
            );
        }
        for name in &self.inputs {
            if args.get(name).is_some() {
                continue;
            }
            match ss.get(name) {
                Some(value) => args.insert(name.clone(), Value::steady(value.clone())),
                None => bail!("Missing steady-state value for input '{}'.", name),
            }
        }
        differentiation::ensure_common_length(self, &args)?;
        let values = differentiation::evaluate(self, &args)?;
        Ok(self.named_outputs(values))
    }

    /// Sparse Jacobian around the steady state `ss`.
    pub fn jac(
        &self,
        ss: &BTreeMap<String, Primitive>,
        settings: &JacobianSettings,
    ) -> Result<Jacobian> {
        debug!("{}: jacobian with step {}", self.name, settings.step);
        differentiation::jacobian(self, ss, settings)
    }

    /// Jacobian with every entry materialized as a `horizon x horizon` matrix.
    pub fn jac_dense(
        &self,
        ss: &BTreeMap<String, Primitive>,
        horizon: usize,
        settings: &JacobianSettings,
    ) -> Result<Jacobian<DMatrix<f64>>> {
        Ok(self.jac(ss, settings)?.materialize(horizon))
    }
}

impl BlockFunction for SimpleBlock {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> &[String] {
        &self.inputs
    }

    fn outputs(&self) -> &[String] {
        &self.outputs
    }

    fn evaluate(&self, args: &Args) -> Result<Vec<Value>> {
        (self.f)(args)
    }
}

impl fmt::Debug for SimpleBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<SimpleBlock '{}'>", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basis::BasisKey;
    use crate::traits::Displaceable;
    use nalgebra::DVector;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err:#}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    fn production() -> SimpleBlock {
        SimpleBlock::new("production", &["Z", "K", "L", "alpha"], &["Y"], |x| {
            let capital = x["K"].at(-1)?.pow(&x["alpha"]);
            let labor = x["L"].pow(&(1.0 - &x["alpha"]));
            Ok(vec![&x["Z"] * capital * labor])
        })
    }

    fn production_ss() -> BTreeMap<String, Primitive> {
        [("Z", 1.0), ("K", 8.0), ("L", 1.0), ("alpha", 1.0 / 3.0)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), Primitive::Scalar(v)))
            .collect()
    }

    fn firm() -> SimpleBlock {
        SimpleBlock::new("firm", &["K", "Y", "delta"], &["r", "I"], |x| {
            let r = &x["Y"] / x["K"].at(-1)? - &x["delta"];
            let investment = &x["K"] - (1.0 - &x["delta"]) * x["K"].at(-1)?;
            Ok(vec![r, investment])
        })
    }

    #[test]
    fn ss_returns_plain_outputs() {
        let out = production().ss(&production_ss()).expect("steady state");
        let y = out["Y"].as_scalar().expect("scalar output");
        assert!((y - 2.0).abs() < 1e-12);
    }

    #[test]
    fn ss_broadcasts_vector_inputs() {
        let block = SimpleBlock::new("scale", &["a", "w"], &["y"], |x| {
            Ok(vec![&x["a"] * x["w"].at(-1)?])
        });
        let mut ss = BTreeMap::new();
        ss.insert("a".to_string(), Primitive::Scalar(2.0));
        ss.insert("w".to_string(), Primitive::from(vec![1.0, 2.0]));
        let out = block.ss(&ss).expect("steady state");
        assert_eq!(out["y"], Primitive::from(vec![2.0, 4.0]));
    }

    #[test]
    fn td_shifts_paths_and_keeps_other_inputs_steady() {
        let mut ss = BTreeMap::new();
        ss.insert("K".to_string(), Primitive::Scalar(10.0));
        ss.insert("Y".to_string(), Primitive::Scalar(1.0));
        ss.insert("delta".to_string(), Primitive::Scalar(0.1));
        let mut paths = BTreeMap::new();
        paths.insert("K".to_string(), Primitive::from(vec![11.0, 12.0, 10.0]));

        let out = firm().td(&ss, &paths).expect("time path");
        let investment = out["I"].as_vector().expect("path output");
        let expected =
            DVector::from_vec(vec![11.0 - 0.9 * 10.0, 12.0 - 0.9 * 11.0, 10.0 - 0.9 * 12.0]);
        for (a, b) in investment.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
        let r = out["r"].as_vector().expect("path output");
        assert!((r[0] - (1.0 / 10.0 - 0.1)).abs() < 1e-12);
        assert!((r[1] - (1.0 / 11.0 - 0.1)).abs() < 1e-12);
    }

    #[test]
    fn td_rejects_bad_paths() {
        let block = firm();
        let mut ss = BTreeMap::new();
        ss.insert("Y".to_string(), Primitive::Scalar(1.0));
        ss.insert("delta".to_string(), Primitive::Scalar(0.1));

        let mut paths = BTreeMap::new();
        paths.insert("K".to_string(), Primitive::Scalar(3.0));
        assert_err_contains(block.td(&ss, &paths), "is scalar, should be a time path");

        let mut paths = BTreeMap::new();
        paths.insert("Q".to_string(), Primitive::from(vec![1.0]));
        assert_err_contains(block.td(&ss, &paths), "'Q' is not an input");

        let mut paths = BTreeMap::new();
        paths.insert("K".to_string(), Primitive::from(vec![1.0, 2.0]));
        assert_err_contains(block.td(&ss, &paths), "steady-state K not given");
    }

    #[test_log::test]
    fn jac_of_production_matches_analytic_derivatives() {
        let ss = production_ss();
        let jac = production().jac(&ss, &JacobianSettings::default()).expect("jacobian");

        let alpha: f64 = 1.0 / 3.0;
        let y = 2.0;
        let dk = jac.get("Y", "K").expect("dY/dK");
        assert_eq!(dk.len(), 1);
        let lag = dk.get(BasisKey::new(-1, 0)).expect("K(-1) entry");
        assert!((lag - alpha * y / 8.0).abs() < 1e-7);

        let dz = jac.get("Y", "Z").expect("dY/dZ");
        assert!((dz.get(BasisKey::IDENTITY).expect("Z entry") - y).abs() < 1e-7);
        let dl = jac.get("Y", "L").expect("dY/dL");
        assert!((dl.get(BasisKey::IDENTITY).expect("L entry") - (1.0 - alpha) * y).abs() < 1e-7);
    }

    #[test]
    fn jac_dense_materializes_at_horizon() {
        let mut ss = BTreeMap::new();
        ss.insert("K".to_string(), Primitive::Scalar(10.0));
        ss.insert("Y".to_string(), Primitive::Scalar(1.0));
        ss.insert("delta".to_string(), Primitive::Scalar(0.1));
        let settings = JacobianSettings::default().with_shocks(["K"]);
        let dense = firm().jac_dense(&ss, 4, &settings).expect("dense jacobian");

        let di = dense.get("I", "K").expect("dI/dK");
        assert_eq!(di.shape(), (4, 4));
        for t in 0..4 {
            assert!((di[(t, t)] - 1.0).abs() < 1e-8);
        }
        for t in 1..4 {
            assert!((di[(t, t - 1)] + 0.9).abs() < 1e-8);
        }
        assert_eq!(di[(0, 1)], 0.0);
        assert!(dense.get("r", "Y").is_none());
    }

    #[test]
    fn td_rejects_paths_of_different_lengths() {
        let block = SimpleBlock::new("sum", &["a", "b"], &["y"], |x| {
            Ok(vec![&x["a"] + &x["b"]])
        });
        let ss = BTreeMap::from([
            ("a".to_string(), Primitive::Scalar(1.0)),
            ("b".to_string(), Primitive::Scalar(1.0)),
        ]);
        let paths = BTreeMap::from([
            ("a".to_string(), Primitive::from(vec![1.0, 2.0, 3.0])),
            ("b".to_string(), Primitive::from(vec![1.0, 2.0])),
        ]);
        assert_err_contains(block.td(&ss, &paths), "'b' has length 2, but 'a' has length 3");

        let ss = BTreeMap::from([
            ("a".to_string(), Primitive::from(vec![1.0, 2.0])),
            ("b".to_string(), Primitive::from(vec![1.0])),
        ]);
        assert_err_contains(block.ss(&ss), "'b' has length 1, but 'a' has length 2");
    }

    #[test]
    fn shifted_expression_fails_in_jac_and_lags_in_td() {
        let block = SimpleBlock::new("lagged", &["a"], &["y"], |x| {
            Ok(vec![(&x["a"] * 2.0).at(-1)?])
        });
        let ss = BTreeMap::from([("a".to_string(), Primitive::Scalar(1.0))]);

        let paths = BTreeMap::from([("a".to_string(), Primitive::from(vec![5.0, 1.0, 1.0]))]);
        let out = block.td(&ss, &paths).expect("time path");
        assert_eq!(out["y"], Primitive::from(vec![2.0, 10.0, 2.0]));

        assert_err_contains(
            block.jac(&ss, &JacobianSettings::default()),
            "cannot read a combined expression",
        );
    }

    #[test]
    fn debug_names_block() {
        assert_eq!(format!("{:?}", production()), "<SimpleBlock 'production'>");
    }
}
