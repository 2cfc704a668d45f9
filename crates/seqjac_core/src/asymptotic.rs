//! Translation-invariant (Toeplitz) kernels of sparse operators.
//!
//! A signature of length `2τ - 1` stores the coefficient on offset `i` at
//! position `τ - 1 - i`, i.e. it describes an asymptotic column of the
//! operator. Signatures are only meaningful far from the start of the horizon,
//! where truncated diagonals no longer matter.

use nalgebra::DMatrix;
use num_complex::Complex;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};
use std::ops::{Add, Mul, Neg};

use crate::error::OperatorError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "Vec<f64>", try_from = "Vec<f64>")]
pub struct AsymptoticSignature {
    v: Vec<f64>,
}

impl TryFrom<Vec<f64>> for AsymptoticSignature {
    type Error = OperatorError;
    fn try_from(v: Vec<f64>) -> Result<Self, OperatorError> {
        Self::new(v)
    }
}

impl From<AsymptoticSignature> for Vec<f64> {
    fn from(sig: AsymptoticSignature) -> Self {
        sig.v
    }
}

impl AsymptoticSignature {
    /// Wraps a kernel of length `2τ - 1`. Any other length has no centre
    /// entry for offset zero and is rejected.
    pub fn new(v: Vec<f64>) -> Result<Self, OperatorError> {
        if v.len() % 2 == 0 {
            return Err(OperatorError::EvenKernel { len: v.len() });
        }
        Ok(Self { v })
    }

    // Callers guarantee an odd length.
    pub(crate) fn from_kernel(v: Vec<f64>) -> Self {
        debug_assert!(v.len() % 2 == 1);
        Self { v }
    }

    /// One more than the largest offset the kernel can hold.
    pub fn tau(&self) -> usize {
        (self.v.len() + 1) / 2
    }

    pub fn values(&self) -> &[f64] {
        &self.v
    }

    /// Coefficient on offset `i`; zero outside the stored range.
    pub fn get(&self, offset: i32) -> f64 {
        let pos = self.tau() as i64 - 1 - i64::from(offset);
        if pos < 0 {
            return 0.0;
        }
        self.v.get(pos as usize).copied().unwrap_or(0.0)
    }

    fn widened(&self, tau: usize) -> Vec<f64> {
        let pad = tau - self.tau();
        let mut out = vec![0.0; 2 * tau - 1];
        out[pad..pad + self.v.len()].copy_from_slice(&self.v);
        out
    }

    pub fn scale(&self, a: f64) -> Self {
        Self::from_kernel(self.v.iter().map(|x| a * x).collect())
    }

    /// Kernel of the composed operator `self ∘ rhs`: the convolution of both
    /// kernels, computed in the frequency domain.
    pub fn compose(&self, rhs: &AsymptoticSignature) -> Self {
        let out_len = self.v.len() + rhs.v.len() - 1;
        let n = out_len.next_power_of_two();

        let mut planner = FftPlanner::<f64>::new();
        let forward = planner.plan_fft_forward(n);
        let inverse = planner.plan_fft_inverse(n);

        let spectrum = |v: &[f64]| {
            let mut buf: Vec<Complex<f64>> = v.iter().map(|&x| Complex::new(x, 0.0)).collect();
            buf.resize(n, Complex::new(0.0, 0.0));
            forward.process(&mut buf);
            buf
        };

        let mut product = spectrum(self.v.as_slice());
        for (a, b) in product.iter_mut().zip(spectrum(rhs.v.as_slice())) {
            *a *= b;
        }
        inverse.process(&mut product);

        let scale = 1.0 / n as f64;
        Self::from_kernel(product[..out_len].iter().map(|c| c.re * scale).collect())
    }

    /// `T x T` Toeplitz matrix with entry `(r, c)` equal to the coefficient on
    /// offset `c - r`.
    pub fn toeplitz(&self, t: usize) -> DMatrix<f64> {
        DMatrix::from_fn(t, t, |r, c| self.get(c as i32 - r as i32))
    }
}

impl Add<&AsymptoticSignature> for &AsymptoticSignature {
    type Output = AsymptoticSignature;
    fn add(self, rhs: &AsymptoticSignature) -> AsymptoticSignature {
        let tau = self.tau().max(rhs.tau());
        let mut v = self.widened(tau);
        for (a, b) in v.iter_mut().zip(rhs.widened(tau)) {
            *a += b;
        }
        AsymptoticSignature::from_kernel(v)
    }
}

impl Neg for &AsymptoticSignature {
    type Output = AsymptoticSignature;
    fn neg(self) -> AsymptoticSignature {
        self.scale(-1.0)
    }
}

impl Mul<&AsymptoticSignature> for &AsymptoticSignature {
    type Output = AsymptoticSignature;
    fn mul(self, rhs: &AsymptoticSignature) -> AsymptoticSignature {
        self.compose(rhs)
    }
}
