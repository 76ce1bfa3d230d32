//! Polynomial activations.
//!
//! A Chebyshev interpolant is fit once at construction and evaluated in the
//! monomial basis: `x^(2^i)` by repeated squaring, then each term `c_k x^k`
//! as a product of those powers with the coefficient folded into the lowest
//! one. Term plaintext scales are chosen from a dry run over the scale
//! bookkeeping so every term lands on the same canonical scale, which lets
//! them be summed without any correction.
//!
//! Inputs outside `[lo, hi]` are not checked; the interpolant diverges
//! quickly there.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::backend::HeBackend;
use crate::ciphertext::Ciphertext;
use crate::errors::{EngineError, EngineResult};
use crate::keys::EvaluationKeys;

use super::chebyshev;

// Relative to the largest coefficient.
const NEGLIGIBLE_COEFFICIENT: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivationKind {
    ReLU,
    SiLU,
    Sigmoid,
    Square,
    Identity,
}

impl ActivationKind {
    pub fn eval(self, x: f64) -> f64 {
        match self {
            Self::ReLU => x.max(0.0),
            Self::SiLU => x / (1.0 + (-x).exp()),
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Self::Square => x * x,
            Self::Identity => x,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Activation {
    kind: ActivationKind,
    lo: f64,
    hi: f64,
    degree: usize,
    coefficients: Vec<f64>,
}

impl Activation {
    pub fn new(kind: ActivationKind, lo: f64, hi: f64, degree: usize) -> EngineResult<Self> {
        if degree == 0 {
            return Err(EngineError::layout("activation degree must be at least 1"));
        }
        if !(lo.is_finite() && hi.is_finite() && lo < hi) {
            return Err(EngineError::layout(format!(
                "activation interval [{lo}, {hi}] is empty"
            )));
        }
        let chebyshev = chebyshev::fit(|x| kind.eval(x), lo, hi, degree);
        let coefficients = chebyshev::to_monomial(&chebyshev, lo, hi);
        Ok(Self {
            kind,
            lo,
            hi,
            degree,
            coefficients,
        })
    }

    pub fn kind(&self) -> ActivationKind {
        self.kind
    }

    pub fn interval(&self) -> (f64, f64) {
        (self.lo, self.hi)
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    /// Monomial coefficients `a_0 … a_degree`.
    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    /// `ceil(log2(degree + 1))`, except affine maps which are free.
    pub fn depth_cost(&self) -> usize {
        if self.degree <= 1 {
            0
        } else {
            (usize::BITS - self.degree.leading_zeros()) as usize
        }
    }

    /// Plaintext evaluation of the fitted polynomial.
    pub fn approximate(&self, x: f64) -> f64 {
        chebyshev::evaluate(&self.coefficients, x)
    }

    fn is_negligible(&self, c: f64) -> bool {
        let largest = self
            .coefficients
            .iter()
            .fold(0.0f64, |m, c| m.max(c.abs()));
        c.abs() <= NEGLIGIBLE_COEFFICIENT * largest.max(1.0)
    }

    pub(crate) fn apply<B: HeBackend>(
        &self,
        ciphertext: &Ciphertext<B>,
        backend: &B,
        keys: &EvaluationKeys<B>,
    ) -> EngineResult<Ciphertext<B>> {
        let x = ciphertext.inner();
        let result = if self.degree <= 1 {
            self.apply_affine(x, backend)?
        } else {
            self.apply_polynomial(x, backend, keys)?
        };
        Ok(Ciphertext::new(backend, result, *ciphertext.layout()))
    }

    /// `c_1·x + c_0` by reinterpreting the scale; consumes no level.
    fn apply_affine<B: HeBackend>(&self, x: &B::Ciphertext, backend: &B) -> EngineResult<B::Ciphertext> {
        let c0 = self.coefficients[0];
        let c1 = self.coefficients.get(1).copied().unwrap_or(0.0);
        let level = backend.level_of(x);
        let linear = if self.is_negligible(c1) {
            self.zero_like(x, level, backend)?
        } else {
            let scaled = backend.with_scale(x, backend.scale_of(x) / c1.abs());
            if c1 < 0.0 { backend.negate(&scaled) } else { scaled }
        };
        add_constant(&linear, c0, backend)
    }

    fn apply_polynomial<B: HeBackend>(
        &self,
        x: &B::Ciphertext,
        backend: &B,
        keys: &EvaluationKeys<B>,
    ) -> EngineResult<B::Ciphertext> {
        let start = backend.level_of(x);
        let target_level = start + self.depth_cost();
        let target_scale = backend.canonical_scale(target_level);
        let relin = keys.mult.key();

        // powers[i] = x^(2^i), at level start + i.
        let top = (usize::BITS - 1 - self.degree.leading_zeros()) as usize;
        let mut powers = Vec::with_capacity(top + 1);
        powers.push(x.clone());
        for i in 0..top {
            let squared = backend.multiply_cipher(&powers[i], &powers[i], relin)?;
            powers.push(backend.rescale(&squared)?);
        }

        let terms: Vec<(usize, f64)> = self
            .coefficients
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, c)| !self.is_negligible(**c))
            .map(|(k, &c)| (k, c))
            .collect();
        trace!(terms = terms.len(), start, target_level, "evaluating activation");

        let evaluated = terms
            .par_iter()
            .map(|&(k, c)| -> EngineResult<B::Ciphertext> {
                let term = evaluate_term(k, c, &powers, target_scale, backend, relin)?;
                Ok(backend.mod_drop(&term, target_level)?)
            })
            .collect::<EngineResult<Vec<_>>>()?;

        let mut iter = evaluated.into_iter();
        let sum = match iter.next() {
            Some(first) => iter.try_fold(first, |acc, t| backend.add(&acc, &t))?,
            None => {
                let zero = self.zero_like(x, target_level, backend)?;
                backend.with_scale(&zero, target_scale)
            }
        };
        add_constant(&sum, self.coefficients[0], backend)
    }

    fn zero_like<B: HeBackend>(
        &self,
        x: &B::Ciphertext,
        level: usize,
        backend: &B,
    ) -> EngineResult<B::Ciphertext> {
        let zero = backend.sub(x, x)?;
        Ok(backend.mod_drop(&zero, level)?)
    }
}

/// Bit positions of `k`, lowest first.
fn power_factors(k: usize) -> Vec<usize> {
    (0..usize::BITS as usize).filter(|i| k >> i & 1 == 1).collect()
}

/// `c·x^k` landing on `target_scale`.
fn evaluate_term<B: HeBackend>(
    k: usize,
    c: f64,
    powers: &[B::Ciphertext],
    target_scale: f64,
    backend: &B,
    relin: &B::RelinKey,
) -> EngineResult<B::Ciphertext> {
    let factors = power_factors(k);

    // Dry run: the final scale is `sigma · gain`.
    let mut level = backend.level_of(&powers[factors[0]]);
    let mut gain = backend.scale_of(&powers[factors[0]]) / backend.rescale_modulus(level)? as f64;
    level += 1;
    for &i in &factors[1..] {
        level = level.max(backend.level_of(&powers[i]));
        gain *= backend.scale_of(&powers[i]) / backend.rescale_modulus(level)? as f64;
        level += 1;
    }
    let sigma = target_scale / gain;

    let lowest = &powers[factors[0]];
    let batch = backend.batch_size();
    let constant = backend.encode(&vec![c; batch], sigma, backend.level_of(lowest))?;
    let mut acc = backend.rescale(&backend.multiply_plain(lowest, &constant)?)?;
    for &i in &factors[1..] {
        let mut factor = powers[i].clone();
        let level = backend.level_of(&acc).max(backend.level_of(&factor));
        acc = backend.mod_drop(&acc, level)?;
        factor = backend.mod_drop(&factor, level)?;
        acc = backend.rescale(&backend.multiply_cipher(&acc, &factor, relin)?)?;
    }
    Ok(acc)
}

fn add_constant<B: HeBackend>(
    ciphertext: &B::Ciphertext,
    c: f64,
    backend: &B,
) -> EngineResult<B::Ciphertext> {
    let plain = backend.encode(
        &vec![c; backend.batch_size()],
        backend.scale_of(ciphertext),
        backend.level_of(ciphertext),
    )?;
    Ok(backend.add_plain(ciphertext, &plain)?)
}
