//! Homomorphic operator set.
//!
//! [`Operator`] is a closed set of layers, each with a depth cost known before
//! any ciphertext is touched. Every `apply` first checks the budget and the
//! input layout, and never returns a partially evaluated ciphertext.

pub mod activation;
pub mod chebyshev;
pub mod conv;
pub mod gemm;

use std::collections::BTreeSet;

use rayon::prelude::*;

use crate::backend::HeBackend;
use crate::ciphertext::Ciphertext;
use crate::codec::{RotationTerm, SlotLayout};
use crate::errors::{EngineError, EngineResult};
use crate::keys::{EvaluationKeys, RotationKeySet};

pub use activation::{Activation, ActivationKind};
pub use conv::Conv2D;
pub use gemm::Gemm;

#[derive(Debug, Clone)]
pub enum Operator {
    Conv2D(Conv2D),
    Activation(Activation),
    Gemm(Gemm),
}

impl Operator {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Conv2D(_) => "conv2d",
            Self::Activation(_) => "activation",
            Self::Gemm(_) => "gemm",
        }
    }

    /// Levels consumed by one application.
    pub fn depth_cost(&self) -> usize {
        match self {
            Self::Conv2D(_) | Self::Gemm(_) => 1,
            Self::Activation(act) => act.depth_cost(),
        }
    }

    /// Layout the operator was packed against; `None` accepts any layout.
    pub fn input_layout(&self) -> Option<&SlotLayout> {
        match self {
            Self::Conv2D(conv) => Some(conv.input_layout()),
            Self::Gemm(gemm) => Some(gemm.input_layout()),
            Self::Activation(_) => None,
        }
    }

    pub fn output_layout(&self, input: &SlotLayout) -> SlotLayout {
        match self {
            Self::Conv2D(conv) => *conv.output_layout(),
            Self::Gemm(gemm) => *gemm.output_layout(),
            Self::Activation(_) => *input,
        }
    }

    /// Rotation offsets the operator needs keys for.
    pub fn required_rotations(&self) -> BTreeSet<i64> {
        match self {
            Self::Conv2D(conv) => conv.required_rotations().clone(),
            Self::Gemm(gemm) => gemm.required_rotations().clone(),
            Self::Activation(_) => BTreeSet::new(),
        }
    }

    pub fn apply<B: HeBackend>(
        &self,
        ciphertext: &Ciphertext<B>,
        backend: &B,
        keys: &EvaluationKeys<B>,
    ) -> EngineResult<Ciphertext<B>> {
        check_depth(backend, ciphertext.level(), self.depth_cost())?;
        if let Some(expected) = self.input_layout() {
            check_layout(expected, ciphertext.layout())?;
        }
        match self {
            Self::Conv2D(conv) => conv.apply(ciphertext, backend, keys),
            Self::Activation(act) => act.apply(ciphertext, backend, keys),
            Self::Gemm(gemm) => gemm.apply(ciphertext, backend, keys),
        }
    }
}

pub(crate) fn check_depth<B: HeBackend>(backend: &B, level: usize, cost: usize) -> EngineResult<()> {
    let budget = backend.max_level();
    if level + cost > budget {
        return Err(EngineError::DepthExhausted {
            level,
            cost,
            budget,
        });
    }
    Ok(())
}

pub(crate) fn check_layout(expected: &SlotLayout, actual: &SlotLayout) -> EngineResult<()> {
    if !expected.is_compatible(actual) {
        return Err(EngineError::layout(format!(
            "operator expects {expected:?}, ciphertext carries {actual:?}"
        )));
    }
    Ok(())
}

/// Scale a plaintext multiplicand needs so that the product, once rescaled,
/// sits exactly on the canonical scale of `level + 1`.
pub(crate) fn multiplicand_scale<B: HeBackend>(
    backend: &B,
    ciphertext_scale: f64,
    level: usize,
) -> EngineResult<f64> {
    let dropped = backend.rescale_modulus(level)? as f64;
    Ok(backend.canonical_scale(level + 1) * dropped / ciphertext_scale)
}

pub(crate) fn rotate_by<B: HeBackend>(
    backend: &B,
    ciphertext: &B::Ciphertext,
    offset: usize,
    rotations: &RotationKeySet<B>,
) -> EngineResult<B::Ciphertext> {
    if offset == 0 {
        return Ok(ciphertext.clone());
    }
    let key = rotations.get(offset as i64)?;
    Ok(backend.rotate(ciphertext, key)?)
}

/// `rescale(sum_t rot(ct, t.offset) * t.mask)`, then the optional bias.
///
/// Terms are evaluated in parallel; modular accumulation makes the sum
/// independent of completion order.
pub(crate) fn rotate_multiply_accumulate<B: HeBackend>(
    ciphertext: &Ciphertext<B>,
    terms: &[RotationTerm],
    bias: Option<&[f64]>,
    output_layout: SlotLayout,
    backend: &B,
    keys: &EvaluationKeys<B>,
) -> EngineResult<Ciphertext<B>> {
    let required: BTreeSet<i64> = terms
        .iter()
        .filter(|t| t.offset != 0)
        .map(|t| t.offset as i64)
        .collect();
    keys.rotations.ensure_covers(&required)?;

    let level = ciphertext.level();
    let input = ciphertext.inner();
    let weight_scale = multiplicand_scale(backend, backend.scale_of(input), level)?;

    let products = terms
        .par_iter()
        .map(|term| -> EngineResult<B::Ciphertext> {
            let rotated = rotate_by(backend, input, term.offset, &keys.rotations)?;
            let mask = backend.encode(&term.mask, weight_scale, level)?;
            Ok(backend.multiply_plain(&rotated, &mask)?)
        })
        .collect::<EngineResult<Vec<_>>>()?;

    let mut iter = products.into_iter();
    let first = iter
        .next()
        .ok_or_else(|| EngineError::layout("operator has no packed terms"))?;
    let sum = iter.try_fold(first, |acc, ct| backend.add(&acc, &ct))?;
    let mut result = backend.rescale(&sum)?;

    if let Some(bias) = bias {
        let plain = backend.encode(bias, backend.scale_of(&result), backend.level_of(&result))?;
        result = backend.add_plain(&result, &plain)?;
    }
    Ok(Ciphertext::new(backend, result, output_layout))
}
