//! Parameter planning: ring dimension, modulus chain sizes and batch shape.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::ParameterError;
use crate::math::primes::MAX_MODULUS_BITS;
use crate::math::{ChainRequest, ModulusChain};

pub const MIN_RING_DIMENSION: usize = 8;
pub const MAX_RING_DIMENSION: usize = 1 << 16;
pub const MIN_SCALING_BITS: u32 = 10;
pub const MAX_SCALING_BITS: u32 = 60;
/// Extra bits given to `q_0` over the scaling primes, bounding the integer part of results.
pub const DEFAULT_FIRST_MOD_HEADROOM: u32 = 10;
/// Smallest headroom an explicit configuration may give `q_0`.
pub const MIN_FIRST_MOD_HEADROOM: u32 = 4;
/// Largest precision [`plan`] accepts while keeping the full headroom on `q_0`.
pub const MAX_PRECISION_BITS: u32 = MAX_SCALING_BITS - DEFAULT_FIRST_MOD_HEADROOM;
pub const DEFAULT_ERROR_STD: f64 = 3.2;
/// Sparse secret weight, only used when no security level is claimed.
pub const DEFAULT_HAMMING_WEIGHT: usize = 64;

/// Maximum `log2(QP)` per ring dimension for ternary secrets
/// (HE standard, classical attacks), columns for 128/192/256-bit security.
const HE_STANDARD_BOUNDS: [(usize, [u32; 3]); 7] = [
    (1 << 10, [27, 19, 14]),
    (1 << 11, [54, 37, 29]),
    (1 << 12, [109, 75, 58]),
    (1 << 13, [218, 152, 118]),
    (1 << 14, [438, 305, 237]),
    (1 << 15, [881, 611, 476]),
    (1 << 16, [1761, 1220, 952]),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SecurityLevel {
    #[default]
    Classic128,
    Classic192,
    Classic256,
    /// No lattice-security constraint; small rings for tests and experiments.
    NotSet,
}

impl SecurityLevel {
    /// Largest admissible `log2(QP)` at `ring_dimension`, or `None` if no bound applies.
    pub fn max_log_qp(self, ring_dimension: usize) -> Option<u32> {
        let column = match self {
            Self::Classic128 => 0,
            Self::Classic192 => 1,
            Self::Classic256 => 2,
            Self::NotSet => return None,
        };
        Some(
            HE_STANDARD_BOUNDS
                .iter()
                .find(|(n, _)| *n == ring_dimension)
                .map_or(0, |(_, bounds)| bounds[column]),
        )
    }

    fn admits(self, ring_dimension: usize, log_qp: u32) -> bool {
        self.max_log_qp(ring_dimension)
            .is_none_or(|bound| log_qp <= bound)
    }
}

/// How scales are managed across rescales.
///
/// `FlexibleAuto` tracks the exact scale of every ciphertext and keeps a
/// per-level canonical scale `S_{l+1} = S_l^2 / q_l`; the only technique the
/// bundled backend implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ScalingTechnique {
    #[default]
    FlexibleAuto,
}

/// Immutable scheme parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    ring_dimension: usize,
    scaling_mod_bits: u32,
    first_mod_bits: u32,
    special_mod_bits: u32,
    depth: usize,
    batch_size: usize,
    security: SecurityLevel,
    scaling_technique: ScalingTechnique,
    error_std: f64,
    hamming_weight: usize,
}

impl Parameters {
    pub fn builder() -> ParametersBuilder {
        ParametersBuilder::new()
    }

    pub fn ring_dimension(&self) -> usize {
        self.ring_dimension
    }

    pub fn scaling_mod_bits(&self) -> u32 {
        self.scaling_mod_bits
    }

    pub fn first_mod_bits(&self) -> u32 {
        self.first_mod_bits
    }

    pub fn special_mod_bits(&self) -> u32 {
        self.special_mod_bits
    }

    /// Multiplicative depth budget `D`.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Slot count `N` of every ciphertext.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn security(&self) -> SecurityLevel {
        self.security
    }

    pub fn scaling_technique(&self) -> ScalingTechnique {
        self.scaling_technique
    }

    pub fn error_std(&self) -> f64 {
        self.error_std
    }

    pub fn hamming_weight(&self) -> usize {
        self.hamming_weight
    }

    /// `2^scaling_mod_bits`, the scale fresh encryptions are made at.
    pub fn default_scale(&self) -> f64 {
        (1u64 << self.scaling_mod_bits) as f64
    }

    pub fn chain_request(&self) -> ChainRequest {
        ChainRequest {
            ring_dimension: self.ring_dimension,
            first_bits: self.first_mod_bits,
            scaling_bits: self.scaling_mod_bits,
            special_bits: self.special_mod_bits,
            depth: self.depth,
        }
    }

    /// Searches the concrete primes these parameters describe.
    pub fn modulus_chain(&self) -> Result<ModulusChain, ParameterError> {
        ModulusChain::search(&self.chain_request()).ok_or(ParameterError::PrimeSearch {
            bits: self.scaling_mod_bits,
            ring_dimension: self.ring_dimension,
        })
    }
}

/// Plans parameters for a computation of `depth_required` sequential multiplications.
///
/// The chain has `depth_required + 1` ciphertext primes. The ring dimension is
/// the smallest power of two that holds `slot_count` slots and keeps the chain
/// within the bound of `security`.
pub fn plan(
    depth_required: usize,
    precision_bits: u32,
    slot_count: usize,
    security: SecurityLevel,
) -> Result<Parameters, ParameterError> {
    check_bits("precision", precision_bits, MIN_SCALING_BITS, MAX_PRECISION_BITS)?;
    if slot_count == 0 || !slot_count.is_power_of_two() || slot_count > MAX_RING_DIMENSION / 2 {
        return Err(ParameterError::InvalidSlotCount {
            slots: slot_count,
            max: MAX_RING_DIMENSION / 2,
        });
    }

    let first_mod_bits = precision_bits + DEFAULT_FIRST_MOD_HEADROOM;
    let log_qp = estimated_log_qp(first_mod_bits, precision_bits, MAX_MODULUS_BITS, depth_required);

    let mut ring_dimension = (2 * slot_count).max(MIN_RING_DIMENSION);
    while !security.admits(ring_dimension, log_qp) {
        ring_dimension *= 2;
        if ring_dimension > MAX_RING_DIMENSION {
            return Err(ParameterError::DepthCeiling {
                depth: depth_required,
                log_qp,
                security,
                max_ring: MAX_RING_DIMENSION,
            });
        }
    }

    let parameters = ParametersBuilder::new()
        .ring_dimension(ring_dimension)
        .scaling_mod_bits(precision_bits)
        .first_mod_bits(first_mod_bits)
        .depth(depth_required)
        .batch_size(slot_count)
        .security(security)
        .build()?;
    debug!(
        ring_dimension,
        depth = depth_required,
        precision_bits,
        slot_count,
        ?security,
        "planned parameters"
    );
    Ok(parameters)
}

/// Expected non-zero count of a uniform ternary secret, `2N/3`.
pub fn dense_hamming_weight(ring_dimension: usize) -> usize {
    2 * ring_dimension / 3
}

// Upper bound: a `b`-bit walk may return primes of `b + 1` bits.
fn estimated_log_qp(first: u32, scaling: u32, special: u32, depth: usize) -> u32 {
    (first + 1) + (scaling + 1) * depth as u32 + special
}

fn check_bits(name: &'static str, bits: u32, min: u32, max: u32) -> Result<(), ParameterError> {
    if bits < min || bits > max {
        return Err(ParameterError::InvalidPrecision {
            name,
            bits,
            min,
            max,
        });
    }
    Ok(())
}

/// Explicit parameter configuration with validation.
#[derive(Debug, Clone, Default)]
pub struct ParametersBuilder {
    ring_dimension: Option<usize>,
    scaling_mod_bits: Option<u32>,
    first_mod_bits: Option<u32>,
    special_mod_bits: Option<u32>,
    depth: Option<usize>,
    batch_size: Option<usize>,
    security: Option<SecurityLevel>,
    error_std: Option<f64>,
    hamming_weight: Option<usize>,
}

impl ParametersBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ring_dimension(mut self, ring_dimension: usize) -> Self {
        self.ring_dimension = Some(ring_dimension);
        self
    }

    pub fn scaling_mod_bits(mut self, bits: u32) -> Self {
        self.scaling_mod_bits = Some(bits);
        self
    }

    pub fn first_mod_bits(mut self, bits: u32) -> Self {
        self.first_mod_bits = Some(bits);
        self
    }

    pub fn special_mod_bits(mut self, bits: u32) -> Self {
        self.special_mod_bits = Some(bits);
        self
    }

    pub fn depth(mut self, depth: usize) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn security(mut self, security: SecurityLevel) -> Self {
        self.security = Some(security);
        self
    }

    pub fn error_std(mut self, error_std: f64) -> Self {
        self.error_std = Some(error_std);
        self
    }

    pub fn hamming_weight(mut self, weight: usize) -> Self {
        self.hamming_weight = Some(weight);
        self
    }

    pub fn build(self) -> Result<Parameters, ParameterError> {
        let scaling_mod_bits = self.scaling_mod_bits.unwrap_or(40);
        check_bits("scaling modulus", scaling_mod_bits, MIN_SCALING_BITS, MAX_SCALING_BITS)?;
        let first_mod_bits = self
            .first_mod_bits
            .unwrap_or(scaling_mod_bits + DEFAULT_FIRST_MOD_HEADROOM);
        check_bits(
            "first modulus",
            first_mod_bits,
            scaling_mod_bits + MIN_FIRST_MOD_HEADROOM,
            MAX_SCALING_BITS,
        )?;
        let special_mod_bits = self.special_mod_bits.unwrap_or(MAX_MODULUS_BITS);
        check_bits("special modulus", special_mod_bits, first_mod_bits, MAX_MODULUS_BITS)?;

        let depth = self.depth.unwrap_or(1);
        let batch_size = self.batch_size.unwrap_or(8);
        let ring_dimension = self
            .ring_dimension
            .unwrap_or_else(|| (2 * batch_size).max(MIN_RING_DIMENSION));
        if !ring_dimension.is_power_of_two()
            || !(MIN_RING_DIMENSION..=MAX_RING_DIMENSION).contains(&ring_dimension)
        {
            return Err(ParameterError::InvalidRingDimension(ring_dimension));
        }
        if batch_size == 0 || !batch_size.is_power_of_two() || batch_size > ring_dimension / 2 {
            return Err(ParameterError::InvalidSlotCount {
                slots: batch_size,
                max: ring_dimension / 2,
            });
        }

        let error_std = self.error_std.unwrap_or(DEFAULT_ERROR_STD);
        if !(error_std.is_finite() && error_std > 0.0) {
            return Err(ParameterError::InvalidNoise(format!(
                "error standard deviation {error_std} must be finite and positive"
            )));
        }
        let security = self.security.unwrap_or_default();
        let dense = dense_hamming_weight(ring_dimension);
        let hamming_weight = self.hamming_weight.unwrap_or(match security {
            SecurityLevel::NotSet => DEFAULT_HAMMING_WEIGHT.min(ring_dimension / 2),
            _ => dense,
        });
        if hamming_weight == 0 || hamming_weight > ring_dimension {
            return Err(ParameterError::InvalidNoise(format!(
                "hamming weight {hamming_weight} must be in [1, {ring_dimension}]"
            )));
        }
        // The security table assumes a uniform ternary secret.
        if security != SecurityLevel::NotSet && hamming_weight < dense {
            return Err(ParameterError::SparseSecret {
                weight: hamming_weight,
                minimum: dense,
                security,
            });
        }

        let parameters = Parameters {
            ring_dimension,
            scaling_mod_bits,
            first_mod_bits,
            special_mod_bits,
            depth,
            batch_size,
            security,
            scaling_technique: ScalingTechnique::FlexibleAuto,
            error_std,
            hamming_weight,
        };

        let chain = parameters.modulus_chain()?;
        let log_qp = chain.log_qp();
        if !parameters.security.admits(ring_dimension, log_qp) {
            return Err(ParameterError::Insecure {
                ring_dimension,
                log_qp,
                security: parameters.security,
            });
        }
        Ok(parameters)
    }
}
