use rand::{Rng, seq::SliceRandom};
use rand_distr::{Distribution, Normal};

use crate::rings::{RingError, RingResult};

/// Samples `len` residues uniformly from `[0, modulus)`.
pub fn uniform_residues<R: Rng + ?Sized>(len: usize, modulus: u64, rng: &mut R) -> Vec<u64> {
    (0..len).map(|_| rng.random_range(0..modulus)).collect()
}

/// Samples rounded Gaussian integers with standard deviation `std_dev`.
pub fn gaussian_coefficients<R: Rng + ?Sized>(
    len: usize,
    std_dev: f64,
    rng: &mut R,
) -> RingResult<Vec<i64>> {
    let normal = Normal::new(0.0, std_dev)
        .ok()
        .filter(|_| std_dev.is_finite() && std_dev > 0.0)
        .ok_or(RingError::InvalidStdDev { std_dev })?;
    Ok((0..len)
        .map(|_| normal.sample(rng).round() as i64)
        .collect())
}

/// Samples a ternary vector with exactly `hamming_weight` entries in `{-1, 1}`.
pub fn ternary_coefficients<R: Rng + ?Sized>(
    len: usize,
    hamming_weight: usize,
    rng: &mut R,
) -> RingResult<Vec<i64>> {
    if hamming_weight > len {
        return Err(RingError::InvalidHammingWeight {
            weight: hamming_weight,
            degree: len,
        });
    }
    let mut out = vec![0i64; len];
    let mut indices: Vec<usize> = (0..len).collect();
    indices.shuffle(rng);
    for &idx in indices.iter().take(hamming_weight) {
        out[idx] = if rng.random_bool(0.5) { 1 } else { -1 };
    }
    Ok(out)
}
