//! Canonical embedding with sparse packing.
//!
//! A batch of `n` slots lives in the subring `Z[Y]/(Y^{2n} + 1)` with
//! `Y = X^{gap}` and `gap = N / 2n`. Slot `j` is the evaluation at
//! `zeta^{5^j}` for `zeta = exp(i·pi / 2n)`, so the automorphism
//! `X -> X^{5^k}` rotates the batch left by `k` (cyclically modulo `n`).
//! Encoding and decoding evaluate the Vandermonde matrix directly, which costs
//! `O(n^2)` regardless of the ring dimension.

use std::f64::consts::PI;

use num_complex::Complex64;

use super::errors::{EncodingError, EncodingResult};

// Values must stay well inside i128 after scaling.
const MAX_SCALED_MAGNITUDE: f64 = 1.0e36;

#[derive(Debug, Clone)]
pub struct SlotEncoder {
    ring_degree: usize,
    slots: usize,
    gap: usize,
    /// `zeta^k` for `k` in `0..4n`.
    roots: Vec<Complex64>,
    /// `5^j mod 4n` for `j` in `0..n`.
    rotation_group: Vec<usize>,
}

impl SlotEncoder {
    pub fn new(ring_degree: usize, slots: usize) -> EncodingResult<Self> {
        if !ring_degree.is_power_of_two() || ring_degree < 2 {
            return Err(EncodingError::InvalidRingDegree {
                degree: ring_degree,
            });
        }
        if !slots.is_power_of_two() || slots > ring_degree / 2 {
            return Err(EncodingError::InvalidSlotCount {
                slots,
                max: ring_degree / 2,
            });
        }
        let sub_degree = 2 * slots;
        let order = 2 * sub_degree;
        let roots = (0..order)
            .map(|k| Complex64::from_polar(1.0, PI * k as f64 / sub_degree as f64))
            .collect();
        let mut rotation_group = Vec::with_capacity(slots);
        let mut power = 1usize;
        for _ in 0..slots {
            rotation_group.push(power);
            power = power * 5 % order;
        }
        Ok(Self {
            ring_degree,
            slots,
            gap: ring_degree / sub_degree,
            roots,
            rotation_group,
        })
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn ring_degree(&self) -> usize {
        self.ring_degree
    }

    /// Galois element realising a left rotation by `offset` slots.
    pub fn galois_element(&self, offset: usize) -> usize {
        let order = 2 * self.ring_degree as u64;
        let mut element = 1u64;
        let mut base = 5u64;
        let mut exp = (offset % self.slots) as u64;
        while exp > 0 {
            if exp & 1 == 1 {
                element = element * base % order;
            }
            base = base * base % order;
            exp >>= 1;
        }
        element as usize
    }

    /// Encodes up to `slots` real values at `scale` into `ring_degree` integer coefficients.
    pub fn encode(&self, values: &[f64], scale: f64) -> EncodingResult<Vec<i128>> {
        if values.len() > self.slots {
            return Err(EncodingError::InputTooLong {
                got: values.len(),
                max: self.slots,
            });
        }
        if !(scale.is_finite() && scale > 0.0) {
            return Err(EncodingError::InvalidScale { scale });
        }
        if let Some(&value) = values.iter().find(|v| !v.is_finite()) {
            return Err(EncodingError::CoefficientOutOfRange { value });
        }

        let sub_degree = 2 * self.slots;
        let order = 2 * sub_degree;
        let mut coeffs = vec![0i128; self.ring_degree];
        for i in 0..sub_degree {
            // m_i = (2 / 2n) · Re( sum_j z_j · zeta^{-5^j · i} )
            let acc: f64 = values
                .iter()
                .zip(&self.rotation_group)
                .map(|(&z, &g)| {
                    let exponent = (order - (g * i) % order) % order;
                    z * self.roots[exponent].re
                })
                .sum();
            let scaled = acc * 2.0 / sub_degree as f64 * scale;
            if scaled.abs() > MAX_SCALED_MAGNITUDE {
                return Err(EncodingError::CoefficientOutOfRange { value: scaled });
            }
            coeffs[i * self.gap] = scaled.round() as i128;
        }
        Ok(coeffs)
    }

    /// Decodes centered integer coefficients at `scale` back to the slot values.
    pub fn decode(&self, coeffs: &[i64], scale: f64) -> EncodingResult<Vec<f64>> {
        if coeffs.len() != self.ring_degree {
            return Err(EncodingError::InvalidRingDegree {
                degree: coeffs.len(),
            });
        }
        if !(scale.is_finite() && scale > 0.0) {
            return Err(EncodingError::InvalidScale { scale });
        }
        let sub_degree = 2 * self.slots;
        let order = 2 * sub_degree;
        let sub_coeffs: Vec<f64> = (0..sub_degree)
            .map(|i| coeffs[i * self.gap] as f64 / scale)
            .collect();
        Ok(self
            .rotation_group
            .iter()
            .map(|&g| {
                sub_coeffs
                    .iter()
                    .enumerate()
                    .map(|(i, &c)| c * self.roots[(g * i) % order].re)
                    .sum()
            })
            .collect())
    }
}
