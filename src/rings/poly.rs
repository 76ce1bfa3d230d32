use std::ops::{AddAssign, MulAssign, Neg, SubAssign};
use std::sync::Arc;

use crate::math::primes::{add_mod, center, inv_mod, mul_mod, reduce_signed, sub_mod};

use super::basis::{NttTable, RnsBasis};
use super::errors::{RingError, RingResult};

/// Representation a polynomial's residues are currently stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Coefficient,
    Evaluation,
}

#[derive(Debug, Clone)]
struct Channel {
    table: Arc<NttTable>,
    residues: Vec<u64>,
}

/// A polynomial in `Z_{q_0} x … x Z_{q_{L-1}}[X] / (X^N + 1)`.
///
/// # Invariants
/// - every channel holds exactly `degree` residues, each below its modulus
/// - all channels share one [`Domain`]
#[derive(Debug, Clone)]
pub struct RnsPoly {
    degree: usize,
    channels: Vec<Channel>,
    domain: Domain,
}

// ─── Constructors ─────────────────────────────────────────────────────────────

impl RnsPoly {
    pub fn zero(basis: &RnsBasis, domain: Domain) -> Self {
        let channels = basis
            .tables()
            .iter()
            .map(|table| Channel {
                table: table.clone(),
                residues: vec![0; basis.degree()],
            })
            .collect();
        Self {
            degree: basis.degree(),
            channels,
            domain,
        }
    }

    /// Reduces signed coefficients into every channel of `basis`.
    pub fn from_signed(coeffs: &[i64], basis: &RnsBasis) -> RingResult<Self> {
        Self::from_fn(basis, coeffs.len(), |i, q| reduce_signed(coeffs[i] as i128, q))
    }

    /// Like [`RnsPoly::from_signed`] for values that may exceed `i64`.
    pub fn from_wide(coeffs: &[i128], basis: &RnsBasis) -> RingResult<Self> {
        Self::from_fn(basis, coeffs.len(), |i, q| reduce_signed(coeffs[i], q))
    }

    fn from_fn(
        basis: &RnsBasis,
        len: usize,
        residue: impl Fn(usize, u64) -> u64,
    ) -> RingResult<Self> {
        if len != basis.degree() {
            return Err(RingError::LengthMismatch {
                expected: basis.degree(),
                actual: len,
            });
        }
        let channels = basis
            .tables()
            .iter()
            .map(|table| {
                let q = table.modulus();
                Channel {
                    table: table.clone(),
                    residues: (0..len).map(|i| residue(i, q)).collect(),
                }
            })
            .collect();
        Ok(Self {
            degree: basis.degree(),
            channels,
            domain: Domain::Coefficient,
        })
    }

    /// Wraps residues laid out per channel, validating their range.
    pub fn from_residues(
        residues: Vec<Vec<u64>>,
        basis: &RnsBasis,
        domain: Domain,
    ) -> RingResult<Self> {
        if residues.len() != basis.channel_count() {
            return Err(RingError::LengthMismatch {
                expected: basis.channel_count(),
                actual: residues.len(),
            });
        }
        let mut channels = Vec::with_capacity(residues.len());
        for (table, values) in basis.tables().iter().zip(residues) {
            if values.len() != basis.degree() {
                return Err(RingError::LengthMismatch {
                    expected: basis.degree(),
                    actual: values.len(),
                });
            }
            if let Some(&residue) = values.iter().find(|&&r| r >= table.modulus()) {
                return Err(RingError::NonReducedResidue {
                    residue,
                    modulus: table.modulus(),
                });
            }
            channels.push(Channel {
                table: table.clone(),
                residues: values,
            });
        }
        Ok(Self {
            degree: basis.degree(),
            channels,
            domain,
        })
    }
}

// ─── Accessors & domain conversion ───────────────────────────────────────────

impl RnsPoly {
    pub fn degree(&self) -> usize {
        self.degree
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn moduli(&self) -> Vec<u64> {
        self.channels.iter().map(|c| c.table.modulus()).collect()
    }

    pub fn residues(&self, channel: usize) -> &[u64] {
        &self.channels[channel].residues
    }

    pub fn basis(&self) -> RnsBasis {
        RnsBasis::new(self.channels.iter().map(|c| c.table.clone()).collect())
            .unwrap_or_else(|_| unreachable!("a polynomial always has at least one channel"))
    }

    pub fn to_evaluation(&mut self) {
        if self.domain == Domain::Evaluation {
            return;
        }
        for channel in &mut self.channels {
            channel.table.forward(&mut channel.residues);
        }
        self.domain = Domain::Evaluation;
    }

    pub fn to_coefficient(&mut self) {
        if self.domain == Domain::Coefficient {
            return;
        }
        for channel in &mut self.channels {
            channel.table.inverse(&mut channel.residues);
        }
        self.domain = Domain::Coefficient;
    }

    pub fn into_evaluation(mut self) -> Self {
        self.to_evaluation();
        self
    }

    pub fn into_coefficient(mut self) -> Self {
        self.to_coefficient();
        self
    }

    /// Keeps only the first `len` channels.
    pub fn truncate(&mut self, len: usize) -> RingResult<()> {
        if len == 0 || len > self.channels.len() {
            return Err(RingError::InvalidModDrop {
                drop_count: self.channels.len().saturating_sub(len),
                channel_count: self.channels.len(),
            });
        }
        self.channels.truncate(len);
        Ok(())
    }

    /// The first `head` channels followed by the last channel.
    ///
    /// Used to restrict key-switching material, stored over `q_0 … q_D, P`,
    /// to the primes a ciphertext currently lives on.
    pub fn select_head_and_last(&self, head: usize) -> RingResult<Self> {
        let count = self.channels.len();
        if head == 0 || head >= count {
            return Err(RingError::InvalidModDrop {
                drop_count: count.saturating_sub(head + 1),
                channel_count: count,
            });
        }
        let mut channels = self.channels[..head].to_vec();
        channels.push(self.channels[count - 1].clone());
        Ok(Self {
            degree: self.degree,
            channels,
            domain: self.domain,
        })
    }

    /// Centered coefficients of one channel, read as integers modulo that prime.
    pub fn centered_channel(&self, channel: usize) -> RingResult<Vec<i64>> {
        if self.domain != Domain::Coefficient {
            return Err(RingError::WrongDomain {
                expected: "coefficient",
            });
        }
        let ch = &self.channels[channel];
        let q = ch.table.modulus();
        Ok(ch.residues.iter().map(|&r| center(r, q)).collect())
    }
}

// ─── Ring structure ──────────────────────────────────────────────────────────

impl RnsPoly {
    /// Lifts channel `source` (centered) into every channel of `target`.
    ///
    /// This is the digit decomposition step of hybrid key switching.
    pub fn lift_channel(&self, source: usize, target: &RnsBasis) -> RingResult<Self> {
        let centered = self.centered_channel(source)?;
        Self::from_signed(&centered, target)
    }

    /// Divides by the last modulus with rounding and drops that channel.
    ///
    /// Computes `(a - [a]_{q_l}) · q_l^{-1}` per remaining channel, where
    /// `[a]_{q_l}` is the centered residue of the dropped channel. Serves both
    /// CKKS rescale and the `P`-division at the end of key switching.
    pub fn divide_by_last(&mut self) -> RingResult<u64> {
        if self.domain != Domain::Coefficient {
            return Err(RingError::WrongDomain {
                expected: "coefficient",
            });
        }
        let channel_count = self.channels.len();
        let last = match self.channels.split_last() {
            Some((last, _)) if channel_count >= 2 => last.clone(),
            _ => {
                return Err(RingError::InvalidModDrop {
                    drop_count: 1,
                    channel_count,
                });
            }
        };
        self.channels.truncate(channel_count - 1);
        let q_last = last.table.modulus();
        let tail = last.residues;
        for channel in &mut self.channels {
            let q = channel.table.modulus();
            let q_last_inv = inv_mod(q_last % q, q).ok_or(RingError::NonNttFriendlyModulus {
                modulus: q_last,
                degree: self.degree,
            })?;
            for (value, &r) in channel.residues.iter_mut().zip(&tail) {
                let lifted = reduce_signed(center(r, q_last) as i128, q);
                *value = mul_mod(sub_mod(*value, lifted, q), q_last_inv, q);
            }
        }
        Ok(q_last)
    }

    /// Applies `X -> X^galois` in the coefficient domain.
    pub fn automorphism(&self, galois: usize) -> RingResult<Self> {
        if self.domain != Domain::Coefficient {
            return Err(RingError::WrongDomain {
                expected: "coefficient",
            });
        }
        let order = 2 * self.degree;
        if galois % 2 == 0 {
            return Err(RingError::InvalidGaloisElement {
                element: galois,
                order,
            });
        }
        let n = self.degree;
        let channels = self
            .channels
            .iter()
            .map(|ch| {
                let q = ch.table.modulus();
                let mut out = vec![0u64; n];
                for (i, &value) in ch.residues.iter().enumerate() {
                    let target = (i * galois) % order;
                    if target < n {
                        out[target] = value;
                    } else {
                        out[target - n] = sub_mod(0, value, q);
                    }
                }
                Channel {
                    table: ch.table.clone(),
                    residues: out,
                }
            })
            .collect();
        Ok(Self {
            degree: n,
            channels,
            domain: Domain::Coefficient,
        })
    }

    /// `self += a * b`, all three in the evaluation domain.
    pub fn mul_add_assign(&mut self, a: &RnsPoly, b: &RnsPoly) {
        debug_assert!(
            self.domain == Domain::Evaluation
                && a.domain == Domain::Evaluation
                && b.domain == Domain::Evaluation,
            "mul_add_assign: operands must be in the evaluation domain"
        );
        for ((acc, x), y) in self.channels.iter_mut().zip(&a.channels).zip(&b.channels) {
            let q = acc.table.modulus();
            for ((r, &u), &v) in acc.residues.iter_mut().zip(&x.residues).zip(&y.residues) {
                *r = add_mod(*r, mul_mod(u, v, q), q);
            }
        }
    }

    /// `self[channel] += factor * source[channel]`, leaving the other channels alone.
    pub fn add_scaled_channel(&mut self, channel: usize, source: &RnsPoly, factor: u64) {
        debug_assert_eq!(self.domain, source.domain, "domain mismatch");
        let target = &mut self.channels[channel];
        let q = target.table.modulus();
        let factor = factor % q;
        for (r, &s) in target.residues.iter_mut().zip(&source.channels[channel].residues) {
            *r = add_mod(*r, mul_mod(s, factor, q), q);
        }
    }

    /// Multiplies every coefficient by a small signed constant.
    pub fn scale_by(&mut self, factor: i64) {
        for channel in &mut self.channels {
            let q = channel.table.modulus();
            let f = reduce_signed(factor as i128, q);
            for r in channel.residues.iter_mut() {
                *r = mul_mod(*r, f, q);
            }
        }
    }

    fn zip_channels(&mut self, rhs: &RnsPoly, op: impl Fn(u64, u64, u64) -> u64) {
        debug_assert_eq!(self.moduli(), rhs.moduli(), "channel moduli mismatch");
        debug_assert_eq!(self.domain, rhs.domain, "domain mismatch");
        for (lhs, rhs) in self.channels.iter_mut().zip(&rhs.channels) {
            let q = lhs.table.modulus();
            for (a, &b) in lhs.residues.iter_mut().zip(&rhs.residues) {
                *a = op(*a, b, q);
            }
        }
    }
}

impl AddAssign<&RnsPoly> for RnsPoly {
    fn add_assign(&mut self, rhs: &RnsPoly) {
        self.zip_channels(rhs, add_mod);
    }
}

impl SubAssign<&RnsPoly> for RnsPoly {
    fn sub_assign(&mut self, rhs: &RnsPoly) {
        self.zip_channels(rhs, sub_mod);
    }
}

impl MulAssign<&RnsPoly> for RnsPoly {
    /// Pointwise product; both operands must be in the evaluation domain.
    fn mul_assign(&mut self, rhs: &RnsPoly) {
        debug_assert_eq!(
            self.domain,
            Domain::Evaluation,
            "mul_assign: requires evaluation domain"
        );
        self.zip_channels(rhs, mul_mod);
    }
}

impl Neg for RnsPoly {
    type Output = RnsPoly;

    fn neg(mut self) -> RnsPoly {
        for channel in &mut self.channels {
            let q = channel.table.modulus();
            for r in channel.residues.iter_mut() {
                *r = sub_mod(0, *r, q);
            }
        }
        self
    }
}

/// Product of two polynomials, returned in the coefficient domain.
pub fn multiply(a: &RnsPoly, b: &RnsPoly) -> RnsPoly {
    let mut lhs = a.clone().into_evaluation();
    let rhs = b.clone().into_evaluation();
    lhs *= &rhs;
    lhs.into_coefficient()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basis() -> RnsBasis {
        RnsBasis::from_moduli(&[97, 113, 193], 8).unwrap()
    }

    #[test]
    fn signed_coefficients_reduce_per_channel() {
        let poly = RnsPoly::from_signed(&[-1, 2, 0, 0, 0, 0, 0, 5], &basis()).unwrap();
        assert_eq!(poly.residues(0)[0], 96);
        assert_eq!(poly.residues(1)[0], 112);
        assert_eq!(poly.centered_channel(2).unwrap(), vec![-1, 2, 0, 0, 0, 0, 0, 5]);
    }

    #[test]
    fn length_must_match_degree() {
        assert!(matches!(
            RnsPoly::from_signed(&[1, 2, 3], &basis()),
            Err(RingError::LengthMismatch {
                expected: 8,
                actual: 3
            })
        ));
    }

    #[test]
    fn multiplication_wraps_negacyclically() {
        // X^7 * X = X^8 = -1
        let mut x7 = vec![0i64; 8];
        x7[7] = 1;
        let mut x1 = vec![0i64; 8];
        x1[1] = 3;
        let a = RnsPoly::from_signed(&x7, &basis()).unwrap();
        let b = RnsPoly::from_signed(&x1, &basis()).unwrap();
        let product = multiply(&a, &b);
        assert_eq!(product.centered_channel(0).unwrap(), vec![-3, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(product.domain(), Domain::Coefficient);
    }

    #[test]
    fn divide_by_last_rounds_to_nearest() {
        let b = basis();
        let q_last = 193i64;
        let values: Vec<i64> = vec![5 * q_last, 5 * q_last + 90, -7 * q_last - 3, 0, 1, 2, 3, 4];
        let mut poly = RnsPoly::from_signed(&values, &b).unwrap();
        assert_eq!(poly.divide_by_last().unwrap(), 193);
        assert_eq!(poly.channel_count(), 2);
        let out = poly.centered_channel(0).unwrap();
        assert_eq!(&out[..4], &[5, 5, -7, 0]);
    }

    #[test]
    fn automorphism_permutes_with_sign() {
        // X -> X^3 on degree 8: X^3 -> X^9 = -X
        let mut coeffs = vec![0i64; 8];
        coeffs[3] = 4;
        let poly = RnsPoly::from_signed(&coeffs, &basis()).unwrap();
        let mapped = poly.automorphism(3).unwrap();
        let mut expected = vec![0i64; 8];
        expected[1] = -4;
        assert_eq!(mapped.centered_channel(1).unwrap(), expected);
        assert!(poly.automorphism(2).is_err());
    }

    #[test]
    fn lift_channel_copies_small_values() {
        let b = basis();
        let coeffs: Vec<i64> = vec![-3, 1, 4, -1, 5, -9, 2, 6];
        let poly = RnsPoly::from_signed(&coeffs, &b).unwrap();
        let lifted = poly.lift_channel(1, &b).unwrap();
        for ch in 0..3 {
            assert_eq!(lifted.centered_channel(ch).unwrap(), coeffs);
        }
    }

    #[test]
    fn select_head_and_last_keeps_special_channel() {
        let poly = RnsPoly::zero(&basis(), Domain::Evaluation);
        let view = poly.select_head_and_last(1).unwrap();
        assert_eq!(view.moduli(), vec![97, 193]);
        assert!(poly.select_head_and_last(3).is_err());
    }
}
