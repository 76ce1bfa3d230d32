//! Key material for the bundled backend.
//!
//! Key-switching keys use the hybrid construction with a single special
//! prime `P`: digit `i` encrypts `P · s'` on channel `q_i` only, so a
//! ciphertext component decomposed into its RNS channels can be switched
//! from `s'` to `s` and divided back down by `P`.

use std::fmt;

use rand::Rng;

use crate::backend::BackendResult;
use crate::math::{gaussian_coefficients, ternary_coefficients, uniform_residues};
use crate::rings::{Domain, RnsBasis, RnsPoly};

use super::context::CkksContext;

/// Ternary secret `s`, kept both as coefficients and in evaluation form
/// over the full key basis.
#[derive(Clone)]
pub struct SecretKey {
    pub(crate) coeffs: Vec<i64>,
    pub(crate) poly: RnsPoly,
}

// Coefficients never reach logs or panic messages.
impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKey")
            .field("degree", &self.coeffs.len())
            .field("channels", &self.poly.channel_count())
            .finish_non_exhaustive()
    }
}

impl SecretKey {
    pub fn generate<R: Rng + ?Sized>(context: &CkksContext, rng: &mut R) -> BackendResult<Self> {
        let params = context.parameters();
        let coeffs = ternary_coefficients(context.degree(), params.hamming_weight(), rng)?;
        Self::from_coefficients(context, coeffs)
    }

    pub(crate) fn from_coefficients(
        context: &CkksContext,
        coeffs: Vec<i64>,
    ) -> BackendResult<Self> {
        let poly = RnsPoly::from_signed(&coeffs, context.key_basis())?.into_evaluation();
        Ok(Self { coeffs, poly })
    }

    pub fn coefficients(&self) -> &[i64] {
        &self.coeffs
    }

    /// `s` restricted to the first `channels` ciphertext primes.
    pub(crate) fn restricted(&self, channels: usize) -> BackendResult<RnsPoly> {
        let mut poly = self.poly.clone();
        poly.truncate(channels)?;
        Ok(poly)
    }
}

/// `(b, a)` with `b = -a·s + e` over `q_0 … q_D`, evaluation domain.
#[derive(Debug, Clone)]
pub struct PublicKey {
    pub(crate) b: RnsPoly,
    pub(crate) a: RnsPoly,
}

impl PublicKey {
    pub fn generate<R: Rng + ?Sized>(
        context: &CkksContext,
        secret_key: &SecretKey,
        rng: &mut R,
    ) -> BackendResult<Self> {
        let basis = context.basis_at(0)?;
        let a = uniform_poly(&basis, rng);
        let e = error_poly(context, &basis, rng)?;
        let s = secret_key.restricted(basis.channel_count())?;
        let mut a_s = a.clone();
        a_s *= &s;
        let mut b = e;
        b -= &a_s;
        Ok(Self { b, a })
    }

    pub fn b(&self) -> &RnsPoly {
        &self.b
    }

    pub fn a(&self) -> &RnsPoly {
        &self.a
    }
}

/// One `(b_i, a_i)` pair per ciphertext prime, over `q_0 … q_D, P`.
#[derive(Debug, Clone)]
pub struct SwitchingKey {
    pub(crate) digits: Vec<(RnsPoly, RnsPoly)>,
}

impl SwitchingKey {
    /// Key switching from `target` (in evaluation form over the key basis) to `s`.
    pub fn generate<R: Rng + ?Sized>(
        context: &CkksContext,
        secret_key: &SecretKey,
        target: &RnsPoly,
        rng: &mut R,
    ) -> BackendResult<Self> {
        let basis = context.key_basis();
        let special = context.special_modulus();
        let count = context.moduli().len();
        let mut digits = Vec::with_capacity(count);
        for (i, &q) in context.moduli().iter().enumerate() {
            let a = uniform_poly(basis, rng);
            let mut b = error_poly(context, basis, rng)?;
            let mut a_s = a.clone();
            a_s *= &secret_key.poly;
            b -= &a_s;
            b.add_scaled_channel(i, target, special % q);
            digits.push((b, a));
        }
        Ok(Self { digits })
    }

    /// Switches `d` (coefficient domain over `q_0 … q_t`) to a pair
    /// `(u0, u1)` with `u0 + u1·s ≈ d·s'`.
    pub(crate) fn apply(
        &self,
        context: &CkksContext,
        d: &RnsPoly,
    ) -> BackendResult<(RnsPoly, RnsPoly)> {
        let channels = d.channel_count();
        let basis = context.switching_basis(channels)?;
        let mut u0 = RnsPoly::zero(&basis, Domain::Evaluation);
        let mut u1 = RnsPoly::zero(&basis, Domain::Evaluation);
        for (i, (b, a)) in self.digits.iter().take(channels).enumerate() {
            let digit = d.lift_channel(i, &basis)?.into_evaluation();
            u0.mul_add_assign(&digit, &b.select_head_and_last(channels)?);
            u1.mul_add_assign(&digit, &a.select_head_and_last(channels)?);
        }
        let mut u0 = u0.into_coefficient();
        let mut u1 = u1.into_coefficient();
        u0.divide_by_last()?;
        u1.divide_by_last()?;
        Ok((u0, u1))
    }

    pub fn digits(&self) -> &[(RnsPoly, RnsPoly)] {
        &self.digits
    }
}

/// Switches `s^2` back to `s` after a ciphertext product.
#[derive(Debug, Clone)]
pub struct RelinKey {
    pub(crate) key: SwitchingKey,
}

impl RelinKey {
    pub fn generate<R: Rng + ?Sized>(
        context: &CkksContext,
        secret_key: &SecretKey,
        rng: &mut R,
    ) -> BackendResult<Self> {
        let mut s_squared = secret_key.poly.clone();
        s_squared *= &secret_key.poly;
        Ok(Self {
            key: SwitchingKey::generate(context, secret_key, &s_squared, rng)?,
        })
    }

    pub fn switching_key(&self) -> &SwitchingKey {
        &self.key
    }
}

/// Switches `s(X^g)` back to `s` after the automorphism `X -> X^g`.
#[derive(Debug, Clone)]
pub struct GaloisKey {
    pub(crate) offset: usize,
    pub(crate) galois_element: usize,
    pub(crate) key: SwitchingKey,
}

impl GaloisKey {
    pub fn generate<R: Rng + ?Sized>(
        context: &CkksContext,
        secret_key: &SecretKey,
        offset: usize,
        rng: &mut R,
    ) -> BackendResult<Self> {
        let offset = offset % context.parameters().batch_size();
        let galois_element = context.encoder().galois_element(offset);
        let rotated = RnsPoly::from_signed(&secret_key.coeffs, context.key_basis())?
            .automorphism(galois_element)?
            .into_evaluation();
        Ok(Self {
            offset,
            galois_element,
            key: SwitchingKey::generate(context, secret_key, &rotated, rng)?,
        })
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn galois_element(&self) -> usize {
        self.galois_element
    }

    pub fn switching_key(&self) -> &SwitchingKey {
        &self.key
    }
}

fn uniform_poly<R: Rng + ?Sized>(basis: &RnsBasis, rng: &mut R) -> RnsPoly {
    let residues = basis
        .moduli()
        .into_iter()
        .map(|q| uniform_residues(basis.degree(), q, rng))
        .collect();
    // Uniform residues are uniform in either domain.
    RnsPoly::from_residues(residues, basis, Domain::Evaluation)
        .unwrap_or_else(|_| unreachable!("sampled residues match the basis"))
}

fn error_poly<R: Rng + ?Sized>(
    context: &CkksContext,
    basis: &RnsBasis,
    rng: &mut R,
) -> BackendResult<RnsPoly> {
    Ok(sample_error(context, basis, rng)?.into_evaluation())
}

/// Gaussian error over `basis`, coefficient domain.
pub(crate) fn sample_error<R: Rng + ?Sized>(
    context: &CkksContext,
    basis: &RnsBasis,
    rng: &mut R,
) -> BackendResult<RnsPoly> {
    let coeffs = gaussian_coefficients(basis.degree(), context.parameters().error_std(), rng)?;
    Ok(RnsPoly::from_signed(&coeffs, basis)?)
}

/// Ternary ephemeral over `basis`, coefficient domain.
pub(crate) fn sample_ternary<R: Rng + ?Sized>(
    context: &CkksContext,
    basis: &RnsBasis,
    rng: &mut R,
) -> BackendResult<RnsPoly> {
    let coeffs =
        ternary_coefficients(basis.degree(), context.parameters().hamming_weight(), rng)?;
    Ok(RnsPoly::from_signed(&coeffs, basis)?)
}
