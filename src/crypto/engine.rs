use std::sync::Arc;

use rand::Rng;
use tracing::trace;

use crate::backend::{BackendError, BackendResult, HeBackend, scales_match};
use crate::params::Parameters;
use crate::rings::RnsPoly;

use super::context::CkksContext;
use super::keys::{GaloisKey, PublicKey, RelinKey, SecretKey, sample_error, sample_ternary};
use super::types::{Ciphertext, Plaintext};

/// The bundled RNS-CKKS implementation of [`HeBackend`].
///
/// Cloning is cheap; all clones share one [`CkksContext`].
#[derive(Debug, Clone)]
pub struct CkksBackend {
    context: Arc<CkksContext>,
}

impl CkksBackend {
    pub fn new(context: Arc<CkksContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<CkksContext> {
        &self.context
    }

    fn check_pair(&self, a: &Ciphertext, b_level: usize, b_scale: f64) -> BackendResult<()> {
        if a.level != b_level {
            return Err(BackendError::LevelMismatch {
                expected: a.level,
                actual: b_level,
            });
        }
        if !scales_match(a.scale, b_scale) {
            return Err(BackendError::ScaleMismatch {
                expected: a.scale,
                actual: b_scale,
            });
        }
        Ok(())
    }

    fn check_level(&self, a: &Ciphertext, level: usize) -> BackendResult<()> {
        if a.level != level {
            return Err(BackendError::LevelMismatch {
                expected: a.level,
                actual: level,
            });
        }
        Ok(())
    }
}

impl HeBackend for CkksBackend {
    type Plaintext = Plaintext;
    type Ciphertext = Ciphertext;
    type SecretKey = SecretKey;
    type PublicKey = PublicKey;
    type RelinKey = RelinKey;
    type GaloisKey = GaloisKey;

    fn from_parameters(parameters: &Parameters) -> BackendResult<Self> {
        Ok(Self::new(Arc::new(CkksContext::new(parameters)?)))
    }

    fn parameters(&self) -> &Parameters {
        self.context.parameters()
    }

    fn modulus_chain(&self) -> &[u64] {
        self.context.moduli()
    }

    fn canonical_scale(&self, level: usize) -> f64 {
        self.context.canonical_scale(level)
    }

    fn rescale_modulus(&self, level: usize) -> BackendResult<u64> {
        self.context.rescale_modulus(level)
    }

    fn generate_secret_key<R: Rng + ?Sized>(&self, rng: &mut R) -> BackendResult<SecretKey> {
        SecretKey::generate(&self.context, rng)
    }

    fn generate_public_key<R: Rng + ?Sized>(
        &self,
        secret_key: &SecretKey,
        rng: &mut R,
    ) -> BackendResult<PublicKey> {
        PublicKey::generate(&self.context, secret_key, rng)
    }

    fn generate_relin_key<R: Rng + ?Sized>(
        &self,
        secret_key: &SecretKey,
        rng: &mut R,
    ) -> BackendResult<RelinKey> {
        RelinKey::generate(&self.context, secret_key, rng)
    }

    fn generate_galois_key<R: Rng + ?Sized>(
        &self,
        secret_key: &SecretKey,
        offset: usize,
        rng: &mut R,
    ) -> BackendResult<GaloisKey> {
        GaloisKey::generate(&self.context, secret_key, offset, rng)
    }

    fn encode(&self, values: &[f64], scale: f64, level: usize) -> BackendResult<Plaintext> {
        let basis = self.context.basis_at(level)?;
        let coeffs = self.context.encoder().encode(values, scale)?;
        Ok(Plaintext {
            poly: RnsPoly::from_wide(&coeffs, &basis)?,
            scale,
            level,
        })
    }

    fn decode(&self, plaintext: &Plaintext) -> BackendResult<Vec<f64>> {
        let coeffs = plaintext.poly.centered_channel(0)?;
        Ok(self.context.encoder().decode(&coeffs, plaintext.scale)?)
    }

    fn encrypt<R: Rng + ?Sized>(
        &self,
        plaintext: &Plaintext,
        public_key: &PublicKey,
        rng: &mut R,
    ) -> BackendResult<Ciphertext> {
        let basis = self.context.basis_at(plaintext.level)?;
        let channels = basis.channel_count();
        let v = sample_ternary(&self.context, &basis, rng)?.into_evaluation();

        // c0 = b·v + e0 + m
        let mut c0 = public_key.b.clone();
        c0.truncate(channels)?;
        c0 *= &v;
        let mut c0 = c0.into_coefficient();
        c0 += &sample_error(&self.context, &basis, rng)?;
        c0 += &plaintext.poly;

        // c1 = a·v + e1
        let mut c1 = public_key.a.clone();
        c1.truncate(channels)?;
        c1 *= &v;
        let mut c1 = c1.into_coefficient();
        c1 += &sample_error(&self.context, &basis, rng)?;

        Ok(Ciphertext {
            c0,
            c1,
            scale: plaintext.scale,
            level: plaintext.level,
        })
    }

    fn decrypt(&self, ciphertext: &Ciphertext, secret_key: &SecretKey) -> BackendResult<Plaintext> {
        // m = c0 + c1·s
        let mut phase = ciphertext.c1.clone().into_evaluation();
        phase *= &secret_key.restricted(ciphertext.c1.channel_count())?;
        let mut phase = phase.into_coefficient();
        phase += &ciphertext.c0;
        Ok(Plaintext {
            poly: phase,
            scale: ciphertext.scale,
            level: ciphertext.level,
        })
    }

    fn level_of(&self, ciphertext: &Ciphertext) -> usize {
        ciphertext.level
    }

    fn scale_of(&self, ciphertext: &Ciphertext) -> f64 {
        ciphertext.scale
    }

    fn add(&self, a: &Ciphertext, b: &Ciphertext) -> BackendResult<Ciphertext> {
        self.check_pair(a, b.level, b.scale)?;
        let mut out = a.clone();
        out.c0 += &b.c0;
        out.c1 += &b.c1;
        Ok(out)
    }

    fn sub(&self, a: &Ciphertext, b: &Ciphertext) -> BackendResult<Ciphertext> {
        self.check_pair(a, b.level, b.scale)?;
        let mut out = a.clone();
        out.c0 -= &b.c0;
        out.c1 -= &b.c1;
        Ok(out)
    }

    fn negate(&self, ciphertext: &Ciphertext) -> Ciphertext {
        Ciphertext {
            c0: -ciphertext.c0.clone(),
            c1: -ciphertext.c1.clone(),
            scale: ciphertext.scale,
            level: ciphertext.level,
        }
    }

    fn add_plain(&self, ciphertext: &Ciphertext, plaintext: &Plaintext) -> BackendResult<Ciphertext> {
        self.check_pair(ciphertext, plaintext.level, plaintext.scale)?;
        let mut out = ciphertext.clone();
        out.c0 += &plaintext.poly;
        Ok(out)
    }

    fn sub_plain(&self, ciphertext: &Ciphertext, plaintext: &Plaintext) -> BackendResult<Ciphertext> {
        self.check_pair(ciphertext, plaintext.level, plaintext.scale)?;
        let mut out = ciphertext.clone();
        out.c0 -= &plaintext.poly;
        Ok(out)
    }

    fn multiply_plain(
        &self,
        ciphertext: &Ciphertext,
        plaintext: &Plaintext,
    ) -> BackendResult<Ciphertext> {
        self.check_level(ciphertext, plaintext.level)?;
        let m = plaintext.poly.clone().into_evaluation();
        let mut c0 = ciphertext.c0.clone().into_evaluation();
        c0 *= &m;
        let mut c1 = ciphertext.c1.clone().into_evaluation();
        c1 *= &m;
        Ok(Ciphertext {
            c0: c0.into_coefficient(),
            c1: c1.into_coefficient(),
            scale: ciphertext.scale * plaintext.scale,
            level: ciphertext.level,
        })
    }

    fn multiply_cipher(
        &self,
        a: &Ciphertext,
        b: &Ciphertext,
        relin_key: &RelinKey,
    ) -> BackendResult<Ciphertext> {
        self.check_level(a, b.level)?;
        let a0 = a.c0.clone().into_evaluation();
        let a1 = a.c1.clone().into_evaluation();
        let b0 = b.c0.clone().into_evaluation();
        let b1 = b.c1.clone().into_evaluation();

        let mut d0 = a0.clone();
        d0 *= &b0;
        let mut d1 = a0;
        d1 *= &b1;
        let mut cross = a1.clone();
        cross *= &b0;
        d1 += &cross;
        let mut d2 = a1;
        d2 *= &b1;

        let (u0, u1) = relin_key.key.apply(&self.context, &d2.into_coefficient())?;
        let mut c0 = d0.into_coefficient();
        c0 += &u0;
        let mut c1 = d1.into_coefficient();
        c1 += &u1;
        Ok(Ciphertext {
            c0,
            c1,
            scale: a.scale * b.scale,
            level: a.level,
        })
    }

    fn rotate(&self, ciphertext: &Ciphertext, galois_key: &GaloisKey) -> BackendResult<Ciphertext> {
        let expected = self.context.encoder().galois_element(galois_key.offset);
        if expected != galois_key.galois_element {
            return Err(BackendError::WrongGaloisKey {
                expected,
                actual: galois_key.galois_element,
            });
        }
        trace!(offset = galois_key.offset, level = ciphertext.level, "rotate");
        let g = galois_key.galois_element;
        let mut c0 = ciphertext.c0.automorphism(g)?;
        let c1 = ciphertext.c1.automorphism(g)?;
        let (u0, u1) = galois_key.key.apply(&self.context, &c1)?;
        c0 += &u0;
        Ok(Ciphertext {
            c0,
            c1: u1,
            scale: ciphertext.scale,
            level: ciphertext.level,
        })
    }

    fn rescale(&self, ciphertext: &Ciphertext) -> BackendResult<Ciphertext> {
        let expected = self.context.rescale_modulus(ciphertext.level)?;
        let mut c0 = ciphertext.c0.clone();
        let mut c1 = ciphertext.c1.clone();
        let dropped = c0.divide_by_last()?;
        c1.divide_by_last()?;
        debug_assert_eq!(dropped, expected, "channel count out of sync with level");
        Ok(Ciphertext {
            c0,
            c1,
            scale: ciphertext.scale / dropped as f64,
            level: ciphertext.level + 1,
        })
    }

    fn mod_drop(&self, ciphertext: &Ciphertext, level: usize) -> BackendResult<Ciphertext> {
        if level < ciphertext.level || level > self.context.depth() {
            return Err(BackendError::InvalidModDrop {
                from: ciphertext.level,
                to: level,
            });
        }
        let channels = self.context.channels_at(level);
        let mut out = ciphertext.clone();
        out.c0.truncate(channels)?;
        out.c1.truncate(channels)?;
        out.level = level;
        Ok(out)
    }

    fn with_scale(&self, ciphertext: &Ciphertext, scale: f64) -> Ciphertext {
        Ciphertext {
            scale,
            ..ciphertext.clone()
        }
    }
}
