//! Binary persistence of parameters, keys and ciphertexts (`serde` + `bincode`).
//!
//! Polynomials are written with their moduli and rebound to the loading
//! context's NTT tables, so an artifact only loads into a context built from
//! the same parameters.

use std::io::{Read, Write};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::BackendError;
use crate::ciphertext::Ciphertext;
use crate::codec::SlotLayout;
use crate::context::Context;
use crate::crypto::{
    self, CkksBackend, CkksContext, GaloisKey, PublicKey, RelinKey, SecretKey, SwitchingKey,
};
use crate::params::Parameters;
use crate::rings::{Domain, RingError, RnsBasis, RnsPoly};

use super::{KeyPair, MultKey, RotationKeySet};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("encoding failed: {0}")]
    Codec(#[from] bincode::Error),

    #[error("modulus {modulus} does not belong to this context")]
    ContextMismatch { modulus: u64 },

    #[error("ring dimension {actual} does not match the context's {expected}")]
    DegreeMismatch { expected: usize, actual: usize },

    #[error("malformed artifact: {0}")]
    Malformed(String),

    #[error("ring error: {0}")]
    Ring(#[from] RingError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

pub type PersistResult<T> = Result<T, PersistError>;

/// Artifacts that can be written out and rebound to a context on load.
pub trait Persist: Sized {
    type Wire: Serialize + DeserializeOwned;

    fn to_wire(&self) -> Self::Wire;

    fn from_wire(wire: Self::Wire, context: &Arc<CkksContext>) -> PersistResult<Self>;
}

pub fn persist<T: Persist, W: Write>(artifact: &T, writer: W) -> PersistResult<()> {
    bincode::serialize_into(writer, &artifact.to_wire())?;
    Ok(())
}

pub fn load<T: Persist, R: Read>(reader: R, context: &Context<CkksBackend>) -> PersistResult<T> {
    let wire: T::Wire = bincode::deserialize_from(reader)?;
    T::from_wire(wire, context.backend().context())
}

/// A context is persisted as the parameters it was built from.
pub fn persist_parameters<W: Write>(parameters: &Parameters, writer: W) -> PersistResult<()> {
    bincode::serialize_into(writer, parameters)?;
    Ok(())
}

pub fn load_parameters<R: Read>(reader: R) -> PersistResult<Parameters> {
    Ok(bincode::deserialize_from(reader)?)
}

// ─── Wire formats ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolyWire {
    degree: usize,
    moduli: Vec<u64>,
    residues: Vec<Vec<u64>>,
    evaluation: bool,
}

impl PolyWire {
    fn from_poly(poly: &RnsPoly) -> Self {
        Self {
            degree: poly.degree(),
            moduli: poly.moduli(),
            residues: (0..poly.channel_count())
                .map(|ch| poly.residues(ch).to_vec())
                .collect(),
            evaluation: poly.domain() == Domain::Evaluation,
        }
    }

    fn into_poly(self, context: &CkksContext) -> PersistResult<RnsPoly> {
        if self.degree != context.degree() {
            return Err(PersistError::DegreeMismatch {
                expected: context.degree(),
                actual: self.degree,
            });
        }
        let tables = self
            .moduli
            .iter()
            .map(|&modulus| {
                context
                    .table_for(modulus)
                    .ok_or(PersistError::ContextMismatch { modulus })
            })
            .collect::<PersistResult<Vec<_>>>()?;
        let basis = RnsBasis::new(tables)?;
        let domain = if self.evaluation {
            Domain::Evaluation
        } else {
            Domain::Coefficient
        };
        Ok(RnsPoly::from_residues(self.residues, &basis, domain)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchingKeyWire {
    digits: Vec<(PolyWire, PolyWire)>,
}

impl SwitchingKeyWire {
    fn from_key(key: &SwitchingKey) -> Self {
        Self {
            digits: key
                .digits
                .iter()
                .map(|(b, a)| (PolyWire::from_poly(b), PolyWire::from_poly(a)))
                .collect(),
        }
    }

    fn into_key(self, context: &CkksContext) -> PersistResult<SwitchingKey> {
        if self.digits.len() != context.moduli().len() {
            return Err(PersistError::Malformed(format!(
                "switching key has {} digits, chain has {} primes",
                self.digits.len(),
                context.moduli().len()
            )));
        }
        let digits = self
            .digits
            .into_iter()
            .map(|(b, a)| Ok((b.into_poly(context)?, a.into_poly(context)?)))
            .collect::<PersistResult<Vec<_>>>()?;
        Ok(SwitchingKey { digits })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretKeyWire {
    coeffs: Vec<i64>,
}

impl Persist for SecretKey {
    type Wire = SecretKeyWire;

    fn to_wire(&self) -> SecretKeyWire {
        SecretKeyWire {
            coeffs: self.coeffs.clone(),
        }
    }

    fn from_wire(wire: SecretKeyWire, context: &Arc<CkksContext>) -> PersistResult<Self> {
        if wire.coeffs.len() != context.degree() {
            return Err(PersistError::DegreeMismatch {
                expected: context.degree(),
                actual: wire.coeffs.len(),
            });
        }
        if wire.coeffs.iter().any(|c| !(-1..=1).contains(c)) {
            return Err(PersistError::Malformed("secret key is not ternary".into()));
        }
        Ok(SecretKey::from_coefficients(context, wire.coeffs)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyWire {
    b: PolyWire,
    a: PolyWire,
}

impl Persist for PublicKey {
    type Wire = PublicKeyWire;

    fn to_wire(&self) -> PublicKeyWire {
        PublicKeyWire {
            b: PolyWire::from_poly(&self.b),
            a: PolyWire::from_poly(&self.a),
        }
    }

    fn from_wire(wire: PublicKeyWire, context: &Arc<CkksContext>) -> PersistResult<Self> {
        Ok(PublicKey {
            b: wire.b.into_poly(context)?,
            a: wire.a.into_poly(context)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPairWire {
    public_key: PublicKeyWire,
    private_key: SecretKeyWire,
}

impl Persist for KeyPair<CkksBackend> {
    type Wire = KeyPairWire;

    fn to_wire(&self) -> KeyPairWire {
        KeyPairWire {
            public_key: self.public_key.to_wire(),
            private_key: self.private_key.to_wire(),
        }
    }

    fn from_wire(wire: KeyPairWire, context: &Arc<CkksContext>) -> PersistResult<Self> {
        Ok(KeyPair {
            public_key: PublicKey::from_wire(wire.public_key, context)?,
            private_key: SecretKey::from_wire(wire.private_key, context)?,
        })
    }
}

impl Persist for MultKey<CkksBackend> {
    type Wire = SwitchingKeyWire;

    fn to_wire(&self) -> SwitchingKeyWire {
        SwitchingKeyWire::from_key(&self.key().key)
    }

    fn from_wire(wire: SwitchingKeyWire, context: &Arc<CkksContext>) -> PersistResult<Self> {
        Ok(MultKey::new(RelinKey {
            key: wire.into_key(context)?,
        }))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationKeySetWire {
    batch: usize,
    keys: Vec<(usize, usize, SwitchingKeyWire)>,
}

impl Persist for RotationKeySet<CkksBackend> {
    type Wire = RotationKeySetWire;

    fn to_wire(&self) -> RotationKeySetWire {
        RotationKeySetWire {
            batch: self.batch(),
            keys: self
                .iter()
                .map(|(offset, key)| {
                    (
                        offset,
                        key.galois_element,
                        SwitchingKeyWire::from_key(&key.key),
                    )
                })
                .collect(),
        }
    }

    fn from_wire(wire: RotationKeySetWire, context: &Arc<CkksContext>) -> PersistResult<Self> {
        let batch = context.parameters().batch_size();
        if wire.batch != batch {
            return Err(PersistError::Malformed(format!(
                "rotation keys were made for batch {}, context has {batch}",
                wire.batch
            )));
        }
        let mut set = RotationKeySet::new(batch);
        for (offset, galois_element, key) in wire.keys {
            if offset == 0
                || offset >= batch
                || context.encoder().galois_element(offset) != galois_element
            {
                return Err(PersistError::Malformed(format!(
                    "rotation key for offset {offset} carries Galois element {galois_element}"
                )));
            }
            set.insert(
                offset,
                GaloisKey {
                    offset,
                    galois_element,
                    key: key.into_key(context)?,
                },
            );
        }
        Ok(set)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiphertextWire {
    c0: PolyWire,
    c1: PolyWire,
    scale: f64,
    level: usize,
    layout: SlotLayout,
}

impl Persist for Ciphertext<CkksBackend> {
    type Wire = CiphertextWire;

    fn to_wire(&self) -> CiphertextWire {
        let inner = self.inner();
        CiphertextWire {
            c0: PolyWire::from_poly(&inner.c0),
            c1: PolyWire::from_poly(&inner.c1),
            scale: inner.scale,
            level: inner.level,
            layout: *self.layout(),
        }
    }

    fn from_wire(wire: CiphertextWire, context: &Arc<CkksContext>) -> PersistResult<Self> {
        let c0 = wire.c0.into_poly(context)?;
        let c1 = wire.c1.into_poly(context)?;
        if wire.level > context.depth()
            || c0.moduli() != c1.moduli()
            || c0.channel_count() != context.channels_at(wire.level)
        {
            return Err(PersistError::Malformed(format!(
                "ciphertext at level {} carries {} primes",
                wire.level,
                c0.channel_count()
            )));
        }
        let backend = CkksBackend::new(context.clone());
        let inner = crypto::Ciphertext {
            c0,
            c1,
            scale: wire.scale,
            level: wire.level,
        };
        Ok(Ciphertext::new(&backend, inner, wire.layout))
    }
}
