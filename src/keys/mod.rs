//! Key Manager: one-shot key pair generation and the public evaluation keys
//! derived from it.
//!
//! Key material is always passed explicitly; the only shared state is the
//! latch on [`Context`] that makes [`generate_keys`] one-shot.

pub mod persist;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use rand::Rng;
use tracing::{debug, info};

use crate::backend::HeBackend;
use crate::context::Context;
use crate::crypto::CkksBackend;
use crate::errors::{EngineError, EngineResult};

pub use persist::{Persist, PersistError, load, load_parameters, persist, persist_parameters};

/// Public/private key pair produced once per [`Context`].
pub struct KeyPair<B: HeBackend = CkksBackend> {
    pub public_key: B::PublicKey,
    pub private_key: B::SecretKey,
}

impl<B: HeBackend> fmt::Debug for KeyPair<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Relinearization key for ciphertext-ciphertext products.
pub struct MultKey<B: HeBackend = CkksBackend> {
    key: B::RelinKey,
}

impl<B: HeBackend> MultKey<B> {
    pub fn new(key: B::RelinKey) -> Self {
        Self { key }
    }

    pub fn key(&self) -> &B::RelinKey {
        &self.key
    }
}

impl<B: HeBackend> fmt::Debug for MultKey<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultKey").finish_non_exhaustive()
    }
}

/// Galois keys indexed by slot offset, normalised modulo the batch size.
pub struct RotationKeySet<B: HeBackend = CkksBackend> {
    batch: usize,
    keys: BTreeMap<usize, B::GaloisKey>,
}

impl<B: HeBackend> RotationKeySet<B> {
    pub fn new(batch: usize) -> Self {
        Self {
            batch,
            keys: BTreeMap::new(),
        }
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn normalize(&self, offset: i64) -> usize {
        offset.rem_euclid(self.batch as i64) as usize
    }

    pub(crate) fn insert(&mut self, offset: usize, key: B::GaloisKey) {
        self.keys.insert(offset % self.batch, key);
    }

    /// The provisioned offsets, each in `1..batch`.
    pub fn offsets(&self) -> BTreeSet<i64> {
        self.keys.keys().map(|&k| k as i64).collect()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Offset `0` never needs a key and is always covered.
    pub fn contains(&self, offset: i64) -> bool {
        let k = self.normalize(offset);
        k == 0 || self.keys.contains_key(&k)
    }

    pub fn get(&self, offset: i64) -> EngineResult<&B::GaloisKey> {
        self.keys
            .get(&self.normalize(offset))
            .ok_or(EngineError::MissingRotationKey { offset })
    }

    /// Fails with the first offset in `required` that has no key.
    pub fn ensure_covers(&self, required: &BTreeSet<i64>) -> EngineResult<()> {
        match required.iter().find(|&&k| !self.contains(k)) {
            Some(&offset) => Err(EngineError::MissingRotationKey { offset }),
            None => Ok(()),
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &B::GaloisKey)> {
        self.keys.iter().map(|(&k, v)| (k, v))
    }
}

impl<B: HeBackend> fmt::Debug for RotationKeySet<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RotationKeySet")
            .field("batch", &self.batch)
            .field("offsets", &self.offsets())
            .finish()
    }
}

/// The public key material operators are allowed to see.
pub struct EvaluationKeys<B: HeBackend = CkksBackend> {
    pub mult: MultKey<B>,
    pub rotations: RotationKeySet<B>,
}

impl<B: HeBackend> fmt::Debug for EvaluationKeys<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvaluationKeys")
            .field("mult", &self.mult)
            .field("rotations", &self.rotations)
            .finish()
    }
}

/// Generates the key pair for `context`. A second call on the same context
/// fails with [`crate::errors::KeyGenError::AlreadyGenerated`].
pub fn generate_keys<B, R>(context: &Context<B>, rng: &mut R) -> EngineResult<KeyPair<B>>
where
    B: HeBackend,
    R: Rng + ?Sized,
{
    context.claim_key_generation()?;
    let backend = context.backend();
    let private_key = backend.generate_secret_key(rng)?;
    let public_key = backend.generate_public_key(&private_key, rng)?;
    info!("generated key pair");
    Ok(KeyPair {
        public_key,
        private_key,
    })
}

pub fn generate_multiplication_key<B, R>(
    context: &Context<B>,
    private_key: &B::SecretKey,
    rng: &mut R,
) -> EngineResult<MultKey<B>>
where
    B: HeBackend,
    R: Rng + ?Sized,
{
    let key = context.backend().generate_relin_key(private_key, rng)?;
    debug!("generated multiplication key");
    Ok(MultKey::new(key))
}

/// One Galois key per distinct non-zero offset after normalisation.
pub fn generate_rotation_keys<B, R>(
    context: &Context<B>,
    private_key: &B::SecretKey,
    offsets: &BTreeSet<i64>,
    rng: &mut R,
) -> EngineResult<RotationKeySet<B>>
where
    B: HeBackend,
    R: Rng + ?Sized,
{
    let mut set = RotationKeySet::new(context.batch_size());
    let normalized: BTreeSet<usize> = offsets
        .iter()
        .map(|&k| set.normalize(k))
        .filter(|&k| k != 0)
        .collect();
    for offset in normalized {
        let key = context
            .backend()
            .generate_galois_key(private_key, offset, rng)?;
        set.insert(offset, key);
    }
    debug!(count = set.len(), offsets = ?set.offsets(), "generated rotation keys");
    Ok(set)
}

pub fn generate_evaluation_keys<B, R>(
    context: &Context<B>,
    private_key: &B::SecretKey,
    offsets: &BTreeSet<i64>,
    rng: &mut R,
) -> EngineResult<EvaluationKeys<B>>
where
    B: HeBackend,
    R: Rng + ?Sized,
{
    Ok(EvaluationKeys {
        mult: generate_multiplication_key(context, private_key, rng)?,
        rotations: generate_rotation_keys(context, private_key, offsets, rng)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::KeyGenError;
    use crate::params::SecurityLevel;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn context() -> Context {
        Context::plan(1, 30, 8, SecurityLevel::NotSet).unwrap()
    }

    #[test]
    fn key_generation_is_one_shot() {
        let ctx = context();
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        generate_keys(&ctx, &mut rng).unwrap();
        let err = generate_keys(&ctx, &mut rng).unwrap_err();
        assert!(matches!(err, EngineError::KeyGen(KeyGenError::AlreadyGenerated)));
    }

    #[test]
    fn rotation_offsets_are_normalised() {
        let ctx = context();
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let keys = generate_keys(&ctx, &mut rng).unwrap();
        let requested: BTreeSet<i64> = [-1, 7, 0, 8, 3].into_iter().collect();
        let set = generate_rotation_keys(&ctx, &keys.private_key, &requested, &mut rng).unwrap();
        assert_eq!(set.offsets(), [3, 7].into_iter().collect());
        assert!(set.get(-1).is_ok());
        assert!(set.contains(0));
        assert!(matches!(
            set.get(2),
            Err(EngineError::MissingRotationKey { offset: 2 })
        ));
        let wanted: BTreeSet<i64> = [3, 5].into_iter().collect();
        assert!(matches!(
            set.ensure_covers(&wanted),
            Err(EngineError::MissingRotationKey { offset: 5 })
        ));
    }

    #[test]
    fn evaluation_keys_bundle_both_kinds() {
        let ctx = context();
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let keys = generate_keys(&ctx, &mut rng).unwrap();
        let offsets: BTreeSet<i64> = [1].into_iter().collect();
        let eval = generate_evaluation_keys(&ctx, &keys.private_key, &offsets, &mut rng).unwrap();
        assert_eq!(eval.rotations.len(), 1);
        assert_eq!(eval.rotations.batch(), 8);
    }
}
