//! The capability contract the inference engine consumes.
//!
//! Everything the engine does to a ciphertext goes through [`HeBackend`]. The
//! crate ships one implementation, [`crate::crypto::CkksBackend`]; another
//! scheme library can be plugged in by implementing this trait.

use std::fmt::Debug;

use rand::Rng;
use thiserror::Error;

use crate::encoding::EncodingError;
use crate::errors::ParameterError;
use crate::params::Parameters;
use crate::rings::RingError;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BackendError {
    #[error("Scale mismatch: expected {expected:.6e}, got {actual:.6e}")]
    ScaleMismatch { expected: f64, actual: f64 },

    #[error("Level mismatch: expected {expected}, got {actual}")]
    LevelMismatch { expected: usize, actual: usize },

    #[error("level {level} is outside the chain of depth {depth}")]
    InvalidLevel { level: usize, depth: usize },

    #[error("cannot mod-drop from level {from} down to level {to}")]
    InvalidModDrop { from: usize, to: usize },

    #[error("rotation key for Galois element {expected} used for element {actual}")]
    WrongGaloisKey { expected: usize, actual: usize },

    #[error("Invalid parameter: {0}")]
    Parameters(#[from] ParameterError),

    #[error("Encoding failed: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Ring arithmetic failed: {0}")]
    Ring(#[from] RingError),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Leveled, SIMD-packed approximate HE scheme.
///
/// Levels count consumed rescales: fresh ciphertexts sit at level `0` and a
/// ciphertext at level [`HeBackend::max_level`] cannot be rescaled again.
/// Multiplications never rescale on their own.
pub trait HeBackend: Sized + Send + Sync {
    type Plaintext: Clone + Debug + Send + Sync;
    type Ciphertext: Clone + Debug + Send + Sync;
    type SecretKey: Debug + Send + Sync;
    type PublicKey: Debug + Send + Sync;
    type RelinKey: Debug + Send + Sync;
    type GaloisKey: Debug + Send + Sync;

    fn from_parameters(parameters: &Parameters) -> BackendResult<Self>;

    fn parameters(&self) -> &Parameters;

    /// `q_0 … q_D`, the primes a fresh ciphertext lives on.
    fn modulus_chain(&self) -> &[u64];

    fn max_level(&self) -> usize {
        self.parameters().depth()
    }

    fn batch_size(&self) -> usize {
        self.parameters().batch_size()
    }

    /// Scale a ciphertext at `level` is expected to carry.
    fn canonical_scale(&self, level: usize) -> f64;

    /// Prime removed when rescaling a ciphertext at `level`.
    fn rescale_modulus(&self, level: usize) -> BackendResult<u64>;

    // ─── Key generation ──────────────────────────────────────────────────────

    fn generate_secret_key<R: Rng + ?Sized>(&self, rng: &mut R) -> BackendResult<Self::SecretKey>;

    fn generate_public_key<R: Rng + ?Sized>(
        &self,
        secret_key: &Self::SecretKey,
        rng: &mut R,
    ) -> BackendResult<Self::PublicKey>;

    fn generate_relin_key<R: Rng + ?Sized>(
        &self,
        secret_key: &Self::SecretKey,
        rng: &mut R,
    ) -> BackendResult<Self::RelinKey>;

    /// Key for a left rotation by `offset` slots, `offset < batch_size`.
    fn generate_galois_key<R: Rng + ?Sized>(
        &self,
        secret_key: &Self::SecretKey,
        offset: usize,
        rng: &mut R,
    ) -> BackendResult<Self::GaloisKey>;

    // ─── Encoding and encryption ────────────────────────────────────────────

    fn encode(&self, values: &[f64], scale: f64, level: usize) -> BackendResult<Self::Plaintext>;

    /// All `batch_size` slot values of a plaintext.
    fn decode(&self, plaintext: &Self::Plaintext) -> BackendResult<Vec<f64>>;

    fn encrypt<R: Rng + ?Sized>(
        &self,
        plaintext: &Self::Plaintext,
        public_key: &Self::PublicKey,
        rng: &mut R,
    ) -> BackendResult<Self::Ciphertext>;

    fn decrypt(
        &self,
        ciphertext: &Self::Ciphertext,
        secret_key: &Self::SecretKey,
    ) -> BackendResult<Self::Plaintext>;

    // ─── Evaluation ─────────────────────────────────────────────────────────

    fn level_of(&self, ciphertext: &Self::Ciphertext) -> usize;

    fn scale_of(&self, ciphertext: &Self::Ciphertext) -> f64;

    fn add(&self, a: &Self::Ciphertext, b: &Self::Ciphertext) -> BackendResult<Self::Ciphertext>;

    fn sub(&self, a: &Self::Ciphertext, b: &Self::Ciphertext) -> BackendResult<Self::Ciphertext>;

    fn negate(&self, ciphertext: &Self::Ciphertext) -> Self::Ciphertext;

    fn add_plain(
        &self,
        ciphertext: &Self::Ciphertext,
        plaintext: &Self::Plaintext,
    ) -> BackendResult<Self::Ciphertext>;

    fn sub_plain(
        &self,
        ciphertext: &Self::Ciphertext,
        plaintext: &Self::Plaintext,
    ) -> BackendResult<Self::Ciphertext>;

    /// Product with a plaintext at the same level; scales multiply.
    fn multiply_plain(
        &self,
        ciphertext: &Self::Ciphertext,
        plaintext: &Self::Plaintext,
    ) -> BackendResult<Self::Ciphertext>;

    /// Relinearized product of two ciphertexts at the same level; scales multiply.
    fn multiply_cipher(
        &self,
        a: &Self::Ciphertext,
        b: &Self::Ciphertext,
        relin_key: &Self::RelinKey,
    ) -> BackendResult<Self::Ciphertext>;

    /// Cyclic left rotation of the batch by the key's offset.
    fn rotate(
        &self,
        ciphertext: &Self::Ciphertext,
        galois_key: &Self::GaloisKey,
    ) -> BackendResult<Self::Ciphertext>;

    /// Divides by [`HeBackend::rescale_modulus`] and moves one level down the chain.
    fn rescale(&self, ciphertext: &Self::Ciphertext) -> BackendResult<Self::Ciphertext>;

    /// Drops primes until the ciphertext sits at `level`; the scale is unchanged.
    fn mod_drop(&self, ciphertext: &Self::Ciphertext, level: usize)
    -> BackendResult<Self::Ciphertext>;

    /// Reinterprets the ciphertext at a different scale, multiplying the
    /// represented values by `old_scale / scale` at no cost.
    fn with_scale(&self, ciphertext: &Self::Ciphertext, scale: f64) -> Self::Ciphertext;
}

/// Relative tolerance for treating two scales as equal.
pub const SCALE_TOLERANCE: f64 = 1e-9;

pub fn scales_match(a: f64, b: f64) -> bool {
    (a - b).abs() <= SCALE_TOLERANCE * a.abs().max(b.abs())
}
