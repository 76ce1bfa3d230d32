use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::Rng;
use tracing::info;

use crate::backend::HeBackend;
use crate::ciphertext::Ciphertext;
use crate::codec::PackedPlaintext;
use crate::crypto::CkksBackend;
use crate::errors::{EngineResult, KeyGenError};
use crate::params::{Parameters, SecurityLevel, plan};

/// Engine-level context: the backend built for one parameter set plus the
/// one-shot key generation latch.
///
/// Share it by reference or `Arc`; everything except the latch is immutable.
pub struct Context<B: HeBackend = CkksBackend> {
    backend: B,
    keys_issued: AtomicBool,
}

impl<B: HeBackend> Context<B> {
    pub fn new(parameters: &Parameters) -> EngineResult<Self> {
        let backend = B::from_parameters(parameters)?;
        info!(
            ring_dimension = parameters.ring_dimension(),
            depth = parameters.depth(),
            batch = parameters.batch_size(),
            "context ready"
        );
        Ok(Self::with_backend(backend))
    }

    /// Plans parameters and builds the context in one go.
    pub fn plan(
        depth_required: usize,
        precision_bits: u32,
        slot_count: usize,
        security: SecurityLevel,
    ) -> EngineResult<Self> {
        Self::new(&plan(depth_required, precision_bits, slot_count, security)?)
    }

    pub fn with_backend(backend: B) -> Self {
        Self {
            backend,
            keys_issued: AtomicBool::new(false),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn parameters(&self) -> &Parameters {
        self.backend.parameters()
    }

    /// Depth budget `D`.
    pub fn depth(&self) -> usize {
        self.backend.max_level()
    }

    pub fn batch_size(&self) -> usize {
        self.backend.batch_size()
    }

    pub fn keys_generated(&self) -> bool {
        self.keys_issued.load(Ordering::Acquire)
    }

    /// Flips the latch; only the first caller succeeds.
    pub(crate) fn claim_key_generation(&self) -> Result<(), KeyGenError> {
        self.keys_issued
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| KeyGenError::AlreadyGenerated)
    }

    /// Encodes `packed` at its scale on level 0 and encrypts it.
    pub fn encrypt<R: Rng + ?Sized>(
        &self,
        packed: &PackedPlaintext,
        public_key: &B::PublicKey,
        rng: &mut R,
    ) -> EngineResult<Ciphertext<B>> {
        let plaintext = self.backend.encode(&packed.values, packed.scale, 0)?;
        let inner = self.backend.encrypt(&plaintext, public_key, rng)?;
        Ok(Ciphertext::new(&self.backend, inner, packed.layout))
    }

    /// Decrypts to all `batch_size` slot values.
    pub fn decrypt(
        &self,
        ciphertext: &Ciphertext<B>,
        secret_key: &B::SecretKey,
    ) -> EngineResult<Vec<f64>> {
        let plaintext = self.backend.decrypt(ciphertext.inner(), secret_key)?;
        Ok(self.backend.decode(&plaintext)?)
    }
}

impl<B: HeBackend + fmt::Debug> fmt::Debug for Context<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("backend", &self.backend)
            .field("keys_issued", &self.keys_generated())
            .finish()
    }
}
