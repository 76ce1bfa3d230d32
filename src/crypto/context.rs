use std::sync::Arc;

use tracing::debug;

use crate::backend::{BackendError, BackendResult};
use crate::encoding::SlotEncoder;
use crate::math::ModulusChain;
use crate::params::Parameters;
use crate::rings::{NttTable, RnsBasis};

/// Precomputation shared by every key and ciphertext of one parameter set.
///
/// Holds the NTT tables for `q_0 … q_D` and the special prime `P`, the slot
/// encoder and the canonical scale of every level.
#[derive(Debug)]
pub struct CkksContext {
    parameters: Parameters,
    chain: ModulusChain,
    ciphertext_basis: RnsBasis,
    key_basis: RnsBasis,
    special: Arc<NttTable>,
    encoder: SlotEncoder,
    scales: Vec<f64>,
}

impl CkksContext {
    pub fn new(parameters: &Parameters) -> BackendResult<Self> {
        let chain = parameters.modulus_chain()?;
        let degree = parameters.ring_dimension();
        let ciphertext_basis = RnsBasis::from_moduli(&chain.moduli, degree)?;
        let special = Arc::new(NttTable::new(chain.special, degree)?);
        let key_basis = ciphertext_basis.extended(special.clone());
        let encoder = SlotEncoder::new(degree, parameters.batch_size())?;

        // Dropping q_{D-l} at level l: S_{l+1} = S_l^2 / q_{D-l}.
        let depth = parameters.depth();
        let mut scales = Vec::with_capacity(depth + 1);
        let mut scale = parameters.default_scale();
        scales.push(scale);
        for level in 0..depth {
            scale = scale * scale / chain.moduli[depth - level] as f64;
            scales.push(scale);
        }

        debug!(
            ring_dimension = degree,
            depth,
            log_qp = chain.log_qp(),
            special = chain.special,
            "built CKKS context"
        );

        Ok(Self {
            parameters: parameters.clone(),
            chain,
            ciphertext_basis,
            key_basis,
            special,
            encoder,
            scales,
        })
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn degree(&self) -> usize {
        self.parameters.ring_dimension()
    }

    pub fn depth(&self) -> usize {
        self.parameters.depth()
    }

    pub fn moduli(&self) -> &[u64] {
        &self.chain.moduli
    }

    pub fn special_modulus(&self) -> u64 {
        self.chain.special
    }

    pub fn encoder(&self) -> &SlotEncoder {
        &self.encoder
    }

    fn check_level(&self, level: usize) -> BackendResult<()> {
        if level > self.depth() {
            return Err(BackendError::InvalidLevel {
                level,
                depth: self.depth(),
            });
        }
        Ok(())
    }

    /// Number of RNS channels a ciphertext at `level` carries.
    pub fn channels_at(&self, level: usize) -> usize {
        self.depth() + 1 - level.min(self.depth())
    }

    /// Level of a ciphertext carrying `channels` primes.
    pub fn level_for_channels(&self, channels: usize) -> usize {
        self.depth() + 1 - channels
    }

    /// `q_0 … q_{D-level}`.
    pub fn basis_at(&self, level: usize) -> BackendResult<RnsBasis> {
        self.check_level(level)?;
        Ok(self.ciphertext_basis.prefix(self.channels_at(level))?)
    }

    /// `q_0 … q_D, P`, the basis key-switching material is stored over.
    pub fn key_basis(&self) -> &RnsBasis {
        &self.key_basis
    }

    /// `q_0 … q_{channels-1}, P`, the basis one key switch runs in.
    pub fn switching_basis(&self, channels: usize) -> BackendResult<RnsBasis> {
        Ok(self
            .ciphertext_basis
            .prefix(channels)?
            .extended(self.special.clone()))
    }

    pub fn canonical_scale(&self, level: usize) -> f64 {
        self.scales[level.min(self.depth())]
    }

    pub fn rescale_modulus(&self, level: usize) -> BackendResult<u64> {
        if level >= self.depth() {
            return Err(BackendError::InvalidLevel {
                level,
                depth: self.depth(),
            });
        }
        Ok(self.chain.moduli[self.depth() - level])
    }

    /// The shared table for `modulus`, if it belongs to this context.
    pub fn table_for(&self, modulus: u64) -> Option<Arc<NttTable>> {
        self.key_basis
            .tables()
            .iter()
            .find(|t| t.modulus() == modulus)
            .cloned()
    }
}
