use thiserror::Error;

use crate::backend::BackendError;
use crate::keys::PersistError;

/// Infeasible or malformed parameter requests. Fatal at setup.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParameterError {
    #[error(
        "depth {depth} needs {log_qp} modulus bits, more than {security:?} allows at ring dimension {max_ring}"
    )]
    DepthCeiling {
        depth: usize,
        log_qp: u32,
        security: crate::params::SecurityLevel,
        max_ring: usize,
    },
    #[error("slot count {slots} must be a power of two no larger than {max}")]
    InvalidSlotCount { slots: usize, max: usize },
    #[error("ring dimension {0} must be a power of two between 8 and 65536")]
    InvalidRingDimension(usize),
    #[error("{name} of {bits} bits is outside [{min}, {max}]")]
    InvalidPrecision {
        name: &'static str,
        bits: u32,
        min: u32,
        max: u32,
    },
    #[error("ring dimension {ring_dimension} is below the {security:?} minimum for {log_qp} modulus bits")]
    Insecure {
        ring_dimension: usize,
        log_qp: u32,
        security: crate::params::SecurityLevel,
    },
    #[error("ran out of NTT-friendly {bits}-bit primes for ring dimension {ring_dimension}")]
    PrimeSearch { bits: u32, ring_dimension: usize },
    #[error("invalid noise setting: {0}")]
    InvalidNoise(String),
    #[error("secret of hamming weight {weight} is too sparse for {security:?}; need at least {minimum}")]
    SparseSecret {
        weight: usize,
        minimum: usize,
        security: crate::params::SecurityLevel,
    },
}

/// Misuse of the key lifecycle. Fatal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyGenError {
    #[error("keys were already generated for this context; create a new context to regenerate")]
    AlreadyGenerated,
}

/// Everything the engine can surface to a caller.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("parameter error: {0}")]
    Parameter(#[from] ParameterError),

    #[error("key generation error: {0}")]
    KeyGen(#[from] KeyGenError),

    #[error("no rotation key provisioned for slot offset {offset}")]
    MissingRotationKey { offset: i64 },

    #[error("layout mismatch: {0}")]
    Layout(String),

    #[error("depth exhausted: level {level} + cost {cost} exceeds budget {budget}")]
    DepthExhausted {
        level: usize,
        cost: usize,
        budget: usize,
    },

    #[error("tensor of length {len} exceeds slot capacity {capacity}")]
    Capacity { len: usize, capacity: usize },

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("invalid pipeline transition from {from} to {to}")]
    InvalidTransition { from: String, to: &'static str },

    #[error("layer {index} ({operator}) failed: {source}")]
    Layer {
        index: usize,
        operator: &'static str,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    pub fn layout(message: impl Into<String>) -> Self {
        Self::Layout(message.into())
    }

    pub(crate) fn at_layer(self, index: usize, operator: &'static str) -> Self {
        Self::Layer {
            index,
            operator,
            source: Box::new(self),
        }
    }

    /// Index of the failing layer, if the error came out of a pipeline.
    pub fn layer_index(&self) -> Option<usize> {
        match self {
            Self::Layer { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// The underlying error with any layer wrapping stripped.
    pub fn root(&self) -> &EngineError {
        match self {
            Self::Layer { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
