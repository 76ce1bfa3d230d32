//! Encrypted neural-network inference over leveled RNS-CKKS.
//!
//! A model is described as a list of [`Layer`]s, packed once into a
//! [`Pipeline`] against a [`Context`], and evaluated on encrypted inputs.
//! Everything homomorphic goes through the [`HeBackend`] trait; the bundled
//! [`CkksBackend`] is the default implementation.

pub mod backend;
pub mod ciphertext;
pub mod codec;
pub mod context;
pub mod crypto;
pub mod encoding;
pub mod errors;
pub mod keys;
pub mod logger;
pub mod math;
pub mod ops;
pub mod params;
pub mod pipeline;
pub mod rings;

pub use backend::{BackendError, HeBackend};
pub use ciphertext::Ciphertext;
pub use codec::{Kernel, Matrix, PackedPlaintext, SlotLayout, argmax, pack, unpack};
pub use context::Context;
pub use crypto::CkksBackend;
pub use errors::{EngineError, EngineResult, KeyGenError, ParameterError};
pub use keys::{
    EvaluationKeys, KeyPair, MultKey, RotationKeySet, generate_evaluation_keys, generate_keys,
    generate_multiplication_key, generate_rotation_keys,
};
pub use ops::{Activation, ActivationKind, Conv2D, Gemm, Operator};
pub use params::{Parameters, ParametersBuilder, SecurityLevel, plan};
pub use pipeline::{Inference, Layer, Pipeline, build_pipeline};
