//! Bundled RNS-CKKS backend.
//!
//! [`CkksContext`] holds the modulus chain and per-prime precomputation,
//! [`keys`] the key material, and [`CkksBackend`] implements
//! [`crate::backend::HeBackend`] on top of both.

pub mod context;
pub mod engine;
pub mod keys;
pub mod types;

pub use context::CkksContext;
pub use engine::CkksBackend;
pub use keys::{GaloisKey, PublicKey, RelinKey, SecretKey, SwitchingKey};
pub use types::{Ciphertext, Plaintext};
