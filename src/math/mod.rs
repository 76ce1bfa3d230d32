pub mod primes;
pub mod sampling;

pub use primes::{ChainRequest, ModulusChain, is_ntt_friendly_prime, is_prime};
pub use sampling::{gaussian_coefficients, ternary_coefficients, uniform_residues};
