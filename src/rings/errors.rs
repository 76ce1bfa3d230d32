use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RingError {
    #[error("ring degree must be a power of two, got {degree}")]
    InvalidDegree { degree: usize },
    #[error("RNS basis must contain at least one modulus")]
    EmptyBasis,
    #[error("modulus {modulus} is not NTT-friendly for degree {degree}")]
    NonNttFriendlyModulus { modulus: u64, degree: usize },
    #[error("cannot drop {drop_count} of {channel_count} channels")]
    InvalidModDrop {
        drop_count: usize,
        channel_count: usize,
    },
    #[error("expected {expected} residues per channel, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("residue {residue} is not reduced modulo {modulus}")]
    NonReducedResidue { residue: u64, modulus: u64 },
    #[error("Galois element {element} is not odd modulo {order}")]
    InvalidGaloisElement { element: usize, order: usize },
    #[error("operation requires the {expected} domain")]
    WrongDomain { expected: &'static str },
    #[error("standard deviation must be finite and positive, got {std_dev}")]
    InvalidStdDev { std_dev: f64 },
    #[error("hamming weight {weight} exceeds ring degree {degree}")]
    InvalidHammingWeight { weight: usize, degree: usize },
}

pub type RingResult<T> = Result<T, RingError>;
