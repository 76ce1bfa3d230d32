use crate::rings::RnsPoly;

/// Encoded slot values over `q_0 … q_{D-level}`.
#[derive(Debug, Clone)]
pub struct Plaintext {
    pub(crate) poly: RnsPoly,
    pub(crate) scale: f64,
    pub(crate) level: usize,
}

impl Plaintext {
    pub fn poly(&self) -> &RnsPoly {
        &self.poly
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn level(&self) -> usize {
        self.level
    }
}

/// CKKS ciphertext `(c0, c1)` with `c0 + c1·s ≈ scale · m`.
///
/// Both components are kept in the coefficient domain. Unlike a plain
/// `logq`/`logp` pair, the scale is tracked exactly as a float because
/// rescaling divides by a prime, not by a power of two.
#[derive(Debug, Clone)]
pub struct Ciphertext {
    pub(crate) c0: RnsPoly,
    pub(crate) c1: RnsPoly,
    pub(crate) scale: f64,
    pub(crate) level: usize,
}

impl Ciphertext {
    pub fn c0(&self) -> &RnsPoly {
        &self.c0
    }

    pub fn c1(&self) -> &RnsPoly {
        &self.c1
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn level(&self) -> usize {
        self.level
    }
}
