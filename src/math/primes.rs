//! Modular arithmetic and NTT-friendly prime search for the modulus chain.
//!
//! Primality uses Miller-Rabin with a fixed witness set that is exact for
//! every `u64`. All moduli handed out by this module stay below `2^62`, so the
//! sum of two residues never overflows and products fit in `u128`.

use std::collections::BTreeSet;

// Deterministic for all n < 3.3 * 10^24, which covers u64.
const MILLER_RABIN_BASES: [u64; 12] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37];

/// Largest bit size accepted for any modulus in a chain.
pub const MAX_MODULUS_BITS: u32 = 61;

#[inline]
pub fn mul_mod(a: u64, b: u64, modulus: u64) -> u64 {
    ((a as u128 * b as u128) % modulus as u128) as u64
}

#[inline]
pub fn add_mod(a: u64, b: u64, modulus: u64) -> u64 {
    let sum = a + b;
    if sum >= modulus { sum - modulus } else { sum }
}

#[inline]
pub fn sub_mod(a: u64, b: u64, modulus: u64) -> u64 {
    if a >= b { a - b } else { modulus - (b - a) }
}

/// Reduces a signed value into `[0, modulus)`.
#[inline]
pub fn reduce_signed(value: i128, modulus: u64) -> u64 {
    value.rem_euclid(modulus as i128) as u64
}

/// Maps a residue in `[0, modulus)` to its centered representative.
#[inline]
pub fn center(residue: u64, modulus: u64) -> i64 {
    if residue > modulus / 2 {
        -((modulus - residue) as i64)
    } else {
        residue as i64
    }
}

pub fn pow_mod(mut base: u64, mut exponent: u64, modulus: u64) -> u64 {
    if modulus == 1 {
        return 0;
    }
    let mut acc = 1u64;
    base %= modulus;
    while exponent > 0 {
        if exponent & 1 == 1 {
            acc = mul_mod(acc, base, modulus);
        }
        base = mul_mod(base, base, modulus);
        exponent >>= 1;
    }
    acc
}

/// Inverse modulo a prime via Fermat's little theorem.
///
/// Returns `None` when `value` is a multiple of `prime`.
pub fn inv_mod(value: u64, prime: u64) -> Option<u64> {
    let value = value % prime;
    if value == 0 {
        return None;
    }
    Some(pow_mod(value, prime - 2, prime))
}

pub fn is_prime(n: u64) -> bool {
    match n {
        0 | 1 => return false,
        2 | 3 => return true,
        _ if n % 2 == 0 => return false,
        _ => {}
    }

    let rounds = (n - 1).trailing_zeros();
    let odd = (n - 1) >> rounds;

    'witness: for &base in MILLER_RABIN_BASES.iter().filter(|&&b| b < n) {
        let mut x = pow_mod(base, odd, n);
        if x == 1 || x == n - 1 {
            continue;
        }
        for _ in 1..rounds {
            x = mul_mod(x, x, n);
            if x == n - 1 {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

/// A prime `p` supports a negacyclic NTT of length `degree` iff `p ≡ 1 (mod 2·degree)`.
#[inline]
pub fn is_ntt_friendly_prime(p: u64, degree: usize) -> bool {
    let order = 2 * degree as u64;
    p % order == 1 && is_prime(p)
}

/// Direction a [`PrimeWalk`] moves away from its starting power of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

/// Walks NTT-friendly primes outward from `2^bits`, one congruence class step at a time.
///
/// The walk stays inside `[2^(bits-1), 2^(bits+1))` so every prime it yields
/// has `bits` or `bits + 1` significant bits.
#[derive(Debug, Clone)]
pub struct PrimeWalk {
    next: Option<u64>,
    step: u64,
    floor: u64,
    ceiling: u64,
    direction: Direction,
}

impl PrimeWalk {
    pub fn new(bits: u32, degree: usize, direction: Direction) -> Self {
        let step = 2 * degree as u64;
        let center = 1u64 << bits;
        let floor = 1u64 << (bits - 1);
        let ceiling = (1u64 << (bits + 1)).min(1u64 << 62);
        // Smallest x > 2^bits with x ≡ 1 (mod 2n); the downward walk starts one step below it.
        let aligned = (center / step) * step + 1;
        let up = if aligned > center { aligned } else { aligned + step };
        let next = match direction {
            Direction::Up => Some(up),
            Direction::Down => up.checked_sub(step),
        };
        Self {
            next,
            step,
            floor,
            ceiling,
            direction,
        }
    }
}

impl Iterator for PrimeWalk {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        while let Some(candidate) = self.next {
            if candidate < self.floor || candidate >= self.ceiling {
                self.next = None;
                break;
            }
            self.next = match self.direction {
                Direction::Up => candidate.checked_add(self.step),
                Direction::Down => candidate.checked_sub(self.step),
            };
            if is_prime(candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

/// Request for a full RNS modulus chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainRequest {
    pub ring_dimension: usize,
    pub first_bits: u32,
    pub scaling_bits: u32,
    pub special_bits: u32,
    pub depth: usize,
}

/// `q_0`, the `depth` rescaling primes `q_1 … q_D`, and the key-switching prime `P`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModulusChain {
    pub moduli: Vec<u64>,
    pub special: u64,
}

impl ModulusChain {
    /// Deterministically searches the chain described by `request`.
    ///
    /// Scaling primes alternate below and above `2^scaling_bits` so that the
    /// running product of `prime / 2^scaling_bits` stays close to one.
    /// Returns `None` if any of the walks runs dry.
    pub fn search(request: &ChainRequest) -> Option<Self> {
        let n = request.ring_dimension;
        let mut taken = BTreeSet::new();

        let special = PrimeWalk::new(request.special_bits, n, Direction::Down).next()?;
        taken.insert(special);

        let first = PrimeWalk::new(request.first_bits, n, Direction::Up)
            .find(|p| !taken.contains(p))?;
        taken.insert(first);

        let mut below =
            PrimeWalk::new(request.scaling_bits, n, Direction::Down).filter(|p| !taken.contains(p));
        let mut above =
            PrimeWalk::new(request.scaling_bits, n, Direction::Up).filter(|p| !taken.contains(p));

        let mut moduli = Vec::with_capacity(request.depth + 1);
        moduli.push(first);
        for index in 0..request.depth {
            let prime = if index % 2 == 0 {
                below.next().or_else(|| above.next())?
            } else {
                above.next().or_else(|| below.next())?
            };
            moduli.push(prime);
        }

        Some(Self { moduli, special })
    }

    /// Sum of the bit lengths of every prime, including `P`.
    pub fn log_qp(&self) -> u32 {
        self.moduli
            .iter()
            .chain(std::iter::once(&self.special))
            .map(|q| 64 - q.leading_zeros())
            .sum()
    }
}
