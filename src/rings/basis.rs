use std::sync::Arc;

use crate::math::is_ntt_friendly_prime;
use crate::math::primes::{add_mod, inv_mod, mul_mod, pow_mod, sub_mod};

use super::errors::{RingError, RingResult};

/// Twiddle factors for the negacyclic NTT modulo one prime.
///
/// `forward_roots[i] = psi^bitrev(i)` and `inverse_roots[i] = psi^-bitrev(i)`
/// where `psi` is a primitive `2n`-th root of unity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NttTable {
    modulus: u64,
    degree: usize,
    forward_roots: Vec<u64>,
    inverse_roots: Vec<u64>,
    n_inv: u64,
}

impl NttTable {
    pub fn new(modulus: u64, degree: usize) -> RingResult<Self> {
        if !degree.is_power_of_two() || degree < 2 {
            return Err(RingError::InvalidDegree { degree });
        }
        if !is_ntt_friendly_prime(modulus, degree) {
            return Err(RingError::NonNttFriendlyModulus { modulus, degree });
        }

        let psi = find_primitive_root(modulus, 2 * degree);
        let psi_inv = inv_mod(psi, modulus).ok_or(RingError::NonNttFriendlyModulus {
            modulus,
            degree,
        })?;
        let bits = degree.trailing_zeros();

        let roots = |base: u64| -> Vec<u64> {
            (0..degree)
                .map(|i| pow_mod(base, reverse_bits(i, bits) as u64, modulus))
                .collect()
        };
        let forward_roots = roots(psi);
        let inverse_roots = roots(psi_inv);
        let n_inv = inv_mod(degree as u64, modulus).ok_or(RingError::NonNttFriendlyModulus {
            modulus,
            degree,
        })?;

        Ok(Self {
            modulus,
            degree,
            forward_roots,
            inverse_roots,
            n_inv,
        })
    }

    pub fn modulus(&self) -> u64 {
        self.modulus
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    /// In-place Cooley-Tukey forward transform; output is in bit-reversed order.
    pub fn forward(&self, a: &mut [u64]) {
        debug_assert_eq!(a.len(), self.degree);
        let q = self.modulus;
        let mut t = self.degree >> 1;
        let mut m = 1;
        while m < self.degree {
            for i in 0..m {
                let w = self.forward_roots[m + i];
                let start = 2 * i * t;
                for j in start..start + t {
                    let u = a[j];
                    let v = mul_mod(a[j + t], w, q);
                    a[j] = add_mod(u, v, q);
                    a[j + t] = sub_mod(u, v, q);
                }
            }
            m <<= 1;
            t >>= 1;
        }
    }

    /// In-place Gentleman-Sande inverse transform, including the `n^-1` factor.
    pub fn inverse(&self, a: &mut [u64]) {
        debug_assert_eq!(a.len(), self.degree);
        let q = self.modulus;
        let mut t = 1;
        let mut h = self.degree >> 1;
        while h > 0 {
            let mut start = 0;
            for i in 0..h {
                let w = self.inverse_roots[h + i];
                for j in start..start + t {
                    let u = a[j];
                    let v = a[j + t];
                    a[j] = add_mod(u, v, q);
                    a[j + t] = mul_mod(sub_mod(u, v, q), w, q);
                }
                start += 2 * t;
            }
            t <<= 1;
            h >>= 1;
        }
        for value in a.iter_mut() {
            *value = mul_mod(*value, self.n_inv, q);
        }
    }
}

/// An ordered list of NTT tables sharing one ring degree.
///
/// Tables are reference counted so that bases for different levels share
/// precomputation.
#[derive(Debug, Clone)]
pub struct RnsBasis {
    degree: usize,
    tables: Vec<Arc<NttTable>>,
}

impl RnsBasis {
    pub fn new(tables: Vec<Arc<NttTable>>) -> RingResult<Self> {
        let first = tables.first().ok_or(RingError::EmptyBasis)?;
        let degree = first.degree();
        if let Some(bad) = tables.iter().find(|t| t.degree() != degree) {
            return Err(RingError::LengthMismatch {
                expected: degree,
                actual: bad.degree(),
            });
        }
        Ok(Self { degree, tables })
    }

    /// Builds tables for `moduli` from scratch.
    pub fn from_moduli(moduli: &[u64], degree: usize) -> RingResult<Self> {
        let tables = moduli
            .iter()
            .map(|&q| NttTable::new(q, degree).map(Arc::new))
            .collect::<RingResult<Vec<_>>>()?;
        Self::new(tables)
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    pub fn channel_count(&self) -> usize {
        self.tables.len()
    }

    pub fn table(&self, channel: usize) -> &Arc<NttTable> {
        &self.tables[channel]
    }

    pub fn tables(&self) -> &[Arc<NttTable>] {
        &self.tables
    }

    pub fn moduli(&self) -> Vec<u64> {
        self.tables.iter().map(|t| t.modulus()).collect()
    }

    /// The first `len` channels.
    pub fn prefix(&self, len: usize) -> RingResult<Self> {
        if len == 0 || len > self.tables.len() {
            return Err(RingError::InvalidModDrop {
                drop_count: self.tables.len().saturating_sub(len),
                channel_count: self.tables.len(),
            });
        }
        Ok(Self {
            degree: self.degree,
            tables: self.tables[..len].to_vec(),
        })
    }

    /// This basis with `table` appended as the last channel.
    pub fn extended(&self, table: Arc<NttTable>) -> Self {
        let mut tables = self.tables.clone();
        tables.push(table);
        Self {
            degree: self.degree,
            tables,
        }
    }
}

// ─── Number-theory helpers ───────────────────────────────────────────────────

/// Primitive `order`-th root of unity for a power-of-two `order`.
fn find_primitive_root(modulus: u64, order: usize) -> u64 {
    let exponent = (modulus - 1) / order as u64;
    // For a power-of-two order, `root` is primitive iff root^(order/2) = -1.
    (2..modulus)
        .map(|g| pow_mod(g, exponent, modulus))
        .find(|&root| pow_mod(root, (order / 2) as u64, modulus) == modulus - 1)
        .unwrap_or(1)
}

pub(crate) fn reverse_bits(value: usize, bits: u32) -> usize {
    if bits == 0 {
        return 0;
    }
    value.reverse_bits() >> (usize::BITS - bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negacyclic_schoolbook(a: &[u64], b: &[u64], q: u64) -> Vec<u64> {
        let n = a.len();
        let mut out = vec![0u64; n];
        for i in 0..n {
            for j in 0..n {
                let prod = mul_mod(a[i], b[j], q);
                let k = i + j;
                if k < n {
                    out[k] = add_mod(out[k], prod, q);
                } else {
                    out[k - n] = sub_mod(out[k - n], prod, q);
                }
            }
        }
        out
    }

    #[test]
    fn rejects_non_friendly_modulus() {
        assert_eq!(
            NttTable::new(19, 8),
            Err(RingError::NonNttFriendlyModulus {
                modulus: 19,
                degree: 8
            })
        );
        assert_eq!(
            NttTable::new(17, 6),
            Err(RingError::InvalidDegree { degree: 6 })
        );
    }

    #[test]
    fn forward_then_inverse_is_identity() {
        let table = NttTable::new(97, 16).unwrap();
        let original: Vec<u64> = (0..16).map(|i| (i * 7 + 3) % 97).collect();
        let mut a = original.clone();
        table.forward(&mut a);
        assert_ne!(a, original);
        table.inverse(&mut a);
        assert_eq!(a, original);
    }

    #[test]
    fn pointwise_product_matches_negacyclic_convolution() {
        let q = 1_073_750_017u64;
        let table = NttTable::new(q, 32).unwrap();
        let a: Vec<u64> = (0..32).map(|i| (i * i * 31 + 5) % q).collect();
        let b: Vec<u64> = (0..32).map(|i| q - 1 - i).collect();
        let expected = negacyclic_schoolbook(&a, &b, q);

        let (mut fa, mut fb) = (a, b);
        table.forward(&mut fa);
        table.forward(&mut fb);
        let mut product: Vec<u64> = fa.iter().zip(&fb).map(|(&x, &y)| mul_mod(x, y, q)).collect();
        table.inverse(&mut product);
        assert_eq!(product, expected);
    }

    #[test]
    fn prefix_and_extend_share_tables() {
        let basis = RnsBasis::from_moduli(&[17, 97, 113], 8).unwrap();
        let head = basis.prefix(2).unwrap();
        assert_eq!(head.moduli(), vec![17, 97]);
        assert!(Arc::ptr_eq(head.table(1), basis.table(1)));

        let with_last = head.extended(basis.table(2).clone());
        assert_eq!(with_last.moduli(), vec![17, 97, 113]);
        assert!(basis.prefix(0).is_err());
        assert!(matches!(RnsBasis::new(vec![]), Err(RingError::EmptyBasis)));
    }
}
