//! Chebyshev interpolation of scalar activations and conversion to the
//! monomial basis the homomorphic evaluator consumes.

use std::f64::consts::PI;

/// Chebyshev coefficients `c_k` of the degree-`degree` interpolant of `f` on
/// `[lo, hi]`, taken at the `degree + 1` Chebyshev nodes.
pub fn fit(f: impl Fn(f64) -> f64, lo: f64, hi: f64, degree: usize) -> Vec<f64> {
    let n = degree + 1;
    let half_width = (hi - lo) / 2.0;
    let center = (hi + lo) / 2.0;
    let nodes: Vec<f64> = (0..n)
        .map(|j| (PI * (j as f64 + 0.5) / n as f64).cos())
        .collect();
    let samples: Vec<f64> = nodes.iter().map(|&u| f(center + half_width * u)).collect();

    (0..n)
        .map(|k| {
            let sum: f64 = nodes
                .iter()
                .zip(&samples)
                .map(|(&u, &y)| y * (k as f64 * u.acos()).cos())
                .sum();
            let c = 2.0 * sum / n as f64;
            if k == 0 { c / 2.0 } else { c }
        })
        .collect()
}

/// Rewrites `sum_k c_k T_k(u)` with `u = (2x - hi - lo) / (hi - lo)` as
/// `sum_m a_m x^m`.
pub fn to_monomial(chebyshev: &[f64], lo: f64, hi: f64) -> Vec<f64> {
    let n = chebyshev.len();
    if n == 0 {
        return Vec::new();
    }

    // Power-basis coefficients of T_k via T_{k+1} = 2u T_k - T_{k-1}.
    let mut in_u = vec![0.0; n];
    let mut prev = vec![0.0; n];
    let mut curr = vec![0.0; n];
    prev[0] = 1.0;
    if n > 1 {
        curr[1] = 1.0;
    }
    for (k, &c) in chebyshev.iter().enumerate() {
        let t_k = match k {
            0 => prev.clone(),
            1 => curr.clone(),
            _ => {
                let mut next = vec![0.0; n];
                for i in 0..n - 1 {
                    next[i + 1] += 2.0 * curr[i];
                }
                for (slot, &p) in next.iter_mut().zip(&prev) {
                    *slot -= p;
                }
                prev = std::mem::replace(&mut curr, next);
                curr.clone()
            }
        };
        for (acc, t) in in_u.iter_mut().zip(&t_k) {
            *acc += c * t;
        }
    }

    // Substitute u = alpha·x + beta.
    let alpha = 2.0 / (hi - lo);
    let beta = -(hi + lo) / (hi - lo);
    let mut out = vec![0.0; n];
    for (k, &p) in in_u.iter().enumerate() {
        if p == 0.0 {
            continue;
        }
        let mut binom = 1.0;
        for (m, slot) in out.iter_mut().enumerate().take(k + 1) {
            *slot += p * binom * alpha.powi(m as i32) * beta.powi((k - m) as i32);
            binom = binom * (k - m) as f64 / (m + 1) as f64;
        }
    }
    out
}

/// Horner evaluation of monomial coefficients.
pub fn evaluate(coeffs: &[f64], x: f64) -> f64 {
    coeffs.iter().rev().fold(0.0, |acc, &c| acc * x + c)
}
