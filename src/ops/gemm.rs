use std::collections::BTreeSet;

use crate::backend::HeBackend;
use crate::ciphertext::Ciphertext;
use crate::codec::{GemmPacking, Matrix, SlotLayout, pack_bias, pack_gemm_diagonals};
use crate::errors::EngineResult;
use crate::keys::EvaluationKeys;

use super::rotate_multiply_accumulate;

/// Dense layer `y = W x + b` evaluated by generalised diagonals.
#[derive(Debug, Clone)]
pub struct Gemm {
    matrix: Matrix,
    input_layout: SlotLayout,
    packing: GemmPacking,
    bias: Option<Vec<f64>>,
}

impl Gemm {
    pub fn new(
        matrix: Matrix,
        bias: &[f64],
        input_layout: SlotLayout,
        batch: usize,
    ) -> EngineResult<Self> {
        let packing = pack_gemm_diagonals(&matrix, &input_layout, batch)?;
        let bias = pack_bias(bias, &packing.output_layout, batch)?;
        Ok(Self {
            matrix,
            input_layout,
            packing,
            bias,
        })
    }

    pub fn matrix(&self) -> &Matrix {
        &self.matrix
    }

    pub fn input_layout(&self) -> &SlotLayout {
        &self.input_layout
    }

    pub fn output_layout(&self) -> &SlotLayout {
        &self.packing.output_layout
    }

    pub fn diagonal_count(&self) -> usize {
        self.packing.diagonals.len()
    }

    pub fn required_rotations(&self) -> &BTreeSet<i64> {
        &self.packing.offsets
    }

    pub(crate) fn apply<B: HeBackend>(
        &self,
        ciphertext: &Ciphertext<B>,
        backend: &B,
        keys: &EvaluationKeys<B>,
    ) -> EngineResult<Ciphertext<B>> {
        rotate_multiply_accumulate(
            ciphertext,
            &self.packing.diagonals,
            self.bias.as_deref(),
            self.packing.output_layout,
            backend,
            keys,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::argmax;
    use crate::errors::EngineError;
    use crate::ops::Operator;
    use crate::ops::test_support::Harness;
    use approx::assert_abs_diff_eq;

    #[test]
    fn encrypted_gemm_matches_plaintext() {
        let layout = SlotLayout::vector(4);
        let matrix = Matrix::from_rows(&[
            vec![1.0, 2.0, 0.0, -1.0],
            vec![0.5, 0.0, 0.5, 0.0],
            vec![0.0, 0.0, 0.0, 3.0],
        ])
        .unwrap();
        let gemm = Gemm::new(matrix.clone(), &[1.0, 0.0, -2.0], layout, 8).unwrap();
        assert_eq!(gemm.output_layout(), &SlotLayout::vector(3));
        let offsets: Vec<i64> = gemm.required_rotations().iter().copied().collect();

        let mut h = Harness::new(1, 8, &offsets);
        let input = [1.0, -2.0, 3.0, 0.5];
        let ct = h.encrypt(&input, layout);
        let out = Operator::Gemm(gemm)
            .apply(&ct, h.context.backend(), &h.eval)
            .unwrap();
        assert_eq!(out.slot_count(), 3);
        let slots = h.decrypt(&out);
        let expected = [1.0 - 4.0 - 0.5 + 1.0, 0.5 + 1.5, 1.5 - 2.0];
        for (g, w) in slots.iter().zip(expected) {
            assert_abs_diff_eq!(*g, w, epsilon = 1e-3);
        }
    }

    #[test]
    fn ten_way_output_classifies() {
        let layout = SlotLayout::vector(4);
        let rows: Vec<Vec<f64>> = (0..10)
            .map(|i| {
                if i == 6 {
                    vec![1.0, -0.5, 0.25, 2.0]
                } else {
                    (0..4).map(|j| ((i + j) % 4) as f64 * 0.1 - 0.2).collect()
                }
            })
            .collect();
        let matrix = Matrix::from_rows(&rows).unwrap();
        let input = [0.3, -0.7, 1.1, 0.2];
        let plain: Vec<f64> = rows
            .iter()
            .map(|r| r.iter().zip(&input).map(|(a, b)| a * b).sum())
            .collect();

        let gemm = Gemm::new(matrix, &[], layout, 16).unwrap();
        let offsets: Vec<i64> = gemm.required_rotations().iter().copied().collect();
        let mut h = Harness::new(1, 16, &offsets);
        let ct = h.encrypt(&input, layout);
        let out = Operator::Gemm(gemm)
            .apply(&ct, h.context.backend(), &h.eval)
            .unwrap();
        let slots = h.decrypt(&out);
        assert_eq!(argmax(&plain), Some(6));
        assert_eq!(argmax(&slots[..10]), Some(6));
    }

    #[test]
    fn layout_mismatch_is_rejected() {
        let gemm = Gemm::new(Matrix::identity(4), &[], SlotLayout::vector(4), 8).unwrap();
        let mut h = Harness::new(1, 8, &[]);
        let ct = h.encrypt(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], SlotLayout::vector(6));
        let err = Operator::Gemm(gemm)
            .apply(&ct, h.context.backend(), &h.eval)
            .unwrap_err();
        assert!(matches!(err, EngineError::Layout(_)));
    }

    #[test]
    fn exhausted_budget_is_reported() {
        let gemm = Operator::Gemm(
            Gemm::new(Matrix::identity(2), &[], SlotLayout::vector(2), 8).unwrap(),
        );
        let mut h = Harness::new(1, 8, &[]);
        let ct = h.encrypt(&[1.0, 2.0], SlotLayout::vector(2));
        let once = gemm.apply(&ct, h.context.backend(), &h.eval).unwrap();
        let err = gemm.apply(&once, h.context.backend(), &h.eval).unwrap_err();
        assert!(matches!(
            err,
            EngineError::DepthExhausted {
                level: 1,
                cost: 1,
                budget: 1
            }
        ));
    }
}
