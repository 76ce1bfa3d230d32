use std::collections::BTreeSet;

use crate::backend::HeBackend;
use crate::ciphertext::Ciphertext;
use crate::codec::{ConvolutionPacking, Kernel, SlotLayout, pack_bias, pack_convolution_weights};
use crate::errors::EngineResult;
use crate::keys::EvaluationKeys;

use super::rotate_multiply_accumulate;

/// Valid (unpadded) strided 2-D convolution, packed against one input layout.
#[derive(Debug, Clone)]
pub struct Conv2D {
    kernel: Kernel,
    stride: usize,
    input_layout: SlotLayout,
    packing: ConvolutionPacking,
    bias: Option<Vec<f64>>,
}

impl Conv2D {
    /// `bias` holds one value per output channel, or nothing.
    pub fn new(
        kernel: Kernel,
        bias: &[f64],
        input_layout: SlotLayout,
        stride: usize,
        batch: usize,
    ) -> EngineResult<Self> {
        let packing = pack_convolution_weights(&kernel, &input_layout, stride, batch)?;
        let bias = pack_bias(bias, &packing.output_layout, batch)?;
        Ok(Self {
            kernel,
            stride,
            input_layout,
            packing,
            bias,
        })
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn input_layout(&self) -> &SlotLayout {
        &self.input_layout
    }

    pub fn output_layout(&self) -> &SlotLayout {
        &self.packing.output_layout
    }

    pub fn tap_count(&self) -> usize {
        self.packing.taps.len()
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
            &self.packing.taps,
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
    use crate::errors::EngineError;
    use crate::ops::Operator;
    use crate::ops::test_support::Harness;
    use approx::assert_abs_diff_eq;

    fn plain_conv(input: &[f64], kernel: &Kernel, bias: &[f64], h: usize, w: usize) -> Vec<f64> {
        let (oh, ow) = (h - kernel.height + 1, w - kernel.width + 1);
        let mut out = Vec::new();
        for co in 0..kernel.out_channels {
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut acc = bias.get(co).copied().unwrap_or(0.0);
                    for ci in 0..kernel.in_channels {
                        for dy in 0..kernel.height {
                            for dx in 0..kernel.width {
                                acc += kernel.weight(co, ci, dy, dx)
                                    * input[(ci * h + oy + dy) * w + ox + dx];
                            }
                        }
                    }
                    out.push(acc);
                }
            }
        }
        out
    }

    #[test]
    fn encrypted_convolution_matches_plaintext() {
        let layout = SlotLayout::dense(1, 3, 3);
        let kernel = Kernel::new(2, 1, 2, 2, vec![1.0, -0.5, 0.25, 2.0, 0.0, 1.0, -1.0, 0.5]).unwrap();
        let bias = [0.5, -1.0];
        let conv = Conv2D::new(kernel.clone(), &bias, layout, 1, 16).unwrap();
        let offsets: Vec<i64> = conv.required_rotations().iter().copied().collect();

        let mut h = Harness::new(1, 16, &offsets);
        let input: Vec<f64> = (0..9).map(|v| v as f64 * 0.5 - 2.0).collect();
        let ct = h.encrypt(&input, layout);
        let out = Operator::Conv2D(conv.clone())
            .apply(&ct, h.context.backend(), &h.eval)
            .unwrap();
        assert_eq!(out.level(), 1);
        assert_eq!(out.layout(), conv.output_layout());

        let slots = h.decrypt(&out);
        let got = crate::codec::unpack_layout(&slots, out.layout()).unwrap();
        for (g, want) in got.iter().zip(plain_conv(&input, &kernel, &bias, 3, 3)) {
            assert_abs_diff_eq!(*g, want, epsilon = 1e-3);
        }
    }

    #[test]
    fn missing_rotation_key_fails_before_work() {
        let layout = SlotLayout::dense(1, 2, 2);
        let kernel = Kernel::new(1, 1, 1, 2, vec![1.0, 1.0]).unwrap();
        let conv = Conv2D::new(kernel, &[], layout, 1, 8).unwrap();
        let expected: BTreeSet<i64> = [1].into_iter().collect();
        assert_eq!(conv.required_rotations(), &expected);

        let mut h = Harness::new(1, 8, &[]);
        let ct = h.encrypt(&[1.0, 2.0, 3.0, 4.0], layout);
        let err = Operator::Conv2D(conv)
            .apply(&ct, h.context.backend(), &h.eval)
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingRotationKey { offset: 1 }));
    }

    #[test]
    fn zero_kernel_still_costs_one_level() {
        let layout = SlotLayout::dense(1, 2, 2);
        let kernel = Kernel::new(1, 1, 1, 1, vec![0.0]).unwrap();
        let conv = Conv2D::new(kernel, &[3.0], layout, 1, 8).unwrap();
        assert_eq!(conv.tap_count(), 1);
        assert!(conv.required_rotations().is_empty());

        let mut h = Harness::new(2, 8, &[]);
        let ct = h.encrypt(&[1.0, 2.0, 3.0, 4.0], layout);
        let out = Operator::Conv2D(conv)
            .apply(&ct, h.context.backend(), &h.eval)
            .unwrap();
        assert_eq!(out.level(), 1);
        let slots = h.decrypt(&out);
        for v in &slots[..4] {
            assert_abs_diff_eq!(*v, 3.0, epsilon = 1e-3);
        }
    }
}
