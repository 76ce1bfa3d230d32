//! Tensor codec: how logical tensors map onto ciphertext slots, and how
//! convolution kernels and dense matrices are decomposed into
//! rotate-and-multiply payloads.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, EngineResult};

/// Placement of a `(channels, height, width)` tensor in the slot vector.
///
/// Element `(c, y, x)` lives in slot `c·channel_stride + y·row_stride + x·col_stride`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotLayout {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub channel_stride: usize,
    pub row_stride: usize,
    pub col_stride: usize,
}

impl SlotLayout {
    /// Row-major `(c, h, w)` tensor starting at slot 0.
    pub fn dense(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
            channel_stride: height * width,
            row_stride: width,
            col_stride: 1,
        }
    }

    /// Flat vector of `len` elements in slots `0..len`.
    pub fn vector(len: usize) -> Self {
        Self::dense(len, 1, 1)
    }

    /// The same shape with every stride multiplied by `factor`.
    pub fn strided(self, factor: usize) -> Self {
        Self {
            channel_stride: self.channel_stride * factor,
            row_stride: self.row_stride * factor,
            col_stride: self.col_stride * factor,
            ..self
        }
    }

    pub fn len(&self) -> usize {
        self.channels * self.height * self.width
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn position(&self, channel: usize, row: usize, col: usize) -> usize {
        channel * self.channel_stride + row * self.row_stride + col * self.col_stride
    }

    /// Slot of every element, in row-major logical order.
    pub fn positions(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.len());
        for c in 0..self.channels {
            for y in 0..self.height {
                for x in 0..self.width {
                    out.push(self.position(c, y, x));
                }
            }
        }
        out
    }

    /// Same slot for the same logical index.
    pub fn is_compatible(&self, other: &SlotLayout) -> bool {
        self.len() == other.len() && self.positions() == other.positions()
    }

    /// Checks that every element has its own slot below `batch`.
    pub fn validate(&self, batch: usize) -> EngineResult<()> {
        let positions = self.positions();
        if let Some(&max) = positions.iter().max() {
            if max >= batch {
                return Err(EngineError::Capacity {
                    len: max + 1,
                    capacity: batch,
                });
            }
        }
        let distinct: BTreeSet<usize> = positions.iter().copied().collect();
        if distinct.len() != positions.len() {
            return Err(EngineError::layout(format!(
                "layout {self:?} maps distinct elements onto the same slot"
            )));
        }
        Ok(())
    }
}

/// Slot values ready for encoding, plus the scale they are meant for.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedPlaintext {
    pub values: Vec<f64>,
    pub scale: f64,
    pub layout: SlotLayout,
}

/// Lays `tensor` out as a dense vector and zero-pads it to `batch` slots.
pub fn pack(tensor: &[f64], scale: f64, batch: usize) -> EngineResult<PackedPlaintext> {
    pack_with_layout(tensor, SlotLayout::vector(tensor.len()), scale, batch)
}

/// Scatters a row-major tensor onto `layout`.
pub fn pack_with_layout(
    tensor: &[f64],
    layout: SlotLayout,
    scale: f64,
    batch: usize,
) -> EngineResult<PackedPlaintext> {
    if tensor.len() > batch {
        return Err(EngineError::Capacity {
            len: tensor.len(),
            capacity: batch,
        });
    }
    if tensor.len() != layout.len() {
        return Err(EngineError::layout(format!(
            "tensor of {} elements does not fill layout of {}",
            tensor.len(),
            layout.len()
        )));
    }
    layout.validate(batch)?;
    let mut values = vec![0.0; batch];
    for (&value, pos) in tensor.iter().zip(layout.positions()) {
        values[pos] = value;
    }
    Ok(PackedPlaintext {
        values,
        scale,
        layout,
    })
}

/// The first `length` slots.
pub fn unpack(slots: &[f64], length: usize) -> Vec<f64> {
    slots.iter().take(length).copied().collect()
}

/// Gathers the elements of `layout` back into row-major order.
pub fn unpack_layout(slots: &[f64], layout: &SlotLayout) -> EngineResult<Vec<f64>> {
    layout
        .positions()
        .into_iter()
        .map(|pos| {
            slots.get(pos).copied().ok_or(EngineError::Capacity {
                len: pos + 1,
                capacity: slots.len(),
            })
        })
        .collect()
}

fn normalize_offset(offset: i64, batch: usize) -> usize {
    offset.rem_euclid(batch as i64) as usize
}

/// `(C_out, C_in, kh, kw)` convolution kernel, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kernel {
    pub out_channels: usize,
    pub in_channels: usize,
    pub height: usize,
    pub width: usize,
    pub weights: Vec<f64>,
}

impl Kernel {
    pub fn new(
        out_channels: usize,
        in_channels: usize,
        height: usize,
        width: usize,
        weights: Vec<f64>,
    ) -> EngineResult<Self> {
        let expected = out_channels * in_channels * height * width;
        if expected == 0 || weights.len() != expected {
            return Err(EngineError::layout(format!(
                "kernel ({out_channels}, {in_channels}, {height}, {width}) needs {expected} weights, got {}",
                weights.len()
            )));
        }
        Ok(Self {
            out_channels,
            in_channels,
            height,
            width,
            weights,
        })
    }

    pub fn weight(&self, co: usize, ci: usize, dy: usize, dx: usize) -> f64 {
        self.weights[((co * self.in_channels + ci) * self.height + dy) * self.width + dx]
    }
}

/// Dense `rows × cols` matrix, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    pub rows: usize,
    pub cols: usize,
    pub values: Vec<f64>,
}

impl Matrix {
    pub fn new(rows: usize, cols: usize, values: Vec<f64>) -> EngineResult<Self> {
        if rows == 0 || cols == 0 || values.len() != rows * cols {
            return Err(EngineError::layout(format!(
                "matrix {rows}x{cols} needs {} values, got {}",
                rows * cols,
                values.len()
            )));
        }
        Ok(Self { rows, cols, values })
    }

    pub fn from_rows(rows: &[Vec<f64>]) -> EngineResult<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|r| r.len() != cols) {
            return Err(EngineError::layout("matrix rows have different lengths"));
        }
        Self::new(rows.len(), cols, rows.concat())
    }

    pub fn identity(n: usize) -> Self {
        let mut values = vec![0.0; n * n];
        for i in 0..n {
            values[i * n + i] = 1.0;
        }
        Self {
            rows: n,
            cols: n,
            values,
        }
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.values[row * self.cols + col]
    }
}

/// One rotation followed by a slot-wise product.
#[derive(Debug, Clone, PartialEq)]
pub struct RotationTerm {
    /// Left rotation in `0..batch`.
    pub offset: usize,
    pub mask: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConvolutionPacking {
    pub taps: Vec<RotationTerm>,
    pub output_layout: SlotLayout,
    /// Non-zero offsets a rotation key is needed for.
    pub offsets: BTreeSet<i64>,
}

/// Decomposes a valid (unpadded) strided convolution into masked rotations.
///
/// Tap `(co, ci, dy, dx)` reads from slot `out + (ci - co)·cs + dy·rs + dx·xs`;
/// taps sharing that offset share one mask.
pub fn pack_convolution_weights(
    kernel: &Kernel,
    input_layout: &SlotLayout,
    stride: usize,
    batch: usize,
) -> EngineResult<ConvolutionPacking> {
    if stride == 0 {
        return Err(EngineError::layout("convolution stride must be positive"));
    }
    if kernel.in_channels != input_layout.channels {
        return Err(EngineError::layout(format!(
            "kernel expects {} input channels, layout has {}",
            kernel.in_channels, input_layout.channels
        )));
    }
    if kernel.height > input_layout.height || kernel.width > input_layout.width {
        return Err(EngineError::layout(format!(
            "kernel {}x{} does not fit input {}x{}",
            kernel.height, kernel.width, input_layout.height, input_layout.width
        )));
    }

    let output_layout = SlotLayout {
        channels: kernel.out_channels,
        height: (input_layout.height - kernel.height) / stride + 1,
        width: (input_layout.width - kernel.width) / stride + 1,
        channel_stride: input_layout.channel_stride,
        row_stride: input_layout.row_stride * stride,
        col_stride: input_layout.col_stride * stride,
    };
    output_layout.validate(batch)?;

    let cs = input_layout.channel_stride as i64;
    let rs = input_layout.row_stride as i64;
    let xs = input_layout.col_stride as i64;
    let mut masks: BTreeMap<usize, Vec<f64>> = BTreeMap::new();
    for co in 0..kernel.out_channels {
        for ci in 0..kernel.in_channels {
            for dy in 0..kernel.height {
                for dx in 0..kernel.width {
                    let weight = kernel.weight(co, ci, dy, dx);
                    if weight == 0.0 {
                        continue;
                    }
                    let raw = (ci as i64 - co as i64) * cs + dy as i64 * rs + dx as i64 * xs;
                    let offset = normalize_offset(raw, batch);
                    let mask = masks.entry(offset).or_insert_with(|| vec![0.0; batch]);
                    for oy in 0..output_layout.height {
                        for ox in 0..output_layout.width {
                            mask[output_layout.position(co, oy, ox)] += weight;
                        }
                    }
                }
            }
        }
    }
    if masks.is_empty() {
        masks.insert(0, vec![0.0; batch]);
    }

    let offsets = masks
        .keys()
        .filter(|&&k| k != 0)
        .map(|&k| k as i64)
        .collect();
    let taps = masks
        .into_iter()
        .map(|(offset, mask)| RotationTerm { offset, mask })
        .collect();
    Ok(ConvolutionPacking {
        taps,
        output_layout,
        offsets,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct GemmPacking {
    pub diagonals: Vec<RotationTerm>,
    pub output_layout: SlotLayout,
    pub offsets: BTreeSet<i64>,
}

/// Generalised diagonal packing of `matrix` against the physical input layout.
///
/// `diag_k[i] = W[i][j]` for the `j` with `pos(j) ≡ i + k (mod batch)`.
pub fn pack_gemm_diagonals(
    matrix: &Matrix,
    input_layout: &SlotLayout,
    batch: usize,
) -> EngineResult<GemmPacking> {
    if matrix.cols != input_layout.len() {
        return Err(EngineError::layout(format!(
            "matrix has {} columns but the input has {} elements",
            matrix.cols,
            input_layout.len()
        )));
    }
    if matrix.rows > batch {
        return Err(EngineError::Capacity {
            len: matrix.rows,
            capacity: batch,
        });
    }
    input_layout.validate(batch)?;

    let positions = input_layout.positions();
    let mut diagonals: BTreeMap<usize, Vec<f64>> = BTreeMap::new();
    for i in 0..matrix.rows {
        for (j, &pos) in positions.iter().enumerate() {
            let weight = matrix.get(i, j);
            if weight == 0.0 {
                continue;
            }
            let k = normalize_offset(pos as i64 - i as i64, batch);
            diagonals.entry(k).or_insert_with(|| vec![0.0; batch])[i] = weight;
        }
    }
    if diagonals.is_empty() {
        diagonals.insert(0, vec![0.0; batch]);
    }

    let offsets = diagonals
        .keys()
        .filter(|&&k| k != 0)
        .map(|&k| k as i64)
        .collect();
    Ok(GemmPacking {
        diagonals: diagonals
            .into_iter()
            .map(|(offset, mask)| RotationTerm { offset, mask })
            .collect(),
        output_layout: SlotLayout::vector(matrix.rows),
        offsets,
    })
}

/// Scatters a per-channel or per-element bias onto `layout`.
///
/// An empty bias yields `None`.
pub fn pack_bias(bias: &[f64], layout: &SlotLayout, batch: usize) -> EngineResult<Option<Vec<f64>>> {
    if bias.is_empty() {
        return Ok(None);
    }
    let mut values = vec![0.0; batch];
    if bias.len() == layout.channels {
        for c in 0..layout.channels {
            for y in 0..layout.height {
                for x in 0..layout.width {
                    values[layout.position(c, y, x)] = bias[c];
                }
            }
        }
    } else if bias.len() == layout.len() {
        for (&b, pos) in bias.iter().zip(layout.positions()) {
            values[pos] = b;
        }
    } else {
        return Err(EngineError::layout(format!(
            "bias of {} values matches neither {} channels nor {} elements",
            bias.len(),
            layout.channels,
            layout.len()
        )));
    }
    Ok(Some(values))
}

/// Index of the largest value; the first one wins ties.
pub fn argmax(values: &[f64]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Applies the packed rotation terms to plaintext slots.
    fn apply_terms(terms: &[RotationTerm], slots: &[f64]) -> Vec<f64> {
        let n = slots.len();
        let mut out = vec![0.0; n];
        for term in terms {
            for i in 0..n {
                out[i] += term.mask[i] * slots[(i + term.offset) % n];
            }
        }
        out
    }

    #[test]
    fn dense_layout_positions() {
        let layout = SlotLayout::dense(2, 2, 3);
        assert_eq!(layout.len(), 12);
        assert_eq!(layout.position(1, 1, 2), 11);
        assert!(layout.is_compatible(&SlotLayout::vector(12)));
        assert!(!layout.is_compatible(&SlotLayout::dense(2, 3, 2).strided(2)));
    }

    #[test]
    fn pack_rejects_oversized_tensor() {
        assert!(matches!(
            pack(&[1.0; 9], 1.0, 8),
            Err(EngineError::Capacity {
                len: 9,
                capacity: 8
            })
        ));
        let packed = pack(&[1.0, 2.0], 4.0, 4).unwrap();
        assert_eq!(packed.values, vec![1.0, 2.0, 0.0, 0.0]);
        assert_eq!(packed.layout, SlotLayout::vector(2));
    }

    #[test]
    fn convolution_matches_direct_computation() {
        // 1 -> 2 channels, 3x3 input, 2x2 kernel, stride 1.
        let input: Vec<f64> = (0..9).map(|v| v as f64).collect();
        let layout = SlotLayout::dense(1, 3, 3);
        let weights = vec![1.0, 0.0, 0.0, -1.0, 0.5, 0.5, 0.5, 0.5];
        let kernel = Kernel::new(2, 1, 2, 2, weights).unwrap();
        let packing = pack_convolution_weights(&kernel, &layout, 1, 16).unwrap();
        assert_eq!(packing.output_layout.channel_stride, 9);
        assert_eq!(packing.output_layout.height, 2);

        let slots = pack_with_layout(&input, layout, 1.0, 16).unwrap().values;
        let out = apply_terms(&packing.taps, &slots);
        let result = unpack_layout(&out, &packing.output_layout).unwrap();
        let mut expected = Vec::new();
        for co in 0..2 {
            for oy in 0..2 {
                for ox in 0..2 {
                    let mut acc = 0.0;
                    for dy in 0..2 {
                        for dx in 0..2 {
                            acc += kernel.weight(co, 0, dy, dx) * input[(oy + dy) * 3 + ox + dx];
                        }
                    }
                    expected.push(acc);
                }
            }
        }
        assert_eq!(result, expected);
        // Output channel 1 reads one channel stride behind: offset -9 mod 16.
        assert!(packing.offsets.contains(&7));
    }

    #[test]
    fn strided_convolution_scales_output_strides() {
        let layout = SlotLayout::dense(1, 4, 4);
        let kernel = Kernel::new(1, 1, 2, 2, vec![1.0; 4]).unwrap();
        let packing = pack_convolution_weights(&kernel, &layout, 2, 16).unwrap();
        let out = packing.output_layout;
        assert_eq!((out.height, out.width), (2, 2));
        assert_eq!((out.row_stride, out.col_stride), (8, 2));
        assert_eq!(out.positions(), vec![0, 2, 8, 10]);
    }

    #[test]
    fn convolution_rejects_misfit_kernel() {
        let layout = SlotLayout::dense(1, 2, 2);
        let kernel = Kernel::new(1, 1, 3, 3, vec![1.0; 9]).unwrap();
        assert!(matches!(
            pack_convolution_weights(&kernel, &layout, 1, 8),
            Err(EngineError::Layout(_))
        ));
        let wide = Kernel::new(4, 1, 1, 1, vec![1.0; 4]).unwrap();
        assert!(matches!(
            pack_convolution_weights(&wide, &layout, 1, 8),
            Err(EngineError::Capacity { .. })
        ));
    }

    #[test]
    fn gemm_omits_zero_diagonals() {
        let layout = SlotLayout::vector(4);
        let packing = pack_gemm_diagonals(&Matrix::identity(4), &layout, 8).unwrap();
        assert_eq!(packing.diagonals.len(), 1);
        assert_eq!(packing.diagonals[0].offset, 0);
        assert!(packing.offsets.is_empty());
    }

    #[test]
    fn gemm_follows_strided_input() {
        let layout = SlotLayout::dense(1, 2, 2).strided(2);
        let matrix = Matrix::from_rows(&[vec![1.0, 2.0, 3.0, 4.0], vec![0.0, -1.0, 0.0, 1.0]]).unwrap();
        let mut slots = vec![0.0; 16];
        let input = [1.0, -1.0, 2.0, 0.5];
        for (v, p) in input.iter().zip(layout.positions()) {
            slots[p] = *v;
        }
        let packing = pack_gemm_diagonals(&matrix, &layout, 16).unwrap();
        let out = apply_terms(&packing.diagonals, &slots);
        assert_eq!(unpack(&out, 2), vec![1.0 - 2.0 + 6.0 + 2.0, 1.0 + 0.5]);
        assert_eq!(packing.output_layout, SlotLayout::vector(2));
    }

    #[test]
    fn bias_per_channel_or_element() {
        let layout = SlotLayout::dense(2, 1, 2);
        let per_channel = pack_bias(&[1.0, 2.0], &layout, 8).unwrap().unwrap();
        assert_eq!(&per_channel[..4], &[1.0, 1.0, 2.0, 2.0]);
        let per_element = pack_bias(&[1.0, 2.0, 3.0, 4.0], &layout, 8).unwrap().unwrap();
        assert_eq!(&per_element[..4], &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(pack_bias(&[], &layout, 8).unwrap(), None);
        assert!(pack_bias(&[1.0, 2.0, 3.0], &layout, 8).is_err());
    }

    #[test]
    fn argmax_prefers_first_maximum() {
        assert_eq!(argmax(&[0.1, 0.9, 0.9, -2.0]), Some(1));
        assert_eq!(argmax(&[]), None);
    }

    proptest! {
        #[test]
        fn unpack_inverts_pack(
            tensor in prop::collection::vec(-1000.0f64..1000.0, 0..=32),
        ) {
            let packed = pack(&tensor, 1.0, 32).unwrap();
            prop_assert_eq!(packed.values.len(), 32);
            prop_assert_eq!(unpack(&packed.values, tensor.len()), tensor);
        }

        #[test]
        fn layout_gather_inverts_scatter(
            channels in 1usize..3,
            height in 1usize..4,
            width in 1usize..4,
            stride in 1usize..3,
        ) {
            let layout = SlotLayout::dense(channels, height, width).strided(stride);
            let batch = 128;
            let tensor: Vec<f64> = (0..layout.len()).map(|v| v as f64).collect();
            let packed = pack_with_layout(&tensor, layout, 1.0, batch).unwrap();
            prop_assert_eq!(unpack_layout(&packed.values, &layout).unwrap(), tensor);
        }
    }
}
