//! Tensor Op Kernels
//!
//! # Overview
//!
//! The compute kernels behind the graph executor: matrix multiplication
//! (including mixed quantized x float), element-wise arithmetic, RMS
//! normalization, SiLU, softmax, rotary embedding, row gather, causal
//! masking, and strided copies. Kernels operate on plain slices plus
//! shape/stride metadata; no kernel allocates from the arena or calls
//! another kernel.
//!
//! # Matmul Convention
//!
//! [`mul_mat`] contracts both operands over axis 0:
//!
//! ```text
//! A: [K, M]   B: [K, N]   ->   C: [M, N]
//! C[m + n*M] = sum_k A[k + m*K] * B[k + n*K]
//! ```
//!
//! Every consumer — attention scores, context gather, feed-forward, output
//! head — relies on this single convention; transposed access is expressed
//! through stride views feeding it, never by a second convention.
//!
//! Long matmuls yield to the scheduler every few output rows so a
//! cooperative host is not monopolized.

use crate::errors::{LlmError, LlmResult};
use crate::quantize::dequantize_row;
use crate::tensor::{DType, RopeMode, MAX_DIMS};

/// Output rows between cooperative yields in `mul_mat`
const YIELD_EVERY_ROWS: usize = 64;

/// A read-only operand: raw bytes plus 3-D shape and byte strides
///
/// Axis 0 must be dense (`nb[0]` equals the dtype block size); axes 1 and 2
/// may carry arbitrary strides, which is how transposed and per-head views
/// reach the kernels.
pub struct MatView<'a> {
    pub data: &'a [u8],
    pub dtype: DType,
    /// [rows, cols, batch]
    pub ne: [usize; 3],
    /// Byte strides for the three axes
    pub nb: [usize; 3],
}

impl<'a> MatView<'a> {
    /// Bytes of column `i1` in batch `i2` (one contiguous axis-0 run)
    fn col(&self, i1: usize, i2: usize) -> &'a [u8] {
        let start = i1 * self.nb[1] + i2 * self.nb[2];
        let len = self.dtype.row_bytes(self.ne[0]);
        &self.data[start..start + len]
    }

    fn col_f32(&self, i1: usize, i2: usize) -> &'a [f32] {
        crate::arena::cast_f32(self.col(i1, i2))
    }
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut sum = 0.0f32;
    for i in 0..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

/// Matrix multiplication, `C = A . B^T` in the axis-0-contraction sense
///
/// # Arguments
///
/// - `a`: left operand `[K, M, Ba]`; f32, f16, or Q4_K
/// - `b`: right operand `[K, N, Bb]`; must be f32, `Ba` must divide `Bb`
///   (grouped-query broadcast maps batch `i2` to `i2 * Ba / Bb`)
/// - `out`: dense output `[M, N, Bb]`
/// - `scratch`: reusable row buffer for dequantization
///
/// When `A` is quantized, one column of `A` is dequantized at a time into
/// `scratch` and dotted against all of `B`.
pub fn mul_mat(
    a: &MatView,
    b: &MatView,
    out: &mut [f32],
    scratch: &mut Vec<f32>,
) -> LlmResult<()> {
    let k = a.ne[0];
    if b.ne[0] != k {
        return Err(LlmError::ShapeMismatch {
            op: "mul_mat",
            detail: format!("contracting axes differ: {} vs {}", k, b.ne[0]),
        });
    }
    if b.dtype != DType::F32 {
        return Err(LlmError::ShapeMismatch {
            op: "mul_mat",
            detail: "right operand must be f32".to_string(),
        });
    }
    if a.ne[2] == 0 || b.ne[2] % a.ne[2] != 0 {
        return Err(LlmError::ShapeMismatch {
            op: "mul_mat",
            detail: format!("batch {} does not broadcast into {}", a.ne[2], b.ne[2]),
        });
    }

    let m = a.ne[1];
    let n = b.ne[1];
    let batches = b.ne[2];
    debug_assert!(out.len() >= m * n * batches);

    let quantized = a.dtype.is_quantized() || a.dtype == DType::F16;
    if quantized {
        scratch.resize(k, 0.0);
    }

    for i2 in 0..batches {
        let a2 = i2 * a.ne[2] / batches;
        for i1m in 0..m {
            if i1m > 0 && i1m % YIELD_EVERY_ROWS == 0 {
                std::thread::yield_now();
            }
            let a_col: &[f32] = if quantized {
                dequantize_row(a.col(i1m, a2), scratch, k, a.dtype)?;
                &scratch[..]
            } else {
                a.col_f32(i1m, a2)
            };
            let out_base = i2 * m * n + i1m;
            for i1n in 0..n {
                out[out_base + i1n * m] = dot(a_col, b.col_f32(i1n, i2));
            }
        }
    }
    Ok(())
}

/// Element-wise addition; shapes must match
pub fn vec_add(a: &[f32], b: &[f32], out: &mut [f32]) {
    for i in 0..out.len() {
        out[i] = a[i] + b[i];
    }
}

/// Element-wise multiplication; shapes must match
pub fn vec_mul(a: &[f32], b: &[f32], out: &mut [f32]) {
    for i in 0..out.len() {
        out[i] = a[i] * b[i];
    }
}

/// Element-wise multiplication with `b` broadcast across rows
///
/// `b` holds one axis-0 row (a gain vector); every row of `a` is scaled by
/// it. Used for RMS-norm gains.
pub fn vec_mul_broadcast(a: &[f32], b: &[f32], out: &mut [f32]) {
    let row = b.len();
    for (i, o) in out.iter_mut().enumerate() {
        *o = a[i] * b[i % row];
    }
}

/// Multiply by a scalar
pub fn vec_scale(x: &[f32], s: f32, out: &mut [f32]) {
    for i in 0..out.len() {
        out[i] = x[i] * s;
    }
}

/// SiLU activation: `x * sigmoid(x)`
pub fn vec_silu(x: &[f32], out: &mut [f32]) {
    for i in 0..out.len() {
        out[i] = x[i] / (1.0 + (-x[i]).exp());
    }
}

/// Root-mean-square normalization along the contiguous axis
///
/// `x_i <- x_i / sqrt(mean(x^2) + eps)`, per row. No mean subtraction and
/// no gain; gains are applied by a following broadcast multiply.
pub fn rms_norm_rows(x: &[f32], out: &mut [f32], row_len: usize, eps: f32) {
    for (xr, or) in x.chunks_exact(row_len).zip(out.chunks_exact_mut(row_len)) {
        let mean_sq = xr.iter().map(|v| v * v).sum::<f32>() / row_len as f32;
        let inv = 1.0 / (mean_sq + eps).sqrt();
        for i in 0..row_len {
            or[i] = xr[i] * inv;
        }
    }
}

/// Softmax along the contiguous axis, max-subtracted for stability
///
/// A row whose exponentials sum to zero (all lanes -inf) degenerates to
/// the uniform distribution.
pub fn softmax_rows(x: &[f32], out: &mut [f32], row_len: usize) {
    for (xr, or) in x.chunks_exact(row_len).zip(out.chunks_exact_mut(row_len)) {
        let max = xr.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let mut sum = 0.0f32;
        for i in 0..row_len {
            let e = (xr[i] - max).exp();
            or[i] = e;
            sum += e;
        }
        if sum > 0.0 && sum.is_finite() {
            for v in or.iter_mut() {
                *v /= sum;
            }
        } else {
            let uniform = 1.0 / row_len as f32;
            or.fill(uniform);
        }
    }
}

/// Causal attention mask over score rows
///
/// `x` is `[n, t, h]` of attention scores; lane `i0` of row `(i1, i2)` is
/// set to -inf when `i0 > n_past + i1`, so a query never attends past its
/// own position.
pub fn causal_mask_rows(x: &[f32], out: &mut [f32], ne: [usize; 3], n_past: i32) {
    let (n, t, h) = (ne[0], ne[1], ne[2]);
    for i2 in 0..h {
        for i1 in 0..t {
            let limit = n_past + i1 as i32;
            let base = (i2 * t + i1) * n;
            for i0 in 0..n {
                out[base + i0] = if i0 as i32 > limit {
                    f32::NEG_INFINITY
                } else {
                    x[base + i0]
                };
            }
        }
    }
}

/// Rotary position embedding
///
/// `x` is contiguous `[ne0, ne1, ne2]` — lanes, heads, positions — and the
/// position of column `i2` is `n_past + i2`. The first `n_dims` lanes of
/// every head rotate; the rest pass through. Interleaved mode pairs lanes
/// `(2k, 2k+1)`; half-split pairs `(k, k + n_dims/2)`.
pub fn rope_rows(
    x: &[f32],
    out: &mut [f32],
    ne: [usize; 3],
    n_past: i32,
    n_dims: usize,
    mode: RopeMode,
    theta_base: f32,
) {
    let (ne0, ne1, ne2) = (ne[0], ne[1], ne[2]);
    debug_assert!(n_dims <= ne0 && n_dims % 2 == 0);

    for i2 in 0..ne2 {
        let p = (n_past + i2 as i32) as f32;
        for i1 in 0..ne1 {
            let base = (i2 * ne1 + i1) * ne0;
            let row = &x[base..base + ne0];
            let out_row = &mut out[base..base + ne0];

            for k in 0..n_dims / 2 {
                let freq = theta_base.powf(-2.0 * k as f32 / n_dims as f32);
                let angle = p * freq;
                let (sin, cos) = angle.sin_cos();
                let (a, b) = match mode {
                    RopeMode::Interleaved => (2 * k, 2 * k + 1),
                    RopeMode::HalfSplit => (k, k + n_dims / 2),
                };
                let (x0, x1) = (row[a], row[b]);
                out_row[a] = x0 * cos - x1 * sin;
                out_row[b] = x0 * sin + x1 * cos;
            }
            out_row[n_dims..].copy_from_slice(&row[n_dims..]);
        }
    }
}

/// Gather rows of an embedding matrix at integer indices
///
/// `src` is `[d, V]` in any decodable dtype; `idx` holds token ids; the
/// output is `[d, len(idx)]` f32.
pub fn get_rows(
    src: &[u8],
    src_dtype: DType,
    d: usize,
    n_vocab: usize,
    idx: &[i32],
    out: &mut [f32],
) -> LlmResult<()> {
    let row_bytes = src_dtype.row_bytes(d);
    for (t, &id) in idx.iter().enumerate() {
        let id = id as usize;
        if id >= n_vocab {
            return Err(LlmError::ShapeMismatch {
                op: "get_rows",
                detail: format!("row index {} out of {} rows", id, n_vocab),
            });
        }
        let row = &src[id * row_bytes..(id + 1) * row_bytes];
        dequantize_row(row, &mut out[t * d..(t + 1) * d], d, src_dtype)?;
    }
    Ok(())
}

/// Strided f32 copy between two equally-shaped 4-D views
///
/// Both sides address element `(i0, i1, i2, i3)` at byte offset
/// `sum_i(i * nb[i])` in their own buffers. This is the cache-append and
/// contiguify primitive; a transposed destination view turns it into a
/// scatter.
pub fn strided_copy_f32(
    src: &[u8],
    src_nb: [usize; MAX_DIMS],
    dst: &mut [u8],
    dst_nb: [usize; MAX_DIMS],
    ne: [usize; MAX_DIMS],
) {
    for i3 in 0..ne[3] {
        for i2 in 0..ne[2] {
            for i1 in 0..ne[1] {
                let s_base = i1 * src_nb[1] + i2 * src_nb[2] + i3 * src_nb[3];
                let d_base = i1 * dst_nb[1] + i2 * dst_nb[2] + i3 * dst_nb[3];
                for i0 in 0..ne[0] {
                    let s = s_base + i0 * src_nb[0];
                    let d = d_base + i0 * dst_nb[0];
                    dst[d..d + 4].copy_from_slice(&src[s..s + 4]);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    fn dense_view(data: &[u8], ne: [usize; 3]) -> MatView<'_> {
        MatView {
            data,
            dtype: DType::F32,
            ne,
            nb: [4, ne[0] * 4, ne[0] * ne[1] * 4],
        }
    }

    #[test]
    fn test_mul_mat_convention() {
        // A = [[1,2,3],[4,5,6]] stored column-contracted: K=3, M=2
        let a_data = f32_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        // B: K=3, N=2
        let b_data = f32_bytes(&[1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        let a = dense_view(&a_data, [3, 2, 1]);
        let b = dense_view(&b_data, [3, 2, 1]);

        let mut out = vec![0.0f32; 4];
        let mut scratch = Vec::new();
        mul_mat(&a, &b, &mut out, &mut scratch).unwrap();

        // C[m + n*M] = dot(A col m, B col n)
        assert_eq!(out, vec![1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    fn test_mul_mat_matches_reference() {
        // Random-ish A [K=4, M=3], B [K=4, N=2] against a naive A^T . B
        let a_vals: Vec<f32> = (0..12).map(|i| (i as f32 * 0.37).sin()).collect();
        let b_vals: Vec<f32> = (0..8).map(|i| (i as f32 * 0.81).cos()).collect();
        let a_data = f32_bytes(&a_vals);
        let b_data = f32_bytes(&b_vals);
        let a = dense_view(&a_data, [4, 3, 1]);
        let b = dense_view(&b_data, [4, 2, 1]);

        let mut out = vec![0.0f32; 6];
        mul_mat(&a, &b, &mut out, &mut Vec::new()).unwrap();

        for m in 0..3 {
            for n in 0..2 {
                let mut expect = 0.0f32;
                for k in 0..4 {
                    expect += a_vals[m * 4 + k] * b_vals[n * 4 + k];
                }
                let got = out[m + n * 3];
                assert!(
                    (got - expect).abs() <= 1e-4 * expect.abs().max(1.0),
                    "C[{},{}] = {}, expected {}",
                    m,
                    n,
                    got,
                    expect
                );
            }
        }
    }

    #[test]
    fn test_mul_mat_shape_mismatch() {
        let a_data = f32_bytes(&[0.0; 6]);
        let b_data = f32_bytes(&[0.0; 8]);
        let a = dense_view(&a_data, [3, 2, 1]);
        let b = dense_view(&b_data, [4, 2, 1]);
        let err = mul_mat(&a, &b, &mut [0.0; 4], &mut Vec::new()).unwrap_err();
        assert!(matches!(err, LlmError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_mul_mat_batch_broadcast() {
        // A has one batch, B has two: both B batches contract against A's
        let a_data = f32_bytes(&[1.0, 1.0]);
        let b_data = f32_bytes(&[1.0, 2.0, 3.0, 4.0]);
        let a = dense_view(&a_data, [2, 1, 1]);
        let b = dense_view(&b_data, [2, 1, 2]);

        let mut out = vec![0.0f32; 2];
        mul_mat(&a, &b, &mut out, &mut Vec::new()).unwrap();
        assert_eq!(out, vec![3.0, 7.0]);
    }

    #[test]
    fn test_rms_norm_unit_row_fixed_point() {
        // A row whose RMS is already 1 comes back unchanged (eps = 0)
        let x = vec![1.0f32, -1.0, 1.0, -1.0];
        let mut out = vec![0.0f32; 4];
        rms_norm_rows(&x, &mut out, 4, 0.0);
        for (a, b) in x.iter().zip(&out) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_rms_norm_scales_to_unit() {
        let x = vec![3.0f32, 3.0, 3.0, 3.0];
        let mut out = vec![0.0f32; 4];
        rms_norm_rows(&x, &mut out, 4, 1e-9);
        let rms = (out.iter().map(|v| v * v).sum::<f32>() / 4.0).sqrt();
        assert!((rms - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_softmax_shift_invariance() {
        let x = vec![0.5f32, -1.0, 2.0, 0.0];
        let shifted: Vec<f32> = x.iter().map(|v| v + 37.5).collect();
        let mut a = vec![0.0f32; 4];
        let mut b = vec![0.0f32; 4];
        softmax_rows(&x, &mut a, 4);
        softmax_rows(&shifted, &mut b, 4);
        for (p, q) in a.iter().zip(&b) {
            assert!((p - q).abs() < 1e-5);
        }
        assert!((a.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_softmax_degenerate_row_is_uniform() {
        let x = vec![f32::NEG_INFINITY; 4];
        let mut out = vec![0.0f32; 4];
        softmax_rows(&x, &mut out, 4);
        for &v in &out {
            assert!((v - 0.25).abs() < 1e-6);
        }
    }

    #[test]
    fn test_causal_mask() {
        // n = 3 cached positions, t = 2 queries, n_past = 1
        let x = vec![1.0f32; 6];
        let mut out = vec![0.0f32; 6];
        causal_mask_rows(&x, &mut out, [3, 2, 1], 1);
        // Query 0 (position 1) sees lanes 0..=1
        assert_eq!(out[0], 1.0);
        assert_eq!(out[1], 1.0);
        assert_eq!(out[2], f32::NEG_INFINITY);
        // Query 1 (position 2) sees everything
        assert_eq!(&out[3..6], &[1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_silu() {
        let x = vec![0.0f32, 1.0, -1.0];
        let mut out = vec![0.0f32; 3];
        vec_silu(&x, &mut out);
        assert_eq!(out[0], 0.0);
        assert!((out[1] - 0.731_058_6).abs() < 1e-5);
        assert!((out[2] + 0.268_941_42).abs() < 1e-5);
    }

    #[test]
    fn test_rope_inverse() {
        // Rotating forward by n_past then back recovers the input for the
        // first column
        let x: Vec<f32> = (0..8).map(|i| (i as f32 * 0.3).sin()).collect();
        let mut fwd = vec![0.0f32; 8];
        let mut back = vec![0.0f32; 8];
        rope_rows(&x, &mut fwd, [8, 1, 1], 7, 8, RopeMode::Interleaved, 10000.0);
        rope_rows(&fwd, &mut back, [8, 1, 1], -7, 8, RopeMode::Interleaved, 10000.0);
        for (a, b) in x.iter().zip(&back) {
            assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_rope_position_zero_is_identity() {
        let x: Vec<f32> = (0..4).map(|i| i as f32).collect();
        let mut out = vec![0.0f32; 4];
        rope_rows(&x, &mut out, [4, 1, 1], 0, 4, RopeMode::Interleaved, 10000.0);
        assert_eq!(x, out);
    }

    #[test]
    fn test_get_rows() {
        // E = [d=2, V=3]
        let e = f32_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let mut out = vec![0.0f32; 4];
        get_rows(&e, DType::F32, 2, 3, &[2, 0], &mut out).unwrap();
        assert_eq!(out, vec![5.0, 6.0, 1.0, 2.0]);

        let err = get_rows(&e, DType::F32, 2, 3, &[3], &mut [0.0; 2]).unwrap_err();
        assert!(matches!(err, LlmError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_strided_copy_transpose() {
        // Copy a [2, 3] matrix into a transposed destination layout
        let src = f32_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let mut dst = vec![0u8; 24];
        strided_copy_f32(
            &src,
            [4, 8, 24, 24],
            &mut dst,
            [12, 4, 24, 24],
            [2, 3, 1, 1],
        );
        let out = crate::arena::cast_f32(&dst);
        assert_eq!(out, &[1.0, 3.0, 5.0, 2.0, 4.0, 6.0]);
    }
}
