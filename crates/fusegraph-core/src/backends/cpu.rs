//! CPU Backend - Reference Primitive Execution
//!
//! Executes primitive descriptors on host memory. Every kernel gathers its
//! sources into logical row-major f32 values, computes, runs the post-op
//! chain, and scatters the result through the destination layout and type.
//! This keeps layout handling in one place (`memory::gather`/`scatter`) and
//! lets each kernel be written against plain indexing.
//!
//! # Key Features
//! - Broadcasting binary ops and the full eltwise algorithm set
//! - Batched matmul with constant or runtime zero points
//! - Grouped, strided, dilated 2-D convolution
//! - Batch and layer normalization, reorders
//! - Multi-threaded execution via rayon above a size threshold
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use rayon::prelude::*;

use super::Backend;
use crate::error::{Error, Result};
use crate::memory::{numel, Memory, MemoryDesc};
use crate::primitive::{
    Algorithm, Arg, ArgMap, ConvolutionParams, PostOp, PrimitiveAttr, PrimitiveDesc,
    PrimitiveKind, ZeroPoint,
};

/// Threshold for using parallel processing (in elements)
const PARALLEL_THRESHOLD: usize = 4096;

// =============================================================================
// CPU Backend Struct
// =============================================================================

/// CPU backend for primitive execution.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

impl CpuBackend {
    /// Creates a new CPU backend.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

// =============================================================================
// Backend Trait Implementation
// =============================================================================

impl Backend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn execute(&self, desc: &PrimitiveDesc, attr: &PrimitiveAttr, args: &ArgMap) -> Result<()> {
        let kind = desc.kind();
        let values = match desc {
            PrimitiveDesc::Binary {
                algorithm,
                src0,
                src1,
                dst,
            } => {
                let a = arg(args, Arg::Src, kind)?.load_as(src0)?;
                let b = arg(args, Arg::Src1, kind)?.load_as(src1)?;
                Self::binary(*algorithm, &a, src0.dims(), &b, src1.dims(), dst.dims())
            }
            PrimitiveDesc::Eltwise {
                algorithm,
                alpha,
                beta,
                src,
                ..
            } => {
                let mut x = arg(args, Arg::Src, kind)?.load_as(src)?;
                Self::eltwise_in_place(&mut x, *algorithm, *alpha, *beta);
                x
            }
            PrimitiveDesc::MatMul { src, weights, dst } => {
                let a = arg(args, Arg::Src, kind)?.load_as(src)?;
                let b = arg(args, Arg::Weights, kind)?.load_as(weights)?;
                let zp_a = zero_point(attr, args, Arg::Src)?;
                let zp_b = zero_point(attr, args, Arg::Weights)?;
                Self::matmul(&a, src.dims(), &b, weights.dims(), dst.dims(), zp_a, zp_b)
            }
            PrimitiveDesc::Convolution {
                src,
                weights,
                bias,
                dst,
                params,
            } => {
                let x = arg(args, Arg::Src, kind)?.load_as(src)?;
                let w = arg(args, Arg::Weights, kind)?.load_as(weights)?;
                let b = match bias {
                    Some(bias) => Some(arg(args, Arg::Bias, kind)?.load_as(bias)?),
                    None => None,
                };
                Self::convolution(
                    &x,
                    src.dims(),
                    &w,
                    weights.dims(),
                    b.as_deref(),
                    dst.dims(),
                    params,
                )
            }
            PrimitiveDesc::BatchNormalization { src, epsilon, .. } => {
                let x = arg(args, Arg::Src, kind)?.load_as(src)?;
                let scale = arg(args, Arg::Scale, kind)?.load()?;
                let shift = arg(args, Arg::Shift, kind)?.load()?;
                let mean = arg(args, Arg::Mean, kind)?.load()?;
                let variance = arg(args, Arg::Variance, kind)?.load()?;
                Self::batch_normalization(
                    &x,
                    src.dims(),
                    &scale,
                    &shift,
                    &mean,
                    &variance,
                    *epsilon,
                )?
            }
            PrimitiveDesc::LayerNormalization {
                src,
                epsilon,
                use_shift,
                ..
            } => {
                let x = arg(args, Arg::Src, kind)?.load_as(src)?;
                let scale = match args.get(&Arg::Scale) {
                    Some(memory) => Some(memory.load()?),
                    None => None,
                };
                let shift = if *use_shift {
                    Some(arg(args, Arg::Shift, kind)?.load()?)
                } else {
                    None
                };
                Self::layer_normalization(
                    &x,
                    src.dims(),
                    scale.as_deref(),
                    shift.as_deref(),
                    *epsilon,
                )?
            }
            PrimitiveDesc::Reorder { src, .. } => arg(args, Arg::Src, kind)?.load_as(src)?,
        };

        let mut values = values;
        let dst = desc.dst_desc();
        apply_post_ops(&mut values, dst, attr, args)?;
        arg(args, Arg::Dst, kind)?.store_as(dst, &values)
    }
}

// =============================================================================
// Argument Helpers
// =============================================================================

fn arg(args: &ArgMap, slot: Arg, kind: PrimitiveKind) -> Result<&Memory> {
    args.get(&slot)
        .ok_or_else(|| Error::missing_argument(slot, kind))
}

fn zero_point(attr: &PrimitiveAttr, args: &ArgMap, slot: Arg) -> Result<f32> {
    match attr.zero_point(slot) {
        None => Ok(0.0),
        Some(ZeroPoint::Constant(value)) => Ok(value as f32),
        Some(ZeroPoint::Runtime) => {
            let runtime = match slot {
                Arg::Src => Arg::SrcZeroPoint,
                _ => Arg::WeightsZeroPoint,
            };
            let values = arg(args, runtime, PrimitiveKind::MatMul)?.load()?;
            values
                .first()
                .copied()
                .ok_or_else(|| Error::invalid_operation("empty zero point tensor"))
        }
    }
}

/// Maps every row-major index of `dst` to the row-major index of a
/// broadcast source of equal rank.
fn broadcast_indices(src: &[usize], dst: &[usize]) -> Vec<usize> {
    let total = numel(dst);
    let rank = dst.len();
    let mut src_strides = vec![0usize; rank];
    let mut stride = 1usize;
    for axis in (0..rank).rev() {
        src_strides[axis] = if src[axis] == 1 { 0 } else { stride };
        stride *= src[axis];
    }
    let mut indices = Vec::with_capacity(total);
    let mut counter = vec![0usize; rank];
    for _ in 0..total {
        indices.push(
            counter
                .iter()
                .zip(src_strides.iter())
                .map(|(&i, &s)| i * s)
                .sum(),
        );
        for axis in (0..rank).rev() {
            counter[axis] += 1;
            if counter[axis] < dst[axis] {
                break;
            }
            counter[axis] = 0;
        }
    }
    indices
}

fn apply_post_ops(
    values: &mut [f32],
    dst: &MemoryDesc,
    attr: &PrimitiveAttr,
    args: &ArgMap,
) -> Result<()> {
    for (position, post_op) in attr.post_ops().iter().enumerate() {
        match post_op {
            PostOp::Eltwise {
                algorithm,
                alpha,
                beta,
            } => CpuBackend::eltwise_in_place(values, *algorithm, *alpha, *beta),
            PostOp::Binary {
                algorithm,
                src1,
                accumulator_rhs,
            } => {
                let other = args
                    .get(&Arg::PostOpSrc1(position))
                    .ok_or_else(|| Error::missing_argument(Arg::PostOpSrc1(position), "post-op"))?
                    .load_as(src1)?;
                let indices = broadcast_indices(src1.dims(), dst.dims());
                for (value, &index) in values.iter_mut().zip(indices.iter()) {
                    *value = if *accumulator_rhs {
                        binary_op(*algorithm, other[index], *value)
                    } else {
                        binary_op(*algorithm, *value, other[index])
                    };
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Scalar Operations
// =============================================================================

fn binary_op(algorithm: Algorithm, a: f32, b: f32) -> f32 {
    let flag = |c: bool| if c { 1.0 } else { 0.0 };
    match algorithm {
        Algorithm::BinaryAdd => a + b,
        Algorithm::BinarySub => a - b,
        Algorithm::BinaryMul => a * b,
        Algorithm::BinaryDiv => a / b,
        Algorithm::BinaryEq => flag(a == b),
        Algorithm::BinaryGt => flag(a > b),
        Algorithm::BinaryGe => flag(a >= b),
        Algorithm::BinaryLt => flag(a < b),
        Algorithm::BinaryLe => flag(a <= b),
        _ => a,
    }
}

fn eltwise_op(algorithm: Algorithm, x: f32, alpha: f32, beta: f32) -> f32 {
    match algorithm {
        Algorithm::EltwiseAbs => x.abs(),
        Algorithm::EltwiseElu => {
            if x > 0.0 {
                x
            } else {
                alpha * (x.exp() - 1.0)
            }
        }
        Algorithm::EltwiseExp => x.exp(),
        Algorithm::EltwiseGeluErf => 0.5 * x * (1.0 + erf(x * std::f32::consts::FRAC_1_SQRT_2)),
        Algorithm::EltwiseGeluTanh => {
            let sqrt_2_over_pi = (2.0 / std::f32::consts::PI).sqrt();
            0.5 * x * (1.0 + (sqrt_2_over_pi * (x + 0.044_715 * x * x * x)).tanh())
        }
        Algorithm::EltwiseLinear => alpha * x + beta,
        Algorithm::EltwiseLog => x.ln(),
        Algorithm::EltwiseLogistic => 1.0 / (1.0 + (-x).exp()),
        Algorithm::EltwisePow => alpha * x.powf(beta),
        Algorithm::EltwiseRelu => {
            if x > 0.0 {
                x
            } else {
                alpha * x
            }
        }
        Algorithm::EltwiseRound => x.round_ties_even(),
        Algorithm::EltwiseSoftRelu => {
            if x > 20.0 {
                x
            } else {
                x.exp().ln_1p()
            }
        }
        Algorithm::EltwiseSqrt => x.sqrt(),
        Algorithm::EltwiseTanh => x.tanh(),
        _ => x,
    }
}

/// Error function, Abramowitz and Stegun 7.1.26 (absolute error below 1.5e-7).
fn erf(x: f32) -> f32 {
    let sign = x.signum();
    let x = f64::from(x.abs());
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    sign * (1.0 - poly * (-x * x).exp()) as f32
}

// =============================================================================
// Kernels
// =============================================================================

impl CpuBackend {
    /// Broadcasting binary operation over equal-rank sources.
    pub fn binary(
        algorithm: Algorithm,
        a: &[f32],
        a_dims: &[usize],
        b: &[f32],
        b_dims: &[usize],
        dst_dims: &[usize],
    ) -> Vec<f32> {
        let ia = broadcast_indices(a_dims, dst_dims);
        let ib = broadcast_indices(b_dims, dst_dims);
        if ia.len() >= PARALLEL_THRESHOLD {
            ia.par_iter()
                .zip(ib.par_iter())
                .map(|(&i, &j)| binary_op(algorithm, a[i], b[j]))
                .collect()
        } else {
            ia.iter()
                .zip(ib.iter())
                .map(|(&i, &j)| binary_op(algorithm, a[i], b[j]))
                .collect()
        }
    }

    /// Applies an eltwise algorithm to every value.
    pub fn eltwise_in_place(values: &mut [f32], algorithm: Algorithm, alpha: f32, beta: f32) {
        if values.len() >= PARALLEL_THRESHOLD {
            values
                .par_iter_mut()
                .for_each(|v| *v = eltwise_op(algorithm, *v, alpha, beta));
        } else {
            for v in values.iter_mut() {
                *v = eltwise_op(algorithm, *v, alpha, beta);
            }
        }
    }

    /// Batched matmul `[.., M, K] x [.., K, N]` with broadcast batch dims.
    pub fn matmul(
        a: &[f32],
        a_dims: &[usize],
        b: &[f32],
        b_dims: &[usize],
        dst_dims: &[usize],
        zp_a: f32,
        zp_b: f32,
    ) -> Vec<f32> {
        let rank = dst_dims.len();
        let (m, k, n) = (a_dims[rank - 2], a_dims[rank - 1], b_dims[rank - 1]);
        let batch_a = broadcast_indices(&a_dims[..rank - 2], &dst_dims[..rank - 2]);
        let batch_b = broadcast_indices(&b_dims[..rank - 2], &dst_dims[..rank - 2]);

        let mut out = vec![0.0f32; numel(dst_dims)];
        let row = |(r, dst_row): (usize, &mut [f32])| {
            let batch = r / m.max(1);
            let i = r % m.max(1);
            let a_base = batch_a[batch] * m * k + i * k;
            let b_base = batch_b[batch] * k * n;
            for (j, cell) in dst_row.iter_mut().enumerate() {
                let mut acc = 0.0f64;
                for p in 0..k {
                    let lhs = f64::from(a[a_base + p] - zp_a);
                    let rhs = f64::from(b[b_base + p * n + j] - zp_b);
                    acc += lhs * rhs;
                }
                *cell = acc as f32;
            }
        };
        if n == 0 {
            return out;
        }
        if out.len() >= PARALLEL_THRESHOLD {
            out.par_chunks_mut(n).enumerate().for_each(row);
        } else {
            out.chunks_mut(n).enumerate().for_each(row);
        }
        out
    }

    /// Grouped 2-D convolution over logical NCHW values.
    pub fn convolution(
        x: &[f32],
        x_dims: &[usize],
        w: &[f32],
        w_dims: &[usize],
        bias: Option<&[f32]>,
        dst_dims: &[usize],
        params: &ConvolutionParams,
    ) -> Vec<f32> {
        let (channels, height, width) = (x_dims[1], x_dims[2], x_dims[3]);
        let (outputs, group_channels, kh, kw) = (w_dims[0], w_dims[1], w_dims[2], w_dims[3]);
        let (oh, ow) = (dst_dims[2], dst_dims[3]);
        let groups = params.groups.max(1);
        let outputs_per_group = outputs / groups;

        let mut out = vec![0.0f32; numel(dst_dims)];
        let plane = oh * ow;
        let kernel = |(index, dst_plane): (usize, &mut [f32])| {
            let batch = index / outputs;
            let oc = index % outputs;
            let group = oc / outputs_per_group.max(1);
            let base = bias.map_or(0.0, |b| b[oc]);
            for (p, cell) in dst_plane.iter_mut().enumerate() {
                let (y, x_out) = (p / ow, p % ow);
                let mut acc = f64::from(base);
                for c in 0..group_channels {
                    let ic = group * group_channels + c;
                    for ky in 0..kh {
                        let iy = (y * params.strides[0] + ky * params.dilations[0]) as isize
                            - params.padding_begin[0] as isize;
                        if iy < 0 || iy >= height as isize {
                            continue;
                        }
                        for kx in 0..kw {
                            let ix = (x_out * params.strides[1] + kx * params.dilations[1])
                                as isize
                                - params.padding_begin[1] as isize;
                            if ix < 0 || ix >= width as isize {
                                continue;
                            }
                            let src = x[((batch * channels + ic) * height + iy as usize) * width
                                + ix as usize];
                            let weight = w[((oc * group_channels + c) * kh + ky) * kw + kx];
                            acc += f64::from(src) * f64::from(weight);
                        }
                    }
                }
                *cell = acc as f32;
            }
        };
        if plane == 0 {
            return out;
        }
        if out.len() >= PARALLEL_THRESHOLD {
            out.par_chunks_mut(plane).enumerate().for_each(kernel);
        } else {
            out.chunks_mut(plane).enumerate().for_each(kernel);
        }
        out
    }

    /// Inference batch normalization over channel axis 1.
    pub fn batch_normalization(
        x: &[f32],
        dims: &[usize],
        scale: &[f32],
        shift: &[f32],
        mean: &[f32],
        variance: &[f32],
        epsilon: f32,
    ) -> Result<Vec<f32>> {
        let channels = dims[1];
        if [scale.len(), shift.len(), mean.len(), variance.len()]
            .iter()
            .any(|&len| len < channels)
        {
            return Err(Error::invalid_operation(format!(
                "batch normalization statistics must hold {channels} channels"
            )));
        }
        let inner: usize = dims[2..].iter().product();
        Ok(x.iter()
            .enumerate()
            .map(|(i, &v)| {
                let c = (i / inner.max(1)) % channels;
                scale[c] * (v - mean[c]) / (variance[c] + epsilon).sqrt() + shift[c]
            })
            .collect())
    }

    /// Layer normalization over the last axis.
    pub fn layer_normalization(
        x: &[f32],
        dims: &[usize],
        scale: Option<&[f32]>,
        shift: Option<&[f32]>,
        epsilon: f32,
    ) -> Result<Vec<f32>> {
        let width = dims.last().copied().unwrap_or(1);
        for params in [scale, shift].into_iter().flatten() {
            if params.len() < width {
                return Err(Error::invalid_operation(format!(
                    "layer normalization parameters must hold {width} values"
                )));
            }
        }
        let mut out = x.to_vec();
        if width == 0 {
            return Ok(out);
        }
        let normalize = |row: &mut [f32]| {
            let count = row.len() as f32;
            let mean = row.iter().sum::<f32>() / count;
            let variance = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / count;
            let inv_std = 1.0 / (variance + epsilon).sqrt();
            for (d, v) in row.iter_mut().enumerate() {
                let mut y = (*v - mean) * inv_std;
                if let Some(scale) = scale {
                    y *= scale[d];
                }
                if let Some(shift) = shift {
                    y += shift[d];
                }
                *v = y;
            }
        };
        if out.len() >= PARALLEL_THRESHOLD {
            out.par_chunks_mut(width).for_each(normalize);
        } else {
            out.chunks_mut(width).for_each(normalize);
        }
        Ok(out)
    }
}

// =============================================================================
// Tests
// =============================================================================
