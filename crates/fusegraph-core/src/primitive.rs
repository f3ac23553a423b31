//! Primitives - Descriptors, Attributes and Execution
//!
//! A `PrimitiveDesc` captures one compute operation over concrete memory
//! descriptors. Creating it resolves every `Format::Any` input the way the
//! backend prefers, so callers read the chosen layouts back from the
//! descriptor and reorder their tensors to match. A `PrimitiveAttr` carries
//! the fused post-op chain and quantization zero points. A `Primitive` is the
//! executable pairing of both on one engine.
//!
//! # Key Features
//! - Binary, eltwise, matmul, convolution, batch/layer normalization, reorder
//! - Eltwise and binary post-op chains
//! - Constant or runtime zero points for integer matmul
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use core::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::backends::backend_for;
use crate::dtype::DataType;
use crate::engine::{Engine, Stream};
use crate::error::{Error, Result};
use crate::memory::{Dims, Format, Memory, MemoryDesc};

// =============================================================================
// Primitive Kind
// =============================================================================

/// Backend primitive families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimitiveKind {
    /// Batch normalization.
    BatchNormalization,
    /// Elementwise binary operation with broadcasting.
    Binary,
    /// Concatenation.
    Concat,
    /// Convolution.
    Convolution,
    /// Depthwise convolution (post-op only).
    Depthwise,
    /// Elementwise unary operation.
    Eltwise,
    /// Inner product.
    InnerProduct,
    /// Layer normalization.
    LayerNormalization,
    /// Local response normalization.
    Lrn,
    /// Matrix multiplication.
    MatMul,
    /// Zero-copy view change (reshape and friends).
    Memory,
    /// Pooling.
    Pooling,
    /// Parametric ReLU.
    Prelu,
    /// Reduction.
    Reduction,
    /// Layout and type conversion.
    Reorder,
    /// Resampling.
    Resampling,
    /// Channel shuffle.
    Shuffle,
    /// Softmax.
    Softmax,
    /// Accumulating sum.
    Sum,
}

impl PrimitiveKind {
    /// Returns the display name of this primitive kind.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::BatchNormalization => "BatchNormalization",
            Self::Binary => "Binary",
            Self::Concat => "Concat",
            Self::Convolution => "Convolution",
            Self::Depthwise => "Depthwise",
            Self::Eltwise => "Eltwise",
            Self::InnerProduct => "InnerProduct",
            Self::LayerNormalization => "LayerNormalization",
            Self::Lrn => "LRN",
            Self::MatMul => "MatMul",
            Self::Memory => "Memory",
            Self::Pooling => "Pooling",
            Self::Prelu => "PReLU",
            Self::Reduction => "Reduction",
            Self::Reorder => "Reorder",
            Self::Resampling => "Resampling",
            Self::Shuffle => "Shuffle",
            Self::Softmax => "Softmax",
            Self::Sum => "Sum",
        }
    }
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Algorithm
// =============================================================================

/// Algorithm selector for binary and eltwise primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    /// `a + b`
    BinaryAdd,
    /// `a - b`
    BinarySub,
    /// `a * b`
    BinaryMul,
    /// `a / b`
    BinaryDiv,
    /// `a == b`
    BinaryEq,
    /// `a > b`
    BinaryGt,
    /// `a >= b`
    BinaryGe,
    /// `a < b`
    BinaryLt,
    /// `a <= b`
    BinaryLe,
    /// `|x|`
    EltwiseAbs,
    /// `x > 0 ? x : alpha * (e^x - 1)`
    EltwiseElu,
    /// `e^x`
    EltwiseExp,
    /// GELU, erf form.
    EltwiseGeluErf,
    /// GELU, tanh approximation.
    EltwiseGeluTanh,
    /// `alpha * x + beta`
    EltwiseLinear,
    /// `ln(x)`
    EltwiseLog,
    /// `1 / (1 + e^-x)`
    EltwiseLogistic,
    /// `alpha * x^beta`
    EltwisePow,
    /// `x > 0 ? x : alpha * x`
    EltwiseRelu,
    /// Round half to even.
    EltwiseRound,
    /// `ln(1 + e^x)`
    EltwiseSoftRelu,
    /// `sqrt(x)`
    EltwiseSqrt,
    /// `tanh(x)`
    EltwiseTanh,
}

impl Algorithm {
    /// Returns true for binary algorithms.
    #[must_use]
    pub const fn is_binary(self) -> bool {
        matches!(
            self,
            Self::BinaryAdd
                | Self::BinarySub
                | Self::BinaryMul
                | Self::BinaryDiv
                | Self::BinaryEq
                | Self::BinaryGt
                | Self::BinaryGe
                | Self::BinaryLt
                | Self::BinaryLe
        )
    }

    /// Returns true for eltwise algorithms.
    #[must_use]
    pub const fn is_eltwise(self) -> bool {
        !self.is_binary()
    }
}

// =============================================================================
// Post-ops and Attributes
// =============================================================================

/// One operation appended to a primitive's output.
#[derive(Debug, Clone, PartialEq)]
pub enum PostOp {
    /// Elementwise unary operation on the accumulated value.
    Eltwise {
        /// Eltwise algorithm.
        algorithm: Algorithm,
        /// First algorithm parameter.
        alpha: f32,
        /// Second algorithm parameter.
        beta: f32,
    },
    /// Binary operation between the accumulated value and a second tensor.
    Binary {
        /// Binary algorithm.
        algorithm: Algorithm,
        /// Descriptor of the second operand, broadcastable to the destination.
        src1: MemoryDesc,
        /// True when the accumulated value is the right-hand operand.
        accumulator_rhs: bool,
    },
}

/// Ordered post-op chain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostOps {
    ops: Vec<PostOp>,
}

impl PostOps {
    /// Creates an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an eltwise post-op.
    pub fn append_eltwise(&mut self, algorithm: Algorithm, alpha: f32, beta: f32) {
        self.ops.push(PostOp::Eltwise {
            algorithm,
            alpha,
            beta,
        });
    }

    /// Appends a binary post-op.
    pub fn append_binary(&mut self, algorithm: Algorithm, src1: MemoryDesc, accumulator_rhs: bool) {
        self.ops.push(PostOp::Binary {
            algorithm,
            src1,
            accumulator_rhs,
        });
    }

    /// Returns the number of post-ops.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if no post-op was appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Iterates the chain in order.
    pub fn iter(&self) -> impl Iterator<Item = &PostOp> {
        self.ops.iter()
    }
}

/// Quantization zero point of a matmul operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroPoint {
    /// Value known when the primitive is created.
    Constant(i32),
    /// Value read from the matching zero-point argument at execution.
    Runtime,
}

/// Attributes attached to a primitive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrimitiveAttr {
    post_ops: PostOps,
    src_zero_point: Option<ZeroPoint>,
    weights_zero_point: Option<ZeroPoint>,
}

impl PrimitiveAttr {
    /// Creates empty attributes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the post-op chain.
    pub fn set_post_ops(&mut self, post_ops: PostOps) {
        self.post_ops = post_ops;
    }

    /// Returns the post-op chain.
    #[must_use]
    pub fn post_ops(&self) -> &PostOps {
        &self.post_ops
    }

    /// Sets the zero point of `Arg::Src` or `Arg::Weights`.
    pub fn set_zero_point(&mut self, arg: Arg, zero_point: ZeroPoint) -> Result<()> {
        match arg {
            Arg::Src => self.src_zero_point = Some(zero_point),
            Arg::Weights => self.weights_zero_point = Some(zero_point),
            other => {
                return Err(Error::invalid_operation(format!(
                    "zero points are only defined for SRC and WEIGHTS, not {other}"
                )))
            }
        }
        Ok(())
    }

    /// Returns the zero point of `Arg::Src` or `Arg::Weights`.
    #[must_use]
    pub fn zero_point(&self, arg: Arg) -> Option<ZeroPoint> {
        match arg {
            Arg::Src => self.src_zero_point,
            Arg::Weights => self.weights_zero_point,
            _ => None,
        }
    }
}

// =============================================================================
// Arguments
// =============================================================================

/// Execution argument slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arg {
    /// Primary source (also the first binary source).
    Src,
    /// Second binary source.
    Src1,
    /// Weights.
    Weights,
    /// Bias.
    Bias,
    /// Destination.
    Dst,
    /// Normalization scale.
    Scale,
    /// Normalization shift.
    Shift,
    /// Batch normalization mean.
    Mean,
    /// Batch normalization variance.
    Variance,
    /// Runtime zero point of the primary source.
    SrcZeroPoint,
    /// Runtime zero point of the weights.
    WeightsZeroPoint,
    /// Second operand of the binary post-op at the given chain position.
    PostOpSrc1(usize),
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Src => f.write_str("SRC"),
            Self::Src1 => f.write_str("SRC_1"),
            Self::Weights => f.write_str("WEIGHTS"),
            Self::Bias => f.write_str("BIAS"),
            Self::Dst => f.write_str("DST"),
            Self::Scale => f.write_str("SCALE"),
            Self::Shift => f.write_str("SHIFT"),
            Self::Mean => f.write_str("MEAN"),
            Self::Variance => f.write_str("VARIANCE"),
            Self::SrcZeroPoint => f.write_str("ZERO_POINTS|SRC"),
            Self::WeightsZeroPoint => f.write_str("ZERO_POINTS|WEIGHTS"),
            Self::PostOpSrc1(n) => write!(f, "POST_OP({n})|SRC_1"),
        }
    }
}

/// Memory objects bound to a primitive's argument slots.
pub type ArgMap = FxHashMap<Arg, Memory>;

// =============================================================================
// Primitive Descriptors
// =============================================================================

/// Geometry of a 2-D convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvolutionParams {
    /// Stride along H and W.
    pub strides: [usize; 2],
    /// Leading padding along H and W.
    pub padding_begin: [usize; 2],
    /// Trailing padding along H and W.
    pub padding_end: [usize; 2],
    /// Dilation factor along H and W (1 means dense).
    pub dilations: [usize; 2],
    /// Number of channel groups.
    pub groups: usize,
}

impl Default for ConvolutionParams {
    fn default() -> Self {
        Self {
            strides: [1, 1],
            padding_begin: [0, 0],
            padding_end: [0, 0],
            dilations: [1, 1],
            groups: 1,
        }
    }
}

/// One compute operation over concrete memory descriptors.
#[derive(Debug, Clone, PartialEq)]
pub enum PrimitiveDesc {
    /// Broadcasting binary operation.
    Binary {
        /// Binary algorithm.
        algorithm: Algorithm,
        /// First source.
        src0: MemoryDesc,
        /// Second source.
        src1: MemoryDesc,
        /// Destination.
        dst: MemoryDesc,
    },
    /// Elementwise unary operation.
    Eltwise {
        /// Eltwise algorithm.
        algorithm: Algorithm,
        /// First algorithm parameter.
        alpha: f32,
        /// Second algorithm parameter.
        beta: f32,
        /// Source.
        src: MemoryDesc,
        /// Destination.
        dst: MemoryDesc,
    },
    /// Batched matrix multiplication.
    MatMul {
        /// Left operand `[.., M, K]`.
        src: MemoryDesc,
        /// Right operand `[.., K, N]`.
        weights: MemoryDesc,
        /// Result `[.., M, N]`.
        dst: MemoryDesc,
    },
    /// 2-D convolution.
    Convolution {
        /// Source `[N, C, H, W]`.
        src: MemoryDesc,
        /// Weights `[M, C / groups, KH, KW]`.
        weights: MemoryDesc,
        /// Optional bias `[M]`.
        bias: Option<MemoryDesc>,
        /// Destination `[N, M, OH, OW]`.
        dst: MemoryDesc,
        /// Convolution geometry.
        params: ConvolutionParams,
    },
    /// Inference batch normalization with global statistics.
    BatchNormalization {
        /// Source `[N, C, ..]`.
        src: MemoryDesc,
        /// Destination.
        dst: MemoryDesc,
        /// Variance epsilon.
        epsilon: f32,
    },
    /// Layer normalization over the last axis.
    LayerNormalization {
        /// Source.
        src: MemoryDesc,
        /// Destination.
        dst: MemoryDesc,
        /// Variance epsilon.
        epsilon: f32,
        /// Whether a shift argument is applied.
        use_shift: bool,
    },
    /// Layout and type conversion.
    Reorder {
        /// Source.
        src: MemoryDesc,
        /// Destination.
        dst: MemoryDesc,
    },
}

impl PrimitiveDesc {
    /// Creates a binary descriptor.
    ///
    /// Sources must share a rank; `dst` dims must be their broadcast.
    pub fn binary(
        algorithm: Algorithm,
        src0: MemoryDesc,
        src1: MemoryDesc,
        dst: MemoryDesc,
    ) -> Result<Self> {
        if !algorithm.is_binary() {
            return Err(Error::invalid_operation(format!(
                "{algorithm:?} is not a binary algorithm"
            )));
        }
        if src0.ndims() != src1.ndims() {
            return Err(Error::shape_mismatch(src0.dims(), src1.dims()));
        }
        let expected = broadcast_dims(src0.dims(), src1.dims())?;
        if dst.dims() != expected.as_slice() {
            return Err(Error::shape_mismatch(&expected, dst.dims()));
        }
        Ok(Self::Binary {
            algorithm,
            src0: src0.resolve(Format::Plain),
            src1: src1.resolve(Format::Plain),
            dst: dst.resolve(Format::Plain),
        })
    }

    /// Creates an eltwise descriptor; the destination mirrors the source layout.
    pub fn eltwise(algorithm: Algorithm, alpha: f32, beta: f32, src: MemoryDesc) -> Result<Self> {
        if !algorithm.is_eltwise() {
            return Err(Error::invalid_operation(format!(
                "{algorithm:?} is not an eltwise algorithm"
            )));
        }
        let src = src.resolve(Format::Plain);
        Ok(Self::Eltwise {
            algorithm,
            alpha,
            beta,
            dst: src.clone(),
            src,
        })
    }

    /// Creates a matmul descriptor.
    pub fn matmul(src: MemoryDesc, weights: MemoryDesc, dst: MemoryDesc) -> Result<Self> {
        let rank = src.ndims();
        if rank < 2 || weights.ndims() != rank || dst.ndims() != rank {
            return Err(Error::invalid_operation(format!(
                "matmul operands must share a rank of at least 2, got {:?} x {:?} -> {:?}",
                src.dims(),
                weights.dims(),
                dst.dims()
            )));
        }
        if src.dims()[rank - 1] != weights.dims()[rank - 2] {
            return Err(Error::shape_mismatch(
                &[src.dims()[rank - 1]],
                &[weights.dims()[rank - 2]],
            ));
        }
        let batch = broadcast_dims(&src.dims()[..rank - 2], &weights.dims()[..rank - 2])?;
        let mut expected: Dims = batch;
        expected.push(src.dims()[rank - 2]);
        expected.push(weights.dims()[rank - 1]);
        if dst.dims() != expected.as_slice() {
            return Err(Error::shape_mismatch(&expected, dst.dims()));
        }
        Ok(Self::MatMul {
            src: src.resolve(Format::Plain),
            weights: weights.resolve(Format::Plain),
            dst: dst.resolve(Format::Plain),
        })
    }

    /// Creates a 2-D convolution descriptor.
    ///
    /// `Format::Any` sources and destinations resolve to channels-last.
    pub fn convolution(
        src: MemoryDesc,
        weights: MemoryDesc,
        bias: Option<MemoryDesc>,
        dst: MemoryDesc,
        params: ConvolutionParams,
    ) -> Result<Self> {
        if src.ndims() != 4 || weights.ndims() != 4 || dst.ndims() != 4 {
            return Err(Error::invalid_operation(format!(
                "only 2-D convolution is supported, got src {:?} weights {:?}",
                src.dims(),
                weights.dims()
            )));
        }
        let groups = params.groups.max(1);
        let (channels, outputs) = (src.dims()[1], weights.dims()[0]);
        if channels % groups != 0 || outputs % groups != 0 || weights.dims()[1] * groups != channels
        {
            return Err(Error::invalid_operation(format!(
                "convolution channels {channels} and outputs {outputs} do not split into {groups} groups"
            )));
        }
        let mut expected: Dims = Dims::from_slice(&[src.dims()[0], outputs]);
        for axis in 0..2 {
            let extent = src.dims()[axis + 2] + params.padding_begin[axis] + params.padding_end[axis];
            let window = (weights.dims()[axis + 2].max(1) - 1) * params.dilations[axis].max(1) + 1;
            if extent < window {
                return Err(Error::invalid_operation(format!(
                    "convolution window {window} exceeds padded extent {extent}"
                )));
            }
            expected.push((extent - window) / params.strides[axis].max(1) + 1);
        }
        if dst.dims() != expected.as_slice() {
            return Err(Error::shape_mismatch(&expected, dst.dims()));
        }
        if let Some(bias) = &bias {
            if bias.numel() != outputs {
                return Err(Error::shape_mismatch(&[outputs], bias.dims()));
            }
        }
        Ok(Self::Convolution {
            src: src.resolve(Format::ChannelsLast),
            weights: weights.resolve(Format::Plain),
            bias: bias.map(|b| b.resolve(Format::Plain)),
            dst: dst.resolve(Format::ChannelsLast),
            params,
        })
    }

    /// Creates a batch normalization descriptor; the destination mirrors the source.
    pub fn batch_normalization(src: MemoryDesc, dst_dtype: DataType, epsilon: f32) -> Result<Self> {
        if src.ndims() < 2 {
            return Err(Error::invalid_operation(
                "batch normalization needs a channel axis",
            ));
        }
        let src = src.resolve(Format::Plain);
        Ok(Self::BatchNormalization {
            dst: src.with_dtype(dst_dtype),
            src,
            epsilon,
        })
    }

    /// Creates a layer normalization descriptor; the destination mirrors the source.
    pub fn layer_normalization(
        src: MemoryDesc,
        dst: Option<MemoryDesc>,
        epsilon: f32,
        use_shift: bool,
    ) -> Result<Self> {
        if src.ndims() == 0 {
            return Err(Error::invalid_operation(
                "layer normalization needs at least one axis",
            ));
        }
        let src = src.resolve(Format::Plain);
        let dst = match dst {
            Some(dst) if dst.dims() != src.dims() => {
                return Err(Error::shape_mismatch(src.dims(), dst.dims()))
            }
            Some(dst) => dst.resolve(src.format()),
            None => src.clone(),
        };
        Ok(Self::LayerNormalization {
            src,
            dst,
            epsilon,
            use_shift,
        })
    }

    /// Creates a reorder between two concrete descriptors with equal dims.
    pub fn reorder(src: MemoryDesc, dst: MemoryDesc) -> Result<Self> {
        if src.is_any() || dst.is_any() {
            return Err(Error::invalid_operation(
                "reorder descriptors must have a concrete layout",
            ));
        }
        if src.dims() != dst.dims() {
            return Err(Error::shape_mismatch(src.dims(), dst.dims()));
        }
        Ok(Self::Reorder { src, dst })
    }

    /// Returns the primitive family.
    #[must_use]
    pub const fn kind(&self) -> PrimitiveKind {
        match self {
            Self::Binary { .. } => PrimitiveKind::Binary,
            Self::Eltwise { .. } => PrimitiveKind::Eltwise,
            Self::MatMul { .. } => PrimitiveKind::MatMul,
            Self::Convolution { .. } => PrimitiveKind::Convolution,
            Self::BatchNormalization { .. } => PrimitiveKind::BatchNormalization,
            Self::LayerNormalization { .. } => PrimitiveKind::LayerNormalization,
            Self::Reorder { .. } => PrimitiveKind::Reorder,
        }
    }

    /// Returns the primary source descriptor.
    #[must_use]
    pub fn src_desc(&self) -> &MemoryDesc {
        match self {
            Self::Binary { src0, .. } => src0,
            Self::Eltwise { src, .. }
            | Self::MatMul { src, .. }
            | Self::Convolution { src, .. }
            | Self::BatchNormalization { src, .. }
            | Self::LayerNormalization { src, .. }
            | Self::Reorder { src, .. } => src,
        }
    }

    /// Returns the weights descriptor, if the primitive has weights.
    #[must_use]
    pub fn weights_desc(&self) -> Option<&MemoryDesc> {
        match self {
            Self::MatMul { weights, .. } | Self::Convolution { weights, .. } => Some(weights),
            _ => None,
        }
    }

    /// Returns the destination descriptor.
    #[must_use]
    pub fn dst_desc(&self) -> &MemoryDesc {
        match self {
            Self::Binary { dst, .. }
            | Self::Eltwise { dst, .. }
            | Self::MatMul { dst, .. }
            | Self::Convolution { dst, .. }
            | Self::BatchNormalization { dst, .. }
            | Self::LayerNormalization { dst, .. }
            | Self::Reorder { dst, .. } => dst,
        }
    }
}

/// Broadcasts two equal-rank dims (a dim of 1 stretches to the other).
pub fn broadcast_dims(a: &[usize], b: &[usize]) -> Result<Dims> {
    if a.len() != b.len() {
        return Err(Error::shape_mismatch(a, b));
    }
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| match (x, y) {
            _ if x == y => Ok(x),
            (1, _) => Ok(y),
            (_, 1) => Ok(x),
            _ => Err(Error::shape_mismatch(a, b)),
        })
        .collect()
}

// =============================================================================
// Primitive
// =============================================================================

#[derive(Debug)]
struct PrimitiveInner {
    desc: PrimitiveDesc,
    attr: PrimitiveAttr,
    engine: Engine,
}

/// An executable primitive bound to an engine.
#[derive(Debug, Clone)]
pub struct Primitive {
    inner: Arc<PrimitiveInner>,
}

impl Primitive {
    /// Creates a primitive, validating its attributes against the descriptor.
    pub fn new(desc: PrimitiveDesc, attr: PrimitiveAttr, engine: &Engine) -> Result<Self> {
        let dst_rank = desc.dst_desc().ndims();
        for post_op in attr.post_ops().iter() {
            if let PostOp::Binary { src1, .. } = post_op {
                if src1.ndims() != dst_rank {
                    return Err(Error::shape_mismatch(desc.dst_desc().dims(), src1.dims()));
                }
                broadcast_dims(desc.dst_desc().dims(), src1.dims())?;
            }
        }
        if (attr.zero_point(Arg::Src).is_some() || attr.zero_point(Arg::Weights).is_some())
            && desc.kind() != PrimitiveKind::MatMul
        {
            return Err(Error::invalid_operation(format!(
                "zero points are not supported by {}",
                desc.kind()
            )));
        }
        Ok(Self {
            inner: Arc::new(PrimitiveInner {
                desc,
                attr,
                engine: *engine,
            }),
        })
    }

    /// Convenience constructor for a reorder without attributes.
    pub fn reorder(src: &MemoryDesc, dst: &MemoryDesc, engine: &Engine) -> Result<Self> {
        Self::new(
            PrimitiveDesc::reorder(src.clone(), dst.clone())?,
            PrimitiveAttr::new(),
            engine,
        )
    }

    /// Returns the primitive family.
    #[must_use]
    pub fn kind(&self) -> PrimitiveKind {
        self.inner.desc.kind()
    }

    /// Returns the descriptor.
    #[must_use]
    pub fn desc(&self) -> &PrimitiveDesc {
        &self.inner.desc
    }

    /// Returns the attributes.
    #[must_use]
    pub fn attr(&self) -> &PrimitiveAttr {
        &self.inner.attr
    }

    /// Returns the engine this primitive runs on.
    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// Submits the primitive to `stream` with the given arguments.
    pub fn execute(&self, stream: &Stream, args: &ArgMap) -> Result<()> {
        let backend = backend_for(stream.engine())?;
        trace!(
            kind = ?self.kind(),
            backend = backend.name(),
            post_ops = self.inner.attr.post_ops().len(),
            "executing primitive"
        );
        backend.execute(&self.inner.desc, &self.inner.attr, args)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_dims() {
        let dims = broadcast_dims(&[2, 1, 4], &[1, 3, 4]).unwrap();
        assert_eq!(dims.as_slice(), &[2, 3, 4]);
        assert!(broadcast_dims(&[2, 3], &[3, 3]).is_err());
    }

    #[test]
    fn test_binary_desc_resolves_plain() {
        let desc = PrimitiveDesc::binary(
            Algorithm::BinaryAdd,
            MemoryDesc::plain(&[2, 3], DataType::F32),
            MemoryDesc::plain(&[1, 3], DataType::F32),
            MemoryDesc::any(&[2, 3], DataType::F32),
        )
        .unwrap();
        assert!(desc.dst_desc().is_plain());
        assert_eq!(desc.kind(), PrimitiveKind::Binary);
    }

    #[test]
    fn test_convolution_desc_prefers_channels_last() {
        let desc = PrimitiveDesc::convolution(
            MemoryDesc::any(&[1, 3, 5, 5], DataType::F32),
            MemoryDesc::any(&[4, 3, 3, 3], DataType::F32),
            None,
            MemoryDesc::any(&[1, 4, 3, 3], DataType::F32),
            ConvolutionParams::default(),
        )
        .unwrap();
        assert_eq!(desc.src_desc().format(), Format::ChannelsLast);
        assert_eq!(desc.dst_desc().format(), Format::ChannelsLast);
        assert!(desc.weights_desc().unwrap().is_plain());
    }

    #[test]
    fn test_convolution_desc_with_empty_kernel_axis() {
        let conv = |dst: &[usize]| {
            PrimitiveDesc::convolution(
                MemoryDesc::any(&[1, 3, 5, 5], DataType::F32),
                MemoryDesc::any(&[4, 3, 0, 3], DataType::F32),
                None,
                MemoryDesc::any(dst, DataType::F32),
                ConvolutionParams::default(),
            )
        };
        assert!(conv(&[1, 4, 3, 3]).is_err());
        assert!(conv(&[1, 4, 5, 3]).is_ok());
    }

    #[test]
    fn test_matmul_desc_checks_inner_dims() {
        let err = PrimitiveDesc::matmul(
            MemoryDesc::any(&[2, 3], DataType::F32),
            MemoryDesc::any(&[4, 5], DataType::F32),
            MemoryDesc::any(&[2, 5], DataType::F32),
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_zero_point_only_for_matmul() {
        let mut attr = PrimitiveAttr::new();
        attr.set_zero_point(Arg::Src, ZeroPoint::Constant(3)).unwrap();
        assert!(attr.set_zero_point(Arg::Dst, ZeroPoint::Runtime).is_err());

        let eltwise = PrimitiveDesc::eltwise(
            Algorithm::EltwiseRelu,
            0.0,
            0.0,
            MemoryDesc::plain(&[4], DataType::F32),
        )
        .unwrap();
        assert!(Primitive::new(eltwise, attr, &Engine::cpu()).is_err());
    }

    #[test]
    fn test_post_op_rank_must_match() {
        let mut post_ops = PostOps::new();
        post_ops.append_binary(
            Algorithm::BinaryAdd,
            MemoryDesc::plain(&[4], DataType::F32),
            false,
        );
        let mut attr = PrimitiveAttr::new();
        attr.set_post_ops(post_ops);
        let desc = PrimitiveDesc::eltwise(
            Algorithm::EltwiseRelu,
            0.0,
            0.0,
            MemoryDesc::plain(&[2, 4], DataType::F32),
        )
        .unwrap();
        assert!(Primitive::new(desc, attr, &Engine::cpu()).is_err());
    }

    #[test]
    fn test_arg_display() {
        assert_eq!(Arg::PostOpSrc1(2).to_string(), "POST_OP(2)|SRC_1");
        assert_eq!(Arg::WeightsZeroPoint.to_string(), "ZERO_POINTS|WEIGHTS");
    }
}
