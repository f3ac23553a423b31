//! Primitive Tables - Operator Mapping and Fusion Rules
//!
//! Immutable lookup tables consulted by the builder, the fusion pass and
//! lowering:
//! - operator type to backend primitive kind;
//! - operator type to binary/eltwise algorithm;
//! - per source primitive, the primitive kinds accepted as post-ops;
//! - per primitive, the source to destination element types it can convert
//!   implicitly.
//!
//! Built once and shared by `Arc`; nothing mutates them after construction.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use fusegraph_core::{Algorithm, DataType, PrimitiveKind};
use rustc_hash::FxHashMap;

/// Binary operators.
pub const BINARY_OPS: &[&str] = &[
    "Add",
    "Div",
    "Equal",
    "Greater",
    "GreaterOrEqual",
    "Less",
    "LessOrEqual",
    "Mul",
    "Sub",
];

/// Eltwise operators.
pub const ELTWISE_OPS: &[&str] = &[
    "Abs",
    "Elu",
    "Exp",
    "LeakyRelu",
    "Log",
    "Relu",
    "Round",
    "Sigmoid",
    "Softplus",
    "Sqrt",
    "Tanh",
    "Linear",
    "Pow",
    "Gelu",
    "FastGelu",
];

const POOL_OPS: &[&str] = &["AveragePool", "GlobalAveragePool", "GlobalMaxPool", "MaxPool"];

const REDUCE_OPS: &[&str] = &[
    "ReduceL1",
    "ReduceL2",
    "ReduceLogSum",
    "ReduceLogSumExp",
    "ReduceMax",
    "ReduceMean",
    "ReduceMin",
    "ReduceProd",
    "ReduceSum",
    "ReduceSumSquare",
];

/// Operators decomposed by the builder into several nodes.
pub const HYPER_OPS: &[&str] = &["BiasGelu", "QAttention", "SkipLayerNormalization"];

type CastRules = FxHashMap<DataType, Vec<DataType>>;

/// Operator mapping and fusion rule tables.
#[derive(Debug, Clone)]
pub struct PrimitiveTables {
    op_kinds: FxHashMap<&'static str, PrimitiveKind>,
    algorithms: FxHashMap<&'static str, Algorithm>,
    post_op_rules: FxHashMap<PrimitiveKind, Vec<PrimitiveKind>>,
    cast_rules: FxHashMap<PrimitiveKind, CastRules>,
}

impl Default for PrimitiveTables {
    fn default() -> Self {
        Self::new()
    }
}

impl PrimitiveTables {
    /// Builds the tables.
    pub fn new() -> Self {
        Self {
            op_kinds: op_kinds(),
            algorithms: algorithms(),
            post_op_rules: post_op_rules(),
            cast_rules: cast_rules(),
        }
    }

    /// Primitive kind a 1:1 operator lowers to.
    pub fn primitive_kind(&self, op_type: &str) -> Option<PrimitiveKind> {
        self.op_kinds.get(op_type).copied()
    }

    /// True if the builder decomposes the operator.
    pub fn is_hyper_op(&self, op_type: &str) -> bool {
        HYPER_OPS.contains(&op_type)
    }

    /// Algorithm of a binary or eltwise operator.
    pub fn algorithm(&self, op_type: &str) -> Option<Algorithm> {
        self.algorithms.get(op_type).copied()
    }

    /// True if `post_op` may be appended to a `source` primitive.
    pub fn accepts_post_op(&self, source: PrimitiveKind, post_op: PrimitiveKind) -> bool {
        self.post_op_rules
            .get(&source)
            .is_some_and(|accepted| accepted.contains(&post_op))
    }

    /// True if `primitive` can write `dst` directly from a `src` input.
    ///
    /// Equal types always pass. A primitive with no per-type rules converts
    /// anything; one with rules only converts the listed pairs.
    pub fn is_implicit_cast_compatible(
        &self,
        primitive: PrimitiveKind,
        src: DataType,
        dst: DataType,
    ) -> bool {
        if src == dst {
            return true;
        }
        let Some(rules) = self.cast_rules.get(&primitive) else {
            return false;
        };
        match rules.get(&src) {
            Some(allowed) => allowed.contains(&dst),
            None => rules.is_empty(),
        }
    }
}

// =============================================================================
// Table Contents
// =============================================================================

fn op_kinds() -> FxHashMap<&'static str, PrimitiveKind> {
    let mut map = FxHashMap::default();
    for &op in BINARY_OPS {
        map.insert(op, PrimitiveKind::Binary);
    }
    for &op in ELTWISE_OPS {
        map.insert(op, PrimitiveKind::Eltwise);
    }
    for &op in POOL_OPS {
        map.insert(op, PrimitiveKind::Pooling);
    }
    for &op in REDUCE_OPS {
        map.insert(op, PrimitiveKind::Reduction);
    }
    map.insert("BatchNormalization", PrimitiveKind::BatchNormalization);
    map.insert("Cast", PrimitiveKind::Reorder);
    map.insert("Conv", PrimitiveKind::Convolution);
    map.insert("LRN", PrimitiveKind::Lrn);
    map.insert("LayerNormalization", PrimitiveKind::LayerNormalization);
    map.insert("MatMul", PrimitiveKind::MatMul);
    map.insert("MatMulInteger", PrimitiveKind::MatMul);
    map.insert("Reshape", PrimitiveKind::Memory);
    map.insert("Softmax", PrimitiveKind::Softmax);
    map.insert("Squeeze", PrimitiveKind::Memory);
    map.insert("Sum", PrimitiveKind::Sum);
    map.insert("Transpose", PrimitiveKind::Reorder);
    map.insert("Unsqueeze", PrimitiveKind::Memory);
    map
}

fn algorithms() -> FxHashMap<&'static str, Algorithm> {
    [
        ("Add", Algorithm::BinaryAdd),
        ("Mul", Algorithm::BinaryMul),
        ("Sub", Algorithm::BinarySub),
        ("Div", Algorithm::BinaryDiv),
        ("Equal", Algorithm::BinaryEq),
        ("Greater", Algorithm::BinaryGt),
        ("GreaterOrEqual", Algorithm::BinaryGe),
        ("Less", Algorithm::BinaryLt),
        ("LessOrEqual", Algorithm::BinaryLe),
        ("Abs", Algorithm::EltwiseAbs),
        ("BiasGelu", Algorithm::EltwiseGeluErf),
        ("Elu", Algorithm::EltwiseElu),
        ("Exp", Algorithm::EltwiseExp),
        ("FastGelu", Algorithm::EltwiseGeluTanh),
        ("Gelu", Algorithm::EltwiseGeluErf),
        ("LeakyRelu", Algorithm::EltwiseRelu),
        ("Log", Algorithm::EltwiseLog),
        ("Pow", Algorithm::EltwisePow),
        ("Relu", Algorithm::EltwiseRelu),
        ("Round", Algorithm::EltwiseRound),
        ("Sigmoid", Algorithm::EltwiseLogistic),
        ("Softplus", Algorithm::EltwiseSoftRelu),
        ("Sqrt", Algorithm::EltwiseSqrt),
        ("Tanh", Algorithm::EltwiseTanh),
        ("Linear", Algorithm::EltwiseLinear),
    ]
    .into_iter()
    .collect()
}

fn post_op_rules() -> FxHashMap<PrimitiveKind, Vec<PrimitiveKind>> {
    use PrimitiveKind::{
        BatchNormalization, Binary, Concat, Convolution, Depthwise, Eltwise, InnerProduct,
        LayerNormalization, Lrn, MatMul, Pooling, Prelu, Reduction, Reorder, Resampling, Shuffle,
        Softmax, Sum,
    };
    [
        (Convolution, vec![Eltwise, Sum, Binary, Depthwise]),
        (InnerProduct, vec![Eltwise, Sum, Binary]),
        (MatMul, vec![Eltwise, Sum, Binary, Reorder]),
        (BatchNormalization, vec![Eltwise]),
        (Binary, vec![Eltwise, Sum, Binary, Reorder]),
        (Concat, vec![]),
        (Eltwise, vec![Binary]),
        (LayerNormalization, vec![Eltwise, Sum, Binary]),
        (Lrn, vec![]),
        (Pooling, vec![]),
        (Prelu, vec![]),
        (Resampling, vec![Eltwise, Sum, Binary]),
        (Shuffle, vec![]),
        (Softmax, vec![]),
        (Sum, vec![]),
        (Reorder, vec![Sum]),
        (Reduction, vec![Eltwise, Sum, Binary]),
    ]
    .into_iter()
    .collect()
}

fn rules(entries: &[(DataType, &[DataType])]) -> CastRules {
    entries
        .iter()
        .map(|(src, dsts)| (*src, dsts.to_vec()))
        .collect()
}

fn cast_rules() -> FxHashMap<PrimitiveKind, CastRules> {
    use DataType::{BF16, F16, F32, S32, S8, U8};
    let mut map = FxHashMap::default();
    map.insert(
        PrimitiveKind::Convolution,
        rules(&[
            (F32, &[F32, U8, S8]),
            (F16, &[F16, F32, U8, S8]),
            (U8, &[U8, S8, S32, F32, F16, BF16]),
            (S8, &[U8, S8, S32, F32, F16, BF16]),
            (BF16, &[F32, BF16]),
        ]),
    );
    map.insert(
        PrimitiveKind::InnerProduct,
        rules(&[
            (F32, &[F32]),
            (F16, &[F16, U8, S8]),
            (U8, &[U8, S8, S32, BF16, F32]),
            (S8, &[U8, S8, S32, BF16, F32]),
            (BF16, &[F32, BF16]),
        ]),
    );
    map.insert(
        PrimitiveKind::MatMul,
        rules(&[
            (F32, &[F32]),
            (F16, &[F16, U8, S8]),
            (BF16, &[F32, BF16]),
            (U8, &[U8, S8, S32, F32, BF16]),
            (S8, &[U8, S8, S32, F32, BF16]),
        ]),
    );
    map.insert(
        PrimitiveKind::BatchNormalization,
        rules(&[(F32, &[F32, BF16]), (F16, &[F16]), (S8, &[S8])]),
    );
    map.insert(
        PrimitiveKind::Binary,
        rules(&[
            (BF16, &[BF16]),
            (S8, &[S8, U8, F16, F32]),
            (U8, &[S8, U8, F16, F32]),
            (F16, &[S8, U8, F16, F32]),
            (F32, &[S8, U8, F16, F32]),
        ]),
    );
    map.insert(PrimitiveKind::Concat, CastRules::default());
    map.insert(
        PrimitiveKind::Eltwise,
        rules(&[
            (F32, &[F32, BF16]),
            (BF16, &[F32, BF16]),
            (F16, &[F16]),
            (S32, &[S32, S8, U8]),
            (S8, &[S32, S8, U8]),
            (U8, &[S32, S8, U8]),
        ]),
    );
    let any_norm: &[DataType] = &[F32, BF16, F16, U8, S8];
    map.insert(
        PrimitiveKind::LayerNormalization,
        rules(&[
            (F32, any_norm),
            (BF16, any_norm),
            (F16, any_norm),
            (U8, any_norm),
            (S8, any_norm),
        ]),
    );
    map.insert(
        PrimitiveKind::Lrn,
        rules(&[(F32, &[F32, BF16]), (BF16, &[F32, BF16]), (F16, &[F16])]),
    );
    map.insert(
        PrimitiveKind::Pooling,
        rules(&[
            (F32, &[F32, S8, U8]),
            (BF16, &[BF16]),
            (F16, &[F16, S8, U8]),
            (S32, &[S32]),
            (S8, &[S8, U8, F16, F32]),
            (U8, &[S8, U8, F16, F32]),
        ]),
    );
    let wide: &[DataType] = &[F32, S32, BF16, S8, U8];
    map.insert(
        PrimitiveKind::Prelu,
        rules(&[(F32, wide), (S32, wide), (BF16, wide), (S8, wide), (U8, wide)]),
    );
    map.insert(
        PrimitiveKind::Resampling,
        rules(&[
            (F32, wide),
            (S32, wide),
            (BF16, wide),
            (S8, wide),
            (U8, wide),
            (F16, &[F16]),
        ]),
    );
    map.insert(
        PrimitiveKind::Shuffle,
        rules(&[
            (F32, &[F32, BF16]),
            (BF16, &[F32, BF16]),
            (S32, &[S32, S8, U8]),
            (S8, &[S32, S8, U8]),
            (U8, &[S32, S8, U8]),
        ]),
    );
    map.insert(
        PrimitiveKind::Softmax,
        rules(&[
            (F32, &[F32, BF16, U8, S8]),
            (BF16, &[F32, BF16, U8, S8]),
            (F16, &[F16]),
            (U8, &[U8, S8, F32, BF16]),
            (S8, &[U8, S8, F32, BF16]),
        ]),
    );
    map.insert(PrimitiveKind::Sum, CastRules::default());
    // bf16 <-> s32 reorders are not available on CPU.
    map.insert(
        PrimitiveKind::Reorder,
        rules(&[(BF16, &[F32, F16, BF16, S8, U8]), (S32, &[F32, F16, S32, S8, U8])]),
    );
    let reduce: &[DataType] = &[F32, BF16, S8, U8];
    map.insert(
        PrimitiveKind::Reduction,
        rules(&[(F32, reduce), (BF16, reduce), (S8, reduce), (U8, reduce)]),
    );
    map
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_mapping() {
        let tables = PrimitiveTables::new();
        assert_eq!(tables.primitive_kind("Conv"), Some(PrimitiveKind::Convolution));
        assert_eq!(tables.primitive_kind("MatMulInteger"), Some(PrimitiveKind::MatMul));
        assert_eq!(tables.primitive_kind("Transpose"), Some(PrimitiveKind::Reorder));
        assert_eq!(tables.primitive_kind("Foo"), None);
        assert!(tables.is_hyper_op("SkipLayerNormalization"));
        assert_eq!(tables.primitive_kind("SkipLayerNormalization"), None);
    }

    #[test]
    fn test_algorithms() {
        let tables = PrimitiveTables::new();
        assert_eq!(tables.algorithm("LeakyRelu"), Some(Algorithm::EltwiseRelu));
        assert_eq!(tables.algorithm("Sigmoid"), Some(Algorithm::EltwiseLogistic));
        assert_eq!(tables.algorithm("FastGelu"), Some(Algorithm::EltwiseGeluTanh));
    }

    #[test]
    fn test_post_op_rules() {
        let tables = PrimitiveTables::new();
        assert!(tables.accepts_post_op(PrimitiveKind::Convolution, PrimitiveKind::Eltwise));
        assert!(tables.accepts_post_op(PrimitiveKind::MatMul, PrimitiveKind::Reorder));
        assert!(!tables.accepts_post_op(PrimitiveKind::Eltwise, PrimitiveKind::Eltwise));
        assert!(!tables.accepts_post_op(PrimitiveKind::Softmax, PrimitiveKind::Binary));
        assert!(!tables.accepts_post_op(PrimitiveKind::Memory, PrimitiveKind::Binary));
    }

    #[test]
    fn test_implicit_cast_rules() {
        let tables = PrimitiveTables::new();
        assert!(tables.is_implicit_cast_compatible(PrimitiveKind::MatMul, DataType::F32, DataType::F32));
        assert!(!tables.is_implicit_cast_compatible(PrimitiveKind::MatMul, DataType::F32, DataType::BF16));
        assert!(tables.is_implicit_cast_compatible(PrimitiveKind::MatMul, DataType::U8, DataType::F32));
        // Empty rule sets convert anything.
        assert!(tables.is_implicit_cast_compatible(PrimitiveKind::Sum, DataType::F32, DataType::S8));
        // Populated rule sets reject unlisted sources.
        assert!(!tables.is_implicit_cast_compatible(PrimitiveKind::Reorder, DataType::F32, DataType::S8));
        assert!(!tables.is_implicit_cast_compatible(PrimitiveKind::Memory, DataType::F32, DataType::S8));
    }
}
