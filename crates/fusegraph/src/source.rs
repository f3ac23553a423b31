//! Source Graph - Host Graph Interface
//!
//! Plain data structures describing the operator graph handed to the
//! compiler: topologically ordered nodes with attributes and operand
//! descriptors, graph inputs and outputs, and initializer constants. They
//! derive serde so hosts and tests can describe graphs as JSON.
//!
//! Runtime data crosses the same boundary as `TensorData`: an element type,
//! a concrete shape and a shared byte buffer.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use fusegraph_core::{Buffer, DataType};
use half::{bf16, f16};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{GraphError, GraphResult};

// =============================================================================
// Element Types
// =============================================================================

/// Host tensor element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ElementType {
    /// Undefined type.
    Undefined = 0,
    /// 32-bit float.
    Float = 1,
    /// 8-bit unsigned int.
    Uint8 = 2,
    /// 8-bit signed int.
    Int8 = 3,
    /// 16-bit unsigned int.
    Uint16 = 4,
    /// 16-bit signed int.
    Int16 = 5,
    /// 32-bit signed int.
    Int32 = 6,
    /// 64-bit signed int.
    Int64 = 7,
    /// String type.
    String = 8,
    /// Boolean type.
    Bool = 9,
    /// 16-bit float (half precision).
    Float16 = 10,
    /// 64-bit float (double).
    Double = 11,
    /// 32-bit unsigned int.
    Uint32 = 12,
    /// 64-bit unsigned int.
    Uint64 = 13,
    /// BFloat16.
    Bfloat16 = 16,
}

impl ElementType {
    /// Creates from the host's integer type code.
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Undefined),
            1 => Some(Self::Float),
            2 => Some(Self::Uint8),
            3 => Some(Self::Int8),
            4 => Some(Self::Uint16),
            5 => Some(Self::Int16),
            6 => Some(Self::Int32),
            7 => Some(Self::Int64),
            8 => Some(Self::String),
            9 => Some(Self::Bool),
            10 => Some(Self::Float16),
            11 => Some(Self::Double),
            12 => Some(Self::Uint32),
            13 => Some(Self::Uint64),
            16 => Some(Self::Bfloat16),
            _ => None,
        }
    }

    /// Maps to the backend element type.
    ///
    /// 64-bit integers run as s32 and booleans as u8; types with no backend
    /// equivalent are rejected.
    pub fn to_data_type(self) -> GraphResult<DataType> {
        match self {
            Self::Undefined => Ok(DataType::Undef),
            Self::Float => Ok(DataType::F32),
            Self::Float16 => Ok(DataType::F16),
            Self::Bfloat16 => Ok(DataType::BF16),
            Self::Int64 | Self::Int32 => Ok(DataType::S32),
            Self::Int8 => Ok(DataType::S8),
            Self::Uint8 | Self::Bool => Ok(DataType::U8),
            other => Err(GraphError::UnsupportedElementType(other)),
        }
    }
}

// =============================================================================
// Operands
// =============================================================================

fn default_true() -> bool {
    true
}

/// Descriptor of one node operand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperandDesc {
    /// Operand name; empty for absent optional operands.
    pub name: String,
    /// False for an absent optional operand.
    #[serde(default = "default_true")]
    pub exists: bool,
    /// Declared shape; `None` when no shape information exists, `None`
    /// entries for unknown dims.
    #[serde(default)]
    pub shape: Option<Vec<Option<i64>>>,
    /// Element type.
    pub elem_type: ElementType,
    /// True if the operand is a constant initializer.
    #[serde(default)]
    pub is_constant: bool,
}

impl OperandDesc {
    /// Creates an operand with a fully known shape.
    pub fn new(name: &str, dims: &[i64], elem_type: ElementType) -> Self {
        Self::with_shape(name, dims.iter().map(|&d| Some(d)).collect(), elem_type)
    }

    /// Creates an operand whose shape may contain unknown dims.
    pub fn with_shape(name: &str, shape: Vec<Option<i64>>, elem_type: ElementType) -> Self {
        Self {
            name: name.to_string(),
            exists: true,
            shape: Some(shape),
            elem_type,
            is_constant: false,
        }
    }

    /// Creates an operand with no shape information at all.
    pub fn unknown_shape(name: &str, elem_type: ElementType) -> Self {
        Self {
            name: name.to_string(),
            exists: true,
            shape: None,
            elem_type,
            is_constant: false,
        }
    }

    /// Creates the descriptor of an absent optional operand.
    pub fn absent() -> Self {
        Self {
            name: String::new(),
            exists: false,
            shape: None,
            elem_type: ElementType::Undefined,
            is_constant: false,
        }
    }

    /// Builder: mark the operand as a constant initializer.
    pub fn constant(mut self) -> Self {
        self.is_constant = true;
        self
    }
}

// =============================================================================
// Attributes
// =============================================================================

/// Value of a node attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    /// Float value.
    Float(f32),
    /// Integer value.
    Int(i64),
    /// String value.
    String(String),
    /// Float array.
    Floats(Vec<f32>),
    /// Integer array.
    Ints(Vec<i64>),
}

/// Attribute map of one node.
pub type Attributes = FxHashMap<String, AttributeValue>;

// =============================================================================
// Nodes
// =============================================================================

fn default_version() -> i32 {
    1
}

/// One operator of the source graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceNode {
    /// Stable index within the graph.
    #[serde(default)]
    pub index: usize,
    /// Node name.
    pub name: String,
    /// Operator type.
    pub op_type: String,
    /// Operator set version the node was written against.
    #[serde(default = "default_version")]
    pub since_version: i32,
    /// Attributes.
    #[serde(default)]
    pub attributes: Attributes,
    /// Ordered inputs.
    #[serde(default)]
    pub inputs: Vec<OperandDesc>,
    /// Ordered outputs.
    #[serde(default)]
    pub outputs: Vec<OperandDesc>,
}

impl SourceNode {
    /// Creates a node with no operands.
    pub fn new(op_type: &str, name: &str) -> Self {
        Self {
            index: 0,
            name: name.to_string(),
            op_type: op_type.to_string(),
            since_version: default_version(),
            attributes: Attributes::default(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Builder: append an input.
    pub fn input(mut self, operand: OperandDesc) -> Self {
        self.inputs.push(operand);
        self
    }

    /// Builder: append an output.
    pub fn output(mut self, operand: OperandDesc) -> Self {
        self.outputs.push(operand);
        self
    }

    /// Builder: set an attribute.
    pub fn attr(mut self, name: &str, value: AttributeValue) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }

    /// Gets an attribute by name.
    pub fn get_attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }
}

// =============================================================================
// Initializers
// =============================================================================

/// A constant tensor (weight, bias, zero point, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Initializer {
    /// Name of the tensor.
    pub name: String,
    /// Dimensions.
    pub dims: Vec<i64>,
    /// Element type.
    pub elem_type: ElementType,
    /// Raw little-endian data bytes.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub raw_data: Vec<u8>,
    /// Float data (if not using raw_data).
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub float_data: Vec<f32>,
    /// Integer data for types up to 32 bits (if not using raw_data).
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub int32_data: Vec<i32>,
    /// Int64 data (if not using raw_data).
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub int64_data: Vec<i64>,
}

impl Initializer {
    fn empty(name: &str, dims: &[i64], elem_type: ElementType) -> Self {
        Self {
            name: name.to_string(),
            dims: dims.to_vec(),
            elem_type,
            raw_data: Vec::new(),
            float_data: Vec::new(),
            int32_data: Vec::new(),
            int64_data: Vec::new(),
        }
    }

    /// Creates a float initializer.
    pub fn float(name: &str, dims: &[i64], data: Vec<f32>) -> Self {
        Self {
            float_data: data,
            ..Self::empty(name, dims, ElementType::Float)
        }
    }

    /// Creates an initializer from raw little-endian bytes.
    pub fn raw(name: &str, dims: &[i64], elem_type: ElementType, raw_data: Vec<u8>) -> Self {
        Self {
            raw_data,
            ..Self::empty(name, dims, elem_type)
        }
    }

    /// Creates a signed 8-bit initializer.
    pub fn int8(name: &str, dims: &[i64], data: &[i8]) -> Self {
        Self::raw(name, dims, ElementType::Int8, bytemuck::cast_slice(data).to_vec())
    }

    /// Creates an unsigned 8-bit initializer.
    pub fn uint8(name: &str, dims: &[i64], data: &[u8]) -> Self {
        Self::raw(name, dims, ElementType::Uint8, data.to_vec())
    }

    /// Returns the number of elements.
    pub fn numel(&self) -> usize {
        self.dims.iter().map(|&d| d.max(0) as usize).product()
    }

    /// Decodes 8-bit integer data as signed values.
    ///
    /// Returns `None` when the type is not 8-bit or the payload does not hold
    /// exactly one value per element.
    pub fn unpack_i8(&self) -> Option<Vec<i8>> {
        if !matches!(self.elem_type, ElementType::Int8 | ElementType::Uint8) {
            return None;
        }
        let numel = self.numel();
        if self.raw_data.len() == numel {
            return Some(self.raw_data.iter().map(|&b| b as i8).collect());
        }
        if self.int32_data.len() == numel {
            return Some(self.int32_data.iter().map(|&v| v as i8).collect());
        }
        None
    }

    /// Encodes the data in the layout the backend expects for
    /// [`ElementType::to_data_type`] of this initializer.
    pub fn to_bytes(&self) -> GraphResult<Vec<u8>> {
        let dtype = self.elem_type.to_data_type()?;
        let numel = self.numel();
        let bytes = match self.elem_type {
            ElementType::Int64 if self.raw_data.len() == numel * 8 => self
                .raw_data
                .chunks_exact(8)
                .flat_map(|chunk| {
                    let value = bytemuck::pod_read_unaligned::<i64>(chunk);
                    (value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32).to_le_bytes()
                })
                .collect(),
            ElementType::Int64 if self.int64_data.len() == numel => self
                .int64_data
                .iter()
                .flat_map(|&v| (v.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32).to_le_bytes())
                .collect(),
            _ if self.raw_data.len() == numel * dtype.size_of() => self.raw_data.clone(),
            ElementType::Float if self.float_data.len() == numel => {
                bytemuck::cast_slice(&self.float_data).to_vec()
            }
            ElementType::Float16 if self.float_data.len() == numel => self
                .float_data
                .iter()
                .flat_map(|&v| f16::from_f32(v).to_le_bytes())
                .collect(),
            ElementType::Bfloat16 if self.float_data.len() == numel => self
                .float_data
                .iter()
                .flat_map(|&v| bf16::from_f32(v).to_le_bytes())
                .collect(),
            // half-precision bit patterns packed one per i32
            ElementType::Float16 | ElementType::Bfloat16 if self.int32_data.len() == numel => self
                .int32_data
                .iter()
                .flat_map(|&v| (v as u16).to_le_bytes())
                .collect(),
            ElementType::Int32 if self.int32_data.len() == numel => {
                bytemuck::cast_slice(&self.int32_data).to_vec()
            }
            ElementType::Int8 | ElementType::Uint8 | ElementType::Bool
                if self.int32_data.len() == numel =>
            {
                self.int32_data.iter().map(|&v| v as u8).collect()
            }
            _ => {
                return Err(GraphError::InvalidGraph(format!(
                    "initializer {} has no payload for {} {:?} elements",
                    self.name, numel, self.elem_type
                )))
            }
        };
        Ok(bytes)
    }
}

// =============================================================================
// Graph
// =============================================================================

/// A topologically ordered operator graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceGraph {
    /// Graph name.
    pub name: String,
    /// Declared graph inputs (excluding initializers).
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Declared graph outputs.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Nodes in topological order.
    #[serde(default)]
    pub nodes: Vec<SourceNode>,
    /// Constant initializers.
    #[serde(default)]
    pub initializers: Vec<Initializer>,
}

impl SourceGraph {
    /// Creates an empty graph.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Parses a graph from JSON, renumbering node indices by position.
    pub fn from_json(json: &str) -> GraphResult<Self> {
        let mut graph: Self = serde_json::from_str(json)?;
        for (index, node) in graph.nodes.iter_mut().enumerate() {
            node.index = index;
        }
        Ok(graph)
    }

    /// Serializes the graph to JSON.
    pub fn to_json(&self) -> GraphResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Appends a node, assigning its stable index.
    pub fn add_node(&mut self, mut node: SourceNode) -> usize {
        let index = self.nodes.len();
        node.index = index;
        self.nodes.push(node);
        index
    }

    /// Declares a graph input.
    pub fn add_input(&mut self, name: &str) {
        self.inputs.push(name.to_string());
    }

    /// Declares a graph output.
    pub fn add_output(&mut self, name: &str) {
        self.outputs.push(name.to_string());
    }

    /// Adds a constant initializer.
    pub fn add_initializer(&mut self, initializer: Initializer) {
        self.initializers.push(initializer);
    }

    /// Looks up an initializer by name.
    pub fn initializer(&self, name: &str) -> Option<&Initializer> {
        self.initializers.iter().find(|init| init.name == name)
    }

    /// Graph inputs followed by every initializer not already declared.
    pub fn inputs_including_initializers(&self) -> Vec<String> {
        let mut names = self.inputs.clone();
        for init in &self.initializers {
            if !names.contains(&init.name) {
                names.push(init.name.clone());
            }
        }
        names
    }
}

// =============================================================================
// Runtime Data
// =============================================================================

/// A host tensor bound at compile or execution time.
#[derive(Debug, Clone)]
pub struct TensorData {
    /// Element type.
    pub dtype: DataType,
    /// Concrete shape; empty for a scalar.
    pub shape: Vec<usize>,
    /// Data buffer.
    pub buffer: Buffer,
}

impl TensorData {
    /// Wraps an existing buffer.
    pub fn new(dtype: DataType, shape: &[usize], buffer: Buffer) -> Self {
        Self {
            dtype,
            shape: shape.to_vec(),
            buffer,
        }
    }

    /// Creates an f32 tensor from values.
    pub fn from_f32(shape: &[usize], values: &[f32]) -> Self {
        Self::new(DataType::F32, shape, Buffer::from_slice(values))
    }

    /// Creates a zero-filled tensor.
    pub fn zeros(dtype: DataType, shape: &[usize]) -> Self {
        let count: usize = shape.iter().product();
        Self::new(dtype, shape, Buffer::zeros(count * dtype.size_of()))
    }

    /// Decodes the buffer into f32 values.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        let bytes = self.buffer.read();
        let size = self.dtype.size_of().max(1);
        bytes
            .chunks_exact(size)
            .map(|chunk| self.dtype.decode(chunk))
            .collect()
    }
}

/// Name to host tensor mapping.
pub type TensorMap = FxHashMap<String, TensorData>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_type_mapping() {
        assert_eq!(ElementType::Int64.to_data_type().unwrap(), DataType::S32);
        assert_eq!(ElementType::Bool.to_data_type().unwrap(), DataType::U8);
        assert_eq!(ElementType::Undefined.to_data_type().unwrap(), DataType::Undef);
        assert_eq!(
            ElementType::Double.to_data_type().unwrap_err(),
            GraphError::UnsupportedElementType(ElementType::Double)
        );
        assert_eq!(ElementType::from_i32(16), Some(ElementType::Bfloat16));
        assert_eq!(ElementType::from_i32(14), None);
    }

    #[test]
    fn test_unpack_i8() {
        let zp = Initializer::int8("zp", &[3], &[0, 0, 0]);
        assert_eq!(zp.unpack_i8(), Some(vec![0, 0, 0]));

        let short = Initializer::raw("zp", &[4], ElementType::Int8, vec![0, 0]);
        assert_eq!(short.unpack_i8(), None);

        let float = Initializer::float("w", &[1], vec![0.0]);
        assert_eq!(float.unpack_i8(), None);
    }

    #[test]
    fn test_initializer_bytes_narrow_int64() {
        let init = Initializer {
            int64_data: vec![7, -2],
            ..Initializer::raw("shape", &[2], ElementType::Int64, Vec::new())
        };
        let bytes = init.to_bytes().unwrap();
        assert_eq!(bytemuck::cast_slice::<u8, i32>(&bytes), &[7, -2]);
    }

    #[test]
    fn test_initializer_bytes_half_precision() {
        let init = Initializer {
            float_data: vec![1.5, -2.0, 0.15625],
            ..Initializer::raw("h", &[3], ElementType::Float16, Vec::new())
        };
        let bytes = init.to_bytes().unwrap();
        assert_eq!(bytes.len(), 6);
        let values: Vec<f32> = bytes.chunks_exact(2).map(|c| DataType::F16.decode(c)).collect();
        assert_eq!(values, vec![1.5, -2.0, 0.15625]);

        let init = Initializer {
            float_data: vec![3.0, -0.5],
            ..Initializer::raw("b", &[2], ElementType::Bfloat16, Vec::new())
        };
        let bytes = init.to_bytes().unwrap();
        let values: Vec<f32> = bytes.chunks_exact(2).map(|c| DataType::BF16.decode(c)).collect();
        assert_eq!(values, vec![3.0, -0.5]);

        let bits = Initializer {
            int32_data: vec![i32::from(f16::from_f32(0.25).to_bits())],
            ..Initializer::raw("p", &[1], ElementType::Float16, Vec::new())
        };
        assert_eq!(DataType::F16.decode(&bits.to_bytes().unwrap()), 0.25);
    }

    #[test]
    fn test_graph_json_roundtrip_indices() {
        let mut graph = SourceGraph::new("g");
        graph.add_input("x");
        graph.add_output("y");
        let index = graph.add_node(
            SourceNode::new("Relu", "relu")
                .input(OperandDesc::new("x", &[2], ElementType::Float))
                .output(OperandDesc::new("y", &[2], ElementType::Float)),
        );
        assert_eq!(index, 0);

        let json = graph.to_json().unwrap();
        let parsed = SourceGraph::from_json(&json).unwrap();
        assert_eq!(parsed, graph);
    }

    #[test]
    fn test_inputs_including_initializers() {
        let mut graph = SourceGraph::new("g");
        graph.add_input("x");
        graph.add_initializer(Initializer::float("w", &[1], vec![1.0]));
        assert_eq!(graph.inputs_including_initializers(), vec!["x", "w"]);
    }
}
