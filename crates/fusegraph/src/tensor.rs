//! Tensors - Values, Binding State and the Tensor Arena
//!
//! A `Tensor` is a named, typed value with possibly dynamic dims. During
//! lowering it is bound to backend memory, may be reordered to other layouts
//! and may be aliased by a reshape. Every replaced memory is retained in the
//! tensor's history until the next reset. The first memory bound after a
//! reset is the host memory: graph inputs receive host data there and graph
//! outputs are written there by their producer.
//!
//! Nodes reference tensors through `SlotId`s. A slot is an indirection into
//! the arena, so in-place aliasing and zero-point elision repoint a slot at
//! another tensor without touching the node.
//!
//! # Key Features
//! - Explicit `Unbound -> PendingReshape -> Bound` state machine
//! - Reshape aliases propagated when host data arrives
//! - Immediate reorders for constant initializers
//! - Slot snapshots restored at the start of every compilation
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use core::fmt;

use fusegraph_core::{
    Arg, ArgMap, Buffer, DataType, Dims, Engine, Memory, MemoryDesc, Primitive, Stream,
};
use rustc_hash::FxHashMap;

use crate::error::{GraphError, GraphResult};
use crate::source::OperandDesc;

/// A primitive paired with the memory bound to each of its arguments.
pub type CompiledPrimitive = (Primitive, ArgMap);

// =============================================================================
// Identifiers
// =============================================================================

/// Index of a tensor slot in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub usize);

/// Index of a tensor object in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub usize);

/// Slot of the empty sentinel tensor used for absent operands.
pub const EMPTY_SLOT: SlotId = SlotId(0);

// =============================================================================
// Dimensions
// =============================================================================

/// One tensor dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dim {
    /// Known extent.
    Fixed(usize),
    /// Extent known only once inputs are bound.
    Dynamic,
}

impl Dim {
    /// Returns the extent if known.
    #[must_use]
    pub const fn value(self) -> Option<usize> {
        match self {
            Self::Fixed(v) => Some(v),
            Self::Dynamic => None,
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(v) => write!(f, "{v}"),
            Self::Dynamic => f.write_str("?"),
        }
    }
}

/// Converts concrete dims to `Dim`s.
#[must_use]
pub fn fixed_dims(dims: &[usize]) -> Vec<Dim> {
    dims.iter().map(|&d| Dim::Fixed(d)).collect()
}

fn render_dims(dims: &[Dim]) -> String {
    let parts: Vec<String> = dims.iter().map(ToString::to_string).collect();
    format!("[{}]", parts.join(", "))
}

// =============================================================================
// Tensor
// =============================================================================

/// Binding state of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorState {
    /// No memory bound.
    Unbound,
    /// A reshaped view waits for its origin's data handle.
    PendingReshape,
    /// Memory bound and every alias resolved.
    Bound,
}

/// A reshaped view whose handle follows the handle of its origin.
#[derive(Debug, Clone)]
pub struct ReshapeAlias {
    /// Memory the viewed data lives in.
    pub origin: Memory,
    /// Reshaped memory read by primitives.
    pub target: Memory,
}

/// A named tensor value.
#[derive(Debug, Clone)]
pub struct Tensor {
    name: String,
    declared_dims: Vec<Dim>,
    dims: Vec<Dim>,
    dtype: DataType,
    /// True for constant initializers.
    pub is_constant: bool,
    /// True for graph inputs (declared inputs and initializers).
    pub is_graph_input: bool,
    /// True for graph outputs.
    pub is_graph_output: bool,
    /// True if the host bound a rank-0 value.
    pub is_scalar: bool,
    consumers: usize,
    memory: Option<Memory>,
    host: Option<Memory>,
    history: Vec<Memory>,
    aliases: Vec<ReshapeAlias>,
    resolved: bool,
}

impl Tensor {
    /// Creates a tensor with the given dims and type.
    #[must_use]
    pub fn new(name: &str, dims: Vec<Dim>, dtype: DataType) -> Self {
        Self {
            name: name.to_string(),
            declared_dims: dims.clone(),
            dims,
            dtype,
            is_constant: false,
            is_graph_input: false,
            is_graph_output: false,
            is_scalar: false,
            consumers: 0,
            memory: None,
            host: None,
            history: Vec::new(),
            aliases: Vec::new(),
            resolved: false,
        }
    }

    /// The empty sentinel.
    #[must_use]
    pub fn empty() -> Self {
        Self::new("", Vec::new(), DataType::Undef)
    }

    /// Creates a tensor from a source operand descriptor.
    ///
    /// Negative extents are unknown and a missing shape yields empty dims.
    /// A declared rank-0 shape is the one-element shape `[1]`.
    pub fn from_operand(operand: &OperandDesc) -> GraphResult<Self> {
        if !operand.exists {
            return Ok(Self::empty());
        }
        let dims = match operand.shape.as_deref() {
            None => Vec::new(),
            Some([]) => vec![Dim::Fixed(1)],
            Some(shape) => shape
                .iter()
                .map(|d| match d {
                    Some(v) if *v >= 0 => Dim::Fixed(*v as usize),
                    _ => Dim::Dynamic,
                })
                .collect(),
        };
        let mut tensor = Self::new(&operand.name, dims, operand.elem_type.to_data_type()?);
        tensor.is_constant = operand.is_constant;
        Ok(tensor)
    }

    /// Creates a tensor with the shape and type of `base` under a new name.
    #[must_use]
    pub fn derived(base: &Self, name: &str) -> Self {
        Self::new(name, base.dims.clone(), base.dtype)
    }

    /// Returns the tensor name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// False for the empty sentinel.
    #[must_use]
    pub fn exists(&self) -> bool {
        !self.name.is_empty()
    }

    /// Returns the current dims.
    #[must_use]
    pub fn dims(&self) -> &[Dim] {
        &self.dims
    }

    /// Sets the dims (output dims computed during lowering).
    pub fn set_dims(&mut self, dims: Vec<Dim>) {
        self.dims = dims;
    }

    /// Replaces the declared dims, which survive [`Tensor::reset`].
    pub fn set_declared_dims(&mut self, dims: Vec<Dim>) {
        self.declared_dims.clone_from(&dims);
        self.dims = dims;
    }

    /// Returns the element type.
    #[must_use]
    pub const fn dtype(&self) -> DataType {
        self.dtype
    }

    /// True if any dim is unknown or no shape is known at all.
    #[must_use]
    pub fn has_dynamic_dims(&self) -> bool {
        self.dims.is_empty() || self.dims.iter().any(|d| matches!(d, Dim::Dynamic))
    }

    /// Returns the dims, failing if any is still unknown.
    pub fn concrete_dims(&self) -> GraphResult<Dims> {
        self.dims
            .iter()
            .map(|d| d.value())
            .collect::<Option<Dims>>()
            .ok_or_else(|| GraphError::DynamicShape {
                tensor: self.name.clone(),
                dims: render_dims(&self.dims),
            })
    }

    /// Number of nodes reading this tensor.
    #[must_use]
    pub const fn consumers(&self) -> usize {
        self.consumers
    }

    /// Registers one more consumer.
    pub fn consume(&mut self) {
        self.consumers += 1;
    }

    /// Dense row-major descriptor of the current dims.
    pub fn plain_desc(&self) -> GraphResult<MemoryDesc> {
        Ok(MemoryDesc::plain(&self.concrete_dims()?, self.dtype))
    }

    /// Descriptor of the current dims with the layout left to a primitive.
    pub fn input_desc(&self) -> GraphResult<MemoryDesc> {
        Ok(MemoryDesc::any(&self.concrete_dims()?, self.dtype))
    }

    /// Returns the current memory.
    #[must_use]
    pub fn memory(&self) -> Option<&Memory> {
        self.memory.as_ref()
    }

    /// Returns the current memory, failing when unbound.
    pub fn bound_memory(&self) -> GraphResult<&Memory> {
        self.memory
            .as_ref()
            .ok_or_else(|| GraphError::UnboundTensor(self.name.clone()))
    }

    /// Returns the host memory, failing when unbound.
    ///
    /// This is the first memory bound since the last reset unless
    /// [`Tensor::set_host_memory`] replaced it.
    pub fn host_memory(&self) -> GraphResult<&Memory> {
        self.host
            .as_ref()
            .ok_or_else(|| GraphError::UnboundTensor(self.name.clone()))
    }

    /// Makes `memory` the one exchanged with the host, leaving the
    /// memory read by consumers untouched.
    pub fn set_host_memory(&mut self, memory: Memory) {
        self.host = Some(memory);
    }

    /// Descriptor of the current memory, failing when unbound.
    pub fn desc(&self) -> GraphResult<&MemoryDesc> {
        Ok(self.bound_memory()?.desc())
    }

    /// Memories replaced since the last reset, oldest first.
    #[must_use]
    pub fn history(&self) -> &[Memory] {
        &self.history
    }

    /// Returns the binding state.
    #[must_use]
    pub fn state(&self) -> TensorState {
        match (&self.memory, self.resolved) {
            (None, _) => TensorState::Unbound,
            (Some(_), false) if !self.aliases.is_empty() => TensorState::PendingReshape,
            (Some(_), _) => TensorState::Bound,
        }
    }

    /// Binds `memory`, taking dims from its descriptor.
    ///
    /// A previously bound memory moves to the history.
    pub fn set_memory(&mut self, memory: Memory) {
        self.dims = fixed_dims(memory.desc().dims());
        if self.host.is_none() {
            self.host = Some(memory.clone());
        }
        if let Some(previous) = self.memory.replace(memory) {
            self.history.push(previous);
        }
        if self.aliases.is_empty() {
            self.resolved = true;
        }
    }

    /// Converts the bound memory to `desc`, preserving the element count.
    ///
    /// Changed dims become a reshaped view sharing the current handle. For
    /// every non-constant tensor the view is also queued as an alias and
    /// re-pointed by [`Tensor::set_data_handle`]. A remaining layout or type
    /// change becomes a reorder, executed immediately for bound constants
    /// and otherwise appended to `primitives`. The logical dims are kept.
    pub fn reorder_memory(
        &mut self,
        desc: &MemoryDesc,
        primitives: &mut Vec<CompiledPrimitive>,
        engine: &Engine,
    ) -> GraphResult<()> {
        let logical = self.dims.clone();
        let converted = self.convert_memory(desc, primitives, engine);
        self.dims = logical;
        converted
    }

    fn convert_memory(
        &mut self,
        desc: &MemoryDesc,
        primitives: &mut Vec<CompiledPrimitive>,
        engine: &Engine,
    ) -> GraphResult<()> {
        let current = self.bound_memory()?.clone();
        if current.desc() == desc {
            return Ok(());
        }
        if current.desc().numel() != desc.numel() {
            return Err(fusegraph_core::Error::ElementCountMismatch {
                from: current.desc().numel(),
                to: desc.numel(),
            }
            .into());
        }

        let mut source = current;
        if source.desc().dims() != desc.dims() {
            let reshaped = Memory::unbound(source.desc().reshape(desc.dims())?, engine);
            reshaped.share_handle_of(&source)?;
            if !self.is_constant {
                self.aliases.push(ReshapeAlias {
                    origin: source.clone(),
                    target: reshaped.clone(),
                });
                self.resolved = source.data_handle().is_some();
            }
            self.set_memory(reshaped.clone());
            source = reshaped;
        }
        if source.desc() == desc {
            return Ok(());
        }

        let target = Memory::new(desc.clone(), engine)?;
        let reorder = Primitive::reorder(source.desc(), desc, engine)?;
        let mut args = ArgMap::default();
        args.insert(Arg::Src, source.clone());
        args.insert(Arg::Dst, target.clone());
        if self.is_constant && source.data_handle().is_some() {
            let stream = Stream::new(engine);
            reorder.execute(&stream, &args)?;
            stream.wait()?;
        } else {
            primitives.push((reorder, args));
        }
        self.set_memory(target);
        Ok(())
    }

    /// Binds host data to the host memory.
    ///
    /// Queued reshape aliases are then re-pointed at their origin's handle,
    /// oldest first, so chained views follow.
    pub fn set_data_handle(&mut self, buffer: Buffer) -> GraphResult<()> {
        self.host_memory()?.set_data_handle(buffer)?;
        for alias in &self.aliases {
            alias.target.share_handle_of(&alias.origin)?;
        }
        self.resolved = true;
        Ok(())
    }

    /// Drops memory, history and aliases and restores the declared dims.
    pub fn reset(&mut self) {
        self.memory = None;
        self.host = None;
        self.history.clear();
        self.aliases.clear();
        self.resolved = false;
        self.is_scalar = false;
        self.dims.clone_from(&self.declared_dims);
    }
}

// =============================================================================
// Tensor Arena
// =============================================================================

/// Graph-owned tensor table addressed through rewritable slots.
#[derive(Debug, Clone)]
pub struct TensorArena {
    tensors: Vec<Tensor>,
    slots: Vec<TensorId>,
    baseline: Vec<TensorId>,
    by_name: FxHashMap<String, SlotId>,
}

impl Default for TensorArena {
    fn default() -> Self {
        Self::new()
    }
}

impl TensorArena {
    /// Creates an arena holding only the empty sentinel.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tensors: vec![Tensor::empty()],
            slots: vec![TensorId(0)],
            baseline: Vec::new(),
            by_name: FxHashMap::default(),
        }
    }

    /// Returns the slot of `tensor`'s name, inserting it if new.
    ///
    /// The empty name always maps to [`EMPTY_SLOT`].
    pub fn intern(&mut self, tensor: Tensor) -> SlotId {
        if !tensor.exists() {
            return EMPTY_SLOT;
        }
        if let Some(&slot) = self.by_name.get(tensor.name()) {
            return slot;
        }
        let id = TensorId(self.tensors.len());
        let slot = SlotId(self.slots.len());
        self.by_name.insert(tensor.name().to_string(), slot);
        self.tensors.push(tensor);
        self.slots.push(id);
        slot
    }

    /// Looks up a slot by tensor name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<SlotId> {
        self.by_name.get(name).copied()
    }

    /// Returns the tensor currently behind `slot`.
    #[must_use]
    pub fn get(&self, slot: SlotId) -> &Tensor {
        &self.tensors[self.slots[slot.0].0]
    }

    /// Returns the tensor currently behind `slot`, mutably.
    pub fn get_mut(&mut self, slot: SlotId) -> &mut Tensor {
        let id = self.slots[slot.0];
        &mut self.tensors[id.0]
    }

    /// True if both slots currently reference one tensor.
    #[must_use]
    pub fn same_tensor(&self, a: SlotId, b: SlotId) -> bool {
        self.slots[a.0] == self.slots[b.0]
    }

    /// Repoints `slot` at the tensor behind `target`.
    pub fn alias(&mut self, slot: SlotId, target: SlotId) {
        self.slots[slot.0] = self.slots[target.0];
    }

    /// Records the current slot mapping as the baseline.
    pub fn snapshot_slots(&mut self) {
        self.baseline.clone_from(&self.slots);
    }

    /// Undoes every slot rewrite made since the last snapshot.
    pub fn restore_slots(&mut self) {
        if !self.baseline.is_empty() {
            self.slots.clone_from(&self.baseline);
        }
    }

    /// Resets every tensor.
    pub fn reset_all(&mut self) {
        for tensor in &mut self.tensors {
            tensor.reset();
        }
    }

    /// Number of slots, including the sentinel.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True if only the sentinel exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.len() <= 1
    }
}

// =============================================================================
// Tests
// =============================================================================
