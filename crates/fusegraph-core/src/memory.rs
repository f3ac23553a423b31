//! Memory - Descriptors, Buffers and Memory Objects
//!
//! A `MemoryDesc` describes the logical dims, element type and physical
//! layout of a block of memory. A `Buffer` is a reference-counted byte
//! buffer supplied by the host or allocated by the backend. A `Memory` pairs
//! a descriptor and an engine with a rebindable data handle.
//!
//! Cloning a `Memory` clones the handle cell, not the data: every clone
//! observes a later `set_data_handle`. Primitive argument maps hold such
//! clones, which is what lets a compiled primitive list be rebound to new
//! host buffers without being rebuilt.
//!
//! # Key Features
//! - Plain (row-major), channels-last and arbitrary strided layouts
//! - `any` format for primitive descriptors to resolve
//! - Reshape and front padding of plain descriptors
//! - Logical gather/scatter between typed buffers and f32 values
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::dtype::DataType;
use crate::engine::Engine;
use crate::error::{Error, Result};

/// Element count above which gather/scatter run in parallel.
const PARALLEL_THRESHOLD: usize = 4096;

// =============================================================================
// Type Aliases
// =============================================================================

/// Logical dimensions of a memory descriptor.
pub type Dims = SmallVec<[usize; 6]>;

/// Element strides of a memory descriptor.
pub type Strides = SmallVec<[usize; 6]>;

/// Total number of elements described by `dims`.
#[must_use]
pub fn numel(dims: &[usize]) -> usize {
    dims.iter().product()
}

/// Row-major strides for `dims`.
#[must_use]
pub fn contiguous_strides(dims: &[usize]) -> Strides {
    let mut strides = Strides::from_elem(0, dims.len());
    let mut stride = 1usize;
    for (i, &dim) in dims.iter().enumerate().rev() {
        strides[i] = stride;
        stride *= dim.max(1);
    }
    strides
}

/// Channels-last strides for `dims` (`N, C, D1..Dk` stored as `N, D1..Dk, C`).
#[must_use]
pub fn channels_last_strides(dims: &[usize]) -> Strides {
    if dims.len() < 3 {
        return contiguous_strides(dims);
    }
    let mut strides = Strides::from_elem(0, dims.len());
    let channels = dims[1].max(1);
    strides[1] = 1;
    let mut stride = channels;
    for i in (2..dims.len()).rev() {
        strides[i] = stride;
        stride *= dims[i].max(1);
    }
    strides[0] = stride;
    strides
}

// =============================================================================
// Format
// =============================================================================

/// Physical layout of a memory descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Format {
    /// Layout left for a primitive descriptor to choose.
    Any,
    /// Dense row-major layout.
    Plain,
    /// Dense layout with the channel axis (index 1) innermost.
    ChannelsLast,
    /// Arbitrary element strides.
    Strided,
}

// =============================================================================
// Memory Descriptor
// =============================================================================

/// Logical dims, element type and physical layout of a memory block.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryDesc {
    dims: Dims,
    dtype: DataType,
    format: Format,
    strides: Strides,
}

impl MemoryDesc {
    /// Creates a descriptor with the given layout.
    ///
    /// `Format::Strided` has no canonical strides and is treated as plain;
    /// use [`MemoryDesc::strided`] for explicit strides.
    #[must_use]
    pub fn new(dims: &[usize], dtype: DataType, format: Format) -> Self {
        let (format, strides) = match format {
            Format::Any => (Format::Any, Strides::new()),
            Format::Plain | Format::Strided => (Format::Plain, contiguous_strides(dims)),
            Format::ChannelsLast if dims.len() >= 3 => {
                (Format::ChannelsLast, channels_last_strides(dims))
            }
            Format::ChannelsLast => (Format::Plain, contiguous_strides(dims)),
        };
        Self {
            dims: Dims::from_slice(dims),
            dtype,
            format,
            strides,
        }
    }

    /// Creates a dense row-major descriptor.
    #[must_use]
    pub fn plain(dims: &[usize], dtype: DataType) -> Self {
        Self::new(dims, dtype, Format::Plain)
    }

    /// Creates a descriptor whose layout is chosen by a primitive.
    #[must_use]
    pub fn any(dims: &[usize], dtype: DataType) -> Self {
        Self::new(dims, dtype, Format::Any)
    }

    /// Creates a descriptor with explicit element strides.
    ///
    /// Strides equal to the row-major or channels-last strides of `dims`
    /// are normalized to those formats.
    pub fn strided(dims: &[usize], dtype: DataType, strides: &[usize]) -> Result<Self> {
        if dims.len() != strides.len() {
            return Err(Error::invalid_operation(format!(
                "{} strides given for {} dims",
                strides.len(),
                dims.len()
            )));
        }
        let format = if same_layout(dims, strides, &contiguous_strides(dims)) {
            Format::Plain
        } else if dims.len() >= 3 && same_layout(dims, strides, &channels_last_strides(dims)) {
            Format::ChannelsLast
        } else {
            Format::Strided
        };
        let strides = match format {
            Format::Plain => contiguous_strides(dims),
            Format::ChannelsLast => channels_last_strides(dims),
            _ => Strides::from_slice(strides),
        };
        Ok(Self {
            dims: Dims::from_slice(dims),
            dtype,
            format,
            strides,
        })
    }

    /// Returns the logical dims.
    #[must_use]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Returns the element type.
    #[must_use]
    pub const fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Returns the layout format.
    #[must_use]
    pub const fn format(&self) -> Format {
        self.format
    }

    /// Returns the element strides (empty for `Format::Any`).
    #[must_use]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Returns the number of dimensions.
    #[must_use]
    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    /// Returns the number of logical elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        numel(&self.dims)
    }

    /// Returns true for a dense row-major layout.
    #[must_use]
    pub fn is_plain(&self) -> bool {
        self.format == Format::Plain
    }

    /// Returns true if the layout is still to be chosen.
    #[must_use]
    pub fn is_any(&self) -> bool {
        self.format == Format::Any
    }

    /// Returns the number of bytes spanned by this descriptor.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        let count = self.numel();
        if count == 0 {
            return 0;
        }
        if self.is_any() {
            return count * self.dtype.size_of();
        }
        let span = self
            .dims
            .iter()
            .zip(self.strides.iter())
            .map(|(&d, &s)| (d - 1) * s)
            .sum::<usize>()
            + 1;
        span * self.dtype.size_of()
    }

    /// Returns this descriptor with `Format::Any` resolved to `format`.
    #[must_use]
    pub fn resolve(&self, format: Format) -> Self {
        if self.is_any() {
            Self::new(&self.dims, self.dtype, format)
        } else {
            self.clone()
        }
    }

    /// Returns the same layout over a different element type.
    #[must_use]
    pub fn with_dtype(&self, dtype: DataType) -> Self {
        Self {
            dtype,
            ..self.clone()
        }
    }

    /// Reinterprets a dense row-major (or undecided) layout with new dims.
    pub fn reshape(&self, dims: &[usize]) -> Result<Self> {
        if numel(dims) != self.numel() {
            return Err(Error::ElementCountMismatch {
                from: self.numel(),
                to: numel(dims),
            });
        }
        match self.format {
            Format::Any => Ok(Self::any(dims, self.dtype)),
            Format::Plain => Ok(Self::plain(dims, self.dtype)),
            _ => Err(Error::InvalidReshape {
                message: format!(
                    "cannot reshape {:?} layout from {:?} to {:?}",
                    self.format, self.dims, dims
                ),
            }),
        }
    }

    /// Prepends `front` and appends `back` unit dims.
    #[must_use]
    pub fn padded(&self, front: usize, back: usize) -> Self {
        let mut dims = Dims::from_elem(1, front);
        dims.extend_from_slice(&self.dims);
        dims.extend(std::iter::repeat(1).take(back));
        match self.format {
            Format::Any => Self::any(&dims, self.dtype),
            Format::Plain => Self::plain(&dims, self.dtype),
            _ => {
                let span = self.size_bytes() / self.dtype.size_of().max(1);
                let mut strides = Strides::from_elem(span.max(1), front);
                strides.extend_from_slice(&self.strides);
                strides.extend(std::iter::repeat(1).take(back));
                Self {
                    dims,
                    dtype: self.dtype,
                    format: Format::Strided,
                    strides,
                }
            }
        }
    }

    /// Byte offsets of every logical element, in row-major logical order.
    #[must_use]
    pub fn byte_offsets(&self) -> Vec<usize> {
        let count = self.numel();
        let size = self.dtype.size_of();
        if self.is_plain() || self.is_any() {
            return (0..count).map(|i| i * size).collect();
        }
        let rank = self.dims.len();
        let mut offsets = Vec::with_capacity(count);
        let mut index = vec![0usize; rank];
        for _ in 0..count {
            let element: usize = index
                .iter()
                .zip(self.strides.iter())
                .map(|(&i, &s)| i * s)
                .sum();
            offsets.push(element * size);
            for axis in (0..rank).rev() {
                index[axis] += 1;
                if index[axis] < self.dims[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }
        offsets
    }
}

fn same_layout(dims: &[usize], a: &[usize], b: &[usize]) -> bool {
    dims.iter()
        .zip(a.iter().zip(b.iter()))
        .all(|(&d, (&x, &y))| d <= 1 || x == y)
}

/// Pads the lower-rank descriptor with leading unit dims so both share a rank.
#[must_use]
pub fn pad_to_equal_rank(a: &MemoryDesc, b: &MemoryDesc) -> (MemoryDesc, MemoryDesc) {
    let rank = a.ndims().max(b.ndims());
    (
        a.padded(rank - a.ndims(), 0),
        b.padded(rank - b.ndims(), 0),
    )
}

// =============================================================================
// Buffer
// =============================================================================

/// Reference-counted byte buffer.
#[derive(Debug, Clone, Default)]
pub struct Buffer {
    inner: Arc<RwLock<Vec<u8>>>,
}

impl Buffer {
    /// Creates a zero-filled buffer of `len` bytes.
    #[must_use]
    pub fn zeros(len: usize) -> Self {
        Self::from_bytes(vec![0; len])
    }

    /// Wraps an owned byte vector.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(bytes)),
        }
    }

    /// Copies a typed slice into a new buffer.
    #[must_use]
    pub fn from_slice<T: Pod>(data: &[T]) -> Self {
        Self::from_bytes(bytemuck::cast_slice(data).to_vec())
    }

    /// Copies the buffer contents out as typed values.
    #[must_use]
    pub fn to_vec<T: Pod>(&self) -> Vec<T> {
        bytemuck::pod_collect_to_vec(&self.inner.read())
    }

    /// Returns the length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Returns true if the buffer holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Locks the buffer for reading.
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.inner.read()
    }

    /// Locks the buffer for writing.
    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.inner.write()
    }

    /// Returns true if both handles refer to the same bytes.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Reads every logical element of `desc` from `buffer` as f32, in row-major order.
pub fn gather(buffer: &Buffer, desc: &MemoryDesc) -> Result<Vec<f32>> {
    let bytes = buffer.read();
    check_span(desc, bytes.len())?;
    let dtype = desc.dtype();
    let offsets = desc.byte_offsets();
    let values = if offsets.len() >= PARALLEL_THRESHOLD {
        offsets.par_iter().map(|&o| dtype.decode(&bytes[o..])).collect()
    } else {
        offsets.iter().map(|&o| dtype.decode(&bytes[o..])).collect()
    };
    Ok(values)
}

/// Writes row-major logical `values` into `buffer` using the layout of `desc`.
pub fn scatter(buffer: &Buffer, desc: &MemoryDesc, values: &[f32]) -> Result<()> {
    if values.len() != desc.numel() {
        return Err(Error::ElementCountMismatch {
            from: values.len(),
            to: desc.numel(),
        });
    }
    let mut bytes = buffer.write();
    check_span(desc, bytes.len())?;
    let dtype = desc.dtype();
    let size = dtype.size_of();
    if desc.is_plain() && size > 0 {
        let dense = &mut bytes[..values.len() * size];
        if values.len() >= PARALLEL_THRESHOLD {
            dense
                .par_chunks_mut(size)
                .zip(values.par_iter())
                .for_each(|(chunk, &v)| dtype.encode(v, chunk));
        } else {
            for (chunk, &v) in dense.chunks_mut(size).zip(values.iter()) {
                dtype.encode(v, chunk);
            }
        }
        return Ok(());
    }
    for (offset, &v) in desc.byte_offsets().into_iter().zip(values.iter()) {
        dtype.encode(v, &mut bytes[offset..]);
    }
    Ok(())
}

fn check_span(desc: &MemoryDesc, available: usize) -> Result<()> {
    let required = desc.size_bytes();
    if available < required {
        return Err(Error::BufferTooSmall {
            required,
            actual: available,
        });
    }
    Ok(())
}

// =============================================================================
// Memory
// =============================================================================

#[derive(Debug)]
struct MemoryInner {
    desc: MemoryDesc,
    engine: Engine,
    handle: RwLock<Option<Buffer>>,
}

/// A memory descriptor bound to an engine and a rebindable data handle.
#[derive(Debug, Clone)]
pub struct Memory {
    inner: Arc<MemoryInner>,
}

impl Memory {
    /// Allocates a zero-filled memory object for `desc` on `engine`.
    pub fn new(desc: MemoryDesc, engine: &Engine) -> Result<Self> {
        let size = concrete_size(&desc)?;
        Ok(Self::with_handle(desc, engine, Some(Buffer::zeros(size))))
    }

    /// Creates a memory object with no data handle bound.
    #[must_use]
    pub fn unbound(desc: MemoryDesc, engine: &Engine) -> Self {
        Self::with_handle(desc, engine, None)
    }

    /// Creates a memory object over an existing buffer.
    pub fn from_buffer(desc: MemoryDesc, engine: &Engine, buffer: Buffer) -> Result<Self> {
        check_span(&desc, buffer.len())?;
        Ok(Self::with_handle(desc, engine, Some(buffer)))
    }

    fn with_handle(desc: MemoryDesc, engine: &Engine, handle: Option<Buffer>) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                desc,
                engine: *engine,
                handle: RwLock::new(handle),
            }),
        }
    }

    /// Returns the descriptor.
    #[must_use]
    pub fn desc(&self) -> &MemoryDesc {
        &self.inner.desc
    }

    /// Returns the engine this memory lives on.
    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// Returns the currently bound buffer, if any.
    #[must_use]
    pub fn data_handle(&self) -> Option<Buffer> {
        self.inner.handle.read().clone()
    }

    /// Binds `buffer` as the data of this memory and all its clones.
    pub fn set_data_handle(&self, buffer: Buffer) -> Result<()> {
        check_span(&self.inner.desc, buffer.len())?;
        *self.inner.handle.write() = Some(buffer);
        Ok(())
    }

    /// Binds the handle of `other` (or clears it when `other` is unbound).
    pub fn share_handle_of(&self, other: &Self) -> Result<()> {
        match other.data_handle() {
            Some(buffer) => self.set_data_handle(buffer),
            None => {
                *self.inner.handle.write() = None;
                Ok(())
            }
        }
    }

    fn buffer(&self) -> Result<Buffer> {
        self.data_handle().ok_or(Error::NullDataHandle)
    }

    /// Reads every logical element as f32, in row-major order.
    pub fn load(&self) -> Result<Vec<f32>> {
        gather(&self.buffer()?, self.desc())
    }

    /// Reads every logical element through a different descriptor of the same bytes.
    pub fn load_as(&self, desc: &MemoryDesc) -> Result<Vec<f32>> {
        gather(&self.buffer()?, desc)
    }

    /// Writes row-major logical values.
    pub fn store(&self, values: &[f32]) -> Result<()> {
        scatter(&self.buffer()?, self.desc(), values)
    }

    /// Writes row-major logical values through a different descriptor of the same bytes.
    pub fn store_as(&self, desc: &MemoryDesc, values: &[f32]) -> Result<()> {
        scatter(&self.buffer()?, desc, values)
    }

    /// Returns true if both objects share one handle cell.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

fn concrete_size(desc: &MemoryDesc) -> Result<usize> {
    if desc.is_any() {
        return Err(Error::invalid_operation(
            "cannot allocate memory for a descriptor with format any",
        ));
    }
    Ok(desc.size_bytes())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_strides() {
        assert_eq!(contiguous_strides(&[2, 3, 4]).as_slice(), &[12, 4, 1]);
        assert_eq!(channels_last_strides(&[1, 3, 2, 2]).as_slice(), &[12, 1, 6, 3]);
    }

    #[test]
    fn test_strided_normalizes_to_plain() {
        let desc = MemoryDesc::strided(&[2, 3], DataType::F32, &[3, 1]).unwrap();
        assert!(desc.is_plain());
        assert_eq!(desc, MemoryDesc::plain(&[2, 3], DataType::F32));

        let transposed = MemoryDesc::strided(&[3, 2], DataType::F32, &[1, 3]).unwrap();
        assert_eq!(transposed.format(), Format::Strided);
    }

    #[test]
    fn test_reshape_preserves_count() {
        let desc = MemoryDesc::plain(&[2, 6], DataType::F32);
        let reshaped = desc.reshape(&[3, 4]).unwrap();
        assert_eq!(reshaped.dims(), &[3, 4]);
        assert!(desc.reshape(&[5]).is_err());

        let nhwc = MemoryDesc::new(&[1, 2, 2, 2], DataType::F32, Format::ChannelsLast);
        assert!(matches!(
            nhwc.reshape(&[8]),
            Err(Error::InvalidReshape { .. })
        ));
    }

    #[test]
    fn test_padded_front() {
        let desc = MemoryDesc::plain(&[4], DataType::F32);
        let padded = desc.padded(2, 0);
        assert_eq!(padded.dims(), &[1, 1, 4]);
        assert!(padded.is_plain());
    }

    #[test]
    fn test_pad_to_equal_rank() {
        let a = MemoryDesc::plain(&[2, 3, 4], DataType::F32);
        let b = MemoryDesc::plain(&[4], DataType::F32);
        let (a, b) = pad_to_equal_rank(&a, &b);
        assert_eq!(a.ndims(), b.ndims());
        assert_eq!(b.dims(), &[1, 1, 4]);
    }

    #[test]
    fn test_gather_channels_last() {
        // Logical NCHW [1, 2, 1, 2] stored NHWC.
        let desc = MemoryDesc::new(&[1, 2, 1, 2], DataType::F32, Format::ChannelsLast);
        let buffer = Buffer::from_slice(&[0.0f32, 10.0, 1.0, 11.0]);
        let values = gather(&buffer, &desc).unwrap();
        assert_eq!(values, vec![0.0, 1.0, 10.0, 11.0]);
    }

    #[test]
    fn test_scatter_roundtrip_through_layout() {
        let desc = MemoryDesc::new(&[1, 3, 2, 2], DataType::F32, Format::ChannelsLast);
        let buffer = Buffer::zeros(desc.size_bytes());
        let values: Vec<f32> = (0..12).map(|v| v as f32).collect();
        scatter(&buffer, &desc, &values).unwrap();
        assert_eq!(gather(&buffer, &desc).unwrap(), values);
        // Channel 0 of the first pixel is first, channel 1 second.
        assert_eq!(&buffer.to_vec::<f32>()[..3], &[0.0, 4.0, 8.0]);
    }

    #[test]
    fn test_memory_shares_handle_across_clones() {
        let engine = Engine::cpu();
        let memory = Memory::unbound(MemoryDesc::plain(&[2], DataType::F32), &engine);
        let clone = memory.clone();
        assert!(clone.load().is_err());

        memory
            .set_data_handle(Buffer::from_slice(&[1.0f32, 2.0]))
            .unwrap();
        assert_eq!(clone.load().unwrap(), vec![1.0, 2.0]);
        assert!(memory.ptr_eq(&clone));
    }

    #[test]
    fn test_memory_rejects_small_buffer() {
        let engine = Engine::cpu();
        let memory = Memory::unbound(MemoryDesc::plain(&[4], DataType::F32), &engine);
        let err = memory.set_data_handle(Buffer::zeros(8)).unwrap_err();
        assert_eq!(
            err,
            Error::BufferTooSmall {
                required: 16,
                actual: 8
            }
        );
    }

    #[test]
    fn test_memory_new_rejects_any() {
        let engine = Engine::cpu();
        assert!(Memory::new(MemoryDesc::any(&[2], DataType::F32), &engine).is_err());
    }
}
