//! Data Types - Backend Element Types
//!
//! Defines the element types a backend primitive can read and write, and the
//! scalar conversions the reference executor uses to move values between
//! typed byte buffers and its f32 compute domain.
//!
//! # Key Features
//! - Runtime element type information via `DataType`
//! - Half-precision (f16, bf16) support through the `half` crate
//! - Saturating, round-to-nearest-even integer stores
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use core::fmt;

use bytemuck::pod_read_unaligned;
use half::{bf16, f16};
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};

// =============================================================================
// DataType Enum
// =============================================================================

/// Runtime representation of primitive element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Undefined element type, used by absent tensors.
    Undef,
    /// 32-bit floating point.
    F32,
    /// 16-bit floating point (IEEE half precision).
    F16,
    /// 16-bit brain floating point.
    BF16,
    /// 32-bit signed integer.
    S32,
    /// 8-bit signed integer.
    S8,
    /// 8-bit unsigned integer.
    U8,
}

impl DataType {
    /// Returns the size in bytes of one element of this type.
    #[must_use]
    pub const fn size_of(self) -> usize {
        match self {
            Self::Undef => 0,
            Self::S8 | Self::U8 => 1,
            Self::F16 | Self::BF16 => 2,
            Self::F32 | Self::S32 => 4,
        }
    }

    /// Returns true if this is a floating point type.
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F16 | Self::BF16)
    }

    /// Returns true if this is an integer type.
    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(self, Self::S32 | Self::S8 | Self::U8)
    }

    /// Returns the short name of this data type.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Undef => "undef",
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::BF16 => "bf16",
            Self::S32 => "s32",
            Self::S8 => "s8",
            Self::U8 => "u8",
        }
    }

    /// Decodes one element from `bytes` (little endian) into f32.
    ///
    /// `bytes` must hold at least `size_of()` bytes.
    #[must_use]
    pub fn decode(self, bytes: &[u8]) -> f32 {
        match self {
            Self::Undef => 0.0,
            Self::F32 => pod_read_unaligned::<f32>(&bytes[..4]),
            Self::F16 => f16::from_bits(pod_read_unaligned::<u16>(&bytes[..2])).to_f32(),
            Self::BF16 => bf16::from_bits(pod_read_unaligned::<u16>(&bytes[..2])).to_f32(),
            Self::S32 => pod_read_unaligned::<i32>(&bytes[..4]) as f32,
            Self::S8 => f32::from(bytes[0] as i8),
            Self::U8 => f32::from(bytes[0]),
        }
    }

    /// Encodes an f32 value as one element of this type into `bytes`.
    ///
    /// Integer targets round to nearest even and saturate at the type bounds.
    pub fn encode(self, value: f32, bytes: &mut [u8]) {
        match self {
            Self::Undef => {}
            Self::F32 => bytes[..4].copy_from_slice(&value.to_le_bytes()),
            Self::F16 => bytes[..2].copy_from_slice(&f16::from_f32(value).to_bits().to_le_bytes()),
            Self::BF16 => {
                bytes[..2].copy_from_slice(&bf16::from_f32(value).to_bits().to_le_bytes());
            }
            Self::S32 => {
                let v = saturate(value, i32::MIN as f32, i32::MAX as f32)
                    .to_i32()
                    .unwrap_or(0);
                bytes[..4].copy_from_slice(&v.to_le_bytes());
            }
            Self::S8 => {
                let v = saturate(value, -128.0, 127.0).to_i8().unwrap_or(0);
                bytes[0] = v.to_le_bytes()[0];
            }
            Self::U8 => {
                bytes[0] = saturate(value, 0.0, 255.0).to_u8().unwrap_or(0);
            }
        }
    }
}

fn saturate(value: f32, lo: f32, hi: f32) -> f32 {
    if value.is_nan() {
        return 0.0;
    }
    value.round_ties_even().clamp(lo, hi)
}

impl Default for DataType {
    fn default() -> Self {
        Self::F32
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Tests
// =============================================================================
