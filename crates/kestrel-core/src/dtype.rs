use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

// DType: element types of a tensor
//
// Every tensor carries a DType. Element values are held as f64 in storage and
// rounded through the dtype after every kernel, so an i32 tensor behaves like
// an i32 tensor even though its storage cell is wider:
//
//   Bool  - 0 or 1
//   U8    - unsigned byte, wraps modulo 256
//   I32   - signed 32-bit, wraps
//   I64   - signed 64-bit
//   F16   - IEEE half, rounded through `half::f16`
//   BF16  - brain float, rounded through `half::bf16`
//   F32   - single precision, the default float type
//   F64   - double precision
//
// Type promotion follows the usual lattice: Bool < U8 < I32 < I64 < F16/BF16
// < F32 < F64, with F16 + BF16 promoting to F32.

/// Enum of all supported element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DType {
    Bool,
    U8,
    I32,
    I64,
    F16,
    BF16,
    F32,
    F64,
}

impl DType {
    /// Every dtype, in promotion order.
    pub const ALL: [DType; 8] = [
        DType::Bool,
        DType::U8,
        DType::I32,
        DType::I64,
        DType::F16,
        DType::BF16,
        DType::F32,
        DType::F64,
    ];

    /// Size of one element in bytes when serialized.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::Bool | DType::U8 => 1,
            DType::F16 | DType::BF16 => 2,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    /// Whether this dtype is a floating-point type.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
    }

    /// Whether this dtype holds integers (bool included).
    pub fn is_integral(&self) -> bool {
        !self.is_float()
    }

    /// Whether this is a half-precision type (F16 or BF16).
    pub fn is_half(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16)
    }

    /// The result dtype of a binary operation between `self` and `other`.
    pub fn promote(self, other: DType) -> DType {
        if self == other {
            return self;
        }
        if self.is_half() && other.is_half() {
            return DType::F32;
        }
        self.max(other)
    }

    /// Promote to the default float type if integral (used by true division
    /// and transcendental functions).
    pub fn to_float(self) -> DType {
        if self.is_float() {
            self
        } else {
            DType::F32
        }
    }

    /// Round an f64 through this dtype's value set.
    pub fn cast(self, v: f64) -> f64 {
        match self {
            DType::Bool => {
                if v != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            DType::U8 => (v as i64) as u8 as f64,
            DType::I32 => (v as i64) as i32 as f64,
            DType::I64 => (v as i64) as f64,
            DType::F16 => half::f16::from_f64(v).to_f64(),
            DType::BF16 => half::bf16::from_f64(v).to_f64(),
            DType::F32 => v as f32 as f64,
            DType::F64 => v,
        }
    }

    /// Short name used in type printing and archives.
    pub fn name(&self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::U8 => "u8",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }

    /// One-byte tag for binary encodings.
    pub fn to_tag(self) -> u8 {
        match self {
            DType::Bool => 0,
            DType::U8 => 1,
            DType::I32 => 2,
            DType::I64 => 3,
            DType::F16 => 4,
            DType::BF16 => 5,
            DType::F32 => 6,
            DType::F64 => 7,
        }
    }

    /// Inverse of [`DType::to_tag`].
    pub fn from_tag(tag: u8) -> Result<DType> {
        DType::ALL
            .get(tag as usize)
            .copied()
            .ok_or_else(|| Error::msg(format!("unknown dtype tag: {tag}")))
    }

    /// Encode element values as little-endian bytes in this dtype's width.
    pub fn encode(self, values: &[f64]) -> Vec<u8> {
        let mut out = Vec::with_capacity(values.len() * self.size_in_bytes());
        for &v in values {
            match self {
                DType::Bool => out.push(u8::from(v != 0.0)),
                DType::U8 => out.push(v as u8),
                DType::I32 => out.extend_from_slice(&(v as i32).to_le_bytes()),
                DType::I64 => out.extend_from_slice(&(v as i64).to_le_bytes()),
                DType::F16 => out.extend_from_slice(&half::f16::from_f64(v).to_le_bytes()),
                DType::BF16 => out.extend_from_slice(&half::bf16::from_f64(v).to_le_bytes()),
                DType::F32 => out.extend_from_slice(&(v as f32).to_le_bytes()),
                DType::F64 => out.extend_from_slice(&v.to_le_bytes()),
            }
        }
        out
    }

    /// Decode little-endian bytes produced by [`DType::encode`].
    pub fn decode(self, bytes: &[u8]) -> Result<Vec<f64>> {
        let width = self.size_in_bytes();
        if bytes.len() % width != 0 {
            return Err(Error::msg(format!(
                "byte length {} is not a multiple of {} for dtype {}",
                bytes.len(),
                width,
                self
            )));
        }
        let values = bytes
            .chunks_exact(width)
            .map(|c| match self {
                DType::Bool => f64::from(u8::from(c[0] != 0)),
                DType::U8 => f64::from(c[0]),
                DType::I32 => f64::from(i32::from_le_bytes([c[0], c[1], c[2], c[3]])),
                DType::I64 => {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(c);
                    i64::from_le_bytes(b) as f64
                }
                DType::F16 => half::f16::from_le_bytes([c[0], c[1]]).to_f64(),
                DType::BF16 => half::bf16::from_le_bytes([c[0], c[1]]).to_f64(),
                DType::F32 => f64::from(f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
                DType::F64 => {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(c);
                    f64::from_le_bytes(b)
                }
            })
            .collect();
        Ok(values)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        DType::ALL
            .iter()
            .copied()
            .find(|d| d.name() == s)
            .ok_or_else(|| Error::msg(format!("unknown dtype: '{s}'")))
    }
}

// WithDType: maps Rust element types to DType
//
// Lets constructors be generic over the element type:
//
//   Tensor::from_slice(&[1i64, 2, 3], 3)   -> I64 tensor
//   Tensor::from_slice(&[0.5f32, 1.5], 2)  -> F32 tensor

/// Trait implemented by Rust types that can seed a tensor.
pub trait WithDType: Copy + Send + Sync + 'static + fmt::Debug {
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    /// Convert this value to f64.
    fn to_f64(self) -> f64;

    /// Create a value of this type from f64.
    fn from_f64(v: f64) -> Self;
}

macro_rules! with_dtype_prim {
    ($ty:ty, $dtype:expr) => {
        impl WithDType for $ty {
            const DTYPE: DType = $dtype;
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn from_f64(v: f64) -> Self {
                v as $ty
            }
        }
    };
}

with_dtype_prim!(u8, DType::U8);
with_dtype_prim!(i32, DType::I32);
with_dtype_prim!(i64, DType::I64);
with_dtype_prim!(f32, DType::F32);
with_dtype_prim!(f64, DType::F64);

impl WithDType for bool {
    const DTYPE: DType = DType::Bool;
    fn to_f64(self) -> f64 {
        f64::from(u8::from(self))
    }
    fn from_f64(v: f64) -> Self {
        v != 0.0
    }
}

impl WithDType for half::f16 {
    const DTYPE: DType = DType::F16;
    fn to_f64(self) -> f64 {
        half::f16::to_f64(self)
    }
    fn from_f64(v: f64) -> Self {
        half::f16::from_f64(v)
    }
}

impl WithDType for half::bf16 {
    const DTYPE: DType = DType::BF16;
    fn to_f64(self) -> f64 {
        half::bf16::to_f64(self)
    }
    fn from_f64(v: f64) -> Self {
        half::bf16::from_f64(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_size() {
        assert_eq!(DType::F16.size_in_bytes(), 2);
        assert_eq!(DType::BF16.size_in_bytes(), 2);
        assert_eq!(DType::I32.size_in_bytes(), 4);
        assert_eq!(DType::F64.size_in_bytes(), 8);
        assert_eq!(DType::Bool.size_in_bytes(), 1);
    }

    #[test]
    fn test_promotion() {
        assert_eq!(DType::I32.promote(DType::I64), DType::I64);
        assert_eq!(DType::I64.promote(DType::F32), DType::F32);
        assert_eq!(DType::F16.promote(DType::BF16), DType::F32);
        assert_eq!(DType::Bool.promote(DType::U8), DType::U8);
        assert_eq!(DType::F32.promote(DType::F64), DType::F64);
    }

    #[test]
    fn test_cast_rounds_through_type() {
        assert_eq!(DType::I32.cast(2.9), 2.0);
        assert_eq!(DType::I64.cast(-2.9), -2.0);
        assert_eq!(DType::U8.cast(257.0), 1.0);
        assert_eq!(DType::Bool.cast(0.3), 1.0);
        assert_eq!(DType::F32.cast(0.1), 0.1f32 as f64);
    }

    #[test]
    fn test_encode_decode_bf16() {
        let values = vec![1.0, -2.5, 0.0];
        let bytes = DType::BF16.encode(&values);
        assert_eq!(bytes.len(), 6);
        assert_eq!(DType::BF16.decode(&bytes).unwrap(), values);
    }

    #[test]
    fn test_decode_rejects_ragged_bytes() {
        assert!(DType::I32.decode(&[0, 1, 2]).is_err());
    }

    #[test]
    fn test_name_round_trip() {
        for d in DType::ALL {
            assert_eq!(d.name().parse::<DType>().unwrap(), d);
            assert_eq!(DType::from_tag(d.to_tag()).unwrap(), d);
        }
    }
}
