use std::fmt;
use std::str::FromStr;

// DType — Element types a parameter or array may carry
//
//   F16  — 16-bit IEEE half float, for mixed-precision training
//   F32  — 32-bit float, the default for every parameter
//   F64  — 64-bit float
//   I8 / I32 / I64 — signed integers (quantized weights, labels, indices)
//   U8   — unsigned byte, for image data and masks
//
// The display form uses the long numpy-style names ("float32") because
// those are what users pass as strings when declaring parameters.

/// Enum of all supported element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DType {
    F16,
    #[default]
    F32,
    F64,
    I8,
    I32,
    I64,
    U8,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F16 => 2,
            DType::F32 => 4,
            DType::F64 => 8,
            DType::I8 => 1,
            DType::I32 => 4,
            DType::I64 => 8,
            DType::U8 => 1,
        }
    }

    /// Whether this dtype is a floating-point type.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::F32 | DType::F64)
    }

    /// Long name, e.g. `"float32"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            DType::F16 => "float16",
            DType::F32 => "float32",
            DType::F64 => "float64",
            DType::I8 => "int8",
            DType::I32 => "int32",
            DType::I64 => "int64",
            DType::U8 => "uint8",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DType {
    type Err = crate::Error;

    /// Accepts both the long names (`"float32"`) and the short ones (`"f32"`).
    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "float16" | "f16" => Ok(DType::F16),
            "float32" | "f32" => Ok(DType::F32),
            "float64" | "f64" => Ok(DType::F64),
            "int8" | "i8" => Ok(DType::I8),
            "int32" | "i32" => Ok(DType::I32),
            "int64" | "i64" => Ok(DType::I64),
            "uint8" | "u8" => Ok(DType::U8),
            other => Err(crate::Error::InvalidArgument(format!(
                "unknown dtype '{other}'"
            ))),
        }
    }
}

// WithDType — Bridge between Rust element types and DType
//
// Lets callers build arrays from typed slices without naming the dtype:
//
//   NDArray::from_vec(vec![1.0f32, 2.0], 2, Context::cpu(0))

/// Trait implemented by Rust types that can be stored in an array.
pub trait WithDType: Copy + Send + Sync + 'static + num_traits::NumCast + fmt::Debug {
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    /// Convert this value to f64 (for generic numeric code).
    fn to_f64(self) -> f64;

    /// Create a value of this type from f64.
    fn from_f64(v: f64) -> Self;

    /// Wrap a typed vector as array storage without conversion.
    fn into_storage(data: Vec<Self>) -> crate::ndarray::Storage;
}

macro_rules! with_dtype_cast {
    ($ty:ty, $variant:ident) => {
        impl WithDType for $ty {
            const DTYPE: DType = DType::$variant;
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn from_f64(v: f64) -> Self {
                v as $ty
            }
            fn into_storage(data: Vec<Self>) -> crate::ndarray::Storage {
                crate::ndarray::Storage::$variant(data)
            }
        }
    };
}

with_dtype_cast!(f32, F32);
with_dtype_cast!(f64, F64);
with_dtype_cast!(i8, I8);
with_dtype_cast!(i32, I32);
with_dtype_cast!(i64, I64);
with_dtype_cast!(u8, U8);

impl WithDType for half::f16 {
    const DTYPE: DType = DType::F16;
    fn to_f64(self) -> f64 {
        self.to_f64()
    }
    fn from_f64(v: f64) -> Self {
        half::f16::from_f64(v)
    }
    fn into_storage(data: Vec<Self>) -> crate::ndarray::Storage {
        crate::ndarray::Storage::F16(data)
    }
}
