//! Element type descriptors for stream ports and buffer chunks.

use std::fmt;

/// Primitive element codes understood by the runtime.
///
/// Arithmetic kernels that care about the element layout dispatch on this
/// tag at runtime rather than through type parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeCode {
    /// Untyped octets.
    Byte,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    /// Interleaved re/im pair of `f32`.
    ComplexFloat32,
    /// Interleaved re/im pair of `f64`.
    ComplexFloat64,
}

impl TypeCode {
    /// Size of one element of this code in bytes.
    pub fn size(&self) -> usize {
        match self {
            TypeCode::Byte | TypeCode::Int8 | TypeCode::UInt8 => 1,
            TypeCode::Int16 | TypeCode::UInt16 => 2,
            TypeCode::Int32 | TypeCode::UInt32 | TypeCode::Float32 => 4,
            TypeCode::Int64 | TypeCode::UInt64 | TypeCode::Float64 | TypeCode::ComplexFloat32 => 8,
            TypeCode::ComplexFloat64 => 16,
        }
    }

    /// Canonical markup name.
    pub fn name(&self) -> &'static str {
        match self {
            TypeCode::Byte => "byte",
            TypeCode::Int8 => "int8",
            TypeCode::UInt8 => "uint8",
            TypeCode::Int16 => "int16",
            TypeCode::UInt16 => "uint16",
            TypeCode::Int32 => "int32",
            TypeCode::UInt32 => "uint32",
            TypeCode::Int64 => "int64",
            TypeCode::UInt64 => "uint64",
            TypeCode::Float32 => "float32",
            TypeCode::Float64 => "float64",
            TypeCode::ComplexFloat32 => "complex_float32",
            TypeCode::ComplexFloat64 => "complex_float64",
        }
    }
}

/// A data type descriptor: an element code and a dimension multiplier.
///
/// The dimension describes vector elements (one "element" of
/// `DType::vector(TypeCode::Float32, 2)` occupies 8 bytes). Ports compare
/// dtypes when edges are committed; equality requires the same code and
/// dimension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DType {
    code: TypeCode,
    dimension: usize,
}

impl DType {
    /// A new scalar descriptor.
    pub fn new(code: TypeCode) -> Self {
        DType { code, dimension: 1 }
    }

    /// A new vector descriptor with the given dimension (clamped to 1).
    pub fn vector(code: TypeCode, dimension: usize) -> Self {
        DType { code, dimension: dimension.max(1) }
    }

    /// The untyped single-octet descriptor.
    pub fn byte() -> Self {
        DType::new(TypeCode::Byte)
    }

    /// Parses a markup name, e.g. `"float32"`, `"cf64"`, `"uint8"`.
    ///
    /// Aliases follow the common short forms: `u8/s8/i8`, `f32/f64`,
    /// `cf32/cf64`, and `byte`/`octet`. Returns `None` for unknown markup.
    pub fn from_markup(markup: &str) -> Option<Self> {
        let code = match markup {
            "byte" | "octet" => TypeCode::Byte,
            "int8" | "i8" | "s8" => TypeCode::Int8,
            "uint8" | "u8" => TypeCode::UInt8,
            "int16" | "i16" | "s16" => TypeCode::Int16,
            "uint16" | "u16" => TypeCode::UInt16,
            "int32" | "i32" | "s32" => TypeCode::Int32,
            "uint32" | "u32" => TypeCode::UInt32,
            "int64" | "i64" | "s64" => TypeCode::Int64,
            "uint64" | "u64" => TypeCode::UInt64,
            "float32" | "f32" | "float" => TypeCode::Float32,
            "float64" | "f64" | "double" => TypeCode::Float64,
            "complex_float32" | "cf32" | "complex64" => TypeCode::ComplexFloat32,
            "complex_float64" | "cf64" | "complex128" => TypeCode::ComplexFloat64,
            _ => return None,
        };
        Some(DType::new(code))
    }

    /// The element code.
    pub fn code(&self) -> TypeCode {
        self.code
    }

    /// The vector dimension.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Size of one element in bytes: code size times dimension.
    pub fn size(&self) -> usize {
        self.code.size() * self.dimension
    }
}

impl Default for DType {
    fn default() -> Self {
        DType::byte()
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dimension == 1 {
            write!(f, "{}", self.code.name())
        } else {
            write!(f, "{}[{}]", self.code.name(), self.dimension)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markup_round_trip() {
        for name in ["byte", "int8", "uint16", "int32", "uint64", "float32", "float64", "complex_float32", "complex_float64"] {
            let dtype = DType::from_markup(name).unwrap();
            assert_eq!(dtype.to_string(), name);
        }
        assert_eq!(DType::from_markup("f32"), DType::from_markup("float32"));
        assert_eq!(DType::from_markup("cf64"), DType::from_markup("complex_float64"));
        assert!(DType::from_markup("float128").is_none());
    }

    #[test]
    fn sizes() {
        assert_eq!(DType::from_markup("int32").unwrap().size(), 4);
        assert_eq!(DType::from_markup("complex_float64").unwrap().size(), 16);
        assert_eq!(DType::vector(TypeCode::Float32, 2).size(), 8);
        assert_eq!(DType::byte().size(), 1);
    }
}
