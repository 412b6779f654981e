//! Element type definitions.
//!
//! Maps checkpoint dtype strings and config precision names to a Rust enum.

use crate::error::{Qwen2Error, Result};

/// Supported tensor element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dtype {
    Bool,
    UInt8,
    UInt16,
    UInt32,
    Int8,
    Int16,
    Int32,
    Int64,
    Float16,
    Float32,
    BFloat16,
}

impl Dtype {
    /// Size of a single element in bytes.
    pub fn size_bytes(self) -> usize {
        match self {
            Dtype::Bool | Dtype::UInt8 | Dtype::Int8 => 1,
            Dtype::UInt16 | Dtype::Int16 | Dtype::Float16 | Dtype::BFloat16 => 2,
            Dtype::UInt32 | Dtype::Int32 | Dtype::Float32 => 4,
            Dtype::Int64 => 8,
        }
    }

    /// Parse a safetensors header dtype string (e.g. `"BF16"`).
    pub fn from_safetensors(code: &str) -> Result<Self> {
        match code {
            "F32" => Ok(Dtype::Float32),
            "F16" => Ok(Dtype::Float16),
            "BF16" => Ok(Dtype::BFloat16),
            "I64" => Ok(Dtype::Int64),
            "I32" => Ok(Dtype::Int32),
            "I16" => Ok(Dtype::Int16),
            "I8" => Ok(Dtype::Int8),
            "U8" => Ok(Dtype::UInt8),
            "U16" => Ok(Dtype::UInt16),
            "U32" => Ok(Dtype::UInt32),
            "BOOL" => Ok(Dtype::Bool),
            other => Err(Qwen2Error::UnsupportedPrecision {
                from: other.to_string(),
                to: "any known dtype".to_string(),
            }),
        }
    }

    /// The safetensors header code for this dtype.
    pub fn safetensors_code(self) -> &'static str {
        match self {
            Dtype::Bool => "BOOL",
            Dtype::UInt8 => "U8",
            Dtype::UInt16 => "U16",
            Dtype::UInt32 => "U32",
            Dtype::Int8 => "I8",
            Dtype::Int16 => "I16",
            Dtype::Int32 => "I32",
            Dtype::Int64 => "I64",
            Dtype::Float16 => "F16",
            Dtype::Float32 => "F32",
            Dtype::BFloat16 => "BF16",
        }
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            Dtype::Bool => "bool",
            Dtype::UInt8 => "uint8",
            Dtype::UInt16 => "uint16",
            Dtype::UInt32 => "uint32",
            Dtype::Int8 => "int8",
            Dtype::Int16 => "int16",
            Dtype::Int32 => "int32",
            Dtype::Int64 => "int64",
            Dtype::Float16 => "float16",
            Dtype::Float32 => "float32",
            Dtype::BFloat16 => "bfloat16",
        }
    }

    /// Whether this is a floating-point type.
    pub fn is_float(self) -> bool {
        matches!(self, Dtype::Float16 | Dtype::Float32 | Dtype::BFloat16)
    }

    /// Whether this is an integer type.
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Dtype::UInt8
                | Dtype::UInt16
                | Dtype::UInt32
                | Dtype::Int8
                | Dtype::Int16
                | Dtype::Int32
                | Dtype::Int64
        )
    }
}

impl std::fmt::Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
