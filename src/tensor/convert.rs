//! Load-time precision conversion.
//!
//! A fixed table maps `(storage, compute)` dtype pairs to a conversion function.
//! The loader resolves every pair a shard needs before creating any tensor from it,
//! so an unsupported precision fails the shard up front instead of mid-way.

use byteorder::{ByteOrder, LittleEndian};
use half::{bf16, f16};

use crate::error::{Qwen2Error, Result};
use crate::tensor::Dtype;

/// Converts little-endian element bytes from one dtype to another.
pub type ConvertFn = fn(&[u8]) -> Vec<u8>;

/// Look up the conversion from `from` to `to`.
///
/// Equal dtypes map to a plain copy. `BF16` is never kept as a compute precision,
/// since not every downstream kernel library handles it natively.
pub fn conversion(from: Dtype, to: Dtype) -> Result<ConvertFn> {
    if from == to {
        return Ok(identity);
    }
    match (from, to) {
        (Dtype::BFloat16, Dtype::Float16) => Ok(bf16_to_f16),
        (Dtype::BFloat16, Dtype::Float32) => Ok(bf16_to_f32),
        (Dtype::Float16, Dtype::Float32) => Ok(f16_to_f32),
        (Dtype::Float32, Dtype::Float16) => Ok(f32_to_f16),
        _ => Err(Qwen2Error::UnsupportedPrecision {
            from: from.to_string(),
            to: to.to_string(),
        }),
    }
}

/// Decode F32/F16/BF16 element bytes into `f32` values.
pub fn decode_f32(dtype: Dtype, bytes: &[u8]) -> Result<Vec<f32>> {
    let n = bytes.len() / dtype.size_bytes();
    match dtype {
        Dtype::Float32 => {
            let mut out = vec![0.0f32; n];
            LittleEndian::read_f32_into(&bytes[..n * 4], &mut out);
            Ok(out)
        }
        Dtype::Float16 => Ok(read_u16s(bytes)
            .into_iter()
            .map(|b| f16::from_bits(b).to_f32())
            .collect()),
        Dtype::BFloat16 => Ok(read_u16s(bytes)
            .into_iter()
            .map(|b| bf16::from_bits(b).to_f32())
            .collect()),
        other => Err(Qwen2Error::UnsupportedPrecision {
            from: other.to_string(),
            to: Dtype::Float32.to_string(),
        }),
    }
}

/// Encode `f32` values as F32 or F16 little-endian bytes.
pub fn encode_f32(dtype: Dtype, values: &[f32]) -> Result<Vec<u8>> {
    match dtype {
        Dtype::Float32 => {
            let mut out = vec![0u8; values.len() * 4];
            LittleEndian::write_f32_into(values, &mut out);
            Ok(out)
        }
        Dtype::Float16 => Ok(write_u16s(values.iter().map(|&v| f16::from_f32(v).to_bits()))),
        Dtype::BFloat16 => Ok(write_u16s(values.iter().map(|&v| bf16::from_f32(v).to_bits()))),
        other => Err(Qwen2Error::UnsupportedPrecision {
            from: Dtype::Float32.to_string(),
            to: other.to_string(),
        }),
    }
}

fn identity(bytes: &[u8]) -> Vec<u8> {
    bytes.to_vec()
}

fn bf16_to_f16(bytes: &[u8]) -> Vec<u8> {
    write_u16s(
        read_u16s(bytes)
            .into_iter()
            .map(|b| f16::from_f32(bf16::from_bits(b).to_f32()).to_bits()),
    )
}

fn bf16_to_f32(bytes: &[u8]) -> Vec<u8> {
    write_f32s(read_u16s(bytes).into_iter().map(|b| bf16::from_bits(b).to_f32()))
}

fn f16_to_f32(bytes: &[u8]) -> Vec<u8> {
    write_f32s(read_u16s(bytes).into_iter().map(|b| f16::from_bits(b).to_f32()))
}

fn f32_to_f16(bytes: &[u8]) -> Vec<u8> {
    let n = bytes.len() / 4;
    let mut values = vec![0.0f32; n];
    LittleEndian::read_f32_into(&bytes[..n * 4], &mut values);
    write_u16s(values.into_iter().map(|v| f16::from_f32(v).to_bits()))
}

fn read_u16s(bytes: &[u8]) -> Vec<u16> {
    let n = bytes.len() / 2;
    let mut out = vec![0u16; n];
    LittleEndian::read_u16_into(&bytes[..n * 2], &mut out);
    out
}

fn write_u16s(values: impl Iterator<Item = u16>) -> Vec<u8> {
    let values: Vec<u16> = values.collect();
    let mut out = vec![0u8; values.len() * 2];
    LittleEndian::write_u16_into(&values, &mut out);
    out
}

fn write_f32s(values: impl Iterator<Item = f32>) -> Vec<u8> {
    let values: Vec<f32> = values.collect();
    let mut out = vec![0u8; values.len() * 4];
    LittleEndian::write_f32_into(&values, &mut out);
    out
}
