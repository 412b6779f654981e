//! Tensor handles and element types.
//!
//! - [`dtype`]: Element type definitions and checkpoint dtype codes.
//! - [`convert`]: Load-time precision conversion table.
//!
//! A [`Tensor`] is an opaque, reference-counted handle to device memory with a
//! shape, element type and placement. `Clone` shares the allocation; it never
//! copies data. Two table slots hold the same allocation only when the output
//! projection is tied to the input embedding, which [`Tensor::ptr_eq`] detects.

pub mod convert;
pub mod dtype;

use std::fmt;
use std::sync::Arc;

use crate::error::{Qwen2Error, Result};

pub use dtype::Dtype;

/// Kind of device a tensor lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceType {
    #[default]
    Cpu,
    Nvidia,
}

impl DeviceType {
    pub fn name(self) -> &'static str {
        match self {
            DeviceType::Cpu => "cpu",
            DeviceType::Nvidia => "nvidia",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for DeviceType {
    type Err = Qwen2Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(DeviceType::Cpu),
            "nvidia" | "cuda" | "gpu" => Ok(DeviceType::Nvidia),
            other => Err(Qwen2Error::InvalidInput(format!("unknown device type '{other}'"))),
        }
    }
}

struct TensorData {
    shape: Vec<usize>,
    dtype: Dtype,
    device: DeviceType,
    device_id: i32,
    bytes: Vec<u8>,
}

/// Shared handle to a dense, row-major tensor.
#[derive(Clone)]
pub struct Tensor {
    inner: Arc<TensorData>,
}

/// Bytes needed for `shape` elements of `dtype`, or `None` on overflow.
pub fn byte_len(shape: &[usize], dtype: Dtype) -> Option<usize> {
    shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))?
        .checked_mul(dtype.size_bytes())
}

impl Tensor {
    /// Create a tensor from raw little-endian element bytes.
    ///
    /// Fails with [`Qwen2Error::ShapeMismatch`] if `bytes` does not hold exactly
    /// `numel(shape)` elements of `dtype`.
    pub fn from_bytes(
        shape: &[usize],
        dtype: Dtype,
        device: DeviceType,
        device_id: i32,
        bytes: Vec<u8>,
    ) -> Result<Self> {
        let expected = byte_len(shape, dtype).ok_or_else(|| {
            Qwen2Error::InvalidInput(format!("shape {shape:?} overflows the address space"))
        })?;
        if bytes.len() != expected {
            return Err(Qwen2Error::ShapeMismatch {
                name: format!("{dtype} tensor bytes"),
                expected: vec![expected],
                got: vec![bytes.len()],
            });
        }
        Ok(Tensor {
            inner: Arc::new(TensorData {
                shape: shape.to_vec(),
                dtype,
                device,
                device_id,
                bytes,
            }),
        })
    }

    /// Create a host tensor of `dtype` (F32, F16 or BF16) from `f32` values.
    pub fn from_f32(shape: &[usize], dtype: Dtype, values: &[f32]) -> Result<Self> {
        let bytes = convert::encode_f32(dtype, values)?;
        Self::from_bytes(shape, dtype, DeviceType::Cpu, 0, bytes)
    }

    pub fn shape(&self) -> &[usize] {
        &self.inner.shape
    }

    pub fn dtype(&self) -> Dtype {
        self.inner.dtype
    }

    pub fn device(&self) -> DeviceType {
        self.inner.device
    }

    pub fn device_id(&self) -> i32 {
        self.inner.device_id
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.inner.shape.iter().product()
    }

    /// Raw element bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.inner.bytes
    }

    /// Size of the allocation in bytes.
    pub fn byte_size(&self) -> usize {
        self.inner.bytes.len()
    }

    /// Decode the elements as `f32` (F32, F16 and BF16 only).
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        convert::decode_f32(self.dtype(), self.as_bytes())
    }

    /// Whether two handles refer to the same allocation.
    pub fn ptr_eq(a: &Tensor, b: &Tensor) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.inner.shape)
            .field("dtype", &self.inner.dtype)
            .field("device", &self.inner.device)
            .field("device_id", &self.inner.device_id)
            .finish()
    }
}
