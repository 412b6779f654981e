//! Safetensors shard parser.
//!
//! The safetensors layout is:
//! - 8-byte little-endian header size
//! - JSON header with tensor metadata (name, dtype, shape, data offsets)
//! - Raw tensor data

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use serde::Deserialize;

use crate::error::{Qwen2Error, Result};
use crate::tensor::Dtype;
use crate::weights::mmap::MappedFile;

/// Metadata for a single tensor in a safetensors file.
#[derive(Debug, Clone, Deserialize)]
pub struct TensorInfo {
    /// Data type code (e.g., "F16", "F32", "BF16", "I64").
    pub dtype: String,

    pub shape: Vec<usize>,

    /// Byte offset range `[start, end)` within the data section.
    pub data_offsets: [usize; 2],
}

impl TensorInfo {
    /// Parse the dtype code.
    pub fn parse_dtype(&self) -> Result<Dtype> {
        Dtype::from_safetensors(&self.dtype)
    }

    /// Total byte size of the tensor data.
    pub fn byte_size(&self) -> usize {
        self.data_offsets[1].saturating_sub(self.data_offsets[0])
    }

    /// Element count, saturating at `usize::MAX`.
    pub fn numel(&self) -> usize {
        self.shape
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
            .unwrap_or(usize::MAX)
    }
}

/// Parsed safetensors file header.
pub struct SafetensorsHeader {
    /// Tensor name to metadata, ordered by name.
    pub tensors: BTreeMap<String, TensorInfo>,

    /// Free-form `__metadata__` entries.
    pub metadata: HashMap<String, String>,

    /// Byte offset where the data section begins.
    pub data_offset: usize,
}

/// Parse a safetensors header from a mapped file.
pub fn parse_header(mapped: &MappedFile) -> Result<SafetensorsHeader> {
    let bytes = mapped.as_bytes();

    if bytes.len() < 8 {
        return Err(Qwen2Error::WeightLoad(
            "file too small for safetensors header".into(),
        ));
    }

    let header_size = (&bytes[..8]).read_u64::<LittleEndian>()? as usize;

    if header_size > bytes.len() - 8 {
        return Err(Qwen2Error::WeightLoad(format!(
            "header size {header_size} exceeds file size {}",
            bytes.len()
        )));
    }

    let header_str = std::str::from_utf8(&bytes[8..8 + header_size])
        .map_err(|e| Qwen2Error::WeightLoad(format!("invalid UTF-8 in header: {e}")))?;

    let raw: HashMap<String, serde_json::Value> = serde_json::from_str(header_str)?;

    let mut tensors = BTreeMap::new();
    let mut metadata = HashMap::new();

    for (key, value) in raw {
        if key == "__metadata__" {
            if let Some(obj) = value.as_object() {
                for (mk, mv) in obj {
                    if let Some(s) = mv.as_str() {
                        metadata.insert(mk.clone(), s.to_string());
                    }
                }
            }
        } else {
            let info: TensorInfo = serde_json::from_value(value).map_err(|e| {
                Qwen2Error::WeightLoad(format!("failed to parse tensor '{key}': {e}"))
            })?;
            tensors.insert(key, info);
        }
    }

    Ok(SafetensorsHeader {
        tensors,
        metadata,
        data_offset: 8 + header_size,
    })
}

/// A shard with a parsed header and memory-mapped data.
pub struct SafetensorsFile {
    pub header: SafetensorsHeader,
    pub mapped: MappedFile,
}

impl SafetensorsFile {
    /// Open and parse a safetensors file.
    pub fn open(path: &Path) -> Result<Self> {
        let mapped = MappedFile::open(path)?;
        let header = parse_header(&mapped)?;
        Ok(SafetensorsFile { header, mapped })
    }

    /// The raw bytes of a named tensor.
    pub fn tensor_data(&self, name: &str) -> Result<&[u8]> {
        let info = self.header.tensors.get(name).ok_or_else(|| {
            Qwen2Error::WeightLoad(format!("tensor '{name}' not found in safetensors"))
        })?;
        let [begin, end] = info.data_offsets;
        if end < begin {
            return Err(Qwen2Error::WeightLoad(format!(
                "tensor '{name}' has inverted data offsets [{begin}, {end}]"
            )));
        }
        let start = self.header.data_offset.checked_add(begin).ok_or_else(|| {
            Qwen2Error::WeightLoad(format!("tensor '{name}' data offset {begin} overflows"))
        })?;
        self.mapped.slice(start, end - begin)
    }

    /// Tensor names in lexicographic order.
    pub fn tensor_names(&self) -> Vec<&str> {
        self.header.tensors.keys().map(|s| s.as_str()).collect()
    }

    pub fn has_tensor(&self, name: &str) -> bool {
        self.header.tensors.contains_key(name)
    }
}
