//! Tests for safetensors parsing.

use std::io::Write;

use qwen2::tensor::Dtype;
use qwen2::weights::safetensors::{SafetensorsFile, TensorInfo};
use qwen2::Qwen2Error;

#[test]
fn test_tensor_info_parse_dtype() {
    let info = TensorInfo {
        dtype: "F32".to_string(),
        shape: vec![10, 20],
        data_offsets: [0, 800],
    };
    assert_eq!(info.parse_dtype().unwrap(), Dtype::Float32);
    assert_eq!(info.byte_size(), 800);
    assert_eq!(info.numel(), 200);
}

#[test]
fn test_tensor_info_dtypes() {
    let dtypes = vec![
        ("F16", Dtype::Float16),
        ("F32", Dtype::Float32),
        ("BF16", Dtype::BFloat16),
        ("I32", Dtype::Int32),
        ("U8", Dtype::UInt8),
    ];

    for (name, expected) in dtypes {
        let info = TensorInfo {
            dtype: name.to_string(),
            shape: vec![1],
            data_offsets: [0, 4],
        };
        assert_eq!(info.parse_dtype().unwrap(), expected);
    }
}

#[test]
fn test_tensor_info_unsupported_dtype() {
    let info = TensorInfo {
        dtype: "INVALID".to_string(),
        shape: vec![1],
        data_offsets: [0, 4],
    };
    assert!(matches!(
        info.parse_dtype(),
        Err(Qwen2Error::UnsupportedPrecision { .. })
    ));
}

fn write_raw(bytes: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("test.safetensors");
    let mut f = std::fs::File::create(&file_path).unwrap();
    f.write_all(bytes).unwrap();
    (dir, file_path)
}

#[test]
fn test_parse_safetensors_file() {
    let header = serde_json::json!({
        "test_tensor": {
            "dtype": "F32",
            "shape": [2, 3],
            "data_offsets": [0, 24]
        },
        "__metadata__": {
            "format": "pt"
        }
    });

    let header_str = serde_json::to_string(&header).unwrap();
    let header_bytes = header_str.as_bytes();
    let header_size = header_bytes.len() as u64;

    // 8-byte header size + header JSON + data
    let mut file_data = Vec::new();
    file_data.extend_from_slice(&header_size.to_le_bytes());
    file_data.extend_from_slice(header_bytes);
    file_data.extend_from_slice(&[0u8; 24]);

    let (_dir, file_path) = write_raw(&file_data);
    let sf = SafetensorsFile::open(&file_path).unwrap();

    assert!(sf.header.tensors.contains_key("test_tensor"));
    assert_eq!(sf.header.tensors.len(), 1);
    assert_eq!(sf.header.metadata.get("format").unwrap(), "pt");

    let info = &sf.header.tensors["test_tensor"];
    assert_eq!(info.dtype, "F32");
    assert_eq!(info.shape, vec![2, 3]);
    assert_eq!(info.byte_size(), 24);

    let data = sf.tensor_data("test_tensor").unwrap();
    assert_eq!(data.len(), 24);

    assert!(sf.tensor_data("nonexistent").is_err());
    assert!(sf.has_tensor("test_tensor"));

    let names = sf.tensor_names();
    assert_eq!(names, vec!["test_tensor"]);
}

#[test]
fn test_truncated_file_is_rejected() {
    let (_dir, path) = write_raw(&[1, 2, 3]);
    assert!(SafetensorsFile::open(&path).is_err());
}

#[test]
fn test_header_length_past_end_is_rejected() {
    let mut data = Vec::new();
    data.extend_from_slice(&1000u64.to_le_bytes());
    data.extend_from_slice(b"{}");
    let (_dir, path) = write_raw(&data);
    assert!(SafetensorsFile::open(&path).is_err());
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        SafetensorsFile::open(&dir.path().join("absent.safetensors")),
        Err(Qwen2Error::Io(_))
    ));
}

fn single_tensor_file(info: serde_json::Value, data_len: usize) -> Vec<u8> {
    let header = serde_json::json!({ "t": info });
    let header_bytes = serde_json::to_vec(&header).unwrap();
    let mut file_data = Vec::new();
    file_data.extend_from_slice(&(header_bytes.len() as u64).to_le_bytes());
    file_data.extend_from_slice(&header_bytes);
    file_data.extend(std::iter::repeat(0u8).take(data_len));
    file_data
}

#[test]
fn test_overflowing_data_offset_is_rejected() {
    let file_data = single_tensor_file(
        serde_json::json!({
            "dtype": "F32",
            "shape": [1],
            "data_offsets": [usize::MAX - 1, usize::MAX],
        }),
        4,
    );
    let (_dir, path) = write_raw(&file_data);
    let sf = SafetensorsFile::open(&path).unwrap();
    assert!(matches!(sf.tensor_data("t"), Err(Qwen2Error::WeightLoad(_))));
}

#[test]
fn test_inverted_data_offsets_are_rejected() {
    let file_data = single_tensor_file(
        serde_json::json!({ "dtype": "F32", "shape": [1], "data_offsets": [4, 0] }),
        4,
    );
    let (_dir, path) = write_raw(&file_data);
    let sf = SafetensorsFile::open(&path).unwrap();
    assert!(matches!(sf.tensor_data("t"), Err(Qwen2Error::WeightLoad(_))));
}

#[test]
fn test_numel_saturates() {
    let info = TensorInfo {
        dtype: "F32".to_string(),
        shape: vec![usize::MAX, 4],
        data_offsets: [0, 4],
    };
    assert_eq!(info.numel(), usize::MAX);
}
