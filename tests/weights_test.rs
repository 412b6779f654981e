//! Tests for checkpoint loading into the weight table.

mod common;

use common::{write_safetensors, RawTensor, TinyModel, HIDDEN, LAYERS, VOCAB};
use qwen2::tensor::{DeviceType, Dtype, Tensor};
use qwen2::weights::{self, LayerSlot, Slot, WeightLoader, WeightTable};
use qwen2::{ModelMeta, Qwen2Error};

fn tiny_meta(dir: &std::path::Path) -> ModelMeta {
    ModelMeta::from_file(&dir.join("config.json")).unwrap()
}

#[test]
fn test_load_complete_model() {
    let dir = tempfile::tempdir().unwrap();
    TinyModel::default().write(dir.path());
    let meta = tiny_meta(dir.path());

    let mut table = WeightTable::new(meta.num_layers);
    let report = weights::load_weights(dir.path(), &meta, DeviceType::Cpu, 0, &mut table).unwrap();

    assert_eq!(report.shards.len(), 1);
    assert_eq!(report.loaded, 2 + LAYERS * 12);
    assert_eq!(report.converted, 0);
    assert!(report.ignored.is_empty());
    assert!(table.is_complete());
    table.validate(&meta).unwrap();

    let q = table.require(Slot::Layer(1, LayerSlot::AttnQ)).unwrap();
    assert_eq!(q.shape(), &[8, HIDDEN]);
    assert_eq!(q.dtype(), Dtype::Float32);
}

#[test]
fn test_missing_output_embedding_is_tied() {
    let dir = tempfile::tempdir().unwrap();
    TinyModel::default().write(dir.path());
    let meta = tiny_meta(dir.path());

    let mut table = WeightTable::new(meta.num_layers);
    let report = weights::load_weights(dir.path(), &meta, DeviceType::Cpu, 0, &mut table).unwrap();

    assert!(report.tied_output_embedding);
    assert!(table.is_tied());
    let (input, output) = (table.in_embed.as_ref().unwrap(), table.out_embed.as_ref().unwrap());
    assert!(Tensor::ptr_eq(input, output));
}

#[test]
fn test_explicit_output_embedding_is_not_tied() {
    let dir = tempfile::tempdir().unwrap();
    TinyModel {
        untied: true,
        ..TinyModel::default()
    }
    .write(dir.path());
    let meta = tiny_meta(dir.path());

    let mut table = WeightTable::new(meta.num_layers);
    let report = weights::load_weights(dir.path(), &meta, DeviceType::Cpu, 0, &mut table).unwrap();

    assert!(!report.tied_output_embedding);
    assert!(!table.is_tied());
    assert_eq!(table.out_embed.as_ref().unwrap().shape(), &[VOCAB, HIDDEN]);
}

#[test]
fn test_sharded_checkpoint_matches_single_file() {
    let single = tempfile::tempdir().unwrap();
    let sharded = tempfile::tempdir().unwrap();
    TinyModel::default().write(single.path());
    TinyModel {
        sharded: true,
        ..TinyModel::default()
    }
    .write(sharded.path());
    let meta = tiny_meta(single.path());

    let mut a = WeightTable::new(meta.num_layers);
    let mut b = WeightTable::new(meta.num_layers);
    weights::load_weights(single.path(), &meta, DeviceType::Cpu, 0, &mut a).unwrap();
    let report = weights::load_weights(sharded.path(), &meta, DeviceType::Cpu, 0, &mut b).unwrap();

    assert_eq!(report.shards.len(), 2);
    assert!(report.shards[0] < report.shards[1]);
    assert_eq!(a.populated(), b.populated());
    for i in 0..LAYERS {
        let slot = Slot::Layer(i, LayerSlot::MlpDown);
        assert_eq!(
            a.require(slot).unwrap().as_bytes(),
            b.require(slot).unwrap().as_bytes()
        );
    }
}

#[test]
fn test_bf16_storage_is_converted_at_load() {
    let dir = tempfile::tempdir().unwrap();
    TinyModel {
        bf16: true,
        ..TinyModel::default()
    }
    .write(dir.path());
    let meta = tiny_meta(dir.path()).with_dtype(Dtype::Float16);

    let mut table = WeightTable::new(meta.num_layers);
    let report = weights::load_weights(dir.path(), &meta, DeviceType::Cpu, 0, &mut table).unwrap();

    assert_eq!(report.converted, report.loaded);
    let embed = table.in_embed.as_ref().unwrap();
    assert_eq!(embed.dtype(), Dtype::Float16);
    assert_eq!(embed.byte_size(), VOCAB * HIDDEN * 2);
    table.validate(&meta).unwrap();
}

#[test]
fn test_unrecognized_tensors_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    TinyModel {
        extra_tensor: true,
        ..TinyModel::default()
    }
    .write(dir.path());
    let meta = tiny_meta(dir.path());

    let mut table = WeightTable::new(meta.num_layers);
    let report = weights::load_weights(dir.path(), &meta, DeviceType::Cpu, 0, &mut table).unwrap();
    assert_eq!(
        report.ignored,
        vec!["model.layers.0.self_attn.rotary_emb.inv_freq".to_string()]
    );
    table.validate(&meta).unwrap();
}

#[test]
fn test_unsupported_precision_fails_shard() {
    let dir = tempfile::tempdir().unwrap();
    TinyModel::default().write(dir.path());
    write_safetensors(
        &dir.path().join("zz-extra.safetensors"),
        &[RawTensor {
            name: "model.norm.weight".into(),
            dtype: "I64",
            shape: vec![HIDDEN],
            data: vec![0; HIDDEN * 8],
        }],
    );
    let meta = tiny_meta(dir.path());

    let mut table = WeightTable::new(meta.num_layers);
    let err = weights::load_weights(dir.path(), &meta, DeviceType::Cpu, 0, &mut table).unwrap_err();
    assert!(matches!(err, Qwen2Error::UnsupportedPrecision { .. }));
}

#[test]
fn test_unsupported_precision_on_ignored_tensor_is_harmless() {
    let dir = tempfile::tempdir().unwrap();
    TinyModel::default().write(dir.path());
    write_safetensors(
        &dir.path().join("zz-extra.safetensors"),
        &[RawTensor {
            name: "position_ids".into(),
            dtype: "I64",
            shape: vec![4],
            data: vec![0; 32],
        }],
    );
    let meta = tiny_meta(dir.path());

    let mut table = WeightTable::new(meta.num_layers);
    let report = weights::load_weights(dir.path(), &meta, DeviceType::Cpu, 0, &mut table).unwrap();
    assert_eq!(report.ignored, vec!["position_ids".to_string()]);
}

#[test]
fn test_layer_index_out_of_range() {
    let dir = tempfile::tempdir().unwrap();
    let meta = {
        TinyModel::default().write(dir.path());
        tiny_meta(dir.path())
    };
    let path = dir.path().join("model.safetensors");
    write_safetensors(
        &path,
        &[RawTensor::f32(
            "model.layers.7.input_layernorm.weight",
            &[HIDDEN],
            &[1.0; HIDDEN],
        )],
    );

    let mut table = WeightTable::new(meta.num_layers);
    let err = WeightLoader::new(&meta, DeviceType::Cpu, 0)
        .load_files(&[path], &mut table)
        .unwrap_err();
    assert!(matches!(err, Qwen2Error::WeightLoad(_)));
}

#[test]
fn test_overflowing_shape_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let meta = {
        TinyModel::default().write(dir.path());
        tiny_meta(dir.path())
    };
    let path = dir.path().join("model.safetensors");
    write_safetensors(
        &path,
        &[RawTensor::f32("model.norm.weight", &[usize::MAX, 2], &[1.0])],
    );

    let mut table = WeightTable::new(meta.num_layers);
    let err = WeightLoader::new(&meta, DeviceType::Cpu, 0)
        .load_files(&[path], &mut table)
        .unwrap_err();
    assert!(matches!(err, Qwen2Error::WeightLoad(_)));
    assert!(table.out_norm.is_none());
}

#[test]
fn test_validate_reports_missing_and_bad_shapes() {
    let dir = tempfile::tempdir().unwrap();
    TinyModel::default().write(dir.path());
    let meta = tiny_meta(dir.path());

    let mut table = WeightTable::new(meta.num_layers);
    weights::load_weights(dir.path(), &meta, DeviceType::Cpu, 0, &mut table).unwrap();

    let mut incomplete = WeightTable::new(meta.num_layers);
    incomplete.in_embed = table.in_embed.clone();
    assert!(matches!(
        incomplete.validate(&meta),
        Err(Qwen2Error::MissingWeight(_))
    ));

    let wrong = Tensor::from_f32(&[HIDDEN + 1], Dtype::Float32, &[1.0; HIDDEN + 1]).unwrap();
    table.set(Slot::OutputNorm, wrong).unwrap();
    assert!(matches!(
        table.validate(&meta),
        Err(Qwen2Error::ShapeMismatch { .. })
    ));
}

#[test]
fn test_empty_directory() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        weights::discover_weight_files(dir.path()),
        Err(Qwen2Error::WeightLoad(_))
    ));
}
