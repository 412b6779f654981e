//! Shared fixtures: safetensors writers, a tiny deterministic checkpoint and
//! scripted compute engines.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use half::bf16;

use qwen2::backend::ComputeEngine;
use qwen2::cache::KvCache;
use qwen2::model::ModelMeta;
use qwen2::tensor::{DeviceType, Dtype};
use qwen2::weights::WeightTable;
use qwen2::{Qwen2Error, Result, TokenId};

/// One tensor to be written into a shard.
pub struct RawTensor {
    pub name: String,
    pub dtype: &'static str,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

impl RawTensor {
    pub fn f32(name: &str, shape: &[usize], values: &[f32]) -> Self {
        RawTensor {
            name: name.to_string(),
            dtype: "F32",
            shape: shape.to_vec(),
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    pub fn bf16(name: &str, shape: &[usize], values: &[f32]) -> Self {
        RawTensor {
            name: name.to_string(),
            dtype: "BF16",
            shape: shape.to_vec(),
            data: values
                .iter()
                .flat_map(|v| bf16::from_f32(*v).to_le_bytes())
                .collect(),
        }
    }
}

/// Write a safetensors file: 8-byte LE header length, JSON header, data.
pub fn write_safetensors(path: &Path, tensors: &[RawTensor]) {
    let mut header = serde_json::Map::new();
    header.insert(
        "__metadata__".to_string(),
        serde_json::json!({ "format": "pt" }),
    );
    let mut data = Vec::new();
    for t in tensors {
        let start = data.len();
        data.extend_from_slice(&t.data);
        header.insert(
            t.name.clone(),
            serde_json::json!({
                "dtype": t.dtype,
                "shape": t.shape,
                "data_offsets": [start, data.len()],
            }),
        );
    }

    let header_bytes = serde_json::to_vec(&serde_json::Value::Object(header)).unwrap();
    let mut file = Vec::new();
    file.extend_from_slice(&(header_bytes.len() as u64).to_le_bytes());
    file.extend_from_slice(&header_bytes);
    file.extend_from_slice(&data);
    fs::write(path, file).unwrap();
}

/// Geometry of the tiny test model.
pub const LAYERS: usize = 2;
pub const HIDDEN: usize = 8;
pub const HEADS: usize = 2;
pub const KV_HEADS: usize = 1;
pub const HEAD_DIM: usize = 4;
pub const FFN: usize = 16;
pub const VOCAB: usize = 32;
pub const MAX_POS: usize = 64;

pub fn tiny_config_json(eos: i64) -> serde_json::Value {
    serde_json::json!({
        "model_type": "qwen2",
        "num_hidden_layers": LAYERS,
        "hidden_size": HIDDEN,
        "num_attention_heads": HEADS,
        "num_key_value_heads": KV_HEADS,
        "intermediate_size": FFN,
        "max_position_embeddings": MAX_POS,
        "vocab_size": VOCAB,
        "rms_norm_eps": 1e-6,
        "rope_theta": 10000.0,
        "eos_token_id": eos,
        "torch_dtype": "float32",
    })
}

/// Options for [`write_tiny_model`].
#[derive(Clone)]
pub struct TinyModel {
    /// Store tensors as BF16 instead of F32.
    pub bf16: bool,
    /// Write an explicit `lm_head.weight`.
    pub untied: bool,
    /// Write q/k/v biases.
    pub biases: bool,
    /// Split the tensors over two shards.
    pub sharded: bool,
    /// Add a tensor the router does not recognize.
    pub extra_tensor: bool,
    pub eos: i64,
    pub seed: u64,
}

impl Default for TinyModel {
    fn default() -> Self {
        TinyModel {
            bf16: false,
            untied: false,
            biases: true,
            sharded: false,
            extra_tensor: false,
            eos: -1,
            seed: 17,
        }
    }
}

/// Small deterministic value stream in `[-scale, scale)`.
struct Lcg(u64);

impl Lcg {
    fn values(&mut self, n: usize, scale: f32) -> Vec<f32> {
        (0..n)
            .map(|_| {
                self.0 = self
                    .0
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                let unit = (self.0 >> 40) as f32 / (1u64 << 24) as f32;
                (unit * 2.0 - 1.0) * scale
            })
            .collect()
    }
}

impl TinyModel {
    pub fn tensors(&self) -> Vec<RawTensor> {
        let mut rng = Lcg(self.seed);
        let mut out = Vec::new();
        let mut push = |name: String, shape: &[usize], values: Vec<f32>| {
            out.push(if self.bf16 {
                RawTensor::bf16(&name, shape, &values)
            } else {
                RawTensor::f32(&name, shape, &values)
            });
        };

        let q_dim = HEADS * HEAD_DIM;
        let kv_dim = KV_HEADS * HEAD_DIM;
        push(
            "model.embed_tokens.weight".into(),
            &[VOCAB, HIDDEN],
            rng.values(VOCAB * HIDDEN, 1.0),
        );
        for i in 0..LAYERS {
            let p = format!("model.layers.{i}");
            push(format!("{p}.input_layernorm.weight"), &[HIDDEN], vec![1.0; HIDDEN]);
            push(format!("{p}.self_attn.q_proj.weight"), &[q_dim, HIDDEN], rng.values(q_dim * HIDDEN, 0.5));
            push(format!("{p}.self_attn.k_proj.weight"), &[kv_dim, HIDDEN], rng.values(kv_dim * HIDDEN, 0.5));
            push(format!("{p}.self_attn.v_proj.weight"), &[kv_dim, HIDDEN], rng.values(kv_dim * HIDDEN, 0.5));
            if self.biases {
                push(format!("{p}.self_attn.q_proj.bias"), &[q_dim], rng.values(q_dim, 0.1));
                push(format!("{p}.self_attn.k_proj.bias"), &[kv_dim], rng.values(kv_dim, 0.1));
                push(format!("{p}.self_attn.v_proj.bias"), &[kv_dim], rng.values(kv_dim, 0.1));
            }
            push(format!("{p}.self_attn.o_proj.weight"), &[HIDDEN, q_dim], rng.values(HIDDEN * q_dim, 0.5));
            push(format!("{p}.post_attention_layernorm.weight"), &[HIDDEN], vec![1.0; HIDDEN]);
            push(format!("{p}.mlp.gate_proj.weight"), &[FFN, HIDDEN], rng.values(FFN * HIDDEN, 0.5));
            push(format!("{p}.mlp.up_proj.weight"), &[FFN, HIDDEN], rng.values(FFN * HIDDEN, 0.5));
            push(format!("{p}.mlp.down_proj.weight"), &[HIDDEN, FFN], rng.values(HIDDEN * FFN, 0.5));
        }
        push("model.norm.weight".into(), &[HIDDEN], vec![1.0; HIDDEN]);
        if self.untied {
            push("lm_head.weight".into(), &[VOCAB, HIDDEN], rng.values(VOCAB * HIDDEN, 1.0));
        }
        if self.extra_tensor {
            push("model.layers.0.self_attn.rotary_emb.inv_freq".into(), &[HEAD_DIM / 2], vec![1.0; HEAD_DIM / 2]);
        }
        out
    }

    /// Write `config.json` and the shard(s) into `dir`.
    pub fn write(&self, dir: &Path) {
        fs::write(
            dir.join("config.json"),
            serde_json::to_vec_pretty(&tiny_config_json(self.eos)).unwrap(),
        )
        .unwrap();

        let tensors = self.tensors();
        if self.sharded {
            let mid = tensors.len() / 2;
            let mut tensors = tensors;
            let second = tensors.split_off(mid);
            write_safetensors(&dir.join("model-00001-of-00002.safetensors"), &tensors);
            write_safetensors(&dir.join("model-00002-of-00002.safetensors"), &second);
        } else {
            write_safetensors(&dir.join("model.safetensors"), &tensors);
        }
    }
}

/// Descriptor for sessions driven by stub engines.
pub fn stub_meta(eos: Option<TokenId>) -> ModelMeta {
    ModelMeta {
        dtype: Dtype::Float32,
        num_layers: 1,
        hidden_size: 4,
        num_heads: 2,
        num_kv_heads: 2,
        head_dim: 2,
        intermediate_size: 8,
        max_seq_len: 32,
        vocab_size: 16,
        rms_norm_eps: 1e-6,
        rope_theta: 10000.0,
        eos_tokens: eos.into_iter().collect(),
    }
}

fn one_hot(token: TokenId, vocab: usize) -> Vec<f32> {
    let mut logits = vec![0.0; vocab];
    logits[token as usize] = 1.0;
    logits
}

/// Inputs seen by a stub engine, one entry per forward call.
pub type CallLog = Arc<Mutex<Vec<Vec<TokenId>>>>;

/// Engine whose forward produces a scripted token (or failure) per call and
/// repeats the last entry once the script runs out.
pub struct ScriptedEngine {
    script: VecDeque<std::result::Result<TokenId, String>>,
    last: std::result::Result<TokenId, String>,
    vocab: usize,
    pub calls: CallLog,
}

impl ScriptedEngine {
    /// Always produce `token`.
    pub fn fixed(token: TokenId) -> Self {
        Self::script(vec![Ok(token)])
    }

    pub fn script(script: Vec<std::result::Result<TokenId, String>>) -> Self {
        let last = script.last().cloned().unwrap_or(Ok(0));
        ScriptedEngine {
            script: script.into(),
            last,
            vocab: 16,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn call_log(&self) -> CallLog {
        Arc::clone(&self.calls)
    }
}

impl ComputeEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn init(&mut self, meta: &ModelMeta, _device: DeviceType, _device_ids: &[i32]) -> Result<()> {
        self.vocab = meta.vocab_size;
        Ok(())
    }

    fn forward(
        &mut self,
        _weights: &WeightTable,
        tokens: &[TokenId],
        _cache: Option<&mut KvCache>,
    ) -> Result<Vec<f32>> {
        self.calls.lock().unwrap().push(tokens.to_vec());
        let next = self.script.pop_front().unwrap_or_else(|| self.last.clone());
        match next {
            Ok(token) => Ok(one_hot(token, self.vocab)),
            Err(msg) => Err(Qwen2Error::Inference(msg)),
        }
    }
}

/// Engine that refuses every descriptor.
pub struct RejectingEngine;

impl ComputeEngine for RejectingEngine {
    fn name(&self) -> &str {
        "rejecting"
    }

    fn init(&mut self, _meta: &ModelMeta, device: DeviceType, _device_ids: &[i32]) -> Result<()> {
        Err(Qwen2Error::InvalidInput(format!("no {device} device available")))
    }

    fn forward(
        &mut self,
        _weights: &WeightTable,
        _tokens: &[TokenId],
        _cache: Option<&mut KvCache>,
    ) -> Result<Vec<f32>> {
        Err(Qwen2Error::Inference("not initialized".into()))
    }
}
