//! Reference CPU compute engine.
//!
//! Runs the Qwen2 decoder in f32 on the host. Weights are decoded from their
//! storage precision on first use and memoized per slot; a slot is decoded again
//! only when the table hands out a different tensor for it.

pub mod ops;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::ComputeEngine;
use crate::cache::KvCache;
use crate::error::{Qwen2Error, Result};
use crate::model::ModelMeta;
use crate::tensor::{DeviceType, Tensor};
use crate::weights::names::{LayerSlot, Slot};
use crate::weights::WeightTable;
use crate::TokenId;

use ops::{add_in_place, causal_attention, linear, swiglu, AttentionShape, RmsNorm, Rope};

/// Host f32 implementation of [`ComputeEngine`].
#[derive(Debug, Default)]
pub struct CpuEngine {
    meta: Option<ModelMeta>,
    rope: Option<Rope>,
    decoded: HashMap<Slot, (Tensor, Arc<Vec<f32>>)>,
}

impl CpuEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of weight slots currently held in decoded form.
    pub fn decoded_slots(&self) -> usize {
        self.decoded.len()
    }

    fn weight(&mut self, meta: &ModelMeta, weights: &WeightTable, slot: Slot) -> Result<Arc<Vec<f32>>> {
        let tensor = weights.require(slot)?;
        self.decode(meta, slot, tensor)
    }

    fn optional_weight(
        &mut self,
        meta: &ModelMeta,
        weights: &WeightTable,
        slot: Slot,
    ) -> Result<Option<Arc<Vec<f32>>>> {
        match weights.get(slot) {
            Some(tensor) => self.decode(meta, slot, tensor).map(Some),
            None => Ok(None),
        }
    }

    /// Decode `tensor` unless the memoized copy came from the same handle.
    /// Freshly decoded tensors are checked against the slot's expected shape.
    fn decode(&mut self, meta: &ModelMeta, slot: Slot, tensor: &Tensor) -> Result<Arc<Vec<f32>>> {
        if let Some((held, values)) = self.decoded.get(&slot) {
            if Tensor::ptr_eq(held, tensor) {
                return Ok(Arc::clone(values));
            }
        }
        let expected = slot.expected_shape(meta);
        if tensor.shape() != expected.as_slice() {
            return Err(Qwen2Error::ShapeMismatch {
                name: slot.to_string(),
                expected,
                got: tensor.shape().to_vec(),
            });
        }
        let values = Arc::new(tensor.to_f32_vec()?);
        self.decoded
            .insert(slot, (tensor.clone(), Arc::clone(&values)));
        Ok(values)
    }
}

impl ComputeEngine for CpuEngine {
    fn name(&self) -> &str {
        "cpu"
    }

    fn init(&mut self, meta: &ModelMeta, device: DeviceType, device_ids: &[i32]) -> Result<()> {
        if device != DeviceType::Cpu {
            return Err(Qwen2Error::EngineInit(format!(
                "cpu engine cannot run on {device}"
            )));
        }
        if meta.num_heads == 0 || meta.num_kv_heads == 0 || meta.head_dim == 0 {
            return Err(Qwen2Error::EngineInit(format!(
                "invalid attention geometry: {} heads, {} kv heads, head_dim {}",
                meta.num_heads, meta.num_kv_heads, meta.head_dim
            )));
        }
        if meta.num_heads % meta.num_kv_heads != 0 {
            return Err(Qwen2Error::EngineInit(format!(
                "{} query heads cannot be grouped over {} kv heads",
                meta.num_heads, meta.num_kv_heads
            )));
        }
        if meta.head_dim % 2 != 0 {
            return Err(Qwen2Error::EngineInit(format!(
                "rotary embedding needs an even head_dim, got {}",
                meta.head_dim
            )));
        }
        if meta.vocab_size == 0 || meta.intermediate_size == 0 {
            return Err(Qwen2Error::EngineInit(
                "vocab_size and intermediate_size must be non-zero".into(),
            ));
        }

        info!(
            layers = meta.num_layers,
            hidden = meta.hidden_size,
            heads = meta.num_heads,
            kv_heads = meta.num_kv_heads,
            ?device_ids,
            "cpu engine initialized"
        );
        self.rope = Some(Rope::new(meta.head_dim, meta.rope_theta));
        self.meta = Some(meta.clone());
        self.decoded.clear();
        Ok(())
    }

    fn forward(
        &mut self,
        weights: &WeightTable,
        tokens: &[TokenId],
        mut cache: Option<&mut KvCache>,
    ) -> Result<Vec<f32>> {
        let (meta, rope) = match (&self.meta, &self.rope) {
            (Some(meta), Some(rope)) => (meta.clone(), rope.clone()),
            _ => return Err(Qwen2Error::Inference("cpu engine not initialized".into())),
        };
        if tokens.is_empty() {
            return Err(Qwen2Error::InvalidInput("no tokens to run".into()));
        }

        let n = tokens.len();
        let past = cache.as_deref().map_or(0, KvCache::len);
        if meta.max_seq_len > 0 && past + n > meta.max_seq_len {
            return Err(Qwen2Error::Inference(format!(
                "context of {} tokens exceeds max_seq_len {}",
                past + n,
                meta.max_seq_len
            )));
        }
        if let Some(&bad) = tokens.iter().find(|&&t| t as usize >= meta.vocab_size) {
            return Err(Qwen2Error::InvalidInput(format!(
                "token {bad} outside vocabulary of {}",
                meta.vocab_size
            )));
        }
        if let Some(c) = cache.as_deref_mut() {
            c.ensure_allocated();
        }

        debug!(tokens = n, past, cached = cache.is_some(), "cpu forward");

        let hs = meta.hidden_size;
        let q_dim = meta.q_dim();
        let shape = AttentionShape {
            n_heads: meta.num_heads,
            n_kv_heads: meta.num_kv_heads,
            head_dim: meta.head_dim,
        };

        let embed = self.weight(&meta, weights, Slot::InputEmbedding)?;
        let mut hidden = Vec::with_capacity(n * hs);
        for &t in tokens {
            let row = t as usize * hs;
            let values = embed.get(row..row + hs).ok_or_else(|| {
                Qwen2Error::ShapeMismatch {
                    name: Slot::InputEmbedding.to_string(),
                    expected: vec![meta.vocab_size, hs],
                    got: vec![embed.len() / hs.max(1), hs],
                }
            })?;
            hidden.extend_from_slice(values);
        }

        for layer in 0..meta.num_layers {
            let slot = |s| Slot::Layer(layer, s);

            let attn_norm = self.weight(&meta, weights, slot(LayerSlot::AttnNorm))?;
            let wq = self.weight(&meta, weights, slot(LayerSlot::AttnQ))?;
            let bq = self.optional_weight(&meta, weights, slot(LayerSlot::AttnQBias))?;
            let wk = self.weight(&meta, weights, slot(LayerSlot::AttnK))?;
            let bk = self.optional_weight(&meta, weights, slot(LayerSlot::AttnKBias))?;
            let wv = self.weight(&meta, weights, slot(LayerSlot::AttnV))?;
            let bv = self.optional_weight(&meta, weights, slot(LayerSlot::AttnVBias))?;
            let wo = self.weight(&meta, weights, slot(LayerSlot::AttnO))?;

            let normed = RmsNorm {
                weight: &attn_norm,
                eps: meta.rms_norm_eps,
            }
            .forward(&hidden);
            let mut q = linear(&normed, &wq, bq.as_deref().map(Vec::as_slice), hs);
            let mut k = linear(&normed, &wk, bk.as_deref().map(Vec::as_slice), hs);
            let v = linear(&normed, &wv, bv.as_deref().map(Vec::as_slice), hs);
            rope.apply(&mut q, meta.num_heads, past);
            rope.apply(&mut k, meta.num_kv_heads, past);

            let attn = match cache.as_deref_mut() {
                Some(c) => {
                    c.write(layer, &k, &v)?;
                    causal_attention(&q, c.keys(layer, past + n)?, c.values(layer, past + n)?, shape)
                }
                None => causal_attention(&q, &k, &v, shape),
            };
            add_in_place(&mut hidden, &linear(&attn, &wo, None, q_dim));

            let mlp_norm = self.weight(&meta, weights, slot(LayerSlot::MlpNorm))?;
            let w_gate = self.weight(&meta, weights, slot(LayerSlot::MlpGate))?;
            let w_up = self.weight(&meta, weights, slot(LayerSlot::MlpUp))?;
            let w_down = self.weight(&meta, weights, slot(LayerSlot::MlpDown))?;

            let normed = RmsNorm {
                weight: &mlp_norm,
                eps: meta.rms_norm_eps,
            }
            .forward(&hidden);
            let gate = linear(&normed, &w_gate, None, hs);
            let up = linear(&normed, &w_up, None, hs);
            let act = swiglu(&gate, &up);
            add_in_place(&mut hidden, &linear(&act, &w_down, None, meta.intermediate_size));
        }

        let out_norm = self.weight(&meta, weights, Slot::OutputNorm)?;
        let out_embed = self.weight(&meta, weights, Slot::OutputEmbedding)?;
        let last = &hidden[(n - 1) * hs..];
        let normed = RmsNorm {
            weight: &out_norm,
            eps: meta.rms_norm_eps,
        }
        .forward(last);
        let logits = linear(&normed, &out_embed, None, hs);

        if let Some(c) = cache {
            c.commit(n)?;
        }
        Ok(logits)
    }
}
