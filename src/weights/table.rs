//! The Weight Table: one tensor handle per named role.

use crate::error::{Qwen2Error, Result};
use crate::model::ModelMeta;
use crate::tensor::Tensor;
use crate::weights::names::{LayerSlot, Slot};

/// Weights of one decoder layer.
#[derive(Debug, Clone, Default)]
pub struct LayerWeights {
    pub attn_norm: Option<Tensor>,
    pub q_proj: Option<Tensor>,
    pub q_bias: Option<Tensor>,
    pub k_proj: Option<Tensor>,
    pub k_bias: Option<Tensor>,
    pub v_proj: Option<Tensor>,
    pub v_bias: Option<Tensor>,
    pub o_proj: Option<Tensor>,
    pub mlp_norm: Option<Tensor>,
    pub gate_proj: Option<Tensor>,
    pub up_proj: Option<Tensor>,
    pub down_proj: Option<Tensor>,
}

impl LayerWeights {
    pub fn get(&self, slot: LayerSlot) -> Option<&Tensor> {
        match slot {
            LayerSlot::AttnNorm => self.attn_norm.as_ref(),
            LayerSlot::AttnQ => self.q_proj.as_ref(),
            LayerSlot::AttnQBias => self.q_bias.as_ref(),
            LayerSlot::AttnK => self.k_proj.as_ref(),
            LayerSlot::AttnKBias => self.k_bias.as_ref(),
            LayerSlot::AttnV => self.v_proj.as_ref(),
            LayerSlot::AttnVBias => self.v_bias.as_ref(),
            LayerSlot::AttnO => self.o_proj.as_ref(),
            LayerSlot::MlpNorm => self.mlp_norm.as_ref(),
            LayerSlot::MlpGate => self.gate_proj.as_ref(),
            LayerSlot::MlpUp => self.up_proj.as_ref(),
            LayerSlot::MlpDown => self.down_proj.as_ref(),
        }
    }

    fn slot_mut(&mut self, slot: LayerSlot) -> &mut Option<Tensor> {
        match slot {
            LayerSlot::AttnNorm => &mut self.attn_norm,
            LayerSlot::AttnQ => &mut self.q_proj,
            LayerSlot::AttnQBias => &mut self.q_bias,
            LayerSlot::AttnK => &mut self.k_proj,
            LayerSlot::AttnKBias => &mut self.k_bias,
            LayerSlot::AttnV => &mut self.v_proj,
            LayerSlot::AttnVBias => &mut self.v_bias,
            LayerSlot::AttnO => &mut self.o_proj,
            LayerSlot::MlpNorm => &mut self.mlp_norm,
            LayerSlot::MlpGate => &mut self.gate_proj,
            LayerSlot::MlpUp => &mut self.up_proj,
            LayerSlot::MlpDown => &mut self.down_proj,
        }
    }
}

/// Typed, layer-indexed weights for a whole model.
///
/// Populated incrementally by the loader; complete once every required slot
/// is non-empty (see [`WeightTable::missing`]).
#[derive(Debug, Clone)]
pub struct WeightTable {
    pub in_embed: Option<Tensor>,
    pub out_embed: Option<Tensor>,
    pub out_norm: Option<Tensor>,
    layers: Vec<LayerWeights>,
}

impl WeightTable {
    /// An empty table with `num_layers` layer entries.
    pub fn new(num_layers: usize) -> Self {
        WeightTable {
            in_embed: None,
            out_embed: None,
            out_norm: None,
            layers: vec![LayerWeights::default(); num_layers],
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, index: usize) -> Option<&LayerWeights> {
        self.layers.get(index)
    }

    pub fn layers(&self) -> &[LayerWeights] {
        &self.layers
    }

    pub fn get(&self, slot: Slot) -> Option<&Tensor> {
        match slot {
            Slot::InputEmbedding => self.in_embed.as_ref(),
            Slot::OutputEmbedding => self.out_embed.as_ref(),
            Slot::OutputNorm => self.out_norm.as_ref(),
            Slot::Layer(i, layer) => self.layers.get(i).and_then(|l| l.get(layer)),
        }
    }

    /// Like [`get`](Self::get) but a missing slot is a [`Qwen2Error::MissingWeight`].
    pub fn require(&self, slot: Slot) -> Result<&Tensor> {
        self.get(slot)
            .ok_or_else(|| Qwen2Error::MissingWeight(slot.to_string()))
    }

    /// Store `tensor` in `slot`, returning the handle it replaced.
    pub fn set(&mut self, slot: Slot, tensor: Tensor) -> Result<Option<Tensor>> {
        let num_layers = self.layers.len();
        let entry = match slot {
            Slot::InputEmbedding => &mut self.in_embed,
            Slot::OutputEmbedding => &mut self.out_embed,
            Slot::OutputNorm => &mut self.out_norm,
            Slot::Layer(i, layer) => self
                .layers
                .get_mut(i)
                .ok_or_else(|| {
                    Qwen2Error::WeightLoad(format!(
                        "{slot} addresses layer {i} but the model has {num_layers} layers"
                    ))
                })?
                .slot_mut(layer),
        };
        Ok(entry.replace(tensor))
    }

    /// Tie the output projection to the input embedding when the checkpoint
    /// did not provide one. Returns whether tying happened.
    pub fn tie_output_embedding(&mut self) -> bool {
        if self.out_embed.is_some() {
            return false;
        }
        match &self.in_embed {
            Some(embed) => {
                self.out_embed = Some(embed.clone());
                true
            }
            None => false,
        }
    }

    /// Whether the output projection shares the input embedding's allocation.
    pub fn is_tied(&self) -> bool {
        match (&self.in_embed, &self.out_embed) {
            (Some(a), Some(b)) => Tensor::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Every required slot that is still empty, in table order.
    pub fn missing(&self) -> Vec<Slot> {
        self.required_slots()
            .filter(|&slot| self.get(slot).is_none())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing().is_empty()
    }

    /// Number of populated slots (a tied output projection counts once per slot).
    pub fn populated(&self) -> usize {
        let singles = [&self.in_embed, &self.out_embed, &self.out_norm]
            .iter()
            .filter(|t| t.is_some())
            .count();
        let per_layer: usize = self
            .layers
            .iter()
            .map(|l| LayerSlot::ALL.iter().filter(|&&s| l.get(s).is_some()).count())
            .sum();
        singles + per_layer
    }

    /// Total bytes held, counting a tied output projection once.
    pub fn byte_size(&self) -> usize {
        let mut total: usize = self
            .layers
            .iter()
            .flat_map(|l| LayerSlot::ALL.into_iter().filter_map(move |s| l.get(s)))
            .map(Tensor::byte_size)
            .sum();
        total += self.in_embed.as_ref().map_or(0, Tensor::byte_size);
        total += self.out_norm.as_ref().map_or(0, Tensor::byte_size);
        if !self.is_tied() {
            total += self.out_embed.as_ref().map_or(0, Tensor::byte_size);
        }
        total
    }

    /// Check completeness and every populated slot's shape against `meta`.
    pub fn validate(&self, meta: &ModelMeta) -> Result<()> {
        if self.layers.len() != meta.num_layers {
            return Err(Qwen2Error::WeightLoad(format!(
                "table has {} layers, model has {}",
                self.layers.len(),
                meta.num_layers
            )));
        }
        if let Some(slot) = self.missing().first() {
            return Err(Qwen2Error::MissingWeight(slot.to_string()));
        }
        for slot in self.all_slots() {
            if let Some(tensor) = self.get(slot) {
                let expected = slot.expected_shape(meta);
                if tensor.shape() != expected.as_slice() {
                    return Err(Qwen2Error::ShapeMismatch {
                        name: slot.to_string(),
                        expected,
                        got: tensor.shape().to_vec(),
                    });
                }
            }
        }
        Ok(())
    }

    fn all_slots(&self) -> impl Iterator<Item = Slot> + '_ {
        [Slot::InputEmbedding, Slot::OutputEmbedding, Slot::OutputNorm]
            .into_iter()
            .chain((0..self.layers.len()).flat_map(|i| {
                LayerSlot::ALL.into_iter().map(move |layer| Slot::Layer(i, layer))
            }))
    }

    fn required_slots(&self) -> impl Iterator<Item = Slot> + '_ {
        self.all_slots().filter(|slot| match slot {
            Slot::Layer(_, layer) => layer.is_required(),
            _ => true,
        })
    }
}
