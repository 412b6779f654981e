//! Checkpoint tensor name routing.
//!
//! A finite table maps recognized tensor names to Weight Table slots. Three names
//! are singletons; everything else recognized has the form
//! `<prefix>.layers.<index>.<component>` and lands in the per-layer slot for
//! `<component>`.

use std::collections::HashMap;
use std::fmt;

use crate::model::ModelMeta;

/// Per-layer weight roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LayerSlot {
    AttnNorm,
    AttnQ,
    AttnQBias,
    AttnK,
    AttnKBias,
    AttnV,
    AttnVBias,
    AttnO,
    MlpNorm,
    MlpGate,
    MlpUp,
    MlpDown,
}

impl LayerSlot {
    pub const ALL: [LayerSlot; 12] = [
        LayerSlot::AttnNorm,
        LayerSlot::AttnQ,
        LayerSlot::AttnQBias,
        LayerSlot::AttnK,
        LayerSlot::AttnKBias,
        LayerSlot::AttnV,
        LayerSlot::AttnVBias,
        LayerSlot::AttnO,
        LayerSlot::MlpNorm,
        LayerSlot::MlpGate,
        LayerSlot::MlpUp,
        LayerSlot::MlpDown,
    ];

    /// The `<component>` part of the checkpoint name.
    pub fn component(self) -> &'static str {
        match self {
            LayerSlot::AttnNorm => "input_layernorm.weight",
            LayerSlot::AttnQ => "self_attn.q_proj.weight",
            LayerSlot::AttnQBias => "self_attn.q_proj.bias",
            LayerSlot::AttnK => "self_attn.k_proj.weight",
            LayerSlot::AttnKBias => "self_attn.k_proj.bias",
            LayerSlot::AttnV => "self_attn.v_proj.weight",
            LayerSlot::AttnVBias => "self_attn.v_proj.bias",
            LayerSlot::AttnO => "self_attn.o_proj.weight",
            LayerSlot::MlpNorm => "post_attention_layernorm.weight",
            LayerSlot::MlpGate => "mlp.gate_proj.weight",
            LayerSlot::MlpUp => "mlp.up_proj.weight",
            LayerSlot::MlpDown => "mlp.down_proj.weight",
        }
    }

    /// Biases are optional; every other layer slot must be populated.
    pub fn is_required(self) -> bool {
        !matches!(
            self,
            LayerSlot::AttnQBias | LayerSlot::AttnKBias | LayerSlot::AttnVBias
        )
    }
}

/// A Weight Table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    InputEmbedding,
    OutputEmbedding,
    OutputNorm,
    Layer(usize, LayerSlot),
}

impl Slot {
    /// The shape this slot must have for `meta`.
    pub fn expected_shape(self, meta: &ModelMeta) -> Vec<usize> {
        let hs = meta.hidden_size;
        match self {
            Slot::InputEmbedding | Slot::OutputEmbedding => vec![meta.vocab_size, hs],
            Slot::OutputNorm => vec![hs],
            Slot::Layer(_, layer) => match layer {
                LayerSlot::AttnNorm | LayerSlot::MlpNorm => vec![hs],
                LayerSlot::AttnQ => vec![meta.q_dim(), hs],
                LayerSlot::AttnQBias => vec![meta.q_dim()],
                LayerSlot::AttnK | LayerSlot::AttnV => vec![meta.kv_dim(), hs],
                LayerSlot::AttnKBias | LayerSlot::AttnVBias => vec![meta.kv_dim()],
                LayerSlot::AttnO => vec![hs, meta.q_dim()],
                LayerSlot::MlpGate | LayerSlot::MlpUp => vec![meta.intermediate_size, hs],
                LayerSlot::MlpDown => vec![hs, meta.intermediate_size],
            },
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::InputEmbedding => write!(f, "{INPUT_EMBEDDING}"),
            Slot::OutputEmbedding => write!(f, "{OUTPUT_EMBEDDING}"),
            Slot::OutputNorm => write!(f, "{OUTPUT_NORM}"),
            Slot::Layer(i, layer) => write!(f, "model.layers.{i}.{}", layer.component()),
        }
    }
}

pub const INPUT_EMBEDDING: &str = "model.embed_tokens.weight";
/// Present only when the output projection is not tied to the input embedding.
pub const OUTPUT_EMBEDDING: &str = "lm_head.weight";
pub const OUTPUT_NORM: &str = "model.norm.weight";

const LAYERS_MARKER: &str = ".layers.";

/// Routes checkpoint tensor names to slots. Build once per load.
#[derive(Debug, Clone)]
pub struct NameRouter {
    singletons: HashMap<&'static str, Slot>,
    components: HashMap<&'static str, LayerSlot>,
}

impl NameRouter {
    pub fn new() -> Self {
        let singletons = HashMap::from([
            (INPUT_EMBEDDING, Slot::InputEmbedding),
            (OUTPUT_EMBEDDING, Slot::OutputEmbedding),
            (OUTPUT_NORM, Slot::OutputNorm),
        ]);
        let components = LayerSlot::ALL
            .iter()
            .map(|&slot| (slot.component(), slot))
            .collect();
        NameRouter {
            singletons,
            components,
        }
    }

    /// The slot for `name`, or `None` if the name is not recognized.
    pub fn route(&self, name: &str) -> Option<Slot> {
        if let Some(&slot) = self.singletons.get(name) {
            return Some(slot);
        }
        let (prefix, rest) = name.split_once(LAYERS_MARKER)?;
        if prefix.is_empty() {
            return None;
        }
        let (index, component) = rest.split_once('.')?;
        let index: usize = index.parse().ok()?;
        let layer = *self.components.get(component)?;
        Some(Slot::Layer(index, layer))
    }
}

impl Default for NameRouter {
    fn default() -> Self {
        Self::new()
    }
}
