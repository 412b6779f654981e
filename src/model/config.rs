//! Qwen2 model configuration.
//!
//! [`ModelConfig`] mirrors the checkpoint's `config.json`: every field is optional.
//! [`ModelMeta::from_config`] is the single validating step that turns it into the
//! immutable descriptor the rest of the crate consumes.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Qwen2Error, Result};
use crate::tensor::Dtype;
use crate::TokenId;

/// Default RMSNorm epsilon when `rms_norm_eps` is absent.
pub const DEFAULT_RMS_NORM_EPS: f32 = 1e-6;

/// Default RoPE base when `rope_theta` is absent.
pub const DEFAULT_ROPE_THETA: f32 = 10000.0;

/// `eos_token_id` may be a single id or a list of ids.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum EosTokenId {
    Single(i64),
    Many(Vec<i64>),
}

/// Raw fields of a Hugging Face style `config.json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelConfig {
    pub num_hidden_layers: Option<usize>,
    pub hidden_size: Option<usize>,
    pub num_attention_heads: Option<usize>,

    /// Missing means standard multi-head attention (same as `num_attention_heads`).
    pub num_key_value_heads: Option<usize>,

    /// Explicit per-head dimension; wins over `hidden_size / num_attention_heads`.
    pub head_dim: Option<usize>,

    pub intermediate_size: Option<usize>,
    pub max_position_embeddings: Option<usize>,
    pub vocab_size: Option<usize>,
    pub rms_norm_eps: Option<f32>,
    pub rope_theta: Option<f32>,
    pub eos_token_id: Option<EosTokenId>,

    /// Storage precision name, e.g. `"bfloat16"`.
    pub torch_dtype: Option<String>,

    pub model_type: Option<String>,
}

impl ModelConfig {
    /// Read and parse a `config.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

/// Immutable architecture and numeric description of a loaded model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelMeta {
    /// Compute precision every weight is converted to at load time.
    pub dtype: Dtype,
    pub num_layers: usize,
    pub hidden_size: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub intermediate_size: usize,
    /// Context window; 0 disables both the bound and the KV cache.
    pub max_seq_len: usize,
    pub vocab_size: usize,
    pub rms_norm_eps: f32,
    pub rope_theta: f32,
    /// Every id that ends a sequence, in config order. Empty when none is set.
    pub eos_tokens: Vec<TokenId>,
}

impl ModelMeta {
    /// Validate a raw config into a descriptor.
    ///
    /// Layer count and hidden size are structural: a missing or zero value is a
    /// [`Qwen2Error::Config`]. Other counts default to zero and are left for the
    /// compute engine to reject.
    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        let num_layers = require_nonzero(config.num_hidden_layers, "num_hidden_layers")?;
        let hidden_size = require_nonzero(config.hidden_size, "hidden_size")?;
        let num_heads = config.num_attention_heads.unwrap_or(0);
        let num_kv_heads = config.num_key_value_heads.unwrap_or(num_heads);
        let head_dim = match config.head_dim {
            Some(dim) => dim,
            None if num_heads != 0 => hidden_size / num_heads,
            None => 0,
        };

        Ok(ModelMeta {
            dtype: compute_dtype(config.torch_dtype.as_deref())?,
            num_layers,
            hidden_size,
            num_heads,
            num_kv_heads,
            head_dim,
            intermediate_size: config.intermediate_size.unwrap_or(0),
            max_seq_len: config.max_position_embeddings.unwrap_or(0),
            vocab_size: config.vocab_size.unwrap_or(0),
            rms_norm_eps: config.rms_norm_eps.unwrap_or(DEFAULT_RMS_NORM_EPS),
            rope_theta: config.rope_theta.unwrap_or(DEFAULT_ROPE_THETA),
            eos_tokens: eos_tokens(config.eos_token_id.as_ref())?,
        })
    }

    /// Load and validate `config.json`.
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_config(&ModelConfig::from_file(path)?)
    }

    /// The first end-of-sequence id, if any.
    pub fn eos_token(&self) -> Option<TokenId> {
        self.eos_tokens.first().copied()
    }

    /// Whether `token` ends a sequence.
    pub fn is_eos(&self, token: TokenId) -> bool {
        self.eos_tokens.contains(&token)
    }

    /// Override the compute precision.
    pub fn with_dtype(mut self, dtype: Dtype) -> Self {
        self.dtype = dtype;
        self
    }

    /// Width of the concatenated query heads.
    pub fn q_dim(&self) -> usize {
        self.num_heads * self.head_dim
    }

    /// Width of the concatenated key (or value) heads.
    pub fn kv_dim(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }

    /// Number of query heads per KV head (GQA ratio).
    pub fn num_queries_per_kv(&self) -> usize {
        if self.num_kv_heads == 0 {
            0
        } else {
            self.num_heads / self.num_kv_heads
        }
    }

    /// Whether the model uses Grouped Query Attention.
    pub fn uses_gqa(&self) -> bool {
        self.num_kv_heads < self.num_heads
    }

    /// Rough estimate of the parameter count, assuming an untied output projection.
    pub fn estimated_params(&self) -> usize {
        let embed = self.vocab_size * self.hidden_size;
        let attn = self.hidden_size * self.q_dim()
            + 2 * self.hidden_size * self.kv_dim()
            + self.q_dim()
            + 2 * self.kv_dim()
            + self.q_dim() * self.hidden_size;
        let ffn = self.hidden_size * self.intermediate_size * 3;
        let norms = self.hidden_size * 2;
        embed + self.num_layers * (attn + ffn + norms) + self.hidden_size + embed
    }

    /// Bytes needed for a full-context f32 KV cache.
    pub fn kv_cache_bytes(&self) -> usize {
        2 * self.num_layers * self.max_seq_len * self.kv_dim() * std::mem::size_of::<f32>()
    }
}

fn require_nonzero(value: Option<usize>, field: &str) -> Result<usize> {
    match value {
        Some(v) if v > 0 => Ok(v),
        Some(_) => Err(Qwen2Error::Config(format!("{field} must be non-zero"))),
        None => Err(Qwen2Error::Config(format!("missing required field {field}"))),
    }
}

fn compute_dtype(torch_dtype: Option<&str>) -> Result<Dtype> {
    match torch_dtype {
        None | Some("bfloat16") | Some("float16") | Some("half") => Ok(Dtype::Float16),
        Some("float32") | Some("float") => Ok(Dtype::Float32),
        Some(other) => Err(Qwen2Error::Config(format!(
            "unsupported torch_dtype '{other}'"
        ))),
    }
}

/// Negative ids mean "unset" and are skipped; duplicates collapse.
fn eos_tokens(raw: Option<&EosTokenId>) -> Result<Vec<TokenId>> {
    let ids = match raw {
        None => return Ok(Vec::new()),
        Some(EosTokenId::Single(id)) => std::slice::from_ref(id),
        Some(EosTokenId::Many(ids)) => ids.as_slice(),
    };
    let mut tokens = Vec::with_capacity(ids.len());
    for &id in ids.iter().filter(|&&id| id >= 0) {
        let token = TokenId::try_from(id)
            .map_err(|_| Qwen2Error::Config(format!("eos_token_id {id} out of range")))?;
        if !tokens.contains(&token) {
            tokens.push(token);
        }
    }
    Ok(tokens)
}
