//! Inference session: weight bindings, KV cache and the prefill/step protocol.
//!
//! Manages the two-phase inference process:
//! - **Prefill**: runs the prompt through the decoder, populating the KV cache,
//!   and samples the first new token.
//! - **Step**: feeds back one produced token and samples the next.
//!
//! ```text
//! create ──> Ready ──prefill──> Prefilled ──step──> Decoding ──step──> ...
//!              ^                                        │
//!              └──────────── reset_kv_cache ────────────┘
//! ```
//!
//! The session retains every token it has fed to the engine. With the cache
//! disabled each call recomputes over that full history, so `step` keeps taking
//! a single token either way.

pub mod actor;
mod generate;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::backend::ComputeEngine;
use crate::cache::KvCache;
use crate::error::{Qwen2Error, Result};
use crate::model::ModelMeta;
use crate::sampling::{Sampler, SamplingConfig};
use crate::tensor::DeviceType;
use crate::weights::WeightTable;
use crate::TokenId;

pub use generate::{Generation, GenerationConfig, GenerationStats, StopReason};

/// Outcome of a single prefill or step call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    /// A token was produced; generation may continue.
    Token(TokenId),
    /// The end-of-sequence token was produced.
    EndOfSequence(TokenId),
    /// The compute engine failed; stop and keep what was produced so far.
    Failed(String),
}

impl Next {
    /// The produced token, if any.
    pub fn token(&self) -> Option<TokenId> {
        match self {
            Next::Token(t) | Next::EndOfSequence(t) => Some(*t),
            Next::Failed(_) => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Next::Failed(_))
    }
}

/// Position in the prefill/step protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No sequence in progress.
    Ready,
    /// A prompt has been prefilled; no step yet.
    Prefilled,
    /// At least one step has run.
    Decoding,
}

/// One model bound to one compute engine, one weight table and one KV cache.
///
/// Calls are strictly sequential (`&mut self`). Independent sessions share no
/// mutable state and can run on separate threads.
pub struct InferenceSession<E: ComputeEngine> {
    id: Uuid,
    meta: ModelMeta,
    device: DeviceType,
    device_ids: Vec<i32>,
    engine: E,
    weights: WeightTable,
    cache: KvCache,
    kv_cache_enabled: bool,

    /// Every token fed to the engine in the current sequence.
    history: Vec<TokenId>,
    state: SessionState,
    sampler: Sampler,

    /// Set while a generation loop is in progress.
    is_running: Arc<AtomicBool>,
}

impl<E: ComputeEngine> InferenceSession<E> {
    /// Bind `engine` to `meta` on the given device.
    ///
    /// Fails with [`Qwen2Error::EngineInit`] if the engine rejects the descriptor
    /// or placement. The weight table starts empty; populate it through
    /// [`weights_mut`](Self::weights_mut) before the first prefill.
    pub fn create(meta: ModelMeta, device: DeviceType, device_ids: &[i32], mut engine: E) -> Result<Self> {
        engine
            .init(&meta, device, device_ids)
            .map_err(|e| match e {
                Qwen2Error::EngineInit(_) => e,
                other => Qwen2Error::EngineInit(other.to_string()),
            })?;

        let id = Uuid::new_v4();
        info!(
            session = %id,
            engine = engine.name(),
            %device,
            layers = meta.num_layers,
            max_seq_len = meta.max_seq_len,
            "inference session created"
        );

        Ok(InferenceSession {
            id,
            weights: WeightTable::new(meta.num_layers),
            cache: KvCache::for_model(&meta),
            device,
            device_ids: device_ids.to_vec(),
            engine,
            kv_cache_enabled: true,
            history: Vec::new(),
            state: SessionState::Ready,
            sampler: Sampler::new(SamplingConfig::default()),
            is_running: Arc::new(AtomicBool::new(false)),
            meta,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn meta(&self) -> &ModelMeta {
        &self.meta
    }

    pub fn device(&self) -> DeviceType {
        self.device
    }

    pub fn device_ids(&self) -> &[i32] {
        &self.device_ids
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn weights(&self) -> &WeightTable {
        &self.weights
    }

    /// The weight table, for the loader to populate.
    pub fn weights_mut(&mut self) -> &mut WeightTable {
        &mut self.weights
    }

    /// Tokens of the current sequence fed to the engine so far.
    pub fn history(&self) -> &[TokenId] {
        &self.history
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Number of positions held in the KV cache.
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    pub fn kv_cache_enabled(&self) -> bool {
        self.kv_cache_enabled
    }

    /// Bytes held by the KV cache buffers.
    pub fn cache_memory_bytes(&self) -> usize {
        self.cache.memory_bytes()
    }

    /// Replace the sampling policy (and reseed) for subsequent calls.
    pub fn set_sampling(&mut self, config: SamplingConfig) {
        self.sampler = Sampler::new(config);
    }

    pub fn sampling(&self) -> &SamplingConfig {
        self.sampler.config()
    }

    /// Forget the current sequence. The cache allocation and weights are kept.
    pub fn reset_kv_cache(&mut self) {
        debug!(session = %self.id, cached = self.cache.len(), "kv cache reset");
        self.cache.reset();
        self.history.clear();
        self.state = SessionState::Ready;
    }

    /// Toggle the KV cache. Disabling frees the cache; re-enabling starts from
    /// an empty cache that the next call rebuilds from the retained history.
    pub fn set_kv_cache_enabled(&mut self, enabled: bool) {
        if enabled == self.kv_cache_enabled {
            return;
        }
        debug!(session = %self.id, enabled, "kv cache toggled");
        self.kv_cache_enabled = enabled;
        self.cache.release();
    }

    /// Run `prompt` and sample the first new token.
    ///
    /// If the current history is a strict prefix of `prompt`, cached positions
    /// are reused and only the suffix is computed; otherwise the sequence is
    /// reset first. An empty prompt is an [`Qwen2Error::InvalidInput`].
    pub fn prefill(&mut self, prompt: &[TokenId]) -> Result<Next> {
        if prompt.is_empty() {
            return Err(Qwen2Error::InvalidInput("empty prompt".into()));
        }

        let extends_history = !self.history.is_empty()
            && self.history.len() < prompt.len()
            && prompt.starts_with(&self.history);
        if !extends_history {
            self.cache.reset();
        }
        self.history.clear();
        self.history.extend_from_slice(prompt);
        self.state = SessionState::Prefilled;

        debug!(
            session = %self.id,
            prompt = prompt.len(),
            reused = self.cache.len(),
            "prefill"
        );
        Ok(self.advance())
    }

    /// Feed back `token` and sample the next one.
    ///
    /// Calling this before any [`prefill`](Self::prefill) is an
    /// [`Qwen2Error::InvalidState`].
    pub fn step(&mut self, token: TokenId) -> Result<Next> {
        if self.state == SessionState::Ready {
            return Err(Qwen2Error::InvalidState("step before prefill".into()));
        }
        self.history.push(token);
        self.state = SessionState::Decoding;
        Ok(self.advance())
    }

    /// Shared flag that reads `true` while a generation loop is in progress.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.is_running)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    fn cache_usable(&self) -> bool {
        self.kv_cache_enabled && self.meta.max_seq_len > 0
    }

    /// Compute logits for the uncached tail of the history and sample.
    fn advance(&mut self) -> Next {
        let logits = if self.cache_usable() {
            self.cache.ensure_allocated();
            let past = self.cache.len();
            trace!(past, current = self.history.len(), "cached forward");
            self.engine
                .forward(&self.weights, &self.history[past..], Some(&mut self.cache))
        } else {
            trace!(current = self.history.len(), "full-context forward");
            self.engine.forward(&self.weights, &self.history, None)
        };

        let token = logits.and_then(|logits| self.sampler.sample(&logits).map_err(Qwen2Error::from));
        match token {
            Ok(t) if self.meta.is_eos(t) => Next::EndOfSequence(t),
            Ok(t) => Next::Token(t),
            Err(e) => {
                warn!(session = %self.id, error = %e, "forward pass failed");
                Next::Failed(e.to_string())
            }
        }
    }
}

impl<E: ComputeEngine> std::fmt::Debug for InferenceSession<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceSession")
            .field("id", &self.id)
            .field("engine", &self.engine.name())
            .field("device", &self.device)
            .field("state", &self.state)
            .field("history", &self.history.len())
            .field("cached", &self.cache.len())
            .field("kv_cache_enabled", &self.kv_cache_enabled)
            .finish()
    }
}
