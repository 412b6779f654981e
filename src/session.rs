//! High-level session management.
//!
//! A [`Session`] takes a checkpoint directory from disk to a ready
//! [`InferenceSession`]: descriptor from `config.json`, engine binding, weight
//! loading, completeness check.

use std::path::PathBuf;

use tracing::info;

use crate::backend::{ComputeEngine, CpuEngine};
use crate::engine::actor::ActorHandle;
use crate::engine::{Generation, GenerationConfig, InferenceSession, Next};
use crate::error::Result;
use crate::model::ModelMeta;
use crate::tensor::{DeviceType, Dtype};
use crate::weights::{LoadReport, WeightLoader};
use crate::TokenId;

/// Configuration for creating a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Directory holding `config.json` and the safetensors shards.
    pub model_path: PathBuf,

    pub device: DeviceType,

    /// Device ordinals; the first one receives the weights.
    pub device_ids: Vec<i32>,

    /// Whether the KV cache starts enabled.
    pub kv_cache: bool,

    /// Compute precision override; defaults to the one derived from `torch_dtype`.
    pub dtype: Option<Dtype>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            model_path: PathBuf::new(),
            device: DeviceType::Cpu,
            device_ids: vec![0],
            kv_cache: true,
            dtype: None,
        }
    }
}

impl SessionConfig {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        SessionConfig {
            model_path: model_path.into(),
            ..Self::default()
        }
    }
}

/// A loaded model ready to generate.
///
/// Any error while loading leaves no session behind; fix the checkpoint or
/// configuration and load again.
#[derive(Debug)]
pub struct Session<E: ComputeEngine> {
    inner: InferenceSession<E>,
    report: LoadReport,
}

impl<E: ComputeEngine> Session<E> {
    /// Read the descriptor, bind `engine`, load and validate the weights.
    pub fn load(config: &SessionConfig, engine: E) -> Result<Self> {
        let dir = &config.model_path;
        let mut meta = ModelMeta::from_file(&dir.join("config.json"))?;
        if let Some(dtype) = config.dtype {
            meta = meta.with_dtype(dtype);
        }

        let mut inner = InferenceSession::create(meta.clone(), config.device, &config.device_ids, engine)?;
        let device_id = config.device_ids.first().copied().unwrap_or(0);
        let report =
            WeightLoader::new(&meta, config.device, device_id).load_dir(dir, inner.weights_mut())?;
        inner.weights().validate(&meta)?;
        inner.set_kv_cache_enabled(config.kv_cache);

        info!(
            model = %dir.display(),
            shards = report.shards.len(),
            tensors = report.loaded,
            converted = report.converted,
            ignored = report.ignored.len(),
            tied = report.tied_output_embedding,
            bytes = inner.weights().byte_size(),
            "model loaded"
        );

        Ok(Session { inner, report })
    }

    /// Extend `prompt`, returning the prompt followed by the produced tokens.
    pub fn generate(&mut self, prompt: &[TokenId], config: &GenerationConfig) -> Result<Vec<TokenId>> {
        Ok(self.inner.generate(prompt, config)?.tokens)
    }

    /// Like [`generate`](Self::generate), with stop reason and timings.
    pub fn generate_detailed(&mut self, prompt: &[TokenId], config: &GenerationConfig) -> Result<Generation> {
        self.inner.generate(prompt, config)
    }

    pub fn prefill(&mut self, prompt: &[TokenId]) -> Result<Next> {
        self.inner.prefill(prompt)
    }

    pub fn step(&mut self, token: TokenId) -> Result<Next> {
        self.inner.step(token)
    }

    pub fn reset_kv_cache(&mut self) {
        self.inner.reset_kv_cache();
    }

    pub fn set_kv_cache_enabled(&mut self, enabled: bool) {
        self.inner.set_kv_cache_enabled(enabled);
    }

    pub fn meta(&self) -> &ModelMeta {
        self.inner.meta()
    }

    /// What the loader did.
    pub fn load_report(&self) -> &LoadReport {
        &self.report
    }

    pub fn inner(&self) -> &InferenceSession<E> {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut InferenceSession<E> {
        &mut self.inner
    }

    pub fn into_inner(self) -> InferenceSession<E> {
        self.inner
    }
}

impl<E: ComputeEngine + 'static> Session<E> {
    /// Move the session onto its own worker thread.
    pub fn spawn_actor(self) -> Result<ActorHandle> {
        ActorHandle::spawn(self.inner)
    }
}

impl Session<CpuEngine> {
    /// Load on the CPU reference engine.
    pub fn load_cpu(config: &SessionConfig) -> Result<Self> {
        Self::load(config, CpuEngine::new())
    }
}
