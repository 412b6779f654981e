//! Orchestration layer for Qwen2-family decoder inference.
//!
//! Turns a safetensors checkpoint into a typed [`weights::WeightTable`], binds it to a
//! [`backend::ComputeEngine`] inside an [`engine::InferenceSession`], and drives the
//! prefill/step generation loop with a KV cache and a configurable [`sampling::Sampler`].
//!
//! Tokenization is external: every API here speaks [`TokenId`] sequences.

pub mod backend;
pub mod cache;
pub mod engine;
pub mod error;
pub mod model;
pub mod sampling;
pub mod session;
pub mod tensor;
pub mod weights;

pub use engine::{Generation, GenerationConfig, InferenceSession, Next, StopReason};
pub use error::{Qwen2Error, Result};
pub use model::ModelMeta;
pub use session::{Session, SessionConfig};

/// Token id as produced by the external tokenizer (an index into the vocabulary).
pub type TokenId = u32;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
