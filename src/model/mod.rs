//! Qwen2 model description.
//!
//! - [`config`]: raw `config.json` fields and the validated [`ModelMeta`] descriptor.

pub mod config;

pub use config::{ModelConfig, ModelMeta};
