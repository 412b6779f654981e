//! Compute engine boundary.
//!
//! The numeric work of a forward pass (embedding, attention, normalization,
//! projections) lives behind [`ComputeEngine`]. An [`InferenceSession`] owns one
//! engine and calls it strictly sequentially; implementations can therefore keep
//! scratch state behind `&mut self`.
//!
//! [`cpu::CpuEngine`] is a straightforward f32 reference implementation.
//!
//! [`InferenceSession`]: crate::engine::InferenceSession

pub mod cpu;

use crate::cache::KvCache;
use crate::error::Result;
use crate::model::ModelMeta;
use crate::tensor::DeviceType;
use crate::weights::WeightTable;
use crate::TokenId;

pub use cpu::CpuEngine;

/// A device-specific executor for the decoder forward pass.
pub trait ComputeEngine: Send {
    /// Short backend name used in logs.
    fn name(&self) -> &str;

    /// Accept or reject a descriptor and placement before any session state exists.
    ///
    /// An `Err` here surfaces to the caller as [`Qwen2Error::EngineInit`].
    ///
    /// [`Qwen2Error::EngineInit`]: crate::error::Qwen2Error::EngineInit
    fn init(&mut self, meta: &ModelMeta, device: DeviceType, device_ids: &[i32]) -> Result<()>;

    /// Run `tokens` through the decoder and return the logits of the last one.
    ///
    /// With a cache, `tokens` occupy positions `cache.len()..` and attend to the
    /// cached positions; their keys/values are appended and committed on success.
    /// Without a cache, `tokens` are the whole context starting at position 0.
    fn forward(
        &mut self,
        weights: &WeightTable,
        tokens: &[TokenId],
        cache: Option<&mut KvCache>,
    ) -> Result<Vec<f32>>;
}

impl<E: ComputeEngine + ?Sized> ComputeEngine for Box<E> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn init(&mut self, meta: &ModelMeta, device: DeviceType, device_ids: &[i32]) -> Result<()> {
        (**self).init(meta, device, device_ids)
    }

    fn forward(
        &mut self,
        weights: &WeightTable,
        tokens: &[TokenId],
        cache: Option<&mut KvCache>,
    ) -> Result<Vec<f32>> {
        (**self).forward(weights, tokens, cache)
    }
}
