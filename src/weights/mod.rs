//! Weight loading.
//!
//! Streams tensors out of one or more safetensors shards into a [`WeightTable`]:
//! - shards are visited in lexicographic order, tensors by name within a shard
//! - every storage precision a shard uses is resolved against the conversion
//!   table before any tensor from that shard is created
//! - names are routed through [`NameRouter`]; unrecognized names are logged and skipped
//! - a missing output projection is tied to the input embedding

pub mod mmap;
pub mod names;
pub mod safetensors;
pub mod table;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{Qwen2Error, Result};
use crate::model::ModelMeta;
use crate::tensor::convert::{self, ConvertFn};
use crate::tensor::{byte_len, DeviceType, Dtype, Tensor};

pub use self::names::{LayerSlot, NameRouter, Slot};
pub use self::safetensors::SafetensorsFile;
pub use self::table::{LayerWeights, WeightTable};

/// Summary of a completed load.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// Shards read, in load order.
    pub shards: Vec<PathBuf>,
    /// Tensors stored into a slot.
    pub loaded: usize,
    /// Tensors whose storage precision differed from the compute precision.
    pub converted: usize,
    /// Names that matched no slot.
    pub ignored: Vec<String>,
    /// Whether the output projection was tied to the input embedding.
    pub tied_output_embedding: bool,
}

/// Populates a [`WeightTable`] from checkpoint shards.
pub struct WeightLoader<'a> {
    meta: &'a ModelMeta,
    device: DeviceType,
    device_id: i32,
    router: NameRouter,
}

impl<'a> WeightLoader<'a> {
    pub fn new(meta: &'a ModelMeta, device: DeviceType, device_id: i32) -> Self {
        WeightLoader {
            meta,
            device,
            device_id,
            router: NameRouter::new(),
        }
    }

    /// Load every `.safetensors` shard in `model_dir`.
    ///
    /// There is no rollback: on error the table is left partially populated
    /// and must be discarded along with its session.
    pub fn load_dir(&self, model_dir: &Path, table: &mut WeightTable) -> Result<LoadReport> {
        let shards = discover_weight_files(model_dir)?;
        self.load_files(&shards, table)
    }

    /// Load the given shards in the order given, then apply weight tying.
    pub fn load_files(&self, shards: &[PathBuf], table: &mut WeightTable) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        for path in shards {
            self.load_shard(path, table, &mut report)?;
            report.shards.push(path.clone());
        }

        report.tied_output_embedding = table.tie_output_embedding();
        if report.tied_output_embedding {
            debug!("output projection tied to input embedding");
        }

        info!(
            shards = report.shards.len(),
            loaded = report.loaded,
            converted = report.converted,
            ignored = report.ignored.len(),
            tied = report.tied_output_embedding,
            dtype = %self.meta.dtype,
            "weights loaded"
        );
        Ok(report)
    }

    /// Load one shard into `table`.
    pub fn load_shard(
        &self,
        path: &Path,
        table: &mut WeightTable,
        report: &mut LoadReport,
    ) -> Result<()> {
        let file = SafetensorsFile::open(path)?;

        let mut routed = Vec::new();
        for (name, info) in &file.header.tensors {
            match self.router.route(name) {
                Some(slot) => routed.push((name.as_str(), info, slot)),
                None => {
                    debug!(tensor = %name, shard = %path.display(), "ignoring unrecognized tensor");
                    report.ignored.push(name.clone());
                }
            }
        }

        let plan = self.conversion_plan(routed.iter().map(|(_, info, _)| info.dtype.as_str()))?;

        for (name, info, slot) in routed {
            let storage = info.parse_dtype()?;
            let bytes = file.tensor_data(name)?;
            let expected = byte_len(&info.shape, storage).ok_or_else(|| {
                Qwen2Error::WeightLoad(format!("tensor '{name}' shape {:?} is too large", info.shape))
            })?;
            if bytes.len() != expected {
                return Err(Qwen2Error::ShapeMismatch {
                    name: name.to_string(),
                    expected: vec![expected],
                    got: vec![bytes.len()],
                });
            }

            let convert = plan[&storage];
            if storage != self.meta.dtype {
                report.converted += 1;
            }
            let tensor = Tensor::from_bytes(
                &info.shape,
                self.meta.dtype,
                self.device,
                self.device_id,
                convert(bytes),
            )?;

            if table.set(slot, tensor)?.is_some() {
                warn!(tensor = %name, shard = %path.display(), "tensor replaces one from an earlier shard");
            }
            report.loaded += 1;
        }

        Ok(())
    }

    /// Resolve a conversion function for every distinct storage dtype up front.
    fn conversion_plan<'s>(
        &self,
        codes: impl Iterator<Item = &'s str>,
    ) -> Result<BTreeMap<Dtype, ConvertFn>> {
        let mut plan = BTreeMap::new();
        for code in codes {
            let storage = Dtype::from_safetensors(code)?;
            if plan.contains_key(&storage) {
                continue;
            }
            let convert = convert::conversion(storage, self.meta.dtype)?;
            if storage != self.meta.dtype {
                debug!(from = %storage, to = %self.meta.dtype, "converting storage precision");
            }
            plan.insert(storage, convert);
        }
        Ok(plan)
    }
}

/// Load every shard in `model_dir` into `table`.
pub fn load_weights(
    model_dir: &Path,
    meta: &ModelMeta,
    device: DeviceType,
    device_id: i32,
    table: &mut WeightTable,
) -> Result<LoadReport> {
    WeightLoader::new(meta, device, device_id).load_dir(model_dir, table)
}

/// Discover all safetensors files in a model directory, sorted by path.
///
/// Handles both single-file models and sharded models
/// (e.g., model-00001-of-00004.safetensors).
pub fn discover_weight_files(model_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(model_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "safetensors"))
        .collect();

    if files.is_empty() {
        return Err(Qwen2Error::WeightLoad(format!(
            "no .safetensors files found in {}",
            model_dir.display()
        )));
    }

    files.sort();
    Ok(files)
}
