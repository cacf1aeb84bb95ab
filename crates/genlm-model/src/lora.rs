//! Low-rank adapters for the attention projections.
//!
//! A `lora` artifact stores `layers.{i}.wq.lora_a [d, r]` and
//! `layers.{i}.wq.lora_b [r, d]` (and the same for `wv`). The delta
//! `scale * (x @ A) @ B` is added to the base projection, with
//! `scale = alpha / rank` read from the artifact metadata.

use std::path::Path;

use crate::artifact::{ArtifactFile, ArtifactKind};
use crate::config::ArchitectureConfig;
use crate::ops::matvec;
use crate::{ModelError, ModelResult};

/// One adapted projection.
#[derive(Debug, Clone)]
pub struct LoraAdapter {
    a: Vec<f32>, // [d, r]
    b: Vec<f32>, // [r, d]
}

/// Adapters for one decoder layer. Either projection may be absent.
#[derive(Debug, Clone, Default)]
pub struct LoraLayer {
    pub wq: Option<LoraAdapter>,
    pub wv: Option<LoraAdapter>,
}

#[derive(Debug, Clone)]
pub struct LoraWeights {
    rank: usize,
    scale: f32,
    layers: Vec<LoraLayer>,
}

fn metadata_number(file: &ArtifactFile, key: &str) -> ModelResult<f32> {
    let raw = file
        .header()
        .metadata
        .get(key)
        .ok_or_else(|| ModelError::Header(format!("lora artifact has no '{key}' metadata")))?;
    raw.parse::<f32>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ModelError::Header(format!("lora '{key}' is not a number: {raw:?}")))
}

impl LoraWeights {
    /// Load adapters for a model with the given architecture.
    pub fn load(path: &Path, config: &ArchitectureConfig) -> ModelResult<Self> {
        let file = ArtifactFile::open_kind(path, ArtifactKind::Lora)?;

        let rank = metadata_number(&file, "rank")?;
        if rank < 1.0 || rank.fract() != 0.0 {
            return Err(ModelError::Header(format!("lora rank {rank} must be a positive integer")));
        }
        let rank = rank as usize;
        let alpha = metadata_number(&file, "alpha")?;

        let d = config.d_model;
        let adapter = |layer: usize, proj: &str| -> ModelResult<Option<LoraAdapter>> {
            let a_name = format!("layers.{layer}.{proj}.lora_a");
            let b_name = format!("layers.{layer}.{proj}.lora_b");
            match (file.has_tensor(&a_name), file.has_tensor(&b_name)) {
                (false, false) => Ok(None),
                (true, true) => Ok(Some(LoraAdapter {
                    a: file.tensor_with_shape(&a_name, &[d, rank])?,
                    b: file.tensor_with_shape(&b_name, &[rank, d])?,
                })),
                _ => Err(ModelError::Header(format!(
                    "layer {layer} {proj} adapter needs both lora_a and lora_b"
                ))),
            }
        };

        let layers = (0..config.n_layers)
            .map(|layer| {
                Ok(LoraLayer {
                    wq: adapter(layer, "wq")?,
                    wv: adapter(layer, "wv")?,
                })
            })
            .collect::<ModelResult<Vec<_>>>()?;

        if layers.iter().all(|l| l.wq.is_none() && l.wv.is_none()) {
            return Err(ModelError::MissingTensor("any lora_a/lora_b pair".to_string()));
        }

        tracing::debug!(path = %path.display(), rank, alpha, "lora adapters loaded");

        Ok(Self {
            rank,
            scale: alpha / rank as f32,
            layers,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn layer(&self, idx: usize) -> Option<&LoraLayer> {
        self.layers.get(idx)
    }

    /// Add `scale * (x @ A) @ B` to `out` in place.
    pub fn apply(&self, adapter: &LoraAdapter, x: &[f32], out: &mut [f32]) -> ModelResult<()> {
        let d = out.len();
        let low = matvec(x, &adapter.a, x.len(), self.rank)?;
        let delta = matvec(&low, &adapter.b, self.rank, d)?;
        for (o, dv) in out.iter_mut().zip(delta) {
            *o += self.scale * dv;
        }
        Ok(())
    }
}
