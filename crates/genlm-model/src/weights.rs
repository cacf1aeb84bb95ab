//! Decoded decoder weights.

use crate::artifact::ArtifactFile;
use crate::config::ArchitectureConfig;
use crate::ModelResult;

pub const VISION_PROJECTION: &str = "vision.projection";

/// Features per image patch: mean R, G, B and a constant bias input.
pub const PATCH_FEATURES: usize = 4;

/// One decoder layer.
#[derive(Debug, Clone)]
pub struct LayerWeights {
    pub attn_norm: Vec<f32>, // [d]
    pub wq: Vec<f32>,        // [d, d]
    pub wk: Vec<f32>,        // [d, d]
    pub wv: Vec<f32>,        // [d, d]
    pub wo: Vec<f32>,        // [d, d]
    pub mlp_norm: Vec<f32>,  // [d]
    pub w_gate: Vec<f32>,    // [d, ff]
    pub w_up: Vec<f32>,      // [d, ff]
    pub w_down: Vec<f32>,    // [ff, d]
}

/// Every tensor of a `model` artifact, decoded into owned buffers.
#[derive(Debug, Clone)]
pub struct ModelWeights {
    pub token_embeddings: Vec<f32>, // [vocab, d]
    pub layers: Vec<LayerWeights>,
    pub final_norm: Vec<f32>,              // [d]
    pub lm_head: Vec<f32>,                 // [d, vocab]
    pub output_bias: Option<Vec<f32>>,     // [vocab]
    pub vision_projection: Option<Vec<f32>>, // [PATCH_FEATURES, d]
}

fn layer_tensors(config: &ArchitectureConfig, layer: usize) -> [(String, Vec<usize>); 9] {
    let d = config.d_model;
    let ff = config.d_ff;
    let name = |suffix: &str| format!("layers.{layer}.{suffix}");
    [
        (name("attn_norm"), vec![d]),
        (name("wq"), vec![d, d]),
        (name("wk"), vec![d, d]),
        (name("wv"), vec![d, d]),
        (name("wo"), vec![d, d]),
        (name("mlp_norm"), vec![d]),
        (name("w_gate"), vec![d, ff]),
        (name("w_up"), vec![d, ff]),
        (name("w_down"), vec![ff, d]),
    ]
}

impl ModelWeights {
    /// Check that every required tensor is present with the right shape,
    /// without decoding anything.
    pub fn check_layout(file: &ArtifactFile, config: &ArchitectureConfig) -> ModelResult<()> {
        let d = config.d_model;
        let vocab = config.vocab_size;

        file.expect_shape("token_embeddings", &[vocab, d])?;
        for layer in 0..config.n_layers {
            for (name, shape) in layer_tensors(config, layer) {
                file.expect_shape(&name, &shape)?;
            }
        }
        file.expect_shape("final_norm", &[d])?;
        file.expect_shape("lm_head", &[d, vocab])?;

        if file.has_tensor("output_bias") {
            file.expect_shape("output_bias", &[vocab])?;
        }
        if file.has_tensor(VISION_PROJECTION) {
            file.expect_shape(VISION_PROJECTION, &[PATCH_FEATURES, d])?;
        }
        Ok(())
    }

    /// Decode all tensors. Call [`ModelWeights::check_layout`] first.
    pub fn decode(file: &ArtifactFile, config: &ArchitectureConfig) -> ModelResult<Self> {
        let layers = (0..config.n_layers)
            .map(|layer| {
                let [attn_norm, wq, wk, wv, wo, mlp_norm, w_gate, w_up, w_down] =
                    layer_tensors(config, layer);
                Ok(LayerWeights {
                    attn_norm: file.tensor_f32(&attn_norm.0)?,
                    wq: file.tensor_f32(&wq.0)?,
                    wk: file.tensor_f32(&wk.0)?,
                    wv: file.tensor_f32(&wv.0)?,
                    wo: file.tensor_f32(&wo.0)?,
                    mlp_norm: file.tensor_f32(&mlp_norm.0)?,
                    w_gate: file.tensor_f32(&w_gate.0)?,
                    w_up: file.tensor_f32(&w_up.0)?,
                    w_down: file.tensor_f32(&w_down.0)?,
                })
            })
            .collect::<ModelResult<Vec<_>>>()?;

        let optional = |name: &str| -> ModelResult<Option<Vec<f32>>> {
            if file.has_tensor(name) {
                file.tensor_f32(name).map(Some)
            } else {
                Ok(None)
            }
        };

        Ok(Self {
            token_embeddings: file.tensor_f32("token_embeddings")?,
            layers,
            final_norm: file.tensor_f32("final_norm")?,
            lm_head: file.tensor_f32("lm_head")?,
            output_bias: optional("output_bias")?,
            vision_projection: optional(VISION_PROJECTION)?,
        })
    }

    /// Bytes held by the decoded buffers.
    pub fn memory_bytes(&self) -> usize {
        let layer_floats: usize = self
            .layers
            .iter()
            .map(|l| {
                l.attn_norm.len()
                    + l.wq.len()
                    + l.wk.len()
                    + l.wv.len()
                    + l.wo.len()
                    + l.mlp_norm.len()
                    + l.w_gate.len()
                    + l.w_up.len()
                    + l.w_down.len()
            })
            .sum();
        let floats = self.token_embeddings.len()
            + layer_floats
            + self.final_norm.len()
            + self.lm_head.len()
            + self.output_bias.as_ref().map_or(0, Vec::len)
            + self.vision_projection.as_ref().map_or(0, Vec::len);
        floats * std::mem::size_of::<f32>()
    }
}
