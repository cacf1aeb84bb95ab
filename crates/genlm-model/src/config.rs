//! Architecture metadata carried in the header of a model artifact.

use serde::{Deserialize, Serialize};

use crate::{ModelError, ModelResult};

fn default_rope_base() -> f32 {
    10_000.0
}

fn default_norm_eps() -> f32 {
    1e-5
}

fn default_image_tokens() -> usize {
    4
}

/// Shape of the decoder stored in an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureConfig {
    pub d_model: usize,        // Hidden dimension
    pub d_ff: usize,           // Feedforward hidden dimension
    pub n_heads: usize,        // Attention heads
    pub head_dim: usize,       // Dimension per head; n_heads * head_dim == d_model
    pub n_layers: usize,       // Decoder layers
    pub vocab_size: usize,     // Must equal the vocabulary length
    pub max_context: usize,    // Longest sequence the weights were built for
    #[serde(default = "default_rope_base")]
    pub rope_base: f32,
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f32,
    /// Layers run when the smaller submodel is requested.
    #[serde(default)]
    pub submodel_layers: Option<usize>,
    /// Soft tokens produced per image; a perfect square (patch grid side²).
    #[serde(default = "default_image_tokens")]
    pub image_tokens: usize,
}

impl ArchitectureConfig {
    /// Small decoder used by the synthetic packages.
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            d_model: 32,
            d_ff: 64,
            n_heads: 4,
            head_dim: 8,
            n_layers: 2,
            vocab_size,
            max_context: 2048,
            rope_base: default_rope_base(),
            norm_eps: default_norm_eps(),
            submodel_layers: Some(1),
            image_tokens: default_image_tokens(),
        }
    }

    /// Side of the square image patch grid.
    pub fn patch_grid(&self) -> usize {
        (self.image_tokens as f64).sqrt().round() as usize
    }

    /// Number of layers to run for the requested variant.
    pub fn active_layers(&self, use_submodel: bool) -> ModelResult<usize> {
        if !use_submodel {
            return Ok(self.n_layers);
        }
        self.submodel_layers.ok_or_else(|| {
            ModelError::InvalidConfig("artifact does not contain a submodel".to_string())
        })
    }

    pub fn validate(&self) -> ModelResult<()> {
        let dims = [
            ("d_model", self.d_model),
            ("d_ff", self.d_ff),
            ("n_heads", self.n_heads),
            ("head_dim", self.head_dim),
            ("n_layers", self.n_layers),
            ("vocab_size", self.vocab_size),
            ("max_context", self.max_context),
            ("image_tokens", self.image_tokens),
        ];
        if let Some((name, _)) = dims.iter().find(|(_, value)| *value == 0) {
            return Err(ModelError::InvalidConfig(format!("{name} must be > 0")));
        }

        if self.n_heads.checked_mul(self.head_dim) != Some(self.d_model) {
            return Err(ModelError::InvalidConfig(format!(
                "n_heads ({}) * head_dim ({}) != d_model ({})",
                self.n_heads, self.head_dim, self.d_model
            )));
        }
        if self.head_dim % 2 != 0 {
            return Err(ModelError::InvalidConfig(format!(
                "head_dim {} must be even for RoPE",
                self.head_dim
            )));
        }
        if !(self.rope_base.is_finite() && self.rope_base > 0.0) {
            return Err(ModelError::InvalidConfig("rope_base must be > 0".to_string()));
        }
        if !(self.norm_eps.is_finite() && self.norm_eps > 0.0) {
            return Err(ModelError::InvalidConfig("norm_eps must be > 0".to_string()));
        }

        if let Some(layers) = self.submodel_layers {
            if layers == 0 || layers > self.n_layers {
                return Err(ModelError::InvalidConfig(format!(
                    "submodel_layers {layers} outside 1..={}",
                    self.n_layers
                )));
            }
        }

        let grid = self.patch_grid();
        if grid.checked_mul(grid) != Some(self.image_tokens) {
            return Err(ModelError::InvalidConfig(format!(
                "image_tokens {} is not a perfect square",
                self.image_tokens
            )));
        }

        Ok(())
    }
}
