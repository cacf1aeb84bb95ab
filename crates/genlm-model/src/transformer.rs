//! Pre-norm decoder forward pass.
//!
//! One call processes one position:
//! embed → norm → Q/K/V (+LoRA) → RoPE → KV append → attention → out proj +
//! residual → norm → SwiGLU + residual → (next layer) → final norm → lm_head.
//!
//! The position is written to the KV cache as a single step: if any layer
//! fails, the partial step is rolled back and the cache is left as it was.

use genlm_kv::SessionKVCache;
use genlm_tokenizer::TokenId;

use crate::config::ArchitectureConfig;
use crate::lora::LoraWeights;
use crate::ops::{add, apply_rope, attention_decode, matvec, mlp_swiglu, rms_norm};
use crate::weights::ModelWeights;
use crate::{ModelError, ModelResult};

/// What occupies the next position.
#[derive(Debug, Clone, Copy)]
pub enum StepInput<'a> {
    /// A vocabulary token, looked up in the embedding table.
    Token(TokenId),
    /// A precomputed embedding (image soft token) of width `d_model`.
    Embedding(&'a [f32]),
}

/// Borrowed view of a model ready to run.
///
/// The number of layers run is the number of layers in the KV cache passed
/// to [`Transformer::forward`], so a cache sized for the submodel runs only
/// its leading layers.
#[derive(Debug, Clone, Copy)]
pub struct Transformer<'a> {
    config: &'a ArchitectureConfig,
    weights: &'a ModelWeights,
    lora: Option<&'a LoraWeights>,
}

impl<'a> Transformer<'a> {
    pub fn new(config: &'a ArchitectureConfig, weights: &'a ModelWeights) -> Self {
        Self {
            config,
            weights,
            lora: None,
        }
    }

    pub fn with_lora(mut self, lora: Option<&'a LoraWeights>) -> Self {
        self.lora = lora;
        self
    }

    /// Process one position and return the next-token logits.
    pub fn forward(&self, input: StepInput<'_>, kv: &mut SessionKVCache) -> ModelResult<Vec<f32>> {
        self.step(input, kv, true)
            .map(|logits| logits.unwrap_or_default())
    }

    /// Process one position without projecting to the vocabulary.
    ///
    /// Used for prefill positions whose logits would be discarded.
    pub fn advance(&self, input: StepInput<'_>, kv: &mut SessionKVCache) -> ModelResult<()> {
        self.step(input, kv, false).map(|_| ())
    }

    fn step(
        &self,
        input: StepInput<'_>,
        kv: &mut SessionKVCache,
        want_logits: bool,
    ) -> ModelResult<Option<Vec<f32>>> {
        let result = self.run_layers(input, kv, want_logits);
        match result {
            Ok(logits) => {
                kv.commit()?;
                Ok(logits)
            }
            Err(err) => {
                kv.rollback();
                Err(err)
            }
        }
    }

    fn embed(&self, input: StepInput<'_>) -> ModelResult<Vec<f32>> {
        let d = self.config.d_model;
        match input {
            StepInput::Token(id) => {
                let id = id as usize;
                if id >= self.config.vocab_size {
                    return Err(ModelError::ShapeMismatch {
                        op: "token embedding",
                        expected: self.config.vocab_size,
                        got: id + 1,
                    });
                }
                Ok(self.weights.token_embeddings[id * d..(id + 1) * d].to_vec())
            }
            StepInput::Embedding(embedding) => {
                if embedding.len() != d {
                    return Err(ModelError::ShapeMismatch {
                        op: "soft token embedding",
                        expected: d,
                        got: embedding.len(),
                    });
                }
                Ok(embedding.to_vec())
            }
        }
    }

    fn run_layers(
        &self,
        input: StepInput<'_>,
        kv: &mut SessionKVCache,
        want_logits: bool,
    ) -> ModelResult<Option<Vec<f32>>> {
        let c = self.config;
        let d = c.d_model;
        let position = kv.seq_len();
        let n_layers = kv.n_layers();
        if n_layers > self.weights.layers.len() {
            return Err(ModelError::InvalidConfig(format!(
                "cache has {n_layers} layers, model has {}",
                self.weights.layers.len()
            )));
        }

        let mut x = self.embed(input)?;

        for (idx, layer) in self.weights.layers.iter().take(n_layers).enumerate() {
            let lora = self.lora.and_then(|l| l.layer(idx).map(|layer| (l, layer)));

            let x_norm = rms_norm(&x, &layer.attn_norm, c.norm_eps)?;

            let mut q = matvec(&x_norm, &layer.wq, d, d)?;
            let mut k = matvec(&x_norm, &layer.wk, d, d)?;
            let mut v = matvec(&x_norm, &layer.wv, d, d)?;
            if let Some((weights, adapters)) = lora {
                if let Some(adapter) = &adapters.wq {
                    weights.apply(adapter, &x_norm, &mut q)?;
                }
                if let Some(adapter) = &adapters.wv {
                    weights.apply(adapter, &x_norm, &mut v)?;
                }
            }

            apply_rope(&mut q, &mut k, position, c.n_heads, c.head_dim, c.rope_base)?;

            kv.append_layer(idx, &k, &v)?;
            let cache = kv.layer(idx).ok_or_else(|| {
                ModelError::InvalidConfig(format!("cache layer {idx} missing"))
            })?;
            let seq_len = cache.seq_len();

            let attn_out =
                attention_decode(&q, cache.keys(), cache.values(), seq_len, c.n_heads, c.head_dim)?;
            let attn_proj = matvec(&attn_out, &layer.wo, d, d)?;
            let x_after_attn = add(&x, &attn_proj)?;

            let x_norm2 = rms_norm(&x_after_attn, &layer.mlp_norm, c.norm_eps)?;
            let mlp_out = mlp_swiglu(&x_norm2, &layer.w_gate, &layer.w_up, &layer.w_down, d, c.d_ff)?;
            x = add(&x_after_attn, &mlp_out)?;
        }

        if !want_logits {
            return Ok(None);
        }

        let hidden = rms_norm(&x, &self.weights.final_norm, c.norm_eps)?;
        let mut logits = matvec(&hidden, &self.weights.lm_head, d, c.vocab_size)?;
        if let Some(bias) = &self.weights.output_bias {
            for (logit, b) in logits.iter_mut().zip(bias) {
                *logit += b;
            }
        }
        Ok(Some(logits))
    }
}
