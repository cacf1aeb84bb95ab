//! Writer for deterministic synthetic artifacts.
//!
//! Weights come from a fixed-seed xorshift generator, so two packages written
//! with the same options are byte-identical. An output bias over named pieces
//! lets callers steer what the model says without training anything.

use std::path::Path;

use genlm_sampling::SeededRng;
use genlm_tokenizer::Vocabulary;

use crate::artifact::{ArtifactKind, ArtifactWriter};
use crate::config::ArchitectureConfig;
use crate::vision::VISION_ADAPTER;
use crate::weights::{PATCH_FEATURES, VISION_PROJECTION};
use crate::{ModelError, ModelResult};

struct WeightRng(SeededRng);

impl WeightRng {
    fn new(seed: u64) -> Self {
        Self(SeededRng::new(seed))
    }

    /// `n` weights uniform in `[-0.1, 0.1)`.
    fn fill(&mut self, n: usize) -> Vec<f32> {
        (0..n).map(|_| (self.0.next_f32() - 0.5) * 0.2).collect()
    }
}

/// Options for [`write_model`].
#[derive(Debug, Clone)]
pub struct PackageOptions {
    pub vocabulary: Vocabulary,
    pub seed: u64,
    pub n_layers: usize,
    pub max_context: usize,
    pub submodel_layers: Option<usize>,
    pub stop_sequences: Vec<String>,
    /// Added to the logit of the named piece at every position.
    pub output_bias: Vec<(String, f32)>,
    /// Added to the EOS logit at every position.
    pub eos_bias: f32,
    /// Store a `vision.projection` tensor in the model itself.
    pub include_vision: bool,
}

impl Default for PackageOptions {
    fn default() -> Self {
        Self {
            vocabulary: Vocabulary::standard(),
            seed: 12345,
            n_layers: 2,
            max_context: 2048,
            submodel_layers: Some(1),
            stop_sequences: vec![Vocabulary::END_OF_TURN.to_string()],
            output_bias: vec![(Vocabulary::END_OF_TURN.to_string(), -30.0)],
            eos_bias: -30.0,
            include_vision: true,
        }
    }
}

impl PackageOptions {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Bias one piece; biases for the same piece accumulate.
    pub fn with_output_bias(mut self, piece: impl Into<String>, bias: f32) -> Self {
        self.output_bias.push((piece.into(), bias));
        self
    }

    pub fn with_eos_bias(mut self, bias: f32) -> Self {
        self.eos_bias = bias;
        self
    }

    pub fn with_stop_sequences(mut self, stops: Vec<String>) -> Self {
        self.stop_sequences = stops;
        self
    }

    pub fn with_max_context(mut self, max_context: usize) -> Self {
        self.max_context = max_context;
        self
    }

    pub fn without_submodel(mut self) -> Self {
        self.submodel_layers = None;
        self
    }

    pub fn without_vision(mut self) -> Self {
        self.include_vision = false;
        self
    }

    /// Architecture the package will declare.
    pub fn architecture(&self) -> ArchitectureConfig {
        let mut config = ArchitectureConfig::tiny(self.vocabulary.len());
        config.n_layers = self.n_layers;
        config.max_context = self.max_context;
        config.submodel_layers = self.submodel_layers;
        config
    }

    fn output_bias_vector(&self) -> ModelResult<Vec<f32>> {
        let mut bias = vec![0.0f32; self.vocabulary.len()];
        bias[self.vocabulary.special.eos as usize] += self.eos_bias;
        for (piece, value) in &self.output_bias {
            let id = self.vocabulary.id_of(piece).ok_or_else(|| {
                ModelError::InvalidConfig(format!("output bias for unknown piece {piece:?}"))
            })?;
            bias[id as usize] += value;
        }
        Ok(bias)
    }
}

/// Write a complete `model` artifact.
pub fn write_model(path: &Path, options: &PackageOptions) -> ModelResult<()> {
    let config = options.architecture();
    config.validate()?;
    options.vocabulary.validate()?;

    let d = config.d_model;
    let ff = config.d_ff;
    let vocab = config.vocab_size;
    let mut rng = WeightRng::new(options.seed);

    let mut writer = ArtifactWriter::new(ArtifactKind::Model)
        .architecture(config.clone())
        .vocabulary(options.vocabulary.clone())
        .stop_sequences(options.stop_sequences.clone())
        .metadata("generator", "genlm-model synthetic package")
        .metadata("seed", options.seed.to_string())
        .tensor("token_embeddings", &[vocab, d], &rng.fill(vocab * d))?;

    for layer in 0..config.n_layers {
        let name = |suffix: &str| format!("layers.{layer}.{suffix}");
        writer = writer
            .tensor(name("attn_norm"), &[d], &vec![1.0; d])?
            .tensor(name("wq"), &[d, d], &rng.fill(d * d))?
            .tensor(name("wk"), &[d, d], &rng.fill(d * d))?
            .tensor(name("wv"), &[d, d], &rng.fill(d * d))?
            .tensor(name("wo"), &[d, d], &rng.fill(d * d))?
            .tensor(name("mlp_norm"), &[d], &vec![1.0; d])?
            .tensor(name("w_gate"), &[d, ff], &rng.fill(d * ff))?
            .tensor(name("w_up"), &[d, ff], &rng.fill(d * ff))?
            .tensor(name("w_down"), &[ff, d], &rng.fill(ff * d))?;
    }

    writer = writer
        .tensor("final_norm", &[d], &vec![1.0; d])?
        .tensor("lm_head", &[d, vocab], &rng.fill(d * vocab))?
        .tensor("output_bias", &[vocab], &options.output_bias_vector()?)?;

    if options.include_vision {
        writer = writer.tensor(
            VISION_PROJECTION,
            &[PATCH_FEATURES, d],
            &rng.fill(PATCH_FEATURES * d),
        )?;
    }

    writer.write(path)
}

/// Write a standalone `vision_encoder` artifact for a model architecture.
pub fn write_vision_encoder(path: &Path, config: &ArchitectureConfig, seed: u64) -> ModelResult<()> {
    let d = config.d_model;
    let mut rng = WeightRng::new(seed);
    ArtifactWriter::new(ArtifactKind::VisionEncoder)
        .tensor(VISION_PROJECTION, &[PATCH_FEATURES, d], &rng.fill(PATCH_FEATURES * d))?
        .write(path)
}

/// Write a `vision_adapter` artifact holding a `[d, d]` adapter.
pub fn write_vision_adapter(path: &Path, config: &ArchitectureConfig, seed: u64) -> ModelResult<()> {
    let d = config.d_model;
    let mut rng = WeightRng::new(seed);
    ArtifactWriter::new(ArtifactKind::VisionAdapter)
        .tensor(VISION_ADAPTER, &[d, d], &rng.fill(d * d))?
        .write(path)
}

/// Write a `lora` artifact adapting `wq` and `wv` of every layer.
pub fn write_lora(
    path: &Path,
    config: &ArchitectureConfig,
    rank: usize,
    alpha: f32,
    seed: u64,
) -> ModelResult<()> {
    let d = config.d_model;
    let mut rng = WeightRng::new(seed);
    let mut writer = ArtifactWriter::new(ArtifactKind::Lora)
        .metadata("rank", rank.to_string())
        .metadata("alpha", alpha.to_string());

    for layer in 0..config.n_layers {
        for proj in ["wq", "wv"] {
            writer = writer
                .tensor(format!("layers.{layer}.{proj}.lora_a"), &[d, rank], &rng.fill(d * rank))?
                .tensor(format!("layers.{layer}.{proj}.lora_b"), &[rank, d], &rng.fill(rank * d))?;
        }
    }

    writer.write(path)
}
