//! # genlm-model
//!
//! Model store and reference forward pass for genlm.
//!
//! Provides:
//! - **Artifact container**: versioned single-file format with a JSON header
//!   and little-endian f32 tensors, memory-mapped on open
//! - **ModelArtifact**: validated architecture, vocabulary, stop sequences and
//!   decoded weights, optionally decoded on a background thread
//! - **Transformer**: pre-norm decoder (RMSNorm, RoPE, attention, SwiGLU)
//!   stepping one position at a time through a `SessionKVCache`
//! - **LoRA** and **vision** adapters layered on top of the base weights
//! - **package**: writer for deterministic synthetic artifacts

pub mod artifact;
pub mod config;
pub mod lora;
pub mod ops;
pub mod package;
pub mod store;
pub mod transformer;
pub mod vision;
pub mod weights;

pub use artifact::{ArtifactFile, ArtifactHeader, ArtifactKind, ArtifactWriter, TensorInfo};
pub use config::ArchitectureConfig;
pub use lora::{LoraAdapter, LoraLayer, LoraWeights};
pub use package::PackageOptions;
pub use store::ModelArtifact;
pub use transformer::{StepInput, Transformer};
pub use vision::{Image, VisionEncoder};
pub use weights::{LayerWeights, ModelWeights};

use genlm_kv::KVError;
use genlm_tokenizer::TokenizerError;

/// Errors from loading artifacts and running the forward pass.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("not a genlm artifact (bad magic)")]
    BadMagic,

    #[error("unsupported artifact format version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("artifact truncated: {0}")]
    Truncated(String),

    #[error("invalid artifact header: {0}")]
    Header(String),

    #[error("header JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected a {expected} artifact, found {found}")]
    WrongKind {
        expected: ArtifactKind,
        found: ArtifactKind,
    },

    #[error("tensor '{0}' not found")]
    MissingTensor(String),

    #[error("unsupported dtype '{dtype}' for tensor '{name}'")]
    UnsupportedDtype { name: String, dtype: String },

    #[error("tensor '{name}' has shape {got:?}, expected {expected:?}")]
    TensorShape {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("shape mismatch in {op}: expected {expected}, got {got}")]
    ShapeMismatch {
        op: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("invalid architecture: {0}")]
    InvalidConfig(String),

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("weight upload failed: {0}")]
    WeightUpload(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(#[from] TokenizerError),

    #[error("kv cache error: {0}")]
    KVCache(#[from] KVError),
}

pub type ModelResult<T> = std::result::Result<T, ModelError>;
