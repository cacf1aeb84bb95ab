//! Engine error type.
//!
//! Every public operation reports failures as one of five kinds. Errors from
//! the lower crates are folded into the kind that matches where they surface:
//! during load they are `InitializationFailed`, during decode
//! `ProcessingFailed`. The blanket `From` impls cover the decode path, which
//! is where `?` is used most.

use genlm_kv::KVError;
use genlm_model::ModelError;
use genlm_runtime::BackendError;
use genlm_sampling::SamplingError;
use genlm_tokenizer::TokenizerError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LlmError {
    /// The host cannot run the engine at all.
    #[error("not supported: {0}")]
    NotSupported(String),
    /// The model artifact could not be opened, parsed or decoded.
    #[error("initialization failed: {0}")]
    InitializationFailed(String),
    /// A caller-supplied value violates a stated constraint.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Session construction or clone failed for reasons other than bad input.
    #[error("session error: {0}")]
    SessionError(String),
    /// Runtime failure during tokenization or decode.
    #[error("processing failed: {0}")]
    ProcessingFailed(String),
}

pub type Result<T> = std::result::Result<T, LlmError>;

impl LlmError {
    pub(crate) fn initialization(err: impl std::fmt::Display) -> Self {
        LlmError::InitializationFailed(err.to_string())
    }

    pub(crate) fn session(err: impl std::fmt::Display) -> Self {
        LlmError::SessionError(err.to_string())
    }
}

impl From<TokenizerError> for LlmError {
    fn from(err: TokenizerError) -> Self {
        LlmError::ProcessingFailed(format!("tokenizer: {err}"))
    }
}

impl From<SamplingError> for LlmError {
    fn from(err: SamplingError) -> Self {
        LlmError::ProcessingFailed(format!("sampling: {err}"))
    }
}

impl From<KVError> for LlmError {
    fn from(err: KVError) -> Self {
        LlmError::ProcessingFailed(format!("kv cache: {err}"))
    }
}

impl From<ModelError> for LlmError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::InvalidImage(msg) => LlmError::InvalidInput(msg),
            other => LlmError::ProcessingFailed(other.to_string()),
        }
    }
}

impl From<BackendError> for LlmError {
    fn from(err: BackendError) -> Self {
        LlmError::NotSupported(err.to_string())
    }
}
