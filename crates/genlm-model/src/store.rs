//! Model store: opening `model` artifacts and owning their decoded weights.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Instant;

use genlm_tokenizer::Vocabulary;

use crate::artifact::{ArtifactFile, ArtifactKind};
use crate::config::ArchitectureConfig;
use crate::weights::ModelWeights;
use crate::{ModelError, ModelResult};

enum Upload {
    Idle,
    Running(JoinHandle<ModelResult<ModelWeights>>),
    Failed(String),
}

/// An immutable, validated model.
///
/// Header data (architecture, vocabulary, stop sequences) is available as
/// soon as the artifact opens. Weights are either decoded during
/// [`ModelArtifact::load`] or on a background thread started by
/// [`ModelArtifact::load_deferred`]; [`ModelArtifact::weights`] waits for
/// that thread the first time it is called.
pub struct ModelArtifact {
    path: PathBuf,
    config: ArchitectureConfig,
    vocabulary: Vocabulary,
    stop_sequences: Vec<String>,
    metadata: BTreeMap<String, String>,
    weights: OnceLock<ModelWeights>,
    upload: Mutex<Upload>,
}

impl std::fmt::Debug for ModelArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelArtifact")
            .field("path", &self.path)
            .field("config", &self.config)
            .field("vocab_size", &self.vocabulary.len())
            .field("stop_sequences", &self.stop_sequences)
            .field("uploaded", &self.is_uploaded())
            .finish()
    }
}

impl ModelArtifact {
    /// Open and fully decode a model artifact.
    pub fn load(path: &Path) -> ModelResult<Self> {
        let start = Instant::now();
        let (artifact, file) = Self::open(path)?;
        let weights = ModelWeights::decode(&file, &artifact.config)?;
        tracing::debug!(
            path = %path.display(),
            bytes = weights.memory_bytes(),
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "weights decoded"
        );
        let _ = artifact.weights.set(weights);
        Ok(artifact)
    }

    /// Open and validate a model artifact, decoding weights in the background.
    pub fn load_deferred(path: &Path) -> ModelResult<Self> {
        let (artifact, file) = Self::open(path)?;
        let config = artifact.config.clone();
        let path_display = path.display().to_string();

        let handle = std::thread::Builder::new()
            .name("genlm-weight-upload".to_string())
            .spawn(move || {
                let start = Instant::now();
                let weights = ModelWeights::decode(&file, &config);
                tracing::debug!(
                    path = %path_display,
                    ok = weights.is_ok(),
                    elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "background weight upload finished"
                );
                weights
            })
            .map_err(|e| ModelError::WeightUpload(format!("failed to spawn upload thread: {e}")))?;

        if let Ok(mut upload) = artifact.upload.lock() {
            *upload = Upload::Running(handle);
        }
        Ok(artifact)
    }

    fn open(path: &Path) -> ModelResult<(Self, ArtifactFile)> {
        let file = ArtifactFile::open_kind(path, ArtifactKind::Model)?;
        let header = file.header();

        let config = header
            .architecture
            .clone()
            .ok_or_else(|| ModelError::Header("model artifact has no architecture".to_string()))?;
        config.validate()?;

        let vocabulary = header
            .vocabulary
            .clone()
            .ok_or_else(|| ModelError::Header("model artifact has no vocabulary".to_string()))?;
        vocabulary.validate()?;
        if vocabulary.len() != config.vocab_size {
            return Err(ModelError::InvalidConfig(format!(
                "vocab_size {} but the vocabulary has {} pieces",
                config.vocab_size,
                vocabulary.len()
            )));
        }

        if header.stop_sequences.iter().any(String::is_empty) {
            return Err(ModelError::Header("empty stop sequence".to_string()));
        }

        ModelWeights::check_layout(&file, &config)?;

        let artifact = Self {
            path: path.to_path_buf(),
            config,
            vocabulary,
            stop_sequences: header.stop_sequences.clone(),
            metadata: header.metadata.clone(),
            weights: OnceLock::new(),
            upload: Mutex::new(Upload::Idle),
        };
        Ok((artifact, file))
    }

    /// Decoded weights, waiting for a background upload if one is running.
    pub fn weights(&self) -> ModelResult<&ModelWeights> {
        if let Some(weights) = self.weights.get() {
            return Ok(weights);
        }

        let mut upload = self
            .upload
            .lock()
            .map_err(|_| ModelError::WeightUpload("upload state poisoned".to_string()))?;

        // Another caller may have finished the join while we waited for the lock.
        if let Some(weights) = self.weights.get() {
            return Ok(weights);
        }

        match std::mem::replace(&mut *upload, Upload::Idle) {
            Upload::Running(handle) => {
                let joined = handle
                    .join()
                    .map_err(|_| ModelError::WeightUpload("upload thread panicked".to_string()))
                    .and_then(|result| result);
                match joined {
                    Ok(weights) => Ok(self.weights.get_or_init(|| weights)),
                    Err(err) => {
                        *upload = Upload::Failed(err.to_string());
                        Err(err)
                    }
                }
            }
            Upload::Failed(message) => {
                *upload = Upload::Failed(message.clone());
                Err(ModelError::WeightUpload(message))
            }
            Upload::Idle => Err(ModelError::WeightUpload(
                "weights were never scheduled for upload".to_string(),
            )),
        }
    }

    /// Whether weights are decoded and ready without blocking.
    pub fn is_uploaded(&self) -> bool {
        self.weights.get().is_some()
    }

    /// Whether weights are available for inference. Waits for a running
    /// background upload; a failed upload stays unusable.
    pub fn is_usable(&self) -> bool {
        self.weights().is_ok()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &ArchitectureConfig {
        &self.config
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    pub fn stop_sequences(&self) -> &[String] {
        &self.stop_sequences
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}
