//! Engine and session configuration.
//!
//! Both structs deserialize from JSON with per-field defaults, so a config
//! file only needs to name what differs. Neither is checked on construction:
//! call `validate()` (the engine does so before touching the filesystem).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LlmError, Result};

/// Engine-wide limits and model location. Immutable once the engine is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path to the packaged model artifact.
    pub model_path: PathBuf,

    /// Context budget per session: prompt plus generated tokens.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Images a single session may hold.
    #[serde(default = "default_max_images")]
    pub max_images: usize,

    /// Upper bound for `SessionConfig::top_k`.
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,

    /// Temperature used by default session configs.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Decode weights before `load` returns. When false, decoding runs on a
    /// background thread and the first session waits for it.
    #[serde(default = "default_true")]
    pub wait_for_weight_uploads: bool,

    /// Run only the leading `submodel_layers` decoder layers.
    #[serde(default)]
    pub use_submodel: bool,

    /// Prefill positions processed between cancellation checks.
    #[serde(default = "default_sequence_batch_size")]
    pub sequence_batch_size: usize,

    /// Standalone vision encoder artifact, overriding the model's own.
    #[serde(default)]
    pub vision_encoder_path: Option<PathBuf>,

    /// Vision adapter artifact applied after projection.
    #[serde(default)]
    pub vision_adapter_path: Option<PathBuf>,
}

fn default_max_tokens() -> usize {
    1024
}
fn default_max_images() -> usize {
    4
}
fn default_max_top_k() -> usize {
    40
}
fn default_temperature() -> f32 {
    0.8
}
fn default_true() -> bool {
    true
}
fn default_sequence_batch_size() -> usize {
    1
}

impl EngineConfig {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            max_tokens: default_max_tokens(),
            max_images: default_max_images(),
            max_top_k: default_max_top_k(),
            temperature: default_temperature(),
            wait_for_weight_uploads: true,
            use_submodel: false,
            sequence_batch_size: default_sequence_batch_size(),
            vision_encoder_path: None,
            vision_adapter_path: None,
        }
    }

    /// Read a JSON config file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            LlmError::InvalidInput(format!("cannot read config {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            LlmError::InvalidInput(format!("malformed config {}: {e}", path.display()))
        })
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_max_images(mut self, max_images: usize) -> Self {
        self.max_images = max_images;
        self
    }

    pub fn with_max_top_k(mut self, max_top_k: usize) -> Self {
        self.max_top_k = max_top_k;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_wait_for_weight_uploads(mut self, wait: bool) -> Self {
        self.wait_for_weight_uploads = wait;
        self
    }

    pub fn with_submodel(mut self, use_submodel: bool) -> Self {
        self.use_submodel = use_submodel;
        self
    }

    pub fn with_sequence_batch_size(mut self, size: usize) -> Self {
        self.sequence_batch_size = size;
        self
    }

    pub fn with_vision_encoder(mut self, path: impl Into<PathBuf>) -> Self {
        self.vision_encoder_path = Some(path.into());
        self
    }

    pub fn with_vision_adapter(mut self, path: impl Into<PathBuf>) -> Self {
        self.vision_adapter_path = Some(path.into());
        self
    }

    /// Check numeric limits. Performs no I/O.
    pub fn validate(&self) -> Result<()> {
        if self.model_path.as_os_str().is_empty() {
            return Err(LlmError::InvalidInput("model_path is empty".to_string()));
        }
        if self.max_tokens == 0 {
            return Err(LlmError::InvalidInput("max_tokens must be > 0".to_string()));
        }
        if self.max_top_k == 0 {
            return Err(LlmError::InvalidInput("max_top_k must be > 0".to_string()));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(LlmError::InvalidInput(format!(
                "temperature must be finite and >= 0, got {}",
                self.temperature
            )));
        }
        if self.sequence_batch_size == 0 {
            return Err(LlmError::InvalidInput(
                "sequence_batch_size must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Session config used when `create_session` is given `None`.
    pub fn default_session_config(&self) -> SessionConfig {
        SessionConfig {
            top_k: default_top_k().min(self.max_top_k),
            temperature: self.temperature,
            ..SessionConfig::default()
        }
    }
}

/// Per-session sampling parameters and optional extras.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default)]
    pub random_seed: u64,

    /// LoRA adapter applied on top of the engine weights for this session only.
    #[serde(default)]
    pub lora_path: Option<PathBuf>,

    #[serde(default)]
    pub enable_vision_modality: bool,
}

fn default_top_k() -> usize {
    40
}
fn default_top_p() -> f32 {
    0.9
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            top_p: default_top_p(),
            temperature: default_temperature(),
            random_seed: 0,
            lora_path: None,
            enable_vision_modality: false,
        }
    }
}

impl SessionConfig {
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_random_seed(mut self, seed: u64) -> Self {
        self.random_seed = seed;
        self
    }

    pub fn with_lora(mut self, path: impl Into<PathBuf>) -> Self {
        self.lora_path = Some(path.into());
        self
    }

    pub fn with_vision(mut self, enabled: bool) -> Self {
        self.enable_vision_modality = enabled;
        self
    }

    /// Check sampling ranges against the engine's `max_top_k`.
    pub fn validate(&self, max_top_k: usize) -> Result<()> {
        if self.top_k == 0 || self.top_k > max_top_k {
            return Err(LlmError::InvalidInput(format!(
                "top_k must be in 1..={max_top_k}, got {}",
                self.top_k
            )));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(LlmError::InvalidInput(format!(
                "top_p must be in [0, 1], got {}",
                self.top_p
            )));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(LlmError::InvalidInput(format!(
                "temperature must be finite and >= 0, got {}",
                self.temperature
            )));
        }
        Ok(())
    }
}
