//! Free-function constructors for hosts that only need the common paths.
//!
//! These wrap [`Engine`] construction; anything beyond a model path and the
//! two headline limits goes through [`EngineConfig`] directly.

use std::path::{Path, PathBuf};

use genlm_engine::{Engine, EngineConfig, Result};
use genlm_runtime::{BackendSelector, CapabilityProbe, HostProbe};

/// Minimal engine settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub model_path: PathBuf,
    pub max_tokens: usize,
    pub max_images: usize,
}

impl EngineSettings {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            max_tokens: 1024,
            max_images: 4,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_max_images(mut self, max_images: usize) -> Self {
        self.max_images = max_images;
        self
    }
}

impl From<EngineSettings> for EngineConfig {
    fn from(settings: EngineSettings) -> Self {
        EngineConfig::new(settings.model_path)
            .with_max_tokens(settings.max_tokens)
            .with_max_images(settings.max_images)
    }
}

/// Load a model with default limits.
pub fn create_llm_inference(model_path: impl AsRef<Path>) -> Result<Engine> {
    Engine::load(model_path)
}

pub fn create_llm_inference_with_config(config: EngineConfig) -> Result<Engine> {
    Engine::load_with_config(config)
}

pub fn create_engine(settings: EngineSettings) -> Result<Engine> {
    Engine::load_with_config(settings.into())
}

/// Whether this host can run text generation at all.
pub fn is_supported() -> bool {
    probe_supports_text(&HostProbe)
}

fn probe_supports_text(probe: &dyn CapabilityProbe) -> bool {
    match BackendSelector::probe(probe) {
        Ok(selector) => selector.supports_text(),
        Err(err) => {
            tracing::debug!(probe = probe.name(), error = %err, "host not supported");
            false
        }
    }
}
