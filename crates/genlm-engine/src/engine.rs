//! The loaded model and the factory for sessions.
//!
//! An [`Engine`] is a cheap handle around shared, read-only state. Sessions
//! keep their own reference to that state, so the weights stay alive until
//! the last session created from the engine is dropped.

use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use genlm_model::{ArchitectureConfig, ModelArtifact, ModelResult, ModelWeights, VisionEncoder};
use genlm_runtime::{
    Backend, BackendSelector, CapabilityProbe, HostProbe, KernelOp, TelemetryHook,
    TracingTelemetry,
};
use genlm_tokenizer::VocabTokenizer;
use tracing::{info, warn};

use crate::config::{EngineConfig, SessionConfig};
use crate::error::{LlmError, Result};
use crate::scheduler::ResponseStream;
use crate::session::Session;

/// State shared by an engine and every session it created.
pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) artifact: ModelArtifact,
    pub(crate) tokenizer: VocabTokenizer,
    pub(crate) backend: BackendSelector,
    pub(crate) telemetry: Arc<dyn TelemetryHook>,
    /// Decoder layers each session runs (all, or the submodel prefix).
    pub(crate) active_layers: usize,
    vision: OnceLock<Option<VisionEncoder>>,
}

impl EngineInner {
    pub(crate) fn weights(&self) -> ModelResult<&ModelWeights> {
        self.artifact.weights()
    }

    /// Vision encoder, assembled on first use once weights are available.
    /// `None` for text-only models and hosts without the projection kernel.
    pub(crate) fn vision(&self) -> ModelResult<Option<&VisionEncoder>> {
        if let Some(encoder) = self.vision.get() {
            return Ok(encoder.as_ref());
        }
        if !self.backend.supports_vision() {
            return Ok(self.vision.get_or_init(|| None).as_ref());
        }
        let encoder = VisionEncoder::assemble(
            self.artifact.config(),
            self.weights()?,
            self.config.vision_encoder_path.as_deref(),
            self.config.vision_adapter_path.as_deref(),
        )?;
        Ok(self.vision.get_or_init(|| encoder).as_ref())
    }
}

impl std::fmt::Debug for EngineInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineInner")
            .field("config", &self.config)
            .field("artifact", &self.artifact)
            .field("backend", &self.backend.active())
            .field("active_layers", &self.active_layers)
            .finish()
    }
}

/// A loaded model, shareable across threads.
#[derive(Debug, Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

/// Configures how an engine is constructed.
pub struct EngineBuilder {
    config: EngineConfig,
    probe: Box<dyn CapabilityProbe>,
    telemetry: Arc<dyn TelemetryHook>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            probe: Box::new(HostProbe),
            telemetry: Arc::new(TracingTelemetry),
        }
    }

    /// Replace the host capability probe.
    pub fn probe(mut self, probe: impl CapabilityProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    /// Hook notified of every generation's timing.
    pub fn telemetry(mut self, hook: Arc<dyn TelemetryHook>) -> Self {
        self.telemetry = hook;
        self
    }

    pub fn build(self) -> Result<Engine> {
        let config = self.config;
        config.validate()?;

        let backend = BackendSelector::probe(self.probe.as_ref()).map_err(|err| {
            warn!(probe = self.probe.name(), error = %err, "host rejected");
            LlmError::from(err)
        })?;

        let wants_vision =
            config.vision_encoder_path.is_some() || config.vision_adapter_path.is_some();
        if wants_vision && !backend.supports_vision() {
            return Err(LlmError::NotSupported(format!(
                "backend {} has no {} kernel",
                backend.active(),
                KernelOp::VisionProjection
            )));
        }

        let start = Instant::now();
        let path = config.model_path.as_path();
        let loaded = if config.wait_for_weight_uploads {
            ModelArtifact::load(path)
        } else {
            ModelArtifact::load_deferred(path)
        };
        let artifact = loaded.map_err(|err| {
            warn!(path = %path.display(), error = %err, "model load failed");
            LlmError::initialization(err)
        })?;

        let arch = artifact.config();
        if config.max_tokens > arch.max_context {
            return Err(LlmError::InitializationFailed(format!(
                "max_tokens {} exceeds the model context of {}",
                config.max_tokens, arch.max_context
            )));
        }
        let active_layers = arch
            .active_layers(config.use_submodel)
            .map_err(LlmError::initialization)?;
        let tokenizer =
            VocabTokenizer::new(artifact.vocabulary().clone()).map_err(LlmError::initialization)?;

        let inner = EngineInner {
            config,
            artifact,
            tokenizer,
            backend,
            telemetry: self.telemetry,
            active_layers,
            vision: OnceLock::new(),
        };

        if inner.config.wait_for_weight_uploads {
            inner.vision().map_err(|err| {
                warn!(error = %err, "vision encoder unavailable");
                LlmError::initialization(err)
            })?;
        }

        info!(
            path = %inner.config.model_path.display(),
            backend = %inner.backend.active(),
            layers = inner.active_layers,
            vocab = inner.artifact.config().vocab_size,
            max_tokens = inner.config.max_tokens,
            weights_ready = inner.artifact.is_uploaded(),
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "engine loaded"
        );

        Ok(Engine {
            inner: Arc::new(inner),
        })
    }
}

impl Engine {
    /// Load a model with default limits.
    pub fn load(model_path: impl AsRef<Path>) -> Result<Self> {
        Self::load_with_config(EngineConfig::new(model_path.as_ref()))
    }

    pub fn load_with_config(config: EngineConfig) -> Result<Self> {
        EngineBuilder::new(config).build()
    }

    /// Load after checking the host with a custom probe.
    pub fn load_with_probe(
        config: EngineConfig,
        probe: impl CapabilityProbe + 'static,
    ) -> Result<Self> {
        EngineBuilder::new(config).probe(probe).build()
    }

    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Start a session. `None` uses [`EngineConfig::default_session_config`].
    pub fn create_session(&self, config: Option<SessionConfig>) -> Result<Session> {
        Session::new(Arc::clone(&self.inner), config)
    }

    /// Whether the backend can run text generation and the model's weights
    /// are usable. Waits for a deferred upload to finish.
    pub fn is_supported(&self) -> bool {
        self.inner.backend.supports_text() && self.inner.artifact.is_usable()
    }

    /// One-shot generation in a throwaway default session.
    pub fn generate_response(&self, text: &str) -> Result<String> {
        let mut session = self.create_session(None)?;
        session.add_query_chunk(text)?;
        session.generate_response()
    }

    /// Streaming one-shot generation. The stream owns its session.
    pub fn generate_response_async(&self, text: &str) -> Result<ResponseStream<Session>> {
        let mut session = self.create_session(None)?;
        session.add_query_chunk(text)?;
        Ok(ResponseStream::new(session))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn architecture(&self) -> &ArchitectureConfig {
        self.inner.artifact.config()
    }

    pub fn tokenizer(&self) -> &VocabTokenizer {
        &self.inner.tokenizer
    }

    pub fn backend(&self) -> Backend {
        self.inner.backend.active()
    }

    /// Strings that end a response when they appear in the output.
    pub fn stop_sequences(&self) -> &[String] {
        self.inner.artifact.stop_sequences()
    }

    /// Whether weights have finished decoding.
    pub fn weights_ready(&self) -> bool {
        self.inner.artifact.is_uploaded()
    }

    /// Decoder layers each session runs.
    pub fn active_layers(&self) -> usize {
        self.inner.active_layers
    }
}
