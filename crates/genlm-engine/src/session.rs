//! Sessions: one conversation's inputs, decode state and sampler.
//!
//! Inputs are tokenised (or encoded, for images) as soon as they are added
//! and wait in a pending queue. Generation first commits the pending
//! positions to the KV cache, then decodes. `history` always mirrors the
//! committed KV positions one to one.

use std::collections::VecDeque;
use std::sync::Arc;

use genlm_kv::SessionKVCache;
use genlm_model::{Image, LoraWeights, StepInput, Transformer};
use genlm_runtime::{InferenceMetrics, InferenceTimer};
use genlm_sampling::Sampler;
use genlm_tokenizer::{TokenId, Tokenizer};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::engine::EngineInner;
use crate::error::{LlmError, Result};
use crate::scheduler::{CancelHandle, FinishReason, ResponseStream};

/// Input waiting to be prefilled.
#[derive(Debug, Clone)]
enum PendingInput {
    Tokens(Vec<TokenId>),
    /// One soft-token embedding per image position.
    Image(Vec<Vec<f32>>),
}

impl PendingInput {
    fn len(&self) -> usize {
        match self {
            PendingInput::Tokens(tokens) => tokens.len(),
            PendingInput::Image(embeddings) => embeddings.len(),
        }
    }

    fn skip(&mut self, n: usize) {
        match self {
            PendingInput::Tokens(tokens) => {
                tokens.drain(..n);
            }
            PendingInput::Image(embeddings) => {
                embeddings.drain(..n);
            }
        }
    }

    /// Model input and history id for each position.
    fn positions(
        &self,
        image_id: TokenId,
    ) -> Box<dyn Iterator<Item = (StepInput<'_>, TokenId)> + '_> {
        match self {
            PendingInput::Tokens(tokens) => {
                Box::new(tokens.iter().map(|&t| (StepInput::Token(t), t)))
            }
            PendingInput::Image(embeddings) => Box::new(
                embeddings
                    .iter()
                    .map(move |e| (StepInput::Embedding(e), image_id)),
            ),
        }
    }
}

/// Drop the first `n` positions from the queue.
fn drop_positions(pending: &mut VecDeque<PendingInput>, mut n: usize) {
    while n > 0 {
        let Some(front) = pending.front_mut() else {
            break;
        };
        let len = front.len();
        if len <= n {
            pending.pop_front();
            n -= len;
        } else {
            front.skip(n);
            n = 0;
        }
    }
}

/// Outcome of one decode step.
pub(crate) enum DecodeStep {
    /// A token was committed; its text.
    Token(String),
    Finished(FinishReason),
}

/// Everything a failed blocking generation must put back.
struct Checkpoint {
    committed: usize,
    pending: VecDeque<PendingInput>,
    pending_tokens: usize,
    sampler: Sampler,
    last_logits: Option<Vec<f32>>,
}

/// A conversation with its own KV cache and sampler.
///
/// Sessions are `Send` but not shared: every mutating call takes
/// `&mut self`, so one session runs at most one generation at a time.
pub struct Session {
    id: Uuid,
    engine: Arc<EngineInner>,
    config: SessionConfig,
    kv: SessionKVCache,
    history: Vec<TokenId>,
    pending: VecDeque<PendingInput>,
    pending_tokens: usize,
    images: usize,
    sampler: Sampler,
    /// Logits after the last committed position; `None` until a prefill
    /// finishes.
    last_logits: Option<Vec<f32>>,
    lora: Option<Arc<LoraWeights>>,
    last_metrics: Option<InferenceMetrics>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("committed", &self.history.len())
            .field("pending", &self.pending_tokens)
            .field("images", &self.images)
            .finish()
    }
}

fn build_sampler(config: &SessionConfig, engine: &EngineInner) -> Sampler {
    Sampler::new()
        .with_temperature(config.temperature)
        .with_top_k(config.top_k)
        .with_top_p(config.top_p)
        .with_seed(config.random_seed)
        .with_suppressed_tokens(
            engine
                .tokenizer
                .control_tokens()
                .into_iter()
                .map(|t| t as usize),
        )
}

impl Session {
    pub(crate) fn new(engine: Arc<EngineInner>, config: Option<SessionConfig>) -> Result<Self> {
        let config = config.unwrap_or_else(|| engine.config.default_session_config());
        config.validate(engine.config.max_top_k)?;

        // Blocks on a deferred weight upload.
        engine.weights().map_err(LlmError::session)?;

        if config.enable_vision_modality {
            let encoder = engine.vision().map_err(LlmError::session)?;
            if encoder.is_none() {
                return Err(LlmError::SessionError(
                    "vision modality requested but the engine has no vision encoder".to_string(),
                ));
            }
        }

        let arch = engine.artifact.config();
        let lora = config
            .lora_path
            .as_deref()
            .map(|path| LoraWeights::load(path, arch))
            .transpose()
            .map_err(LlmError::session)?
            .map(Arc::new);

        let kv = SessionKVCache::try_new(
            engine.active_layers,
            engine.config.max_tokens,
            arch.n_heads,
            arch.head_dim,
        )
        .map_err(LlmError::session)?;

        let sampler = build_sampler(&config, &engine);
        let id = Uuid::new_v4();
        info!(
            session = %id,
            top_k = config.top_k,
            top_p = config.top_p,
            temperature = config.temperature,
            seed = config.random_seed,
            lora = lora.is_some(),
            vision = config.enable_vision_modality,
            kv_bytes = kv.memory_bytes(),
            "session created"
        );

        Ok(Self {
            id,
            engine,
            config,
            kv,
            history: Vec::new(),
            pending: VecDeque::new(),
            pending_tokens: 0,
            images: 0,
            sampler,
            last_logits: None,
            lora,
            last_metrics: None,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Queue a text chunk for the next generation.
    pub fn add_query_chunk(&mut self, text: &str) -> Result<()> {
        if text.is_empty() {
            return Err(LlmError::InvalidInput("query chunk is empty".to_string()));
        }
        let tokens = self.engine.tokenizer.encode(text)?;
        self.check_budget(tokens.len())?;
        debug!(session = %self.id, tokens = tokens.len(), "query chunk queued");
        self.pending_tokens += tokens.len();
        self.pending.push_back(PendingInput::Tokens(tokens));
        Ok(())
    }

    /// Queue an image. Requires a vision-enabled session.
    pub fn add_image(&mut self, image: &Image) -> Result<()> {
        if !self.config.enable_vision_modality {
            return Err(LlmError::InvalidInput(
                "vision modality is not enabled for this session".to_string(),
            ));
        }
        if self.images >= self.engine.config.max_images {
            return Err(LlmError::InvalidInput(format!(
                "session already holds the maximum of {} images",
                self.engine.config.max_images
            )));
        }
        let encoder = self
            .engine
            .vision()
            .map_err(|e| LlmError::ProcessingFailed(e.to_string()))?
            .ok_or_else(|| {
                LlmError::ProcessingFailed("vision encoder is unavailable".to_string())
            })?;
        self.check_budget(encoder.tokens_per_image())?;

        let embeddings = encoder.encode(image)?;
        debug!(
            session = %self.id,
            width = image.width(),
            height = image.height(),
            tokens = embeddings.len(),
            "image queued"
        );
        self.pending_tokens += embeddings.len();
        self.pending.push_back(PendingInput::Image(embeddings));
        self.images += 1;
        Ok(())
    }

    /// Tokens `text` would occupy. Does not touch session state.
    pub fn size_in_tokens(&self, text: &str) -> Result<usize> {
        Ok(self.engine.tokenizer.encode(text)?.len())
    }

    /// Generate a complete response.
    ///
    /// On error the session is restored to its state before the call.
    pub fn generate_response(&mut self) -> Result<String> {
        let checkpoint = self.checkpoint();
        let result = ResponseStream::new(&mut *self).collect::<Result<String>>();
        if let Err(err) = &result {
            debug!(session = %self.id, error = %err, "restoring session after failed generation");
            self.restore(checkpoint);
        }
        result
    }

    /// Stream the response chunk by chunk. Nothing runs until the first pull.
    pub fn generate_response_async(&mut self) -> ResponseStream<&mut Session> {
        ResponseStream::new(self)
    }

    /// Stream the response, cancellable through an existing handle.
    pub fn generate_response_with_cancel(
        &mut self,
        cancel: CancelHandle,
    ) -> ResponseStream<&mut Session> {
        ResponseStream::with_cancel(self, cancel)
    }

    /// Deep copy with a fresh id. The copy shares only the engine.
    pub fn clone_session(&self) -> Result<Session> {
        let kv = self
            .kv
            .try_clone()
            .map_err(|e| LlmError::ProcessingFailed(format!("cannot copy session state: {e}")))?;
        let id = Uuid::new_v4();
        debug!(source = %self.id, session = %id, tokens = self.token_count(), "session cloned");
        Ok(Session {
            id,
            engine: Arc::clone(&self.engine),
            config: self.config.clone(),
            kv,
            history: self.history.clone(),
            pending: self.pending.clone(),
            pending_tokens: self.pending_tokens,
            images: self.images,
            sampler: self.sampler.clone(),
            last_logits: self.last_logits.clone(),
            lora: self.lora.clone(),
            last_metrics: None,
        })
    }

    /// Committed plus pending tokens.
    pub fn token_count(&self) -> usize {
        self.history.len() + self.pending_tokens
    }

    pub fn committed_tokens(&self) -> usize {
        self.history.len()
    }

    pub fn pending_tokens(&self) -> usize {
        self.pending_tokens
    }

    /// Tokens still available before `max_tokens`.
    pub fn remaining_tokens(&self) -> usize {
        self.engine
            .config
            .max_tokens
            .saturating_sub(self.token_count())
    }

    pub fn image_count(&self) -> usize {
        self.images
    }

    /// Committed token ids; image positions appear as the image placeholder.
    pub fn history(&self) -> &[TokenId] {
        &self.history
    }

    /// Timing of the most recent finished generation.
    pub fn last_metrics(&self) -> Option<&InferenceMetrics> {
        self.last_metrics.as_ref()
    }

    fn check_budget(&self, extra: usize) -> Result<()> {
        let max = self.engine.config.max_tokens;
        let total = self.token_count() + extra;
        if total > max {
            return Err(LlmError::InvalidInput(format!(
                "input of {extra} tokens would bring the session to {total}, over max_tokens {max}"
            )));
        }
        Ok(())
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            committed: self.history.len(),
            pending: self.pending.clone(),
            pending_tokens: self.pending_tokens,
            sampler: self.sampler.clone(),
            last_logits: self.last_logits.clone(),
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint) {
        self.kv.truncate(checkpoint.committed);
        self.history.truncate(checkpoint.committed);
        self.pending = checkpoint.pending;
        self.pending_tokens = checkpoint.pending_tokens;
        self.sampler = checkpoint.sampler;
        self.last_logits = checkpoint.last_logits;
    }

    // --- generation primitives used by the response stream ---

    pub(crate) fn stop_sequences(&self) -> &[String] {
        self.engine.artifact.stop_sequences()
    }

    /// Whether there is anything to generate from.
    pub(crate) fn has_context(&self) -> bool {
        !self.history.is_empty() || self.pending_tokens > 0
    }

    pub(crate) fn start_timer(&self) -> InferenceTimer {
        InferenceTimer::new(
            self.engine.backend.active(),
            self.id.to_string(),
            self.pending_tokens,
            Arc::clone(&self.engine.telemetry),
        )
    }

    pub(crate) fn set_last_metrics(&mut self, metrics: InferenceMetrics) {
        self.last_metrics = Some(metrics);
    }

    /// Commit every pending position, `sequence_batch_size` at a time.
    ///
    /// Stops early, leaving the rest pending, if `cancel` is set between
    /// batches or a step fails. Positions already processed stay committed.
    pub(crate) fn prefill(&mut self, cancel: &CancelHandle) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let engine = Arc::clone(&self.engine);
        let lora = self.lora.clone();
        let model = Transformer::new(engine.artifact.config(), engine.weights()?)
            .with_lora(lora.as_deref());
        let special = engine.tokenizer.special_tokens();
        let image_id = special.image.unwrap_or(special.pad);
        let batch = engine.config.sequence_batch_size;
        let total = self.pending_tokens;

        let pending = std::mem::take(&mut self.pending);
        let mut done = 0;
        let mut outcome: Result<()> = Ok(());
        for (input, id) in pending.iter().flat_map(|p| p.positions(image_id)) {
            if done % batch == 0 {
                if cancel.is_cancelled() {
                    debug!(session = %self.id, done, total, "prefill cancelled");
                    break;
                }
                if done > 0 {
                    debug!(session = %self.id, done, total, "prefill batch");
                }
            }

            let step = if done + 1 == total {
                model.forward(input, &mut self.kv).map(Some)
            } else {
                model.advance(input, &mut self.kv).map(|()| None)
            };
            match step {
                Ok(logits) => {
                    self.history.push(id);
                    self.last_logits = logits;
                    done += 1;
                }
                Err(err) => {
                    outcome = Err(err.into());
                    break;
                }
            }
        }

        self.pending = pending;
        drop_positions(&mut self.pending, done);
        self.pending_tokens -= done;
        outcome
    }

    /// Sample one token from the last logits and commit it.
    pub(crate) fn decode_step(&mut self) -> Result<DecodeStep> {
        if self.history.len() >= self.engine.config.max_tokens {
            return Ok(DecodeStep::Finished(FinishReason::MaxTokens));
        }

        let logits = self.last_logits.as_deref().ok_or_else(|| {
            LlmError::ProcessingFailed("no logits for the last committed position".to_string())
        })?;
        let token = self.sampler.sample(logits)? as TokenId;

        let engine = Arc::clone(&self.engine);
        if token == engine.tokenizer.special_tokens().eos {
            return Ok(DecodeStep::Finished(FinishReason::Eos));
        }

        let lora = self.lora.clone();
        let model = Transformer::new(engine.artifact.config(), engine.weights()?)
            .with_lora(lora.as_deref());
        let logits = model.forward(StepInput::Token(token), &mut self.kv)?;
        self.history.push(token);
        self.last_logits = Some(logits);

        Ok(DecodeStep::Token(engine.tokenizer.piece(token)?.to_string()))
    }
}
