//! Generation timing.
//!
//! An [`InferenceTimer`] follows one generation from prefill to the final
//! token and reports an [`InferenceMetrics`] summary to the engine's
//! [`TelemetryHook`].

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::backend::Backend;

/// Summary of one finished generation.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceMetrics {
    pub backend: Backend,
    /// Session the generation ran in.
    pub session: String,
    /// Positions committed during prefill.
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    /// Time from the first pull until prefill finished.
    pub prefill: Duration,
    pub total: Duration,
}

impl InferenceMetrics {
    /// Decode time, excluding prefill.
    pub fn decode(&self) -> Duration {
        self.total.saturating_sub(self.prefill)
    }

    /// Decode throughput. Zero when nothing was generated.
    pub fn tokens_per_sec(&self) -> f64 {
        let secs = self.decode().as_secs_f64();
        if self.generated_tokens == 0 || secs <= 0.0 {
            return 0.0;
        }
        self.generated_tokens as f64 / secs
    }
}

/// Receives generation events. Every method defaults to doing nothing.
pub trait TelemetryHook: Send + Sync {
    fn on_prefill_complete(&self, _session: &str, _prompt_tokens: usize, _elapsed: Duration) {}

    fn on_generation_complete(&self, _metrics: &InferenceMetrics) {}
}

/// Keeps every reported summary.
#[derive(Debug, Clone, Default)]
pub struct RecordingTelemetry {
    reports: Arc<Mutex<Vec<InferenceMetrics>>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_metrics(&self) -> Option<InferenceMetrics> {
        self.reports.lock().ok()?.last().cloned()
    }

    /// Number of generations reported so far.
    pub fn completed(&self) -> usize {
        self.reports.lock().map_or(0, |reports| reports.len())
    }

    /// Summaries reported for one session, oldest first.
    pub fn for_session(&self, session: &str) -> Vec<InferenceMetrics> {
        self.reports
            .lock()
            .map(|reports| {
                reports
                    .iter()
                    .filter(|m| m.session == session)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl TelemetryHook for RecordingTelemetry {
    fn on_generation_complete(&self, metrics: &InferenceMetrics) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push(metrics.clone());
        }
    }
}

/// Logs summaries through `tracing`. The engine's default hook.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetryHook for TracingTelemetry {
    fn on_prefill_complete(&self, session: &str, prompt_tokens: usize, elapsed: Duration) {
        tracing::trace!(session, prompt_tokens, ?elapsed, "prefill complete");
    }

    fn on_generation_complete(&self, metrics: &InferenceMetrics) {
        tracing::debug!(
            session = %metrics.session,
            backend = %metrics.backend,
            prompt_tokens = metrics.prompt_tokens,
            generated_tokens = metrics.generated_tokens,
            prefill_ms = metrics.prefill.as_millis() as u64,
            tokens_per_sec = metrics.tokens_per_sec(),
            "generation timing"
        );
    }
}

/// Times one generation.
pub struct InferenceTimer {
    backend: Backend,
    session: String,
    prompt_tokens: usize,
    start: Instant,
    prefill: Option<Duration>,
    generated: usize,
    hook: Arc<dyn TelemetryHook>,
}

impl InferenceTimer {
    pub fn new(
        backend: Backend,
        session: impl Into<String>,
        prompt_tokens: usize,
        hook: Arc<dyn TelemetryHook>,
    ) -> Self {
        Self {
            backend,
            session: session.into(),
            prompt_tokens,
            start: Instant::now(),
            prefill: None,
            generated: 0,
            hook,
        }
    }

    pub fn mark_prefill_complete(&mut self) {
        let elapsed = self.start.elapsed();
        self.prefill = Some(elapsed);
        self.hook
            .on_prefill_complete(&self.session, self.prompt_tokens, elapsed);
    }

    pub fn mark_token(&mut self) {
        self.generated += 1;
    }

    pub fn generated_tokens(&self) -> usize {
        self.generated
    }

    /// Build the summary and hand it to the hook.
    pub fn finish(self) -> InferenceMetrics {
        let metrics = InferenceMetrics {
            backend: self.backend,
            session: self.session,
            prompt_tokens: self.prompt_tokens,
            generated_tokens: self.generated,
            prefill: self.prefill.unwrap_or_default(),
            total: self.start.elapsed(),
        };
        self.hook.on_generation_complete(&metrics);
        metrics
    }
}
