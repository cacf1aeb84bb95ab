//! Generation scheduling: the pull-based response stream.
//!
//! A [`ResponseStream`] does no work until it is pulled. The first pull
//! prefills pending inputs; every further pull decodes tokens until one
//! produces visible text or a stop condition is reached. Cancellation is
//! checked between tokens (and between prefill batches), never inside one.

use std::borrow::BorrowMut;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use genlm_runtime::InferenceTimer;
use tracing::debug;

use crate::error::{LlmError, Result};
use crate::session::{DecodeStep, Session};

/// Why a generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The model sampled end-of-sequence.
    Eos,
    /// The session reached `max_tokens`.
    MaxTokens,
    /// An engine stop sequence appeared in the output.
    StopSequence,
    /// The consumer cancelled before a natural stop.
    Cancelled,
}

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub(crate) enum StopScan {
    /// Text that can no longer be part of a stop sequence.
    Emit(String),
    /// A stop sequence matched; the text before it is final.
    Stop(String),
}

/// Finds stop sequences in streamed text, holding back any suffix that could
/// still grow into one.
#[derive(Debug, Clone)]
pub(crate) struct StopMatcher {
    stops: Vec<String>,
    held: String,
}

impl StopMatcher {
    pub(crate) fn new(stops: impl IntoIterator<Item = String>) -> Self {
        Self {
            stops: stops.into_iter().filter(|s| !s.is_empty()).collect(),
            held: String::new(),
        }
    }

    pub(crate) fn push(&mut self, piece: &str) -> StopScan {
        self.held.push_str(piece);

        let first_match = self
            .stops
            .iter()
            .filter_map(|stop| self.held.find(stop.as_str()))
            .min();
        if let Some(at) = first_match {
            let text = self.held[..at].to_string();
            self.held.clear();
            return StopScan::Stop(text);
        }

        let split = self.held.len() - self.partial_suffix_len();
        let text: String = self.held.drain(..split).collect();
        StopScan::Emit(text)
    }

    /// Release held text once no more input will arrive.
    pub(crate) fn flush(&mut self) -> String {
        std::mem::take(&mut self.held)
    }

    /// Length of the longest suffix of `held` that begins some stop sequence.
    fn partial_suffix_len(&self) -> usize {
        self.held
            .char_indices()
            .map(|(i, _)| i)
            .find(|&i| {
                let suffix = &self.held[i..];
                self.stops.iter().any(|stop| stop.starts_with(suffix))
            })
            .map_or(0, |i| self.held.len() - i)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Decoding,
    Done,
}

/// Finite, non-restartable stream of response chunks.
///
/// `S` is either `&mut Session` (from [`Session::generate_response_async`])
/// or an owned [`Session`] (from the engine's one-shot helper). A decode
/// failure is yielded once as an `Err`, after which the stream is exhausted.
/// Chunks already yielded stay committed to the session.
pub struct ResponseStream<S: BorrowMut<Session>> {
    session: S,
    cancel: CancelHandle,
    matcher: StopMatcher,
    timer: Option<InferenceTimer>,
    phase: Phase,
    finish: Option<FinishReason>,
}

impl<S: BorrowMut<Session>> ResponseStream<S> {
    pub(crate) fn new(session: S) -> Self {
        Self::with_cancel(session, CancelHandle::new())
    }

    pub(crate) fn with_cancel(session: S, cancel: CancelHandle) -> Self {
        let matcher = StopMatcher::new(session.borrow().stop_sequences().iter().cloned());
        Self {
            session,
            cancel,
            matcher,
            timer: None,
            phase: Phase::Idle,
            finish: None,
        }
    }

    /// Stop at the next token boundary. Held-back text is discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Handle that cancels this stream from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Set once the stream is exhausted without error.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish
    }

    pub fn session(&self) -> &Session {
        self.session.borrow()
    }

    fn start(&mut self) -> Result<()> {
        let session = self.session.borrow_mut();
        if !session.has_context() {
            return Err(LlmError::InvalidInput(
                "nothing to respond to: add a query chunk or image first".to_string(),
            ));
        }
        let mut timer = session.start_timer();
        session.prefill(&self.cancel)?;
        timer.mark_prefill_complete();
        self.timer = Some(timer);
        Ok(())
    }

    fn complete(&mut self, reason: FinishReason) {
        self.phase = Phase::Done;
        self.finish = Some(reason);
        let session = self.session.borrow_mut();
        let generated = self.timer.as_ref().map_or(0, |t| t.generated_tokens());
        if let Some(timer) = self.timer.take() {
            session.set_last_metrics(timer.finish());
        }
        debug!(
            session = %session.id(),
            ?reason,
            generated,
            tokens = session.token_count(),
            "generation finished"
        );
    }

    fn fail(&mut self, err: LlmError) -> LlmError {
        self.phase = Phase::Done;
        self.timer = None;
        debug!(session = %self.session.borrow().id(), error = %err, "generation failed");
        err
    }
}

impl<S: BorrowMut<Session>> Iterator for ResponseStream<S> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.phase {
            Phase::Done => return None,
            Phase::Idle => {
                self.phase = Phase::Decoding;
                if let Err(err) = self.start() {
                    return Some(Err(self.fail(err)));
                }
            }
            Phase::Decoding => {}
        }

        loop {
            if self.cancel.is_cancelled() {
                self.complete(FinishReason::Cancelled);
                return None;
            }

            let step = match self.session.borrow_mut().decode_step() {
                Ok(step) => step,
                Err(err) => return Some(Err(self.fail(err))),
            };

            match step {
                DecodeStep::Finished(reason) => {
                    let rest = self.matcher.flush();
                    self.complete(reason);
                    return (!rest.is_empty()).then_some(Ok(rest));
                }
                DecodeStep::Token(piece) => {
                    if let Some(timer) = self.timer.as_mut() {
                        timer.mark_token();
                    }
                    match self.matcher.push(&piece) {
                        StopScan::Emit(text) if text.is_empty() => continue,
                        StopScan::Emit(text) => return Some(Ok(text)),
                        StopScan::Stop(text) => {
                            self.complete(FinishReason::StopSequence);
                            return (!text.is_empty()).then_some(Ok(text));
                        }
                    }
                }
            }
        }
    }
}

impl<S: BorrowMut<Session>> Drop for ResponseStream<S> {
    fn drop(&mut self) {
        if self.phase == Phase::Decoding {
            self.complete(FinishReason::Cancelled);
        }
    }
}
