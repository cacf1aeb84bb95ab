//! Generation on a dedicated thread.
//!
//! ```text
//! ┌─────────────┐   rendezvous channel   ┌─────────────────────┐
//! │  caller     │ <──── Chunk/Done ──────│ generation thread   │
//! │             │ ───── cancel flag ────>│ owns the Session    │
//! └─────────────┘                        └─────────────────────┘
//! ```
//!
//! The channel has no buffer, so the thread decodes the next chunk only
//! after the previous one was received. Dropping the handle cancels the
//! generation at the next token boundary and joins the thread.

use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::debug;

use crate::error::{LlmError, Result};
use crate::scheduler::{CancelHandle, FinishReason};
use crate::session::Session;

/// Events sent from the generation thread.
#[derive(Debug, Clone)]
pub enum GenerationEvent {
    /// Next piece of response text.
    Chunk(String),
    /// Generation stopped; no more events follow.
    Done(FinishReason),
    /// Decode failed; no more events follow.
    Error(LlmError),
}

/// Handle to a session generating on its own thread.
///
/// Iterating yields the same chunks as [`Session::generate_response_async`].
pub struct BackgroundGeneration {
    events: Option<Receiver<GenerationEvent>>,
    cancel: CancelHandle,
    thread: Option<thread::JoinHandle<Session>>,
    finish: Option<FinishReason>,
}

impl BackgroundGeneration {
    /// Move `session` to a new thread and start generating.
    pub fn spawn(session: Session) -> Result<Self> {
        let (event_tx, event_rx) = bounded::<GenerationEvent>(0);
        let cancel = CancelHandle::new();
        let flag = cancel.clone();

        let thread = thread::Builder::new()
            .name("genlm-generation".into())
            .spawn(move || generation_loop(session, flag, event_tx))
            .map_err(|e| {
                LlmError::ProcessingFailed(format!("cannot spawn generation thread: {e}"))
            })?;

        Ok(Self {
            events: Some(event_rx),
            cancel,
            thread: Some(thread),
            finish: None,
        })
    }

    /// Receive the next event (blocking). `None` once the thread is done.
    pub fn recv(&mut self) -> Option<GenerationEvent> {
        let event = self.events.as_ref()?.recv().ok()?;
        self.observe(&event);
        Some(event)
    }

    /// Receive with timeout. `None` on timeout or once the thread is done.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<GenerationEvent> {
        match self.events.as_ref()?.recv_timeout(timeout) {
            Ok(event) => {
                self.observe(&event);
                Some(event)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Stop at the next token boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Set once a `Done` event has been received.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish
    }

    /// Cancel whatever is left of the generation and take the session back.
    pub fn join(mut self) -> Result<Session> {
        self.shutdown()
            .ok_or_else(|| LlmError::ProcessingFailed("generation thread panicked".to_string()))
    }

    fn observe(&mut self, event: &GenerationEvent) {
        if let GenerationEvent::Done(reason) = event {
            self.finish = Some(*reason);
        }
    }

    fn shutdown(&mut self) -> Option<Session> {
        self.cancel.cancel();
        // A blocked send fails once the receiver is gone.
        self.events = None;
        self.thread.take()?.join().ok()
    }
}

impl Iterator for BackgroundGeneration {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.recv()? {
                GenerationEvent::Chunk(text) => return Some(Ok(text)),
                GenerationEvent::Error(err) => return Some(Err(err)),
                GenerationEvent::Done(_) => continue,
            }
        }
    }
}

impl Drop for BackgroundGeneration {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shutdown();
        }
    }
}

fn generation_loop(
    mut session: Session,
    cancel: CancelHandle,
    events: Sender<GenerationEvent>,
) -> Session {
    let id = session.id();
    {
        let mut stream = session.generate_response_with_cancel(cancel);
        while let Some(item) = stream.next() {
            let event = match item {
                Ok(text) => GenerationEvent::Chunk(text),
                Err(err) => GenerationEvent::Error(err),
            };
            if events.send(event).is_err() {
                debug!(session = %id, "receiver dropped, cancelling generation");
                break;
            }
        }
        if let Some(reason) = stream.finish_reason() {
            let _ = events.send(GenerationEvent::Done(reason));
        }
    }
    session
}
