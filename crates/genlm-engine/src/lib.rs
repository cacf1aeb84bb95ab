//! # genlm-engine
//!
//! Loads a packaged model once and runs conversations against it.
//!
//! ```text
//! Engine ──create_session──> Session ──generate_response_async──> ResponseStream
//!   │                          │                                     │
//!   └ shared weights (Arc)     └ KV cache, sampler, pending inputs   └ chunks
//! ```
//!
//! ## Design Notes
//!
//! ### Ownership
//! An [`Engine`] is a cheap handle. Every [`Session`] holds its own reference
//! to the engine's shared state, so the weights outlive all sessions even if
//! the engine handle is dropped first.
//!
//! ### One generation per session
//! Generation borrows the session mutably. Overlapping generations on one
//! session do not compile; parallel work uses several sessions.
//!
//! ### Streaming
//! [`ResponseStream`] is a plain iterator. Nothing is decoded until it is
//! pulled, cancellation is observed between tokens, and a failure is the last
//! item. [`BackgroundGeneration`] runs the same stream on its own thread.
//!
//! ### Blocking after streaming
//! Every generation continues from the session's current state: a stream
//! started after a blocking call sees the earlier response in its context,
//! and vice versa.

pub mod actor;
pub mod config;
pub mod engine;
pub mod error;
pub mod scheduler;
pub mod session;

pub use actor::{BackgroundGeneration, GenerationEvent};
pub use config::{EngineConfig, SessionConfig};
pub use engine::{Engine, EngineBuilder};
pub use error::{LlmError, Result};
pub use scheduler::{CancelHandle, FinishReason, ResponseStream};
pub use session::Session;

pub use genlm_model::Image;
pub use genlm_runtime::{
    Backend, CapabilityProbe, HostProbe, InferenceMetrics, RecordingTelemetry, TelemetryHook,
    UnsupportedHost,
};
