//! # genlm
//!
//! On-device LLM inference sessions over a single packaged model file.
//!
//! ```no_run
//! use genlm::{Engine, SessionConfig};
//!
//! # fn main() -> genlm::Result<()> {
//! let engine = Engine::load("model.genlm")?;
//! let mut session = engine.create_session(Some(SessionConfig::default().with_random_seed(1)))?;
//! session.add_query_chunk("Hello")?;
//! for chunk in session.generate_response_async() {
//!     print!("{}", chunk?);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The workspace crates are re-exported for callers that need the lower
//! layers: packaging artifacts, running the decoder directly, or plugging in
//! a capability probe.

pub mod factory;

pub use factory::{
    create_engine, create_llm_inference, create_llm_inference_with_config, is_supported,
    EngineSettings,
};
pub use genlm_engine::*;

pub use genlm_kv as kv;
pub use genlm_model as model;
pub use genlm_runtime as runtime;
pub use genlm_sampling as sampling;
pub use genlm_tokenizer as tokenizer;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
