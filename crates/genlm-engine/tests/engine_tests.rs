//! Integration tests for genlm-engine.
//!
//! Validates:
//! - Engine construction: limit checks before I/O, load failures, host capability checks
//! - Session inputs: budgets, images, purity of size_in_tokens
//! - Generation: stop conditions, stop-sequence hold-back, rollback on failure
//! - Streaming: equivalence with blocking generation, cancellation
//! - Clones, LoRA, submodel, deferred upload, background generation

use std::path::{Path, PathBuf};
use std::sync::Arc;

use genlm_engine::*;
use genlm_model::package::{self, PackageOptions};
use genlm_tokenizer::Vocabulary;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

struct Fixture {
    dir: TempDir,
    model: PathBuf,
}

impl Fixture {
    fn new(options: PackageOptions) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.genlm");
        package::write_model(&model, &options).unwrap();
        Self { dir, model }
    }

    fn config(&self, max_tokens: usize) -> EngineConfig {
        EngineConfig::new(&self.model).with_max_tokens(max_tokens)
    }

    fn engine(&self, max_tokens: usize) -> Engine {
        Engine::load_with_config(self.config(max_tokens)).unwrap()
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

/// A model whose every greedy step emits "Hello".
fn forced_hello() -> PackageOptions {
    PackageOptions::default().with_output_bias("Hello", 50.0)
}

fn greedy() -> SessionConfig {
    SessionConfig::default().with_temperature(0.0)
}

fn stream_text(stream: impl Iterator<Item = Result<String>>) -> String {
    stream.map(|chunk| chunk.unwrap()).collect()
}

// ---------------------------------------------------------------------------
// Engine construction
// ---------------------------------------------------------------------------

#[test]
fn invalid_limits_fail_before_io() {
    let missing = Path::new("/definitely/not/here/model.genlm");
    for config in [
        EngineConfig::new(missing).with_max_tokens(0),
        EngineConfig::new(missing).with_max_top_k(0),
        EngineConfig::new(missing).with_temperature(-0.5),
    ] {
        // InvalidInput rather than InitializationFailed: the file was never opened.
        assert!(matches!(
            Engine::load_with_config(config),
            Err(LlmError::InvalidInput(_))
        ));
    }
}

#[test]
fn missing_and_corrupt_models_fail_initialization() {
    let fixture = Fixture::new(PackageOptions::default());
    assert!(matches!(
        Engine::load(fixture.path("absent.genlm")),
        Err(LlmError::InitializationFailed(_))
    ));

    let garbage = fixture.path("garbage.genlm");
    std::fs::write(&garbage, b"this is not a model artifact at all").unwrap();
    assert!(matches!(
        Engine::load(&garbage),
        Err(LlmError::InitializationFailed(_))
    ));
}

#[test]
fn oversized_tensor_shape_fails_initialization() {
    let fixture = Fixture::new(PackageOptions::default());
    let header = r#"{"kind":"model","tensors":{"huge":{"dtype":"F32","shape":[4294967296,4294967296],"data_offsets":[0,0]}}}"#;
    let mut bytes = b"GENLMPK\0".to_vec();
    bytes.extend_from_slice(&1u32.to_le_bytes());
    bytes.extend_from_slice(&(header.len() as u64).to_le_bytes());
    bytes.extend_from_slice(header.as_bytes());

    let path = fixture.path("huge.genlm");
    std::fs::write(&path, bytes).unwrap();
    assert!(matches!(
        Engine::load(&path),
        Err(LlmError::InitializationFailed(_))
    ));
}

#[test]
fn version_mismatch_fails_fast() {
    let fixture = Fixture::new(PackageOptions::default());
    let mut bytes = std::fs::read(&fixture.model).unwrap();
    bytes[8..12].copy_from_slice(&2u32.to_le_bytes());
    let future = fixture.path("future.genlm");
    std::fs::write(&future, bytes).unwrap();

    match Engine::load(&future) {
        Err(LlmError::InitializationFailed(msg)) => assert!(msg.contains("version 2"), "{msg}"),
        other => panic!("expected InitializationFailed, got {other:?}"),
    }
}

#[test]
fn max_tokens_beyond_model_context_is_rejected() {
    let fixture = Fixture::new(PackageOptions::default().with_max_context(32));
    assert!(matches!(
        Engine::load_with_config(fixture.config(64)),
        Err(LlmError::InitializationFailed(_))
    ));
    assert!(Engine::load_with_config(fixture.config(32)).is_ok());
}

#[test]
fn unsupported_host_is_reported() {
    let fixture = Fixture::new(PackageOptions::default());
    let err = Engine::load_with_probe(fixture.config(32), UnsupportedHost::new("no fp32 units"))
        .unwrap_err();
    assert!(matches!(&err, LlmError::NotSupported(msg) if msg.contains("no fp32 units")));
}

struct TextOnlyHost;

impl CapabilityProbe for TextOnlyHost {
    fn name(&self) -> &str {
        "text-only"
    }

    fn backend(&self) -> std::result::Result<Backend, genlm_runtime::BackendError> {
        Ok(Backend::Cpu)
    }

    fn matrix(&self) -> genlm_runtime::KernelMatrix {
        genlm_runtime::KernelMatrix::full(Backend::Cpu)
            .without(Backend::Cpu, genlm_runtime::KernelOp::VisionProjection)
    }
}

#[test]
fn text_only_host_refuses_vision() {
    let fixture = Fixture::new(PackageOptions::default());
    let encoder = fixture.path("encoder.genlm");
    package::write_vision_encoder(&encoder, &PackageOptions::default().architecture(), 3)
        .unwrap();

    let err = Engine::load_with_probe(fixture.config(32).with_vision_encoder(&encoder), TextOnlyHost)
        .unwrap_err();
    assert!(matches!(err, LlmError::NotSupported(_)));

    let engine = Engine::load_with_probe(fixture.config(32), TextOnlyHost).unwrap();
    assert!(engine.is_supported());
    let err = engine
        .create_session(Some(SessionConfig::default().with_vision(true)))
        .unwrap_err();
    assert!(matches!(err, LlmError::SessionError(_)));
    assert!(engine.create_session(None).is_ok());
}

#[test]
fn loaded_engine_reports_support() {
    let fixture = Fixture::new(PackageOptions::default());
    let engine = fixture.engine(32);
    assert!(engine.is_supported());
    assert_eq!(engine.backend(), Backend::Cpu);
    assert_eq!(engine.stop_sequences(), &[Vocabulary::END_OF_TURN.to_string()]);
    assert_eq!(engine.active_layers(), engine.architecture().n_layers);
}

#[test]
fn config_file_round_trip() {
    let fixture = Fixture::new(PackageOptions::default());
    let path = fixture.path("engine.json");
    let json = format!(
        r#"{{"model_path": {:?}, "max_tokens": 40, "sequence_batch_size": 4}}"#,
        fixture.model.display().to_string()
    );
    std::fs::write(&path, json).unwrap();

    let config = EngineConfig::from_json_file(&path).unwrap();
    assert_eq!(config.max_tokens, 40);
    assert_eq!(config.sequence_batch_size, 4);
    assert_eq!(config.max_images, 4);
    let engine = Engine::load_with_config(config).unwrap();
    assert_eq!(engine.config().max_tokens, 40);

    std::fs::write(&path, "{ not json").unwrap();
    assert!(matches!(
        EngineConfig::from_json_file(&path),
        Err(LlmError::InvalidInput(_))
    ));
}

// ---------------------------------------------------------------------------
// Session inputs
// ---------------------------------------------------------------------------

#[test]
fn hello_example_stays_within_budget() {
    let fixture = Fixture::new(PackageOptions::default());
    let engine =
        Engine::load_with_config(fixture.config(50).with_max_top_k(40)).unwrap();
    let mut session = engine.create_session(None).unwrap();

    session.add_query_chunk("Hello").unwrap();
    let response = session.generate_response().unwrap();

    assert!(!response.is_empty());
    assert!(session.token_count() <= 50);
    assert_eq!(session.pending_tokens(), 0);
}

#[test]
fn invalid_session_configs_are_rejected() {
    let fixture = Fixture::new(PackageOptions::default());
    let engine = fixture.engine(32);
    for config in [
        SessionConfig::default().with_top_k(0),
        SessionConfig::default().with_top_k(41),
        SessionConfig::default().with_top_p(1.01),
        SessionConfig::default().with_temperature(-1.0),
    ] {
        assert!(matches!(
            engine.create_session(Some(config)),
            Err(LlmError::InvalidInput(_))
        ));
    }
}

#[test]
fn size_in_tokens_is_pure() {
    let fixture = Fixture::new(PackageOptions::default());
    let engine = fixture.engine(32);
    let mut session = engine.create_session(None).unwrap();
    session.add_query_chunk("Hi").unwrap();

    let first = session.size_in_tokens("Hello world, Hello").unwrap();
    let second = session.size_in_tokens("Hello world, Hello").unwrap();
    assert_eq!(first, 4);
    assert_eq!(first, second);
    assert_eq!(session.token_count(), 1);
}

#[test]
fn empty_chunk_and_empty_session_are_invalid() {
    let fixture = Fixture::new(PackageOptions::default());
    let engine = fixture.engine(32);
    let mut session = engine.create_session(None).unwrap();

    assert!(matches!(
        session.add_query_chunk(""),
        Err(LlmError::InvalidInput(_))
    ));
    assert!(matches!(
        session.generate_response(),
        Err(LlmError::InvalidInput(_))
    ));
    assert_eq!(session.token_count(), 0);
}

#[test]
fn uncovered_text_without_unk_is_processing_failed() {
    let mut options = PackageOptions::default();
    options.vocabulary.special.unk = None;
    let fixture = Fixture::new(options);
    let engine = fixture.engine(32);
    let mut session = engine.create_session(None).unwrap();

    session.add_query_chunk("Hello").unwrap();
    let before = session.token_count();
    assert!(matches!(
        session.add_query_chunk("\u{1f600}"),
        Err(LlmError::ProcessingFailed(_))
    ));
    assert_eq!(session.token_count(), before);
    assert!(session.generate_response().is_ok());
}

#[test]
fn over_budget_chunk_fails_and_leaves_session_usable() {
    let fixture = Fixture::new(forced_hello());
    let engine = fixture.engine(16);
    let mut session = engine.create_session(Some(greedy())).unwrap();

    // "Hello world" is two tokens.
    let mut accepted = 0;
    let err = loop {
        match session.add_query_chunk("Hello world") {
            Ok(()) => accepted += 1,
            Err(err) => break err,
        }
    };
    assert!(matches!(err, LlmError::InvalidInput(_)));
    assert_eq!(accepted, 8);
    assert_eq!(session.token_count(), 16);

    // The budget is full, so the response is empty but the call succeeds.
    assert_eq!(session.generate_response().unwrap(), "");
    assert_eq!(session.committed_tokens(), 16);
    assert_eq!(session.remaining_tokens(), 0);
}

#[test]
fn images_require_vision_modality() {
    let fixture = Fixture::new(PackageOptions::default());
    let engine = fixture.engine(64);
    let mut session = engine.create_session(None).unwrap();
    let image = Image::solid(8, 8, [200, 10, 10]).unwrap();

    for _ in 0..3 {
        assert!(matches!(
            session.add_image(&image),
            Err(LlmError::InvalidInput(_))
        ));
    }
    assert_eq!(session.image_count(), 0);
    assert_eq!(session.token_count(), 0);
}

#[test]
fn image_limit_and_malformed_images() {
    let fixture = Fixture::new(PackageOptions::default());
    let engine = Engine::load_with_config(fixture.config(64).with_max_images(1)).unwrap();
    let mut session = engine
        .create_session(Some(greedy().with_vision(true)))
        .unwrap();
    let tokens_per_image = engine.architecture().image_tokens;

    // Smaller than the patch grid.
    let tiny = Image::solid(1, 1, [0, 0, 0]).unwrap();
    assert!(matches!(session.add_image(&tiny), Err(LlmError::InvalidInput(_))));
    assert_eq!(session.image_count(), 0);

    let image = Image::solid(8, 8, [0, 128, 255]).unwrap();
    session.add_image(&image).unwrap();
    assert_eq!(session.image_count(), 1);
    assert_eq!(session.token_count(), tokens_per_image);

    assert!(matches!(session.add_image(&image), Err(LlmError::InvalidInput(_))));
    assert_eq!(session.image_count(), 1);
    assert_eq!(session.token_count(), tokens_per_image);

    session.add_query_chunk("What is this").unwrap();
    session.generate_response().unwrap();
    assert!(session.committed_tokens() > tokens_per_image);
}

#[test]
fn vision_on_text_only_model_is_a_session_error() {
    let fixture = Fixture::new(PackageOptions::default().without_vision());
    let engine = fixture.engine(32);
    assert!(matches!(
        engine.create_session(Some(SessionConfig::default().with_vision(true))),
        Err(LlmError::SessionError(_))
    ));
    assert!(engine.create_session(None).is_ok());
}

#[test]
fn external_vision_encoder_and_adapter() {
    let fixture = Fixture::new(PackageOptions::default().without_vision());
    let arch = PackageOptions::default().architecture();
    let encoder = fixture.path("encoder.genlm");
    let adapter = fixture.path("adapter.genlm");
    package::write_vision_encoder(&encoder, &arch, 3).unwrap();
    package::write_vision_adapter(&adapter, &arch, 4).unwrap();

    let engine = Engine::load_with_config(
        fixture
            .config(64)
            .with_vision_encoder(&encoder)
            .with_vision_adapter(&adapter),
    )
    .unwrap();
    let mut session = engine
        .create_session(Some(greedy().with_vision(true)))
        .unwrap();
    session.add_image(&Image::solid(4, 4, [1, 2, 3]).unwrap()).unwrap();
    session.add_query_chunk("Hi").unwrap();
    session.generate_response().unwrap();

    let broken = Engine::load_with_config(
        fixture.config(64).with_vision_encoder(fixture.path("missing.genlm")),
    );
    assert!(matches!(broken, Err(LlmError::InitializationFailed(_))));
}

// ---------------------------------------------------------------------------
// Stop conditions
// ---------------------------------------------------------------------------

#[test]
fn max_tokens_bounds_generation() {
    let fixture = Fixture::new(forced_hello());
    let engine = fixture.engine(10);
    let mut session = engine.create_session(Some(greedy())).unwrap();
    session.add_query_chunk("Hi").unwrap();

    let mut stream = session.generate_response_async();
    let text = stream_text(stream.by_ref());
    assert_eq!(stream.finish_reason(), Some(FinishReason::MaxTokens));
    drop(stream);

    assert_eq!(text, "Hello".repeat(9));
    assert_eq!(session.committed_tokens(), 10);
}

#[test]
fn eos_ends_generation_without_text() {
    let fixture = Fixture::new(PackageOptions::default().with_eos_bias(50.0));
    let engine = fixture.engine(32);
    let mut session = engine.create_session(Some(greedy())).unwrap();
    session.add_query_chunk("Hello").unwrap();

    let mut stream = session.generate_response_async();
    assert!(stream.next().is_none());
    assert_eq!(stream.finish_reason(), Some(FinishReason::Eos));
    drop(stream);

    // EOS is not committed.
    assert_eq!(session.committed_tokens(), 1);
}

#[test]
fn stop_sequence_is_dropped_and_text_before_it_kept() {
    // "Hello" + "Hello" contains "lloHe"; "He" precedes it.
    let options = forced_hello().with_stop_sequences(vec!["lloHe".to_string()]);
    let fixture = Fixture::new(options);
    let engine = fixture.engine(32);
    let mut session = engine.create_session(Some(greedy())).unwrap();
    session.add_query_chunk("Hi").unwrap();

    let mut stream = session.generate_response_async();
    let chunks: Vec<String> = stream.by_ref().map(|c| c.unwrap()).collect();
    assert_eq!(chunks, vec!["He".to_string()]);
    assert_eq!(stream.finish_reason(), Some(FinishReason::StopSequence));
    drop(stream);
    assert_eq!(session.committed_tokens(), 3);
}

#[test]
fn held_back_text_is_flushed_at_max_tokens() {
    // Every response ends in "llo", which could still start "lloX".
    let options = forced_hello().with_stop_sequences(vec!["lloX".to_string()]);
    let fixture = Fixture::new(options);
    let engine = fixture.engine(6);
    let mut session = engine.create_session(Some(greedy())).unwrap();
    session.add_query_chunk("Hi").unwrap();

    assert_eq!(session.generate_response().unwrap(), "Hello".repeat(5));
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

#[test]
fn stream_concatenation_matches_blocking_output() {
    let fixture = Fixture::new(PackageOptions::default());
    let engine = fixture.engine(48);
    let config = SessionConfig::default().with_random_seed(7);

    let mut blocking = engine.create_session(Some(config.clone())).unwrap();
    blocking.add_query_chunk("Hello").unwrap();
    let expected = blocking.generate_response().unwrap();

    let mut streaming = engine.create_session(Some(config)).unwrap();
    streaming.add_query_chunk("Hello").unwrap();
    let streamed = stream_text(streaming.generate_response_async());

    assert_eq!(streamed, expected);
    assert_eq!(streaming.history(), blocking.history());
}

#[test]
fn cancelled_stream_leaves_session_usable() {
    let fixture = Fixture::new(PackageOptions::default());
    let engine = fixture.engine(64);
    let mut session = engine.create_session(None).unwrap();
    session.add_query_chunk("Hello").unwrap();

    let mut stream = session.generate_response_async();
    let first = stream.next().unwrap().unwrap();
    assert!(!first.is_empty());
    stream.cancel();
    assert!(stream.next().is_none());
    assert!(stream.next().is_none());
    assert_eq!(stream.finish_reason(), Some(FinishReason::Cancelled));
    drop(stream);

    let committed = session.committed_tokens();
    assert!(committed > 1 && committed < 64);
    assert_eq!(session.token_count(), committed);

    session.add_query_chunk(" and").unwrap();
    session.generate_response().unwrap();
    assert_eq!(session.committed_tokens(), 64);
}

#[test]
fn cancel_before_first_pull_does_nothing() {
    let fixture = Fixture::new(PackageOptions::default());
    let engine = fixture.engine(32);
    let mut session = engine.create_session(None).unwrap();
    session.add_query_chunk("Hello world").unwrap();

    let cancel = CancelHandle::new();
    cancel.cancel();
    let mut stream = session.generate_response_with_cancel(cancel);
    assert!(stream.next().is_none());
    assert_eq!(stream.finish_reason(), Some(FinishReason::Cancelled));
    drop(stream);

    assert_eq!(session.committed_tokens(), 0);
    assert_eq!(session.pending_tokens(), 2);
}

#[test]
fn dropped_stream_is_inert() {
    let fixture = Fixture::new(PackageOptions::default());
    let engine = fixture.engine(32);
    let mut session = engine.create_session(None).unwrap();
    session.add_query_chunk("Hello").unwrap();

    drop(session.generate_response_async());
    assert_eq!(session.committed_tokens(), 0);
    assert_eq!(session.pending_tokens(), 1);
}

#[test]
fn stream_after_blocking_continues_the_conversation() {
    // Three "Hello"s in a row are a stop sequence, so each response commits
    // three tokens and returns nothing.
    let options = forced_hello().with_stop_sequences(vec!["HelloHelloHello".to_string()]);
    let fixture = Fixture::new(options);
    let engine = fixture.engine(32);
    let mut session = engine.create_session(Some(greedy())).unwrap();

    session.add_query_chunk("Hi").unwrap();
    assert_eq!(session.generate_response().unwrap(), "");
    assert_eq!(session.committed_tokens(), 4);

    session.add_query_chunk("Hi").unwrap();
    let mut stream = session.generate_response_async();
    assert!(stream.next().is_none());
    assert_eq!(stream.finish_reason(), Some(FinishReason::StopSequence));
    drop(stream);
    assert_eq!(session.committed_tokens(), 8);

    // A stream with no new input keeps decoding from where it stopped.
    assert_eq!(stream_text(session.generate_response_async()), "");
    assert_eq!(session.committed_tokens(), 11);
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[test]
fn blocking_failure_restores_the_session() {
    let fixture = Fixture::new(PackageOptions::default().with_output_bias("Hello", f32::INFINITY));
    let engine = fixture.engine(32);
    let mut session = engine.create_session(None).unwrap();
    session.add_query_chunk("Hi there").unwrap();
    let pending = session.pending_tokens();

    let err = session.generate_response().unwrap_err();
    assert!(matches!(err, LlmError::ProcessingFailed(_)), "{err}");
    assert_eq!(session.committed_tokens(), 0);
    assert_eq!(session.pending_tokens(), pending);
}

#[test]
fn streaming_failure_is_terminal_and_keeps_committed_work() {
    let fixture = Fixture::new(PackageOptions::default().with_output_bias("Hello", f32::INFINITY));
    let engine = fixture.engine(32);
    let mut session = engine.create_session(None).unwrap();
    session.add_query_chunk("Hi there").unwrap();
    let prompt = session.pending_tokens();

    let mut stream = session.generate_response_async();
    assert!(matches!(stream.next(), Some(Err(LlmError::ProcessingFailed(_)))));
    assert!(stream.next().is_none());
    assert_eq!(stream.finish_reason(), None);
    drop(stream);

    assert_eq!(session.committed_tokens(), prompt);
    assert_eq!(session.pending_tokens(), 0);
}

// ---------------------------------------------------------------------------
// Clones and isolation
// ---------------------------------------------------------------------------

#[test]
fn mutating_a_clone_does_not_affect_the_source() {
    let fixture = Fixture::new(PackageOptions::default());
    let engine = fixture.engine(48);
    let mut source = engine
        .create_session(Some(SessionConfig::default().with_random_seed(3)))
        .unwrap();
    source.add_query_chunk("Hello").unwrap();

    let baseline = source.clone_session().unwrap().generate_response().unwrap();

    let mut clone = source.clone_session().unwrap();
    assert_ne!(clone.id(), source.id());
    clone.add_query_chunk(" world").unwrap();
    clone.generate_response().unwrap();

    assert_eq!(source.generate_response().unwrap(), baseline);
}

#[test]
fn clone_after_generation_copies_decode_state() {
    let fixture = Fixture::new(PackageOptions::default());
    let engine = fixture.engine(64);
    let mut source = engine.create_session(None).unwrap();
    source.add_query_chunk("Hello").unwrap();
    source.generate_response_async().take(2).for_each(drop);

    let mut clone = source.clone_session().unwrap();
    assert_eq!(clone.history(), source.history());
    assert_eq!(
        clone.generate_response().unwrap(),
        source.generate_response().unwrap()
    );
}

#[test]
fn sessions_outlive_the_engine_handle() {
    let fixture = Fixture::new(forced_hello());
    let engine = fixture.engine(5);
    let mut session = engine.create_session(Some(greedy())).unwrap();
    drop(engine);

    session.add_query_chunk("Hi").unwrap();
    assert_eq!(session.generate_response().unwrap(), "Hello".repeat(4));
}

#[test]
fn sessions_generate_in_parallel() {
    let fixture = Fixture::new(PackageOptions::default());
    let engine = fixture.engine(32);

    let outputs: Vec<String> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let engine = &engine;
                scope.spawn(move || {
                    let mut session = engine.create_session(None).unwrap();
                    session.add_query_chunk("Hello").unwrap();
                    session.generate_response().unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(outputs.windows(2).all(|w| w[0] == w[1]));
}

// ---------------------------------------------------------------------------
// Engine options
// ---------------------------------------------------------------------------

#[test]
fn deferred_upload_matches_eager_load() {
    let fixture = Fixture::new(PackageOptions::default());
    let eager = fixture.engine(32);
    let deferred =
        Engine::load_with_config(fixture.config(32).with_wait_for_weight_uploads(false)).unwrap();

    let run = |engine: &Engine| {
        let mut session = engine.create_session(None).unwrap();
        session.add_query_chunk("Hello").unwrap();
        session.generate_response().unwrap()
    };
    assert_eq!(run(&deferred), run(&eager));
    assert!(deferred.weights_ready());
}

#[test]
fn deferred_engine_reports_support_once_weights_land() {
    let fixture = Fixture::new(PackageOptions::default());
    let engine =
        Engine::load_with_config(fixture.config(32).with_wait_for_weight_uploads(false)).unwrap();
    assert!(engine.is_supported());
    assert!(engine.weights_ready());
}

#[test]
fn submodel_runs_fewer_layers() {
    let fixture = Fixture::new(PackageOptions::default());
    let engine = Engine::load_with_config(fixture.config(32).with_submodel(true)).unwrap();
    assert_eq!(engine.active_layers(), 1);
    assert!(engine.generate_response("Hello").is_ok());

    let no_submodel = Fixture::new(PackageOptions::default().without_submodel());
    assert!(matches!(
        Engine::load_with_config(no_submodel.config(32).with_submodel(true)),
        Err(LlmError::InitializationFailed(_))
    ));
}

#[test]
fn prefill_batch_size_does_not_change_output() {
    let fixture = Fixture::new(PackageOptions::default());
    let run = |batch: usize| {
        let engine =
            Engine::load_with_config(fixture.config(48).with_sequence_batch_size(batch)).unwrap();
        let mut session = engine.create_session(None).unwrap();
        session.add_query_chunk("How are you today?").unwrap();
        session.add_query_chunk(" The answer").unwrap();
        session.generate_response().unwrap()
    };
    assert_eq!(run(1), run(3));
    assert_eq!(run(1), run(64));
}

#[test]
fn lora_is_session_local() {
    let fixture = Fixture::new(PackageOptions::default());
    let engine = fixture.engine(32);
    let lora = fixture.path("adapter.genlm");
    package::write_lora(&lora, engine.architecture(), 2, 4.0, 17).unwrap();

    let before = engine.generate_response("Hello").unwrap();

    let mut adapted = engine
        .create_session(Some(SessionConfig::default().with_lora(&lora)))
        .unwrap();
    adapted.add_query_chunk("Hello").unwrap();
    adapted.generate_response().unwrap();

    assert_eq!(engine.generate_response("Hello").unwrap(), before);

    assert!(matches!(
        engine.create_session(Some(
            SessionConfig::default().with_lora(fixture.path("missing-lora.genlm"))
        )),
        Err(LlmError::SessionError(_))
    ));
}

#[test]
fn one_shot_helpers_agree() {
    let fixture = Fixture::new(PackageOptions::default());
    let engine = fixture.engine(32);
    let blocking = engine.generate_response("Hello").unwrap();
    let streamed = stream_text(engine.generate_response_async("Hello").unwrap());
    assert!(!blocking.is_empty());
    assert_eq!(blocking, streamed);
}

#[test]
fn telemetry_hook_sees_completed_generations() {
    let fixture = Fixture::new(forced_hello());
    let hook = RecordingTelemetry::new();
    let engine = Engine::builder(fixture.config(8))
        .telemetry(Arc::new(hook.clone()))
        .build()
        .unwrap();

    let mut session = engine.create_session(Some(greedy())).unwrap();
    session.add_query_chunk("Hi").unwrap();
    session.generate_response().unwrap();

    assert_eq!(hook.completed(), 1);
    let metrics = session.last_metrics().unwrap();
    assert_eq!(metrics.prompt_tokens, 1);
    assert_eq!(metrics.generated_tokens, 7);
    assert_eq!(hook.last_metrics().as_ref(), Some(metrics));
}

// ---------------------------------------------------------------------------
// Background generation
// ---------------------------------------------------------------------------

#[test]
fn background_generation_streams_and_returns_the_session() {
    let fixture = Fixture::new(forced_hello());
    let engine = fixture.engine(8);
    let mut session = engine.create_session(Some(greedy())).unwrap();
    session.add_query_chunk("Hi").unwrap();

    let mut generation = BackgroundGeneration::spawn(session).unwrap();
    let text = stream_text(generation.by_ref());
    assert_eq!(text, "Hello".repeat(7));
    assert_eq!(generation.finish_reason(), Some(FinishReason::MaxTokens));

    let session = generation.join().unwrap();
    assert_eq!(session.committed_tokens(), 8);
}

#[test]
fn dropping_background_generation_cancels_it() {
    let fixture = Fixture::new(PackageOptions::default());
    let engine = fixture.engine(256);
    let mut session = engine.create_session(None).unwrap();
    session.add_query_chunk("Hello").unwrap();

    let mut generation = BackgroundGeneration::spawn(session).unwrap();
    assert!(matches!(generation.recv(), Some(GenerationEvent::Chunk(_))));
    let session = generation.join().unwrap();
    assert!(session.committed_tokens() < 256);

    let mut second = engine.create_session(None).unwrap();
    second.add_query_chunk("Hello").unwrap();
    let generation = BackgroundGeneration::spawn(second).unwrap();
    drop(generation);
}
