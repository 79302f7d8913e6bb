// End-to-end conversation tests: multi-turn persistence, history clearing,
// cancellation, missing callbacks, and barge-in interruption.

use lyra::backend::stub::StubModelSpec;
use lyra::config::{LogLevel, PipelineConfig, SdkConfig};
use lyra::error::ErrorCode;
use lyra::models::CatalogProvider;
use lyra::models::types::ModelInfo;
use lyra::pipeline::ConversationIo;
use lyra::pipeline::messages::PipelineState;
use lyra::{AudioData, LyraRuntime, ModelHandle};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

struct EmptyCatalog;
impl CatalogProvider for EmptyCatalog {
    fn fetch(&self) -> lyra::Result<Vec<ModelInfo>> {
        Ok(Vec::new())
    }
}

fn runtime(dir: &tempfile::TempDir) -> LyraRuntime {
    let config = SdkConfig {
        thread_count: 2,
        model_directory: dir.path().to_path_buf(),
        memory_limit_bytes: 1024 * 1024,
        log_level: LogLevel::Error,
        ..SdkConfig::default()
    };
    LyraRuntime::initialize_with(
        config,
        Arc::new(lyra::backend::stub::StubFactory),
        Some(Box::new(EmptyCatalog)),
    )
    .expect("runtime init")
}

fn load_models(rt: &LyraRuntime, dir: &tempfile::TempDir) -> (ModelHandle, ModelHandle, ModelHandle) {
    let stt_path = dir.path().join("stt.bin");
    StubModelSpec::stt().write(&stt_path).unwrap();
    let llm_path = dir.path().join("llm.bin");
    StubModelSpec::llm().write(&llm_path).unwrap();
    let tts_path = dir.path().join("tts.bin");
    StubModelSpec::tts().write(&tts_path).unwrap();
    (
        rt.stt().load_model(&stt_path).unwrap(),
        rt.llm().load_model(&llm_path).unwrap(),
        rt.tts().load_model(&tts_path).unwrap(),
    )
}

fn tone(seconds: f32) -> AudioData {
    let rate = 16_000u32;
    let samples = (0..(seconds * rate as f32) as usize)
        .map(|n| (2.0 * std::f32::consts::PI * 220.0 * n as f32 / rate as f32).sin() * 0.5)
        .collect();
    AudioData::new(samples, rate)
}

/// Input source that pops scripted buffers and then yields empties forever.
fn scripted_input(buffers: Vec<AudioData>) -> lyra::pipeline::AudioSource {
    let queue = Mutex::new(buffers.into_iter().collect::<VecDeque<_>>());
    Box::new(move || queue.lock().unwrap().pop_front().unwrap_or_else(AudioData::empty))
}

fn quick_generation() -> lyra::GenerationConfig {
    lyra::GenerationConfig {
        temperature: 0.0,
        max_tokens: 8,
        ..Default::default()
    }
}

#[test]
fn multi_turn_conversation_persists_history_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime(&dir);
    let (stt_h, llm_h, tts_h) = load_models(&rt, &dir);

    let pipeline = rt.create_pipeline();
    // VAD off: no barge-in probing, so the scripted pulls map 1:1 to turns.
    let config = PipelineConfig {
        enable_vad: false,
        generation: quick_generation(),
        ..Default::default()
    };
    pipeline.configure(stt_h, llm_h, tts_h, config).unwrap();

    let transcripts: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let responses: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let frames: Arc<Mutex<Vec<AudioData>>> = Arc::new(Mutex::new(Vec::new()));
    let (t_sink, r_sink, f_sink) =
        (Arc::clone(&transcripts), Arc::clone(&responses), Arc::clone(&frames));

    pipeline
        .start_conversation(ConversationIo {
            audio_input: Some(scripted_input(vec![tone(0.5), tone(0.6), tone(0.4)])),
            audio_output: Some(Box::new(move |a| f_sink.lock().unwrap().push(a))),
            on_transcript: Some(Box::new(move |t| t_sink.lock().unwrap().push(t))),
            on_response: Some(Box::new(move |t| r_sink.lock().unwrap().push(t))),
        })
        .unwrap();

    // Three turns ran, in order, with strictly increasing timestamps.
    let history = pipeline.get_history();
    assert_eq!(history.len(), 3);
    for pair in history.windows(2) {
        assert!(pair[1].timestamp_s > pair[0].timestamp_s);
    }
    for turn in &history {
        assert!(!turn.user_text.is_empty());
        assert!(!turn.assistant_text.is_empty());
    }

    assert_eq!(transcripts.lock().unwrap().len(), 3);
    assert!(!responses.lock().unwrap().is_empty());
    assert!(!frames.lock().unwrap().is_empty());
    assert!(frames.lock().unwrap().iter().all(|f| !f.samples.is_empty()));

    // The LLM observed the accumulated turns.
    assert_eq!(rt.llm().conversation_history(llm_h).unwrap().len(), 6);
    assert!(rt.llm().context_usage(llm_h).unwrap() > 0);
    assert_eq!(pipeline.state(), PipelineState::Idle);

    // clear_history empties the pipeline AND zeroes the LLM context.
    pipeline.clear_history().unwrap();
    assert!(pipeline.get_history().is_empty());
    assert_eq!(rt.llm().context_usage(llm_h).unwrap(), 0);
    assert!(rt.llm().conversation_history(llm_h).unwrap().is_empty());

    rt.shutdown();
}

#[test]
fn conversation_requires_configuration_and_callbacks() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime(&dir);
    let (stt_h, llm_h, tts_h) = load_models(&rt, &dir);
    let pipeline = rt.create_pipeline();

    // Not configured yet.
    let err = pipeline
        .start_conversation(ConversationIo {
            audio_input: Some(scripted_input(vec![])),
            audio_output: Some(Box::new(|_| {})),
            on_transcript: Some(Box::new(|_| {})),
            on_response: Some(Box::new(|_| {})),
        })
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidInputConfiguration);

    pipeline
        .configure(stt_h, llm_h, tts_h, PipelineConfig::default())
        .unwrap();

    // Each missing callback is a null-pointer error.
    let err = pipeline
        .start_conversation(ConversationIo {
            audio_input: None,
            audio_output: Some(Box::new(|_| {})),
            on_transcript: Some(Box::new(|_| {})),
            on_response: Some(Box::new(|_| {})),
        })
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidInputNullPointer);

    let err = pipeline
        .start_conversation(ConversationIo {
            audio_input: Some(scripted_input(vec![])),
            audio_output: Some(Box::new(|_| {})),
            on_transcript: None,
            on_response: Some(Box::new(|_| {})),
        })
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidInputNullPointer);

    rt.shutdown();
}

#[test]
fn configure_rejects_stale_handles() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime(&dir);
    let (stt_h, llm_h, tts_h) = load_models(&rt, &dir);
    rt.stt().unload_model(stt_h).unwrap();

    let pipeline = rt.create_pipeline();
    let err = pipeline
        .configure(stt_h, llm_h, tts_h, PipelineConfig::default())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidInputModelHandle);
    assert_eq!(pipeline.state(), PipelineState::Unconfigured);

    rt.shutdown();
}

#[test]
fn cancel_aborts_an_endless_conversation() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime(&dir);
    let (stt_h, llm_h, tts_h) = load_models(&rt, &dir);

    let pipeline = Arc::new(rt.create_pipeline());
    let config = PipelineConfig {
        enable_vad: false,
        generation: quick_generation(),
        ..Default::default()
    };
    pipeline.configure(stt_h, llm_h, tts_h, config).unwrap();

    let canceller = Arc::clone(&pipeline);
    let cancel_thread = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(100));
        canceller.cancel();
    });

    // The input never runs dry; only cancel can end this conversation.
    let err = pipeline
        .start_conversation(ConversationIo {
            audio_input: Some(Box::new(|| tone(0.3))),
            audio_output: Some(Box::new(|_| {})),
            on_transcript: Some(Box::new(|_| {})),
            on_response: Some(Box::new(|_| {})),
        })
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::OperationCancelled);
    assert_eq!(pipeline.state(), PipelineState::Idle);

    cancel_thread.join().unwrap();
    rt.shutdown();
}

#[test]
fn barge_in_interrupts_speech_and_feeds_the_next_turn() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime(&dir);
    let (stt_h, llm_h, tts_h) = load_models(&rt, &dir);

    let pipeline = rt.create_pipeline();
    // VAD on: while speaking, the pipeline probes the input after every
    // frame, so the second scripted tone arrives as an interruption.
    let config = PipelineConfig {
        enable_vad: true,
        vad_threshold: 0.5,
        generation: lyra::GenerationConfig {
            temperature: 0.0,
            max_tokens: 24,
            ..Default::default()
        },
        ..Default::default()
    };
    pipeline.configure(stt_h, llm_h, tts_h, config).unwrap();

    pipeline
        .start_conversation(ConversationIo {
            audio_input: Some(scripted_input(vec![tone(0.5), tone(0.4)])),
            audio_output: Some(Box::new(|_| {})),
            on_transcript: Some(Box::new(|_| {})),
            on_response: Some(Box::new(|_| {})),
        })
        .unwrap();

    // Both tones became turns: the second via barge-in while speaking.
    let history = pipeline.get_history();
    assert_eq!(history.len(), 2);
    assert_eq!(pipeline.state(), PipelineState::Idle);

    rt.shutdown();
}

#[test]
fn silent_audio_is_skipped_when_vad_is_enabled() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime(&dir);
    let (stt_h, llm_h, tts_h) = load_models(&rt, &dir);

    let pipeline = rt.create_pipeline();
    let config = PipelineConfig {
        enable_vad: true,
        vad_threshold: 0.5,
        generation: quick_generation(),
        ..Default::default()
    };
    pipeline.configure(stt_h, llm_h, tts_h, config).unwrap();

    let transcripts: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let t_sink = Arc::clone(&transcripts);

    // Pure silence: no turn should happen at all.
    let silence = AudioData::new(vec![0.0; 8_000], 16_000);
    pipeline
        .start_conversation(ConversationIo {
            audio_input: Some(scripted_input(vec![silence])),
            audio_output: Some(Box::new(|_| {})),
            on_transcript: Some(Box::new(move |t| t_sink.lock().unwrap().push(t))),
            on_response: Some(Box::new(|_| {})),
        })
        .unwrap();

    assert!(transcripts.lock().unwrap().is_empty());
    assert!(pipeline.get_history().is_empty());

    rt.shutdown();
}
