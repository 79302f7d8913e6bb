//! Voice conversation pipeline: STT → LLM → TTS as a turn-taking state
//! machine.
//!
//! The pipeline borrows its three engines and never owns them. Each turn
//! pulls audio, transcribes it, streams a response out of the LLM while a
//! sentence accumulator feeds the synthesizer, and plays synthesized frames
//! to the output sink. LLM generation runs on the blocking pool while the
//! coordinator consumes sentences through a bounded channel, so synthesis
//! of sentence `n` overlaps generation of sentence `n+1`.
//!
//! Barge-in: while speaking (and VAD is enabled), every emitted audio
//! frame is followed by a probe of the input source; a probe containing a
//! detectable speech segment cancels the in-flight turn, and the probed
//! audio becomes the next turn's input.

pub mod messages;

use crate::audio::AudioData;
use crate::config::PipelineConfig;
use crate::dispatch::{CallbackStream, DEFAULT_STREAM_CAPACITY};
use crate::error::{ErrorCode, LyraError, Result};
use crate::handle::ModelHandle;
use crate::llm::LlmEngine;
use crate::stt::{SttEngine, vad};
use crate::tts::TtsEngine;
use messages::{PipelineState, TurnRecord};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Pull source for input audio. An empty buffer ends the conversation.
pub type AudioSource = Box<dyn FnMut() -> AudioData + Send + 'static>;

/// Sink for synthesized output audio frames.
pub type AudioSink = Box<dyn FnMut(AudioData) + Send + 'static>;

/// Callback receiving transcripts or response tokens.
pub type TextCallback = Box<dyn FnMut(String) + Send + 'static>;

/// Output frame length while speaking; barge-in probes run between frames.
const OUTPUT_FRAME_MS: usize = 100;

/// Bounded sentence hand-off between the LLM stage and the TTS stage.
const SENTENCE_CHANNEL_SIZE: usize = 8;

/// Callbacks and audio endpoints for one conversation.
///
/// Every field is required; [`VoicePipeline::start_conversation`] rejects
/// missing ones with `InvalidInputNullPointer`.
pub struct ConversationIo {
    pub audio_input: Option<AudioSource>,
    pub audio_output: Option<AudioSink>,
    pub on_transcript: Option<TextCallback>,
    pub on_response: Option<TextCallback>,
}

#[derive(Clone)]
struct Configured {
    stt: ModelHandle,
    llm: ModelHandle,
    tts: ModelHandle,
    config: PipelineConfig,
}

/// Turn-taking conversation coordinator over the three engines.
pub struct VoicePipeline {
    stt: Arc<SttEngine>,
    llm: Arc<LlmEngine>,
    tts: Arc<TtsEngine>,
    rt: tokio::runtime::Handle,
    state: Arc<Mutex<PipelineState>>,
    configured: Mutex<Option<Configured>>,
    history: Arc<Mutex<Vec<TurnRecord>>>,
    cancel: Mutex<CancellationToken>,
    active: AtomicBool,
}

impl VoicePipeline {
    pub fn new(
        stt: Arc<SttEngine>,
        llm: Arc<LlmEngine>,
        tts: Arc<TtsEngine>,
        rt: tokio::runtime::Handle,
    ) -> Self {
        Self {
            stt,
            llm,
            tts,
            rt,
            state: Arc::new(Mutex::new(PipelineState::Unconfigured)),
            configured: Mutex::new(None),
            history: Arc::new(Mutex::new(Vec::new())),
            cancel: Mutex::new(CancellationToken::new()),
            active: AtomicBool::new(false),
        }
    }

    /// Current pipeline state; safe to call from any thread at any time.
    pub fn state(&self) -> PipelineState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Validate the three engine handles and store the configuration.
    /// Acquires no resources beyond validation.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::InvalidInputModelHandle`] when any handle is not live
    /// in its engine; config validation errors.
    pub fn configure(
        &self,
        stt_handle: ModelHandle,
        llm_handle: ModelHandle,
        tts_handle: ModelHandle,
        config: PipelineConfig,
    ) -> Result<()> {
        config.validate()?;
        for (name, ok) in [
            ("stt_handle", self.stt.is_loaded(stt_handle)),
            ("llm_handle", self.llm.is_loaded(llm_handle)),
            ("tts_handle", self.tts.is_loaded(tts_handle)),
        ] {
            if !ok {
                return Err(LyraError::new(
                    ErrorCode::InvalidInputModelHandle,
                    format!("pipeline `{name}` does not refer to a loaded model"),
                    format!("`{name}` failed engine validation during configure"),
                )
                .with_recovery("load the model and pass the returned handle"));
            }
        }

        *self.configured.lock().unwrap_or_else(|e| e.into_inner()) = Some(Configured {
            stt: stt_handle,
            llm: llm_handle,
            tts: tts_handle,
            config,
        });
        self.set_state(PipelineState::Idle);
        info!("pipeline configured");
        Ok(())
    }

    /// Cooperatively abort the current conversation; the running turn stops
    /// at its next safe point and the state returns to `Idle`.
    pub fn cancel(&self) {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner()).cancel();
        if !self.active.load(Ordering::SeqCst) {
            if self.state() != PipelineState::Unconfigured {
                self.set_state(PipelineState::Idle);
            }
        } else {
            self.set_state(PipelineState::Cancelled);
        }
        info!("pipeline cancellation requested");
    }

    /// Conversation turns so far; safe in any state.
    pub fn get_history(&self) -> Vec<TurnRecord> {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Drop the pipeline history *and* the LLM handle's context.
    ///
    /// # Errors
    ///
    /// Handle errors from the LLM engine when configured.
    pub fn clear_history(&self) -> Result<()> {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clear();
        let configured = self.configured.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(c) = configured {
            self.llm.clear_context(c.llm)?;
        }
        debug!("pipeline history cleared");
        Ok(())
    }

    /// Run a conversation until the input source yields an empty buffer or
    /// the pipeline is cancelled. Blocks the calling thread.
    ///
    /// # Errors
    ///
    /// - [`ErrorCode::InvalidInputConfiguration`] before `configure`
    /// - [`ErrorCode::InvalidInputNullPointer`] for missing callbacks
    /// - [`ErrorCode::OperationCancelled`] when cancelled mid-conversation
    /// - engine errors from any stage
    pub fn start_conversation(&self, io: ConversationIo) -> Result<()> {
        let Some(configured) = self.configured.lock().unwrap_or_else(|e| e.into_inner()).clone()
        else {
            return Err(LyraError::new(
                ErrorCode::InvalidInputConfiguration,
                "pipeline is not configured yet",
                "start_conversation called before configure supplied engine handles",
            )
            .with_recovery("call configure with valid handles first"));
        };

        let mut audio_input = require(io.audio_input, "audio_input")?;
        let mut audio_output = require(io.audio_output, "audio_output")?;
        let mut on_transcript = require(io.on_transcript, "on_transcript")?;
        let mut on_response = require(io.on_response, "on_response")?;

        if self.active.swap(true, Ordering::SeqCst) {
            return Err(LyraError::new(
                ErrorCode::InvalidInputConfiguration,
                "a conversation is already running on this pipeline",
                "start_conversation called while another conversation was active",
            )
            .with_recovery("cancel the running conversation first"));
        }
        let _reset = StateReset { pipeline: self };

        // Fresh token per conversation; cancel() fires the active one.
        let cancel = {
            let mut guard = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
            *guard = CancellationToken::new();
            guard.clone()
        };

        // Dispatcher streams serialize the user callbacks per stream.
        let transcript_stream =
            CallbackStream::spawn("transcript", DEFAULT_STREAM_CAPACITY, move |t: String| {
                on_transcript(t)
            });
        let response_stream = Arc::new(CallbackStream::spawn(
            "response",
            DEFAULT_STREAM_CAPACITY,
            move |t: String| on_response(t),
        ));
        let output_stream =
            CallbackStream::spawn("audio-out", DEFAULT_STREAM_CAPACITY, move |a: AudioData| {
                audio_output(a)
            });

        info!("conversation started");
        let mut pending_audio: Option<AudioData> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(LyraError::cancelled("conversation"));
            }

            self.set_state(PipelineState::Listening);
            let mut audio = match pending_audio.take() {
                Some(a) => a,
                None => audio_input(),
            };
            if audio.is_empty() {
                info!("input exhausted, conversation over");
                return Ok(());
            }
            audio.scrub();

            if configured.config.enable_vad {
                let segments = vad::detect_segments(
                    &audio.samples,
                    audio.sample_rate,
                    configured.config.vad_threshold,
                );
                if segments.is_empty() {
                    debug!("no speech in input buffer, skipping turn");
                    continue;
                }
            }

            self.set_state(PipelineState::Transcribing);
            let transcription =
                self.stt
                    .transcribe(configured.stt, &audio, &configured.config.transcription)?;
            let user_text = transcription.text.trim().to_owned();
            if user_text.is_empty() {
                debug!("empty transcription, skipping turn");
                continue;
            }
            transcript_stream.send(user_text.clone());

            self.set_state(PipelineState::Thinking);
            let outcome = self.run_turn(
                &configured,
                &user_text,
                &cancel,
                &response_stream,
                &output_stream,
                &mut audio_input,
            )?;

            self.push_turn(user_text, outcome.assistant_text);

            if cancel.is_cancelled() {
                return Err(LyraError::cancelled("conversation"));
            }
            if let Some(interrupting) = outcome.interrupting_audio {
                self.set_state(PipelineState::Interrupted);
                pending_audio = Some(interrupting);
                continue;
            }
            self.set_state(PipelineState::Idle);
        }
    }

    /// One turn: stream the LLM response, synthesize sentences as they
    /// complete, emit frames, and watch for barge-in.
    fn run_turn(
        &self,
        configured: &Configured,
        user_text: &str,
        cancel: &CancellationToken,
        response_stream: &Arc<CallbackStream<String>>,
        output_stream: &CallbackStream<AudioData>,
        audio_input: &mut AudioSource,
    ) -> Result<TurnOutcome> {
        let turn_cancel = cancel.child_token();

        // The system prompt rides in front of the first turn's prompt.
        let first_turn = self.history.lock().unwrap_or_else(|e| e.into_inner()).is_empty();
        let prompt = if first_turn && !configured.config.system_prompt.is_empty() {
            format!("{}\n\n{user_text}", configured.config.system_prompt)
        } else {
            user_text.to_owned()
        };

        let (sentence_tx, mut sentence_rx) =
            tokio::sync::mpsc::channel::<String>(SENTENCE_CHANNEL_SIZE);
        let response_acc: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));

        let llm_task = {
            let llm = Arc::clone(&self.llm);
            let llm_handle = configured.llm;
            let gen_config = configured.config.generation.clone();
            let llm_cancel = turn_cancel.clone();
            let response_stream = Arc::clone(response_stream);
            let response_acc = Arc::clone(&response_acc);
            let pending = Arc::new(Mutex::new(String::new()));

            move || -> Result<String> {
                let sentence_cb_tx = sentence_tx.clone();
                let pending_cb = Arc::clone(&pending);
                let result = llm.generate_streaming(
                    llm_handle,
                    &prompt,
                    &gen_config,
                    &llm_cancel,
                    Box::new(move |piece: String| {
                        response_stream.send(piece.clone());
                        response_acc
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .push_str(&piece);
                        let mut acc = pending_cb.lock().unwrap_or_else(|e| e.into_inner());
                        acc.push_str(&piece);
                        while let Some(split) = sentence_boundary(&acc) {
                            let sentence: String = acc.drain(..split).collect();
                            let sentence = sentence.trim().to_owned();
                            if !sentence.is_empty() {
                                let _ = sentence_cb_tx.blocking_send(sentence);
                            }
                        }
                    }),
                );
                // generate_streaming drained its dispatcher before
                // returning, so the accumulator is final: flush the tail.
                let tail = pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .trim()
                    .to_owned();
                if !tail.is_empty() {
                    let _ = sentence_tx.blocking_send(tail);
                }
                result
            }
        };

        let outcome = self.rt.block_on(async {
            let llm_join = tokio::task::spawn_blocking(llm_task);

            let mut interrupting_audio: Option<AudioData> = None;
            'sentences: while let Some(sentence) = sentence_rx.recv().await {
                if turn_cancel.is_cancelled() {
                    break;
                }
                self.set_state(PipelineState::Speaking);

                let synthesized = self.tts.synthesize(
                    configured.tts,
                    &sentence,
                    &configured.config.synthesis,
                    &turn_cancel,
                );
                let synthesized = match synthesized {
                    Ok(audio) => audio,
                    Err(e) if e.code() == ErrorCode::OperationCancelled => break,
                    Err(e) => {
                        sentence_rx.close();
                        let _ = llm_join.await;
                        return Err(e);
                    }
                };

                // Emit in frames, probing the input for barge-in after each.
                let frame_len =
                    (synthesized.sample_rate as usize * OUTPUT_FRAME_MS / 1000).max(1);
                for frame in synthesized.samples.chunks(frame_len) {
                    if turn_cancel.is_cancelled() {
                        break 'sentences;
                    }
                    output_stream.send(AudioData::new(frame.to_vec(), synthesized.sample_rate));

                    if configured.config.enable_vad {
                        let mut probe = audio_input();
                        if !probe.is_empty() {
                            probe.scrub();
                            let voiced = !vad::detect_segments(
                                &probe.samples,
                                probe.sample_rate,
                                configured.config.vad_threshold,
                            )
                            .is_empty();
                            if voiced {
                                info!("barge-in detected, interrupting playback");
                                turn_cancel.cancel();
                                interrupting_audio = Some(probe);
                                break 'sentences;
                            }
                        }
                    }
                }
            }

            // Stop accepting sentences and collect the LLM result.
            sentence_rx.close();
            let llm_result = llm_join.await.map_err(|e| {
                LyraError::new(
                    ErrorCode::InferenceBackendFailure,
                    "generation task failed unexpectedly",
                    format!("LLM stage join error: {e}"),
                )
            })?;

            let assistant_text = match llm_result {
                Ok(text) => text,
                Err(e)
                    if e.code() == ErrorCode::OperationCancelled
                        && interrupting_audio.is_some() =>
                {
                    // Barge-in cut generation short; keep what was spoken.
                    response_acc.lock().unwrap_or_else(|e| e.into_inner()).clone()
                }
                Err(e) => return Err(e),
            };

            Ok(TurnOutcome { assistant_text, interrupting_audio })
        })?;

        Ok(outcome)
    }

    fn push_turn(&self, user_text: String, assistant_text: String) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let timestamp_s = history
            .last()
            .map(|t| t.timestamp_s + 1)
            .unwrap_or(0)
            .max(chrono::Utc::now().timestamp());
        history.push(TurnRecord { user_text, assistant_text, timestamp_s });
    }

    fn set_state(&self, next: PipelineState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != next {
            debug!(from = %*state, to = %next, "pipeline state transition");
            *state = next;
        }
    }
}

struct TurnOutcome {
    assistant_text: String,
    interrupting_audio: Option<AudioData>,
}

/// Restores `Idle` and clears the active flag when a conversation exits by
/// any path.
struct StateReset<'a> {
    pipeline: &'a VoicePipeline,
}

impl Drop for StateReset<'_> {
    fn drop(&mut self) {
        self.pipeline.active.store(false, Ordering::SeqCst);
        self.pipeline.set_state(PipelineState::Idle);
    }
}

fn require<T>(value: Option<T>, name: &str) -> Result<T> {
    value.ok_or_else(|| {
        LyraError::new(
            ErrorCode::InvalidInputNullPointer,
            format!("conversation callback `{name}` is missing"),
            format!("start_conversation requires `{name}` to be supplied"),
        )
        .with_recovery("provide all four conversation callbacks")
    })
}

/// Byte index just past the first sentence terminator, if any.
fn sentence_boundary(text: &str) -> Option<usize> {
    text.char_indices()
        .find(|(_, c)| matches!(c, '.' | '!' | '?'))
        .map(|(i, _)| i + 1)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::error::expect_err;

    #[test]
    fn sentence_boundary_finds_first_terminator() {
        assert_eq!(sentence_boundary("hello there"), None);
        assert_eq!(sentence_boundary("done. next"), Some(5));
        assert_eq!(sentence_boundary("what? then"), Some(5));
    }

    #[test]
    fn missing_callbacks_are_null_pointer_errors() {
        let err = expect_err(require::<AudioSource>(None, "audio_input"));
        assert_eq!(err.code(), ErrorCode::InvalidInputNullPointer);
        assert!(err.message().contains("audio_input"));
    }
}
