//! Backend adapter contract.
//!
//! Each inference engine drives an opaque backend through one of these
//! traits. The traits deliberately stay narrow (open, query context, run,
//! close-on-drop) so swapping in a real GGUF/ONNX backend touches nothing
//! above this seam. `&mut self` on the run methods expresses that decoders
//! are stateful (KV caches, beam state); the owning engine serializes all
//! mutation behind its per-handle mutex.

pub mod stub;

use crate::error::Result;
use crate::stt::Transcription;
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Sampling parameters handed to [`LlmBackend::generate`].
#[derive(Debug, Clone)]
pub struct SamplerParams {
    /// 0.0 selects deterministic argmax decoding.
    pub temperature: f32,
    /// Nucleus mass; candidates outside the top-p set are dropped.
    pub top_p: f32,
    /// Candidate cutoff after nucleus filtering; 0 disables it.
    pub top_k: u32,
    /// Logits of already-observed tokens are divided by this.
    pub repetition_penalty: f32,
    /// Hard cap on emitted tokens.
    pub max_tokens: usize,
    /// Decoded output never contains any of these; generation stops before
    /// emitting one.
    pub stop_sequences: Vec<String>,
}

/// Language model backend: tokenization plus autoregressive generation.
pub trait LlmBackend: Send {
    /// Maximum tokens the model can hold as active state.
    fn context_capacity(&self) -> usize;

    /// Tokens currently occupying the KV cache.
    fn context_usage(&self) -> usize;

    /// Deterministic text → token encoding.
    ///
    /// # Errors
    ///
    /// Backend failures mapped into the inference range.
    fn tokenize(&mut self, text: &str) -> Result<Vec<u32>>;

    /// Token → text decoding. For any text this backend tokenized,
    /// `detokenize(tokenize(text))` equals the text up to whitespace
    /// normalization.
    ///
    /// # Errors
    ///
    /// Unknown token ids are an inference error.
    fn detokenize(&self, tokens: &[u32]) -> Result<String>;

    /// Run generation over `prompt_tokens` (the full context for this call:
    /// conversation history plus the new prompt).
    ///
    /// Per emitted token, `on_token` receives the decoded non-empty text
    /// piece; returning `false` stops generation early without error. On
    /// return the KV cache holds exactly the supplied context plus the
    /// emitted tokens.
    ///
    /// # Errors
    ///
    /// [`crate::error::ErrorCode::OperationCancelled`] when `cancel` fires
    /// between tokens; backend failures otherwise.
    fn generate(
        &mut self,
        prompt_tokens: &[u32],
        params: &SamplerParams,
        on_token: &mut dyn FnMut(&str) -> bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<u32>>;

    /// Drop all cached state; `context_usage` returns 0 afterwards.
    fn reset(&mut self);
}

/// Speech-to-text backend.
pub trait SttBackend: Send {
    /// Transcribe mono f32 PCM. `language` is an ISO hint (empty =
    /// autodetect); `want_words` requests per-word timestamps.
    ///
    /// # Errors
    ///
    /// Backend failures mapped into the inference range.
    fn transcribe(
        &mut self,
        samples: &[f32],
        sample_rate: u32,
        language: &str,
        want_words: bool,
    ) -> Result<Transcription>;
}

/// Text-to-speech backend.
pub trait TtsBackend: Send {
    /// Voice identifiers this model provides.
    fn voices(&self) -> Vec<String>;

    /// Fixed output sample rate; constant for the lifetime of the model.
    fn sample_rate(&self) -> u32;

    /// Synthesize text into mono f32 PCM. Chunks stream to `on_chunk` in
    /// order (each non-empty; returning `false` stops early); the returned
    /// buffer is the concatenation of every chunk.
    ///
    /// # Errors
    ///
    /// [`crate::error::ErrorCode::OperationCancelled`] when `cancel` fires
    /// between chunks; unknown voices and backend failures otherwise.
    fn synthesize(
        &mut self,
        text: &str,
        voice: &str,
        speed: f32,
        pitch: f32,
        on_chunk: &mut dyn FnMut(&[f32]) -> bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>>;
}

/// Opens model files and produces backend instances.
///
/// Factories distinguish missing files from malformed ones so the engines
/// can surface precise load errors. Concurrent opens of the same path must
/// produce independent instances.
pub trait BackendFactory: Send + Sync {
    /// # Errors
    ///
    /// Model-not-found or model-load errors.
    fn open_llm(&self, path: &Path) -> Result<Box<dyn LlmBackend>>;

    /// # Errors
    ///
    /// Model-not-found or model-load errors.
    fn open_stt(&self, path: &Path) -> Result<Box<dyn SttBackend>>;

    /// # Errors
    ///
    /// Model-not-found or model-load errors.
    fn open_tts(&self, path: &Path) -> Result<Box<dyn TtsBackend>>;
}

impl From<&crate::config::GenerationConfig> for SamplerParams {
    fn from(config: &crate::config::GenerationConfig) -> Self {
        Self {
            temperature: config.temperature,
            top_p: config.top_p,
            top_k: config.top_k,
            repetition_penalty: config.repetition_penalty,
            max_tokens: config.max_tokens as usize,
            stop_sequences: config.stop_sequences.clone(),
        }
    }
}
