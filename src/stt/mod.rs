//! Speech-to-text engine.
//!
//! Thin validation-and-bookkeeping layer over an [`SttBackend`]: audio is
//! checked and scrubbed before the backend ever sees it, transcription
//! invariants (confidence ranges, ordered word timings) are enforced on the
//! way out, and every loaded model is tracked by the memory manager.

pub mod vad;

use crate::audio::{AudioData, AudioSegment};
use crate::backend::{BackendFactory, SttBackend};
use crate::config::TranscriptionConfig;
use crate::error::{LyraError, Result};
use crate::handle::{HandleAllocator, HandleTable, ModelHandle};
use crate::memory::{MemoryManager, PinGuard};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// One word with its span and confidence.
#[derive(Debug, Clone, PartialEq)]
pub struct WordTiming {
    pub text: String,
    pub start_time_s: f32,
    pub end_time_s: f32,
    /// In `[0.0, 1.0]`.
    pub confidence: f32,
}

/// Result of a transcription call.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcription {
    /// The transcribed text (possibly empty for silent audio).
    pub text: String,
    /// Overall confidence in `[0.0, 1.0]`, always finite.
    pub confidence: f32,
    /// Detected (or requested) language tag.
    pub language: String,
    /// Per-word timings; empty unless word timestamps were requested.
    pub words: Vec<WordTiming>,
}

/// Speech-to-text engine hosting any number of loaded models.
pub struct SttEngine {
    table: HandleTable<dyn SttBackend>,
    factory: Arc<dyn BackendFactory>,
    memory: Arc<MemoryManager>,
    allocator: Arc<HandleAllocator>,
}

impl SttEngine {
    pub fn new(
        factory: Arc<dyn BackendFactory>,
        memory: Arc<MemoryManager>,
        allocator: Arc<HandleAllocator>,
    ) -> Self {
        Self {
            table: HandleTable::new(),
            factory,
            memory,
            allocator,
        }
    }

    /// Open a model file and return its handle.
    ///
    /// # Errors
    ///
    /// Model-not-found / model-load errors from the backend factory;
    /// [`crate::error::ErrorCode::ModelInsufficientMemory`] when the memory
    /// budget cannot fit the model.
    pub fn load_model(&self, path: &Path) -> Result<ModelHandle> {
        let backend = self.factory.open_stt(path)?;
        let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0).max(1);
        let handle = self.allocator.allocate();
        self.memory.track_allocation(handle, size)?;
        self.table.insert(handle, backend);
        info!(%handle, path = %path.display(), "STT model loaded");
        Ok(handle)
    }

    /// Unload a model and release its memory account.
    ///
    /// # Errors
    ///
    /// [`crate::error::ErrorCode::InferenceModelNotLoaded`] for unknown handles.
    pub fn unload_model(&self, handle: ModelHandle) -> Result<()> {
        self.table.remove(handle)?;
        self.memory.track_deallocation(handle)?;
        info!(%handle, "STT model unloaded");
        Ok(())
    }

    /// Whether this engine currently hosts `handle`.
    pub fn is_loaded(&self, handle: ModelHandle) -> bool {
        self.table.contains(handle)
    }

    /// All live handles of this engine.
    pub fn loaded_handles(&self) -> Vec<ModelHandle> {
        self.table.handles()
    }

    /// Transcribe a PCM buffer.
    ///
    /// Empty buffers and non-positive sample rates are rejected before the
    /// backend runs; NaN/Inf samples are scrubbed to silence.
    ///
    /// # Errors
    ///
    /// [`crate::error::ErrorCode::InvalidInputAudioFormat`] for unusable
    /// audio, handle errors, or backend failures.
    pub fn transcribe(
        &self,
        handle: ModelHandle,
        audio: &AudioData,
        config: &TranscriptionConfig,
    ) -> Result<Transcription> {
        audio.validate()?;
        let slot = self.table.get(handle)?;
        let _pin = PinGuard::new(&self.memory, handle)?;
        self.memory.record_access(handle)?;

        let mut clean = audio.clone();
        let scrubbed = clean.scrub();
        if scrubbed > 0 {
            debug!(%handle, scrubbed, "scrubbed non-finite samples before transcription");
        }

        // Translation requests resolve to English output; backends treat the
        // language argument as the output language when translating.
        let language = if config.translate && config.language.is_empty() {
            "en"
        } else {
            config.language.as_str()
        };

        let started = Instant::now();
        let mut backend = slot.lock().unwrap_or_else(|e| e.into_inner());
        let mut result = backend.transcribe(
            &clean.samples,
            clean.sample_rate,
            language,
            config.word_timestamps,
        )?;
        drop(backend);

        enforce_invariants(&mut result);
        debug!(
            %handle,
            latency_ms = started.elapsed().as_millis() as u64,
            chars = result.text.len(),
            "transcription complete"
        );
        Ok(result)
    }

    /// Detect speech segments with the energy VAD.
    ///
    /// `handle` is optional: energy analysis needs no model, but when a
    /// handle is supplied it must be valid.
    ///
    /// # Errors
    ///
    /// [`crate::error::ErrorCode::InvalidInputParameterValue`] for a
    /// threshold outside `[0.0, 1.0]` (or NaN); audio/handle errors.
    pub fn detect_voice_activity(
        &self,
        handle: Option<ModelHandle>,
        audio: &AudioData,
        threshold: f32,
    ) -> Result<Vec<AudioSegment>> {
        if threshold.is_nan() || !(0.0..=1.0).contains(&threshold) {
            return Err(LyraError::invalid_parameter(
                "threshold",
                format!("{threshold} not in [0.0, 1.0]"),
            ));
        }
        if let Some(h) = handle {
            self.table.get(h)?;
            self.memory.record_access(h)?;
        }
        audio.validate()?;

        let mut clean = audio.clone();
        clean.scrub();
        Ok(vad::detect_segments(&clean.samples, clean.sample_rate, threshold))
    }
}

/// Clamp confidences into range and drop malformed word entries rather
/// than propagating backend sloppiness to callers.
fn enforce_invariants(t: &mut Transcription) {
    if !t.confidence.is_finite() {
        t.confidence = 0.0;
    }
    t.confidence = t.confidence.clamp(0.0, 1.0);
    t.words.retain(|w| w.start_time_s < w.end_time_s);
    for w in &mut t.words {
        if !w.confidence.is_finite() {
            w.confidence = 0.0;
        }
        w.confidence = w.confidence.clamp(0.0, 1.0);
    }
}
