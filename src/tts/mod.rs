//! Text-to-speech engine.
//!
//! Validates synthesis parameters up front, pins the model for the
//! duration of a call, and delivers streamed chunks through the callback
//! dispatcher. The output sample rate is a property of the loaded model
//! and never changes between calls.

use crate::audio::AudioData;
use crate::backend::{BackendFactory, TtsBackend};
use crate::config::SynthesisConfig;
use crate::dispatch::{CallbackStream, DEFAULT_STREAM_CAPACITY};
use crate::error::{ErrorCode, LyraError, Result};
use crate::handle::{HandleAllocator, HandleTable, ModelHandle};
use crate::memory::{MemoryManager, PinGuard};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Audio chunk callback for streaming synthesis.
pub type ChunkCallback = Box<dyn FnMut(AudioData) + Send + 'static>;

/// Text-to-speech engine hosting any number of loaded models.
pub struct TtsEngine {
    table: HandleTable<dyn TtsBackend>,
    factory: Arc<dyn BackendFactory>,
    memory: Arc<MemoryManager>,
    allocator: Arc<HandleAllocator>,
}

impl TtsEngine {
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
    /// Model-not-found / model-load errors;
    /// [`ErrorCode::ModelInsufficientMemory`] when the budget cannot fit it.
    pub fn load_model(&self, path: &Path) -> Result<ModelHandle> {
        let backend = self.factory.open_tts(path)?;
        let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0).max(1);
        let handle = self.allocator.allocate();
        self.memory.track_allocation(handle, size)?;
        self.table.insert(handle, backend);
        info!(%handle, path = %path.display(), "TTS model loaded");
        Ok(handle)
    }

    /// Unload a model and release its memory account.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::InferenceModelNotLoaded`] for unknown handles.
    pub fn unload_model(&self, handle: ModelHandle) -> Result<()> {
        self.table.remove(handle)?;
        self.memory.track_deallocation(handle)?;
        info!(%handle, "TTS model unloaded");
        Ok(())
    }

    pub fn is_loaded(&self, handle: ModelHandle) -> bool {
        self.table.contains(handle)
    }

    pub fn loaded_handles(&self) -> Vec<ModelHandle> {
        self.table.handles()
    }

    /// Voice identifiers the loaded model provides.
    ///
    /// # Errors
    ///
    /// Handle errors.
    pub fn available_voices(&self, handle: ModelHandle) -> Result<Vec<String>> {
        let slot = self.table.get(handle)?;
        let backend = slot.lock().unwrap_or_else(|e| e.into_inner());
        Ok(backend.voices())
    }

    /// Synchronous synthesis; returns the full audio buffer.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::InferenceInvalidInput`] for empty text, parameter
    /// validation errors, handle errors, or backend failures.
    pub fn synthesize(
        &self,
        handle: ModelHandle,
        text: &str,
        config: &SynthesisConfig,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<AudioData> {
        self.run_synthesis(handle, text, config, None, cancel)
    }

    /// Streaming synthesis: `on_chunk` receives non-empty audio chunks in
    /// order from a dispatcher thread; their concatenation equals the
    /// returned buffer.
    ///
    /// # Errors
    ///
    /// Same as [`TtsEngine::synthesize`].
    pub fn synthesize_streaming(
        &self,
        handle: ModelHandle,
        text: &str,
        config: &SynthesisConfig,
        cancel: &tokio_util::sync::CancellationToken,
        on_chunk: ChunkCallback,
    ) -> Result<AudioData> {
        let mut callback = on_chunk;
        let stream = CallbackStream::spawn("tts-chunk", DEFAULT_STREAM_CAPACITY, move |c: AudioData| {
            callback(c)
        });
        let result = self.run_synthesis(handle, text, config, Some(&stream), cancel);
        stream.finish();
        result
    }

    fn run_synthesis(
        &self,
        handle: ModelHandle,
        text: &str,
        config: &SynthesisConfig,
        sink: Option<&CallbackStream<AudioData>>,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<AudioData> {
        config.validate()?;
        if text.trim().is_empty() {
            return Err(LyraError::new(
                ErrorCode::InferenceInvalidInput,
                "synthesis text must not be empty",
                "synthesize was called with empty or whitespace-only text",
            )
            .with_recovery("pass the text to speak"));
        }

        let slot = self.table.get(handle)?;
        let _pin = PinGuard::new(&self.memory, handle)?;
        self.memory.record_access(handle)?;

        let mut backend = slot.lock().unwrap_or_else(|e| e.into_inner());
        let sample_rate = backend.sample_rate();

        let started = Instant::now();
        let mut on_chunk = |chunk: &[f32]| -> bool {
            match sink {
                Some(stream) => stream.send(AudioData::new(chunk.to_vec(), sample_rate)),
                None => true,
            }
        };
        let samples = backend.synthesize(
            text,
            &config.voice_id,
            config.speed,
            config.pitch,
            &mut on_chunk,
            cancel,
        )?;
        drop(backend);

        debug!(
            %handle,
            samples = samples.len(),
            seconds = samples.len() as f32 / sample_rate as f32,
            latency_ms = started.elapsed().as_millis() as u64,
            "synthesis complete"
        );
        Ok(AudioData::new(samples, sample_rate))
    }
}
