//! Language model engine.
//!
//! Hosts any number of loaded LLMs behind opaque handles. Each handle owns
//! its backend, its conversation history, and its slice of the memory
//! budget. Generation is serialized per handle (the handle's mutex) while
//! different handles run in parallel.
//!
//! # Context window policy
//!
//! With capacity `C`, context tokens `P` (history + prompt) and requested
//! output budget `M`:
//!
//! - `P ≥ C` fails with `InferenceContextWindowExceeded`
//! - `P + M > C` drops the oldest history turns until it fits; if the bare
//!   prompt still leaves no room for `M`, the output budget is clamped to
//!   the remaining space
//! - usage never exceeds `C` on any path

use crate::backend::{BackendFactory, SamplerParams};
use crate::config::GenerationConfig;
use crate::dispatch::{CallbackStream, DEFAULT_STREAM_CAPACITY};
use crate::error::{ErrorCode, LyraError, Result};
use crate::handle::{HandleAllocator, HandleTable, ModelHandle};
use crate::memory::{MemoryManager, PinGuard};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One completed exchange in a handle's conversation.
#[derive(Debug, Clone)]
struct HistoryTurn {
    user: String,
    assistant: String,
    timestamp_s: i64,
}

/// Per-handle state: the backend plus conversation bookkeeping.
struct LoadedLlm {
    backend: Box<dyn crate::backend::LlmBackend>,
    history: Vec<HistoryTurn>,
    capacity: usize,
    last_timestamp_s: i64,
}

/// Token callback for streaming generation.
pub type TokenCallback = Box<dyn FnMut(String) + Send + 'static>;

/// Language model engine.
pub struct LlmEngine {
    table: HandleTable<LoadedLlm>,
    factory: Arc<dyn BackendFactory>,
    memory: Arc<MemoryManager>,
    allocator: Arc<HandleAllocator>,
}

impl LlmEngine {
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

    /// Open a model file and return its handle. Concurrent loads of the
    /// same path produce independent instances with distinct handles.
    ///
    /// # Errors
    ///
    /// Model-not-found / model-load errors;
    /// [`ErrorCode::ModelInsufficientMemory`] when the budget cannot fit it.
    pub fn load_model(&self, path: &Path) -> Result<ModelHandle> {
        let backend = self.factory.open_llm(path)?;
        let capacity = backend.context_capacity();
        let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0).max(1);
        let handle = self.allocator.allocate();
        self.memory.track_allocation(handle, size)?;
        self.table.insert(
            handle,
            Box::new(LoadedLlm {
                backend,
                history: Vec::new(),
                capacity,
                last_timestamp_s: 0,
            }),
        );
        info!(%handle, path = %path.display(), capacity, "LLM loaded");
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
        info!(%handle, "LLM unloaded");
        Ok(())
    }

    pub fn is_loaded(&self, handle: ModelHandle) -> bool {
        self.table.contains(handle)
    }

    pub fn loaded_handles(&self) -> Vec<ModelHandle> {
        self.table.handles()
    }

    /// Deterministic text → token encoding.
    ///
    /// # Errors
    ///
    /// Handle or backend errors.
    pub fn tokenize(&self, handle: ModelHandle, text: &str) -> Result<Vec<u32>> {
        let slot = self.table.get(handle)?;
        self.memory.record_access(handle)?;
        let mut state = slot.lock().unwrap_or_else(|e| e.into_inner());
        state.backend.tokenize(text)
    }

    /// Token → text decoding.
    ///
    /// # Errors
    ///
    /// Handle errors, or unknown token ids.
    pub fn detokenize(&self, handle: ModelHandle, tokens: &[u32]) -> Result<String> {
        let slot = self.table.get(handle)?;
        self.memory.record_access(handle)?;
        let state = slot.lock().unwrap_or_else(|e| e.into_inner());
        state.backend.detokenize(tokens)
    }

    /// Synchronous generation; returns the full response text.
    ///
    /// # Errors
    ///
    /// Validation, handle, context-window, timeout, cancellation, or
    /// backend errors.
    pub fn generate(
        &self,
        handle: ModelHandle,
        prompt: &str,
        config: &GenerationConfig,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.run_generation(handle, prompt, config, None, cancel)
    }

    /// Streaming generation: `on_token` fires exactly once per produced
    /// token, in order, from a dispatcher thread. The concatenation of all
    /// pieces equals the returned text.
    ///
    /// # Errors
    ///
    /// Same as [`LlmEngine::generate`].
    pub fn generate_streaming(
        &self,
        handle: ModelHandle,
        prompt: &str,
        config: &GenerationConfig,
        cancel: &CancellationToken,
        on_token: TokenCallback,
    ) -> Result<String> {
        let mut callback = on_token;
        let stream = CallbackStream::spawn("llm-token", DEFAULT_STREAM_CAPACITY, move |t: String| {
            callback(t)
        });
        let result = self.run_generation(handle, prompt, config, Some(&stream), cancel);
        // Drain queued tokens before returning so callers observe every
        // callback strictly before the call completes.
        stream.finish();
        result
    }

    /// Maximum tokens the model can hold as active state.
    ///
    /// # Errors
    ///
    /// Handle errors.
    pub fn context_capacity(&self, handle: ModelHandle) -> Result<usize> {
        let slot = self.table.get(handle)?;
        let state = slot.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.capacity)
    }

    /// Tokens currently occupying the KV cache.
    ///
    /// # Errors
    ///
    /// Handle errors.
    pub fn context_usage(&self, handle: ModelHandle) -> Result<usize> {
        let slot = self.table.get(handle)?;
        let state = slot.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.backend.context_usage().min(state.capacity))
    }

    /// Reset the KV cache and wipe the conversation history.
    ///
    /// # Errors
    ///
    /// Handle errors.
    pub fn clear_context(&self, handle: ModelHandle) -> Result<()> {
        let slot = self.table.get(handle)?;
        let mut state = slot.lock().unwrap_or_else(|e| e.into_inner());
        state.backend.reset();
        state.history.clear();
        debug!(%handle, "context cleared");
        Ok(())
    }

    /// Alternating `User: ...` / `Assistant: ...` lines accumulated by
    /// successful generate calls since the last [`LlmEngine::clear_context`].
    ///
    /// # Errors
    ///
    /// Handle errors.
    pub fn conversation_history(&self, handle: ModelHandle) -> Result<Vec<String>> {
        let slot = self.table.get(handle)?;
        let state = slot.lock().unwrap_or_else(|e| e.into_inner());
        let mut lines = Vec::with_capacity(state.history.len() * 2);
        for turn in &state.history {
            lines.push(format!("User: {}", turn.user));
            lines.push(format!("Assistant: {}", turn.assistant));
        }
        Ok(lines)
    }

    fn run_generation(
        &self,
        handle: ModelHandle,
        prompt: &str,
        config: &GenerationConfig,
        sink: Option<&CallbackStream<String>>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        config.validate()?;
        if prompt.trim().is_empty() {
            return Err(LyraError::new(
                ErrorCode::InferenceInvalidInput,
                "generation prompt must not be empty",
                "generate was called with an empty or whitespace-only prompt",
            )
            .with_recovery("pass the user's text as the prompt"));
        }

        let slot = self.table.get(handle)?;
        let _pin = PinGuard::new(&self.memory, handle)?;
        self.memory.record_access(handle)?;
        let mut state = slot.lock().unwrap_or_else(|e| e.into_inner());

        let capacity = state.capacity;
        let requested = config.max_tokens as usize;

        // Fit the context: measure, then drop oldest turns until the output
        // budget fits too.
        let mut work_history = state.history.clone();
        let mut context_tokens = state.backend.tokenize(&render_context(&work_history, prompt))?;
        if context_tokens.len() >= capacity {
            return Err(LyraError::new(
                ErrorCode::InferenceContextWindowExceeded,
                "prompt and history exceed the model's context window",
                format!(
                    "context needs {} tokens but the model holds at most {capacity}",
                    context_tokens.len()
                ),
            )
            .with_recovery("clear the context or shorten the prompt"));
        }
        while context_tokens.len() + requested > capacity && !work_history.is_empty() {
            work_history.remove(0);
            context_tokens = state.backend.tokenize(&render_context(&work_history, prompt))?;
        }
        let truncated_turns = state.history.len() - work_history.len();
        if truncated_turns > 0 {
            debug!(%handle, truncated_turns, "dropped oldest history to fit the context window");
        }

        let mut params = SamplerParams::from(config);
        params.max_tokens = requested.min(capacity - context_tokens.len());

        let deadline = config
            .deadline_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        let mut timed_out = false;
        let mut on_token = |piece: &str| -> bool {
            if let Some(d) = deadline
                && Instant::now() > d
            {
                timed_out = true;
                return false;
            }
            match sink {
                Some(stream) => stream.send(piece.to_owned()),
                None => true,
            }
        };

        let started = Instant::now();
        let emitted = state
            .backend
            .generate(&context_tokens, &params, &mut on_token, cancel)?;

        if timed_out {
            // The partial output is discarded; cache usage stays within
            // capacity and the history is untouched.
            return Err(LyraError::new(
                ErrorCode::InferenceTimeout,
                "generation exceeded its deadline",
                format!(
                    "deadline of {}ms elapsed after {} tokens",
                    config.deadline_ms.unwrap_or(0),
                    emitted.len()
                ),
            ));
        }

        let text = state.backend.detokenize(&emitted)?;
        debug!(
            %handle,
            tokens = emitted.len(),
            latency_ms = started.elapsed().as_millis() as u64,
            "generation complete"
        );

        // Commit: the truncation plus the new turn, with a strictly
        // increasing timestamp.
        let timestamp_s = chrono::Utc::now().timestamp().max(state.last_timestamp_s + 1);
        state.history = work_history;
        state.history.push(HistoryTurn {
            user: prompt.to_owned(),
            assistant: text.clone(),
            timestamp_s,
        });
        state.last_timestamp_s = timestamp_s;
        Ok(text)
    }
}

/// Render history plus the new prompt the way the model sees it.
fn render_context(history: &[HistoryTurn], prompt: &str) -> String {
    let mut out = String::new();
    for turn in history {
        out.push_str("User: ");
        out.push_str(&turn.user);
        out.push_str("\nAssistant: ");
        out.push_str(&turn.assistant);
        out.push('\n');
    }
    out.push_str("User: ");
    out.push_str(prompt);
    out.push_str("\nAssistant:");
    out
}
