//! Lyra: on-device voice AI runtime.
//!
//! Hosts three model families (a text-generating LLM, a speech-to-text
//! transcriber, and a text-to-speech synthesizer) and chains them into a
//! turn-taking voice conversation pipeline:
//!
//! Audio in → VAD → STT → LLM → TTS → Audio out
//!
//! All inference runs locally; no user data leaves the device.
//!
//! # Architecture
//!
//! - **Model management**: catalog discovery over HTTPS, resumable
//!   checksum-verified downloads, and a durable JSON manifest of installed
//!   models (`models`, `download`, `manifest`, `net`, `checksum`)
//! - **Memory accounting**: per-model sizes, refcount pinning, and LRU
//!   eviction that respects pins (`memory`)
//! - **Engines**: validation-first wrappers over narrow backend adapter
//!   traits, with deterministic in-process reference backends (`llm`,
//!   `stt`, `tts`, `backend`)
//! - **Pipeline**: a cancellable, interruptible conversation state machine
//!   built on bounded channels (`pipeline`)
//! - **Dispatch**: user callbacks run on dedicated per-stream threads with
//!   bounded-queue backpressure (`dispatch`)
//!
//! # Quick start
//!
//! ```no_run
//! use lyra::{LyraRuntime, SdkConfig};
//!
//! let runtime = LyraRuntime::initialize(SdkConfig::default())?;
//! let llm = runtime.llm().load_model("weights/assistant.bin".as_ref())?;
//! # let _ = llm;
//! runtime.shutdown();
//! # Ok::<(), lyra::LyraError>(())
//! ```

pub mod audio;
pub mod backend;
pub mod checksum;
pub mod config;
pub mod dispatch;
pub mod download;
pub mod error;
pub mod handle;
pub mod llm;
pub mod manifest;
pub mod memory;
pub mod models;
pub mod net;
pub mod pipeline;
pub mod runtime;
pub mod stt;
pub mod tts;

pub use audio::{AudioData, AudioSegment};
pub use config::{
    GenerationConfig, LogLevel, PipelineConfig, SdkConfig, SynthesisConfig, TranscriptionConfig,
};
pub use error::{ErrorCategory, ErrorCode, LyraError, Result};
pub use handle::ModelHandle;
pub use models::types::{DeviceCapabilities, ModelInfo, ModelKind, ModelVersion};
pub use pipeline::messages::{PipelineState, TurnRecord};
pub use pipeline::{ConversationIo, VoicePipeline};
pub use runtime::LyraRuntime;
pub use stt::{Transcription, WordTiming};
