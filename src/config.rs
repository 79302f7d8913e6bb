//! Configuration types for the runtime, the engines, and the pipeline.
//!
//! Every config struct has serde round-tripping with `#[serde(default)]`
//! (unknown future fields never break old files) and a `validate()` that
//! runs before any resource is acquired.

use crate::error::{ErrorCode, LyraError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Log verbosity recognized by [`SdkConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    /// Directive string for the tracing env-filter.
    pub fn as_filter(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SdkConfig {
    /// Worker threads for pipeline orchestration. Capped at hardware
    /// concurrency during validation.
    pub thread_count: usize,
    /// Absolute directory holding model files and the registry.
    pub model_directory: PathBuf,
    /// Soft ceiling on total loaded-model bytes; 0 disables the ceiling.
    pub memory_limit_bytes: u64,
    /// Log verbosity for the installed tracing subscriber.
    pub log_level: LogLevel,
    /// Local-only usage counters. Nothing ever leaves the device either way.
    pub enable_telemetry: bool,
    /// HTTPS endpoint serving the model catalog JSON.
    pub registry_url: String,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            thread_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
            model_directory: default_model_dir(),
            memory_limit_bytes: 4 * 1024 * 1024 * 1024,
            log_level: LogLevel::Info,
            enable_telemetry: false,
            registry_url: "https://registry.lyra-runtime.dev/catalog.json".to_owned(),
        }
    }
}

fn default_model_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("lyra")
        .join("models")
}

impl SdkConfig {
    /// Validate and normalize: caps `thread_count` at hardware concurrency.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::InvalidInputConfiguration`] naming the offending field.
    pub fn validate(&mut self) -> Result<()> {
        if self.thread_count == 0 {
            return Err(config_error(
                "thread_count",
                "must be a positive integer".to_owned(),
            ));
        }
        let hardware = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(self.thread_count);
        if self.thread_count > hardware {
            self.thread_count = hardware;
        }
        if !self.model_directory.is_absolute() {
            return Err(config_error(
                "model_directory",
                format!("`{}` is not an absolute path", self.model_directory.display()),
            ));
        }
        if self.memory_limit_bytes == 0 {
            return Err(config_error(
                "memory_limit_bytes",
                "must be positive (there is no unlimited mode)".to_owned(),
            ));
        }
        crate::net::validate_https(&self.registry_url)?;
        Ok(())
    }

    /// Load a TOML config file.
    ///
    /// # Errors
    ///
    /// Storage errors for unreadable files, configuration errors for
    /// unparseable ones.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| LyraError::from_io(format!("reading {}", path.display()), &e))?;
        toml::from_str(&raw).map_err(|e| {
            config_error("file", format!("{} is not valid TOML: {e}", path.display()))
        })
    }

    /// Write the config as TOML.
    ///
    /// # Errors
    ///
    /// Storage errors from the write.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| config_error("file", format!("serialization failed: {e}")))?;
        std::fs::write(path, text)
            .map_err(|e| LyraError::from_io(format!("writing {}", path.display()), &e))?;
        Ok(())
    }
}

/// Sampling and length parameters for one generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Upper bound on produced tokens.
    pub max_tokens: u32,
    /// 0.0 is deterministic argmax decoding; up to 2.0 flattens the
    /// distribution.
    pub temperature: f32,
    /// Nucleus sampling mass in `[0, 1]`.
    pub top_p: f32,
    /// Candidate cutoff; 0 disables top-k truncation.
    pub top_k: u32,
    /// Multiplicative penalty on already-seen tokens; must be positive.
    pub repetition_penalty: f32,
    /// Generation halts before emitting any of these.
    pub stop_sequences: Vec<String>,
    /// Optional per-call wall-clock deadline in milliseconds.
    pub deadline_ms: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            repetition_penalty: 1.1,
            stop_sequences: Vec::new(),
            deadline_ms: None,
        }
    }
}

impl GenerationConfig {
    /// # Errors
    ///
    /// [`ErrorCode::InvalidInputParameterValue`] naming the parameter.
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(LyraError::invalid_parameter("max_tokens", "must be greater than zero"));
        }
        if !self.temperature.is_finite() || !(0.0..=2.0).contains(&self.temperature) {
            return Err(LyraError::invalid_parameter(
                "temperature",
                format!("{} not in [0.0, 2.0]", self.temperature),
            ));
        }
        if !self.top_p.is_finite() || !(0.0..=1.0).contains(&self.top_p) {
            return Err(LyraError::invalid_parameter(
                "top_p",
                format!("{} not in [0.0, 1.0]", self.top_p),
            ));
        }
        if !self.repetition_penalty.is_finite() || self.repetition_penalty <= 0.0 {
            return Err(LyraError::invalid_parameter(
                "repetition_penalty",
                format!("{} is not positive", self.repetition_penalty),
            ));
        }
        Ok(())
    }
}

/// Voice and prosody parameters for synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Voice identifier; must name a voice the loaded model provides.
    pub voice_id: String,
    /// Playback speed multiplier in `[0.25, 4.0]`.
    pub speed: f32,
    /// Pitch shift in `[-1.0, 1.0]` (about one octave either way).
    pub pitch: f32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            voice_id: "amber".to_owned(),
            speed: 1.0,
            pitch: 0.0,
        }
    }
}

impl SynthesisConfig {
    /// # Errors
    ///
    /// [`ErrorCode::InvalidInputParameterValue`] naming the parameter.
    pub fn validate(&self) -> Result<()> {
        if self.voice_id.trim().is_empty() {
            return Err(LyraError::invalid_parameter("voice_id", "must not be empty"));
        }
        if !self.speed.is_finite() || !(0.25..=4.0).contains(&self.speed) {
            return Err(LyraError::invalid_parameter(
                "speed",
                format!("{} not in [0.25, 4.0]", self.speed),
            ));
        }
        if !self.pitch.is_finite() || !(-1.0..=1.0).contains(&self.pitch) {
            return Err(LyraError::invalid_parameter(
                "pitch",
                format!("{} not in [-1.0, 1.0]", self.pitch),
            ));
        }
        Ok(())
    }
}

/// Options for one transcription call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    /// ISO language hint; empty means autodetect.
    pub language: String,
    /// Request per-word timestamps.
    pub word_timestamps: bool,
    /// Translate into English instead of transcribing verbatim.
    pub translate: bool,
}

/// Configuration for the voice conversation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Skip turns whose audio contains no detected speech.
    pub enable_vad: bool,
    /// VAD sensitivity in `[0.0, 1.0]`; lower detects more speech.
    pub vad_threshold: f32,
    /// Prefixed to the conversation context on every LLM call.
    pub system_prompt: String,
    pub generation: GenerationConfig,
    pub synthesis: SynthesisConfig,
    pub transcription: TranscriptionConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enable_vad: true,
            vad_threshold: 0.5,
            system_prompt: String::new(),
            generation: GenerationConfig::default(),
            synthesis: SynthesisConfig::default(),
            transcription: TranscriptionConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// # Errors
    ///
    /// [`ErrorCode::InvalidInputParameterValue`] from any nested config.
    pub fn validate(&self) -> Result<()> {
        if !self.vad_threshold.is_finite() || !(0.0..=1.0).contains(&self.vad_threshold) {
            return Err(LyraError::invalid_parameter(
                "vad_threshold",
                format!("{} not in [0.0, 1.0]", self.vad_threshold),
            ));
        }
        self.generation.validate()?;
        self.synthesis.validate()?;
        Ok(())
    }
}

fn config_error(field: &str, why: String) -> LyraError {
    LyraError::new(
        ErrorCode::InvalidInputConfiguration,
        format!("configuration field `{field}` is invalid"),
        format!("`{field}` rejected: {why}"),
    )
    .with_recovery("correct the configuration and initialize again")
}
